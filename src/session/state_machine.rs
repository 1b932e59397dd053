//! Session State Machine (spec §4.1): the top-level driver loop.
//!
//! `Accepting` is the caller's responsibility (accepting the underlying
//! connection with a timeout before a [`Session`] even exists); this module
//! starts at `WaitingConfigure` and drives through `Open` to `Closing`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use broadcast_protocol::MessageDirection;

use crate::compression::{CompressorSlot, Dictionary};
use crate::error::{SessionError, SessionResult};
use crate::transport::Transport;

use super::{egress, ingress, Collaborators, FanoutItem, Session, SessionPhase};

/// How often the loop wakes on its own when neither the transport nor the
/// fanout queue has anything ready, so compressor-Preparing promotion and
/// the training-retrain cooldown still get re-checked while the connection
/// is otherwise idle.
const IDLE_TICK: Duration = Duration::from_millis(200);

/// Runs one session to completion: `WaitingConfigure` through `Closed`.
/// Always returns -- the `Err` variant carries the error that put the
/// session into `Closing`, if any; a clean peer-initiated close returns
/// `Ok(())`.
pub async fn run_session<T>(mut session: Session, mut transport: T, collaborators: Collaborators) -> SessionResult<()>
where
    T: Transport,
{
    session.phase = SessionPhase::WaitingConfigure;

    let outcome = drive(&mut session, &mut transport, &collaborators).await;

    session.phase = SessionPhase::Closing;
    teardown(&mut session, &collaborators).await;

    let mut pinned = std::pin::Pin::new(&mut transport);
    let (code, reason) = match &outcome {
        Ok(()) => (1000, "closed"),
        Err(e) => (1002, {
            warn!(error = %e, "session closing due to error");
            "protocol error"
        }),
    };
    pinned.as_mut().close(code, reason).await;

    outcome
}

async fn drive<T>(session: &mut Session, transport: &mut T, collaborators: &Collaborators) -> SessionResult<()>
where
    T: Transport,
{
    // WaitingConfigure: read exactly one frame, it must be CONFIGURE. Bounded
    // by `websocket_accept_timeout` -- a peer that completes the underlying
    // accept but never sends CONFIGURE would otherwise hold the slot open
    // indefinitely.
    let first = tokio::time::timeout(session.config.websocket_accept_timeout, transport.next())
        .await
        .map_err(|_| SessionError::protocol("timed out waiting for CONFIGURE"))?
        .ok_or_else(|| SessionError::protocol("connection closed before CONFIGURE"))?
        .map_err(|e| SessionError::protocol(format!("transport error awaiting CONFIGURE: {e}")))?;
    let frame = broadcast_protocol::decode(&first, MessageDirection::SubscriberToBroadcaster)?;
    if frame.msg_type != broadcast_protocol::s2b::CONFIGURE {
        return Err(SessionError::protocol("first frame was not CONFIGURE"));
    }
    ingress::dispatch(session, collaborators, frame).await?;
    debug!("session configured, entering Open");

    flush_sends(session, transport).await?;

    // Open: a priority-ordered pass over every ready source before falling
    // back to a genuine wait (spec §4.1's 9 numbered sources), grounded on
    // the original's "check each ready condition in order, only block on
    // asyncio.wait/FIRST_COMPLETED once nothing is immediately ready"
    // Open-state handler.
    loop {
        if session.phase != SessionPhase::Open {
            return Ok(());
        }

        reap_backgrounded(session);
        promote_ready_compressors(session).await?;

        if let Some(training) = session.training.as_mut() {
            training.maybe_refresh(&session.config, session.spool_dir.as_deref()).await?;
        }
        flush_sends(session, transport).await?;

        if let Some(frame) = session.unprocessed_receives.pop_front() {
            ingress::dispatch(session, collaborators, frame).await?;
            flush_sends(session, transport).await?;
            continue;
        }

        let ack_capacity_free = session
            .config
            .websocket_send_max_unacknowledged
            .map_or(true, |max| session.expecting_acks.len() < max);

        tokio::select! {
            biased;

            incoming = transport.next() => {
                let raw = incoming
                    .ok_or_else(|| SessionError::protocol("transport closed"))?
                    .map_err(|e| SessionError::protocol(format!("transport error: {e}")))?;
                let frame = broadcast_protocol::decode(&raw, MessageDirection::SubscriberToBroadcaster)?;
                if session.unprocessed_receives.len() >= session.config.websocket_max_unprocessed_receives {
                    return Err(SessionError::protocol("too many unprocessed receives queued"));
                }
                session.unprocessed_receives.push_back(frame);
            }

            item = recv_fanout(&mut session.incoming_fanout), if ack_capacity_free => {
                if let Some(item) = item {
                    egress::process_fanout_item(session, collaborators, item).await?;
                    flush_sends(session, transport).await?;
                }
            }

            () = tokio::time::sleep(IDLE_TICK) => {}
        }
    }
}

/// Non-blocking poll of the fanout receiver: pending until the session has
/// one (i.e. before CONFIGURE completes, which can't happen here since
/// `drive` only reaches this loop after CONFIGURE, but kept total for the
/// type to stay a plain `Option`).
async fn recv_fanout(rx: &mut Option<tokio::sync::mpsc::UnboundedReceiver<FanoutItem>>) -> Option<FanoutItem> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Reaps every backgrounded task that has already finished (spec §3
/// `backgrounded`), logging failures -- a spooling or training task losing
/// doesn't take the connection down with it.
fn reap_backgrounded(session: &mut Session) {
    while let Some(result) = session.backgrounded.try_join_next() {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "backgrounded task failed"),
            Err(e) => warn!(error = %e, "backgrounded task panicked"),
        }
    }
}

/// Promotes every compressor slot whose background preparation task has
/// finished, queueing an announcement for `active`/`standard` (the peer
/// needs to know about those) but not `last` (already superseded, so the
/// peer was never told about it in the first place). Exposed publicly so
/// tests that drive `ingress`/`egress` directly, without running `drive`'s
/// loop, can advance a connection past `CONFIGURE` the same way the loop
/// would on its first iteration.
pub async fn promote_ready_compressors(session: &mut Session) -> SessionResult<()> {
    if let Some(dict) = promote_ready_slot(&mut session.compression.active).await? {
        egress::enqueue_compressor_announcement(session, &dict, session.config.compression_min_size, session.config.compression_trained_max_size as u64);
    }
    if let Some(dict) = promote_ready_slot(&mut session.compression.standard).await? {
        egress::enqueue_compressor_announcement(session, &dict, session.config.compression_min_size, session.config.compression_trained_max_size as u64);
    }
    promote_ready_slot(&mut session.compression.last).await?;
    Ok(())
}

/// If `slot` is `Preparing` and its task has finished, awaits it (a no-op
/// wait, since `is_finished` already confirmed it's ready), promotes the
/// slot to `Ready`, and returns the dictionary for the caller to announce.
async fn promote_ready_slot(slot: &mut Option<CompressorSlot>) -> SessionResult<Option<Dictionary>> {
    let ready = matches!(slot, Some(CompressorSlot::Preparing { handle, .. }) if handle.is_finished());
    if !ready {
        return Ok(None);
    }
    let Some(CompressorSlot::Preparing { handle, .. }) = slot.take() else {
        unreachable!("checked Preparing above");
    };
    match handle.await {
        Ok(Ok(dict)) => {
            *slot = Some(CompressorSlot::Ready(dict.clone()));
            Ok(Some(dict))
        }
        Ok(Err(e)) => Err(e),
        Err(join_err) => Err(SessionError::local_fault(format!("compressor preparation task panicked: {join_err}"))),
    }
}

async fn flush_sends<T>(session: &mut Session, transport: &mut T) -> SessionResult<()>
where
    T: Transport,
{
    while let Some(item) = session.pending_sends.pop_front() {
        let mut frame = broadcast_protocol::Frame::new(item.msg_type);
        frame.headers = item.headers;
        frame.body = item.body;
        if session.config.websocket_minimal_headers {
            frame.flags |= broadcast_protocol::MINIMAL_HEADERS_FLAG;
        }
        let encoded = broadcast_protocol::encode(&frame, MessageDirection::BroadcasterToSubscriber)?;
        transport
            .send(encoded)
            .await
            .map_err(|e| SessionError::protocol(format!("transport send error: {e}")))?;
    }
    Ok(())
}

async fn teardown(session: &mut Session, collaborators: &Collaborators) {
    if let Some(id) = session.receiver_id.take() {
        collaborators.fanout_hub.unregister_receiver(id).await;
    }
    for topic in session.exact_subscriptions.drain() {
        collaborators.fanout_hub.decrement_exact(&topic).await;
    }
    for (_, pattern) in session.glob_subscriptions.drain(..) {
        collaborators.fanout_hub.decrement_glob(&pattern).await;
    }
    info!(nonce = %session.nonce_b64, "session torn down");
}
