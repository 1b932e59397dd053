//! Ingress Pipeline (spec §4.3): validates, authorizes, and assembles
//! inbound frames, handing completed notifications to the delivery fanout.

use std::time::SystemTime;

use broadcast_protocol::{s2b, Frame};
use sha2::{Digest, Sha512};

use crate::collaborators::AuthOutcome;
use crate::compression::{self, trainer, Dictionary, NO_COMPRESSION_ID, STANDARD_ID};
use crate::error::{SessionError, SessionResult};
use crate::glob::CompiledGlob;
use crate::spool::SpoolBuffer;

use super::egress::enqueue_compressor_announcement;
use super::{Collaborators, ExpectedAck, IncomingNotification, PendingSend, Session, SessionPhase};

/// Dispatches one parsed inbound frame. Returns `Ok(())` having queued
/// whatever confirmation frames are due; any `Err` is fatal for the
/// connection per spec §7.
pub async fn dispatch(session: &mut Session, collaborators: &Collaborators, frame: Frame) -> SessionResult<()> {
    match frame.msg_type {
        s2b::CONFIGURE => handle_configure(session, collaborators, frame).await,
        s2b::SUBSCRIBE_EXACT => handle_subscribe_exact(session, collaborators, frame).await,
        s2b::SUBSCRIBE_GLOB => handle_subscribe_glob(session, collaborators, frame).await,
        s2b::UNSUBSCRIBE_EXACT => handle_unsubscribe_exact(session, collaborators, frame).await,
        s2b::UNSUBSCRIBE_GLOB => handle_unsubscribe_glob(session, collaborators, frame).await,
        s2b::NOTIFY => handle_notify(session, collaborators, frame).await,
        s2b::NOTIFY_STREAM => handle_notify_stream(session, collaborators, frame).await,
        s2b::CONTINUE_RECEIVE => handle_continue_receive(session, frame),
        s2b::CONFIRM_RECEIVE => handle_confirm_receive(session, frame),
        other => Err(SessionError::protocol(format!("unknown message type {other}"))),
    }
}

fn header_str<'a>(frame: &'a Frame, name: &str) -> Option<&'a str> {
    frame.headers.get(name).and_then(|v| std::str::from_utf8(v).ok())
}

fn header_u64(frame: &Frame, name: &str) -> SessionResult<Option<u64>> {
    match frame.headers.get(name) {
        None => Ok(None),
        Some(bytes) => broadcast_protocol::decode_uint(bytes)
            .map(Some)
            .map_err(|_| SessionError::protocol(format!("header {name} is not a valid big-endian integer"))),
    }
}

async fn handle_configure(session: &mut Session, collaborators: &Collaborators, frame: Frame) -> SessionResult<()> {
    if session.phase != SessionPhase::WaitingConfigure {
        return Err(SessionError::protocol("CONFIGURE received outside WaitingConfigure"));
    }

    let subscriber_nonce = frame
        .headers
        .get("x-subscriber-nonce")
        .ok_or_else(|| SessionError::protocol("CONFIGURE missing x-subscriber-nonce"))?;
    if subscriber_nonce.len() != 32 {
        return Err(SessionError::protocol("x-subscriber-nonce must be exactly 32 bytes"));
    }

    let enable_zstd = header_u64(&frame, "x-enable-zstd")?.unwrap_or(0) != 0;
    let enable_training = header_u64(&frame, "x-enable-training")?.unwrap_or(0) != 0;
    if enable_training && !enable_zstd {
        return Err(SessionError::protocol("x-enable-training requires x-enable-zstd"));
    }
    let initial_dict = header_u64(&frame, "x-initial-dict")?.unwrap_or(0);

    let broadcaster_nonce = uuid::Uuid::new_v4();
    let broadcaster_nonce_bytes = broadcaster_nonce.as_bytes();

    let mut hasher = Sha512::new();
    hasher.update(subscriber_nonce);
    hasher.update(broadcaster_nonce_bytes);
    let combined = hasher.finalize();
    let connection_nonce = &combined[..32];

    session.auth = crate::auth::AuthSequencer::new(connection_nonce);
    session.nonce_b64 = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, connection_nonce);
    session.connection_config = crate::config::ConnectionConfig { enable_zstd, enable_training };
    session.compression = crate::compression::CompressionManager::new(session.config.compression_allowed);

    // Both the standard and any requested preset compressor are prepared in
    // the background (even the standard one, which does no real work) and
    // promoted to `Ready` by the Open-state select loop once their task
    // completes, rather than built inline here.
    if enable_zstd && session.config.compression_allowed {
        let handle = tokio::spawn(async { Ok(Dictionary::standard(3)) });
        session.compression.standard = Some(crate::compression::CompressorSlot::Preparing { id: STANDARD_ID, handle });
    }

    if initial_dict != 0 && initial_dict != 1 && session.config.compression_allowed {
        let provider = collaborators.dictionary_provider.clone();
        let handle = tokio::spawn(async move {
            provider
                .get_compression_dictionary_by_id(initial_dict)
                .await
                .map(|(bytes, level)| Dictionary { id: initial_dict, bytes: Some(std::sync::Arc::new(bytes)), level })
                .ok_or_else(|| SessionError::protocol(format!("unknown preset dictionary id {initial_dict}")))
        });
        session.compression.active = Some(crate::compression::CompressorSlot::Preparing { id: initial_dict, handle });
    }

    if enable_training && session.config.allow_training {
        session.training = Some(trainer::TrainerState::new(session.spool_dir.as_deref()).await?);
    }

    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
    session.receiver_id = Some(collaborators.fanout_hub.register_receiver(sender).await);
    session.incoming_fanout = Some(receiver);

    let mut headers = broadcast_protocol::Headers::new();
    headers.insert("x-broadcaster-nonce", broadcaster_nonce_bytes.to_vec());
    session.pending_sends.push_back(PendingSend {
        headers,
        msg_type: broadcast_protocol::b2s::CONFIRM_CONFIGURE,
        body: Vec::new(),
    });

    session.phase = SessionPhase::Open;
    Ok(())
}

async fn authorize_subscription(
    session: &mut Session,
    collaborators: &Collaborators,
    frame: &Frame,
    is_glob: bool,
    key: &str,
) -> SessionResult<()> {
    let minted = session.auth.mint_subscriber_url();
    let authorization = header_str(frame, "authorization");
    let now = SystemTime::now();
    let outcome = if is_glob {
        collaborators
            .auth_verifier
            .is_subscribe_glob_allowed(&minted.url, key, now, authorization)
            .await
    } else {
        collaborators
            .auth_verifier
            .is_subscribe_exact_allowed(&minted.url, key.as_bytes(), now, authorization)
            .await
    };
    match outcome {
        AuthOutcome::Ok => Ok(()),
        AuthOutcome::Unauthorized | AuthOutcome::Forbidden => {
            Err(SessionError::AuthRejected(format!("{key} rejected: {outcome:?}")))
        }
        AuthOutcome::Unavailable => Err(SessionError::ResourceUnavailable("auth verifier unavailable".into())),
    }
}

async fn handle_subscribe_exact(session: &mut Session, collaborators: &Collaborators, frame: Frame) -> SessionResult<()> {
    let topic = frame.headers.get("x-topic").ok_or_else(|| SessionError::protocol("SUBSCRIBE_EXACT missing x-topic"))?.to_vec();
    let topic_str = String::from_utf8_lossy(&topic).into_owned();
    authorize_subscription(session, collaborators, &frame, false, &topic_str).await?;

    if session.exact_subscriptions.contains(&topic) {
        return Err(SessionError::protocol("already subscribed to this topic"));
    }

    let mut headers = broadcast_protocol::Headers::new();
    headers.insert("x-topic", topic.clone());
    session.pending_sends.push_back(PendingSend {
        headers,
        msg_type: broadcast_protocol::b2s::CONFIRM_SUBSCRIBE_EXACT,
        body: Vec::new(),
    });

    collaborators.fanout_hub.increment_exact(&topic).await;
    session.exact_subscriptions.insert(topic);
    Ok(())
}

async fn handle_subscribe_glob(session: &mut Session, collaborators: &Collaborators, frame: Frame) -> SessionResult<()> {
    let glob_str = frame
        .headers
        .get("x-glob")
        .ok_or_else(|| SessionError::protocol("SUBSCRIBE_GLOB missing x-glob"))
        .and_then(|b| std::str::from_utf8(b).map_err(|_| SessionError::protocol("x-glob not UTF-8")))?
        .to_string();
    authorize_subscription(session, collaborators, &frame, true, &glob_str).await?;

    if session.glob_subscriptions.iter().any(|(_, p)| p == &glob_str) {
        return Err(SessionError::protocol("already subscribed to this glob"));
    }

    let compiled = CompiledGlob::compile(&glob_str)?;

    let mut headers = broadcast_protocol::Headers::new();
    headers.insert("x-glob", glob_str.clone().into_bytes());
    session.pending_sends.push_back(PendingSend {
        headers,
        msg_type: broadcast_protocol::b2s::CONFIRM_SUBSCRIBE_GLOB,
        body: Vec::new(),
    });

    collaborators.fanout_hub.increment_glob(&glob_str).await;
    session.glob_subscriptions.push((compiled, glob_str));
    Ok(())
}

async fn handle_unsubscribe_exact(session: &mut Session, collaborators: &Collaborators, frame: Frame) -> SessionResult<()> {
    let topic = frame.headers.get("x-topic").ok_or_else(|| SessionError::protocol("UNSUBSCRIBE_EXACT missing x-topic"))?.to_vec();
    let topic_str = String::from_utf8_lossy(&topic).into_owned();
    authorize_subscription(session, collaborators, &frame, false, &topic_str).await?;

    session.exact_subscriptions.remove(&topic);
    collaborators.fanout_hub.decrement_exact(&topic).await;

    let mut headers = broadcast_protocol::Headers::new();
    headers.insert("x-topic", topic);
    session.pending_sends.push_back(PendingSend {
        headers,
        msg_type: broadcast_protocol::b2s::CONFIRM_UNSUBSCRIBE_EXACT,
        body: Vec::new(),
    });
    Ok(())
}

async fn handle_unsubscribe_glob(session: &mut Session, collaborators: &Collaborators, frame: Frame) -> SessionResult<()> {
    let glob_str = frame
        .headers
        .get("x-glob")
        .ok_or_else(|| SessionError::protocol("UNSUBSCRIBE_GLOB missing x-glob"))
        .and_then(|b| std::str::from_utf8(b).map_err(|_| SessionError::protocol("x-glob not UTF-8")))?
        .to_string();
    authorize_subscription(session, collaborators, &frame, true, &glob_str).await?;

    session.glob_subscriptions.retain(|(_, p)| p != &glob_str);
    collaborators.fanout_hub.decrement_glob(&glob_str).await;

    let mut headers = broadcast_protocol::Headers::new();
    headers.insert("x-glob", glob_str.into_bytes());
    session.pending_sends.push_back(PendingSend {
        headers,
        msg_type: broadcast_protocol::b2s::CONFIRM_UNSUBSCRIBE_GLOB,
        body: Vec::new(),
    });
    Ok(())
}

struct NotifyHeaderFields {
    identifier: Vec<u8>,
    topic: Vec<u8>,
    compressor_id: u64,
    compressed_length: u64,
    decompressed_length: u64,
    compressed_sha512: [u8; 64],
}

fn parse_notify_headers(frame: &Frame) -> SessionResult<NotifyHeaderFields> {
    let identifier = frame.headers.get("x-identifier").ok_or_else(|| SessionError::protocol("NOTIFY missing x-identifier"))?.to_vec();
    if identifier.len() > 64 {
        return Err(SessionError::protocol("x-identifier exceeds 64 bytes"));
    }
    let topic = frame.headers.get("x-topic").ok_or_else(|| SessionError::protocol("NOTIFY missing x-topic"))?.to_vec();
    let compressor_id = header_u64(frame, "x-compressor")?.ok_or_else(|| SessionError::protocol("NOTIFY missing x-compressor"))?;
    let compressed_length = header_u64(frame, "x-compressed-length")?.ok_or_else(|| SessionError::protocol("NOTIFY missing x-compressed-length"))?;
    let decompressed_length = header_u64(frame, "x-decompressed-length")?.ok_or_else(|| SessionError::protocol("NOTIFY missing x-decompressed-length"))?;
    let sha_bytes = frame.headers.get("x-compressed-sha512").ok_or_else(|| SessionError::protocol("NOTIFY missing x-compressed-sha512"))?;
    if sha_bytes.len() != 64 {
        return Err(SessionError::protocol("x-compressed-sha512 must be 64 bytes"));
    }
    let mut compressed_sha512 = [0u8; 64];
    compressed_sha512.copy_from_slice(sha_bytes);
    Ok(NotifyHeaderFields { identifier, topic, compressor_id, compressed_length, decompressed_length, compressed_sha512 })
}

async fn authorize_notify(
    session: &mut Session,
    collaborators: &Collaborators,
    frame: &Frame,
    topic: &[u8],
    message_sha512: &[u8; 64],
) -> SessionResult<()> {
    let minted = session.auth.mint_subscriber_url();
    let authorization = header_str(frame, "authorization");
    let outcome = collaborators
        .auth_verifier
        .is_notify_allowed(&minted.url, topic, message_sha512, SystemTime::now(), authorization)
        .await;
    match outcome {
        AuthOutcome::Ok => Ok(()),
        AuthOutcome::Unauthorized | AuthOutcome::Forbidden => Err(SessionError::AuthRejected("notify rejected".into())),
        AuthOutcome::Unavailable => Err(SessionError::ResourceUnavailable("auth verifier unavailable".into())),
    }
}

async fn finish_notify(
    session: &mut Session,
    collaborators: &Collaborators,
    identifier: Vec<u8>,
    topic: Vec<u8>,
    decompressed: Vec<u8>,
    decompressed_sha512: [u8; 64],
) -> SessionResult<()> {
    if let Some(training) = session.training.as_mut() {
        if trainer::is_eligible(decompressed.len(), &session.config) {
            if let Some(collector) = training.feed() {
                collector.feed(&decompressed).await?;
            }
        }
    }
    maybe_advance_training(session, collaborators).await?;

    let content_length = decompressed.len() as u64;
    let body_stream: crate::collaborators::BodyStream = Box::pin(std::io::Cursor::new(decompressed));
    let (status, outcome) = collaborators
        .delivery_fanout
        .handle_trusted_notify(&topic, body_stream, content_length, &decompressed_sha512)
        .await?;
    if status == crate::collaborators::DeliveryStatus::Unavailable {
        return Err(SessionError::ResourceUnavailable("delivery fanout unavailable".into()));
    }

    let mut headers = broadcast_protocol::Headers::new();
    headers.insert("x-identifier", identifier);
    headers.insert("x-subscribers", (outcome.status_succeeded as u64).to_be_bytes().to_vec());
    session.pending_sends.push_back(PendingSend { headers, msg_type: broadcast_protocol::b2s::CONFIRM_NOTIFY, body: Vec::new() });
    Ok(())
}

/// Re-evaluates the training watermarks after a feed, spawning the
/// appropriate background training call and rotating in the resulting
/// dictionary once it completes (the completion itself is reaped by the
/// state machine's backgrounded-task set; here we only kick training off).
pub(super) async fn maybe_advance_training(session: &mut Session, collaborators: &Collaborators) -> SessionResult<()> {
    let Some(training) = session.training.as_mut() else { return Ok(()) };
    let fired = training.poll_watermark(&session.config, session.spool_dir.as_deref()).await?;
    if let Some((kind, samples)) = fired {
        let id = session.compression.mint_trained_id();
        let provider = collaborators.dictionary_provider.clone();
        let trained = match kind {
            trainer::WatermarkKind::Low => provider.train_compression_dict_low_watermark(samples).await?,
            trainer::WatermarkKind::High => provider.train_compression_dict_high_watermark(samples).await?,
        };
        let dict = Dictionary { id, bytes: Some(std::sync::Arc::new(trained.0)), level: trained.1 };
        session.compression.rotate_in(dict.clone());
        enqueue_compressor_announcement(session, &dict, session.config.compression_min_size, session.config.compression_trained_max_size as u64);
    }
    Ok(())
}

async fn handle_notify(session: &mut Session, collaborators: &Collaborators, frame: Frame) -> SessionResult<()> {
    let fields = parse_notify_headers(&frame)?;
    if fields.compressor_id != NO_COMPRESSION_ID
        && (!session.config.compression_allowed || !session.connection_config.enable_zstd)
    {
        return Err(SessionError::protocol("compressed NOTIFY on a connection without zstd enabled"));
    }

    authorize_notify(session, collaborators, &frame, &fields.topic, &fields.compressed_sha512).await?;

    if frame.body.len() as u64 != fields.compressed_length {
        return Err(SessionError::integrity("NOTIFY body length does not match x-compressed-length"));
    }
    let actual_sha: [u8; 64] = Sha512::digest(&frame.body).into();
    if actual_sha != fields.compressed_sha512 {
        return Err(SessionError::integrity("NOTIFY body hash does not match x-compressed-sha512"));
    }

    let decompressed = if fields.compressor_id == NO_COMPRESSION_ID {
        if fields.compressed_length != fields.decompressed_length {
            return Err(SessionError::protocol("uncompressed NOTIFY with mismatched lengths"));
        }
        frame.body
    } else {
        let dict = session
            .compression
            .find_ready(fields.compressor_id)
            .cloned()
            .ok_or_else(|| SessionError::protocol(format!("unknown compressor id {}", fields.compressor_id)))?;
        compression::decompress(&frame.body, &dict, session.config.decompression_max_window_size, fields.decompressed_length)?
    };

    let decompressed_sha512: [u8; 64] = Sha512::digest(&decompressed).into();
    finish_notify(session, collaborators, fields.identifier, fields.topic, decompressed, decompressed_sha512).await
}

async fn handle_notify_stream(session: &mut Session, collaborators: &Collaborators, frame: Frame) -> SessionResult<()> {
    let identifier = frame.headers.get("x-identifier").ok_or_else(|| SessionError::protocol("NOTIFY_STREAM missing x-identifier"))?.to_vec();
    let part_id = header_u64(&frame, "x-part-id")?.ok_or_else(|| SessionError::protocol("NOTIFY_STREAM missing x-part-id"))?;

    if part_id == 0 {
        if session.incoming_notification.is_some() {
            return Err(SessionError::protocol("NOTIFY_STREAM part 0 while a stream is already in progress"));
        }
        let fields = parse_notify_headers(&frame)?;
        if fields.identifier != identifier {
            return Err(SessionError::protocol("NOTIFY_STREAM identifier mismatch between headers"));
        }
        authorize_notify(session, collaborators, &frame, &fields.topic, &fields.compressed_sha512).await?;

        let mut body = SpoolBuffer::new(session.config.message_body_spool_size, session.spool_dir.clone());
        body.write(&frame.body).await?;
        if body.len() > fields.compressed_length {
            return Err(SessionError::protocol("NOTIFY_STREAM part exceeds declared compressed length"));
        }

        let done = body.len() == fields.compressed_length;
        if done {
            complete_notify_stream(session, collaborators, fields.identifier, fields.topic, fields.compressor_id, fields.decompressed_length, fields.compressed_sha512, body).await
        } else {
            session.incoming_notification = Some(IncomingNotification {
                identifier: fields.identifier.clone(),
                topic: fields.topic,
                compressor_id: fields.compressor_id,
                compressed_length: fields.compressed_length,
                decompressed_length: fields.decompressed_length,
                compressed_sha512: fields.compressed_sha512,
                next_expected_part: 1,
                body,
            });
            enqueue_continue_notify(session, fields.identifier, 0);
            Ok(())
        }
    } else {
        let in_progress = session
            .incoming_notification
            .as_mut()
            .ok_or_else(|| SessionError::protocol("NOTIFY_STREAM continuation with no stream in progress"))?;
        if in_progress.identifier != identifier {
            return Err(SessionError::protocol("NOTIFY_STREAM continuation identifier mismatch"));
        }
        if part_id != in_progress.next_expected_part {
            return Err(SessionError::protocol("NOTIFY_STREAM part arrived out of order"));
        }

        in_progress.body.write(&frame.body).await?;
        if in_progress.body.len() > in_progress.compressed_length {
            return Err(SessionError::protocol("NOTIFY_STREAM exceeds declared compressed length"));
        }
        in_progress.next_expected_part += 1;

        let done = in_progress.body.len() == in_progress.compressed_length;
        if done {
            let IncomingNotification { identifier, topic, compressor_id, decompressed_length, compressed_sha512, body, .. } =
                session.incoming_notification.take().unwrap();
            complete_notify_stream(session, collaborators, identifier, topic, compressor_id, decompressed_length, compressed_sha512, body).await
        } else {
            enqueue_continue_notify(session, identifier, part_id);
            Ok(())
        }
    }
}

fn enqueue_continue_notify(session: &mut Session, identifier: Vec<u8>, part_id: u64) {
    let mut headers = broadcast_protocol::Headers::new();
    headers.insert("x-identifier", identifier);
    headers.insert("x-part-id", broadcast_protocol::encode_min_uint(part_id));
    session.pending_sends.push_back(PendingSend { headers, msg_type: broadcast_protocol::b2s::CONTINUE_NOTIFY, body: Vec::new() });
}

#[allow(clippy::too_many_arguments)]
async fn complete_notify_stream(
    session: &mut Session,
    collaborators: &Collaborators,
    identifier: Vec<u8>,
    topic: Vec<u8>,
    compressor_id: u64,
    decompressed_length: u64,
    compressed_sha512: [u8; 64],
    mut body: SpoolBuffer,
) -> SessionResult<()> {
    if body.running_sha512() != compressed_sha512 {
        return Err(SessionError::integrity("NOTIFY_STREAM total hash does not match advertised compressed sha512"));
    }
    let compressed_bytes = body.read_all().await?;

    let decompressed = if compressor_id == NO_COMPRESSION_ID {
        if compressed_bytes.len() as u64 != decompressed_length {
            return Err(SessionError::protocol("uncompressed NOTIFY_STREAM with mismatched lengths"));
        }
        compressed_bytes
    } else {
        let dict = session
            .compression
            .find_ready(compressor_id)
            .cloned()
            .ok_or_else(|| SessionError::protocol(format!("unknown compressor id {compressor_id}")))?;
        compression::decompress(&compressed_bytes, &dict, session.config.decompression_max_window_size, decompressed_length)?
    };

    let decompressed_sha512: [u8; 64] = Sha512::digest(&decompressed).into();
    finish_notify(session, collaborators, identifier, topic, decompressed, decompressed_sha512).await
}

fn handle_continue_receive(session: &mut Session, frame: Frame) -> SessionResult<()> {
    let identifier = frame.headers.get("x-identifier").ok_or_else(|| SessionError::protocol("CONTINUE_RECEIVE missing x-identifier"))?.to_vec();
    let part_id = header_u64(&frame, "x-part-id")?.ok_or_else(|| SessionError::protocol("CONTINUE_RECEIVE missing x-part-id"))?;
    match session.expecting_acks.pop_front() {
        Some(ExpectedAck::ContinueReceive { identifier: expected_id, part_id: expected_part }) if expected_id == identifier && expected_part == part_id => Ok(()),
        _ => Err(SessionError::protocol("unexpected CONTINUE_RECEIVE")),
    }
}

fn handle_confirm_receive(session: &mut Session, frame: Frame) -> SessionResult<()> {
    let identifier = frame.headers.get("x-identifier").ok_or_else(|| SessionError::protocol("CONFIRM_RECEIVE missing x-identifier"))?.to_vec();
    match session.expecting_acks.pop_front() {
        Some(ExpectedAck::ConfirmReceive { identifier: expected_id }) if expected_id == identifier => Ok(()),
        _ => Err(SessionError::protocol("unexpected CONFIRM_RECEIVE")),
    }
}
