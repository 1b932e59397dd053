//! Egress Pipeline (spec §4.4): turns a fanout-delivered notification into
//! one or more outbound `RECEIVE_STREAM` frames, choosing a compressor,
//! chunking to the configured frame size, and queueing the acks the peer
//! owes back.

use sha2::{Digest, Sha512};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use broadcast_protocol::b2s;

use crate::collaborators::BodyStream;
use crate::compression::{self, Dictionary, CompressorSlot, NO_COMPRESSION_ID};
use crate::compression::trainer;
use crate::error::{SessionError, SessionResult};
use crate::spool::SpoolBuffer;

use super::ingress::maybe_advance_training;
use super::{Collaborators, ExpectedAck, FanoutItem, PendingSend, Session};

/// Chunk size used when draining an exclusive hub stream into a spool
/// buffer (spec §9).
const DRAIN_CHUNK: usize = 64 * 1024;

const MIN_FRAME_BODY: usize = 512;

struct ChosenCompression {
    id: u64,
    dict: Option<Dictionary>,
}

/// Compression selection (spec §4.4): large payloads prefer the standard
/// compressor (cheap, no dictionary warm-up cost); mid-sized payloads
/// prefer whatever custom dictionary is currently active; small payloads
/// below `compression_min_size` are never compressed.
fn choose_compression(session: &Session, length: u64) -> ChosenCompression {
    if length >= session.config.compression_trained_max_size as u64 {
        if let Some(CompressorSlot::Ready(dict)) = &session.compression.standard {
            return ChosenCompression { id: dict.id, dict: Some(dict.clone()) };
        }
    } else if length >= session.config.compression_min_size as u64 {
        if let Some(CompressorSlot::Ready(dict)) = &session.compression.active {
            return ChosenCompression { id: dict.id, dict: Some(dict.clone()) };
        }
    }
    ChosenCompression { id: NO_COMPRESSION_ID, dict: None }
}

/// Processes one item handed over by the fanout queue, producing the full
/// set of outbound `RECEIVE_STREAM` frames (plus any `ENABLE_ZSTD_*`
/// announcements already queued elsewhere) and the acks expected back.
pub async fn process_fanout_item(session: &mut Session, collaborators: &Collaborators, item: FanoutItem) -> SessionResult<()> {
    match item {
        FanoutItem::Small { topic, sha512, bytes } => process_small(session, collaborators, topic, sha512, bytes).await,
        FanoutItem::LargeSpooled { topic, sha512, body } => {
            let length = body.len();
            process_large(session, collaborators, topic, sha512, length, body).await
        }
        FanoutItem::LargeStreamed { topic, sha512, length, stream, finished_signal } => {
            let mut body = SpoolBuffer::new(session.config.message_body_spool_size, session.spool_dir.clone());
            drain_stream_into_spool(stream, &mut body).await?;
            // Per spec §9: signal release of the publisher's exclusive
            // stream as soon as every byte is read, ahead of compression.
            let _ = finished_signal.send(());
            process_large(session, collaborators, topic, sha512, length, body).await
        }
    }
}

async fn drain_stream_into_spool(mut stream: BodyStream, sink: &mut SpoolBuffer) -> SessionResult<()> {
    let mut buf = vec![0u8; DRAIN_CHUNK];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write(&buf[..n]).await?;
    }
    Ok(())
}

async fn process_small(session: &mut Session, collaborators: &Collaborators, topic: Vec<u8>, sha512: [u8; 64], bytes: Vec<u8>) -> SessionResult<()> {
    if let Some(training) = session.training.as_mut() {
        if trainer::is_eligible(bytes.len(), &session.config) {
            if let Some(collector) = training.feed() {
                collector.feed(&bytes).await?;
            }
        }
    }
    maybe_advance_training(session, collaborators).await?;

    let chosen = choose_compression(session, bytes.len() as u64);
    let (wire_bytes, wire_sha512) = match &chosen.dict {
        None => (bytes.clone(), sha512),
        Some(dict) => {
            let compressed = compression::compress(&bytes, dict)?;
            let compressed_sha512: [u8; 64] = Sha512::digest(&compressed).into();
            (compressed, compressed_sha512)
        }
    };

    send_receive_stream(session, &topic, chosen.id, bytes.len() as u64, wire_bytes, wire_sha512)
}

/// Handles `LargeSpooled`/`LargeStreamed` items: unlike the small path,
/// never reads the whole spooled body back into one `Vec` -- compression
/// (if any) streams chunk-by-chunk straight from the source spool into an
/// output spool, and the outbound chunking below reads the wire bytes back
/// the same way.
async fn process_large(
    session: &mut Session,
    collaborators: &Collaborators,
    topic: Vec<u8>,
    sha512: [u8; 64],
    length: u64,
    mut body: SpoolBuffer,
) -> SessionResult<()> {
    // Training only samples payloads up to compression_trained_max_size, so
    // a body large enough to take this path is essentially never eligible;
    // still check so a borderline-sized spooled body isn't silently skipped.
    if let Some(training) = session.training.as_mut() {
        if trainer::is_eligible(length as usize, &session.config) {
            if let Some(collector) = training.feed() {
                let sample = body.read_all().await?;
                collector.feed(&sample).await?;
            }
        }
    }
    maybe_advance_training(session, collaborators).await?;

    let chosen = choose_compression(session, length);
    match chosen.dict {
        None => send_receive_stream_from_spool(session, &topic, NO_COMPRESSION_ID, length, &mut body, sha512).await,
        Some(dict) => {
            let mut compressed = SpoolBuffer::new(session.config.message_body_spool_size, session.spool_dir.clone());
            compression::compress_stream(&mut body, &mut compressed, &dict).await?;
            let wire_sha512 = compressed.running_sha512();
            send_receive_stream_from_spool(session, &topic, chosen.id, length, &mut compressed, wire_sha512).await
        }
    }
}

fn send_receive_stream(
    session: &mut Session,
    topic: &[u8],
    compressor_id: u64,
    decompressed_length: u64,
    wire_bytes: Vec<u8>,
    wire_sha512: [u8; 64],
) -> SessionResult<()> {
    check_pending_sends_capacity(session)?;

    let identifier = Uuid::new_v4().as_bytes()[..16].to_vec();
    let max_frame = session.config.outgoing_max_ws_message_size.unwrap_or(usize::MAX);

    let mut part_id: u64 = 0;
    let mut offset = 0usize;
    let total = wire_bytes.len();

    loop {
        let (headers, take) = next_receive_stream_headers(session, topic, compressor_id, total as u64, decompressed_length, wire_sha512, &identifier, part_id, max_frame, total - offset);
        let chunk = wire_bytes[offset..offset + take].to_vec();
        offset += take;
        let is_final = offset >= total;
        push_receive_stream_frame(session, &identifier, part_id, is_final, headers, chunk);
        if is_final {
            break;
        }
        part_id += 1;
    }

    Ok(())
}

async fn send_receive_stream_from_spool(
    session: &mut Session,
    topic: &[u8],
    compressor_id: u64,
    decompressed_length: u64,
    wire: &mut SpoolBuffer,
    wire_sha512: [u8; 64],
) -> SessionResult<()> {
    check_pending_sends_capacity(session)?;

    let identifier = Uuid::new_v4().as_bytes()[..16].to_vec();
    let max_frame = session.config.outgoing_max_ws_message_size.unwrap_or(usize::MAX);
    let total = wire.len();

    let mut part_id: u64 = 0;
    let mut sent: u64 = 0;

    loop {
        let remaining = total - sent;
        let (headers, take) = next_receive_stream_headers(session, topic, compressor_id, total, decompressed_length, wire_sha512, &identifier, part_id, max_frame, remaining as usize);
        let chunk = wire.read_chunk(take).await?;
        sent += chunk.len() as u64;
        let is_final = sent >= total;
        push_receive_stream_frame(session, &identifier, part_id, is_final, headers, chunk);
        if is_final {
            break;
        }
        part_id += 1;
    }

    Ok(())
}

/// Shared header-building and chunk-sizing for both the in-memory and
/// spooled `RECEIVE_STREAM` senders: returns the headers for this part and
/// how many body bytes it should carry.
#[allow(clippy::too_many_arguments)]
fn next_receive_stream_headers(
    session: &mut Session,
    topic: &[u8],
    compressor_id: u64,
    total: u64,
    decompressed_length: u64,
    wire_sha512: [u8; 64],
    identifier: &[u8],
    part_id: u64,
    max_frame: usize,
    remaining: usize,
) -> (broadcast_protocol::Headers, usize) {
    let minted = session.auth.mint_broadcaster_url();
    let mut headers = broadcast_protocol::Headers::new();
    headers.insert("authorization", minted.url.clone().into_bytes());
    headers.insert("x-identifier", identifier.to_vec());
    headers.insert("x-part-id", broadcast_protocol::encode_min_uint(part_id));
    if part_id == 0 {
        headers.insert("x-topic", topic.to_vec());
        headers.insert("x-compressor", broadcast_protocol::encode_min_uint(compressor_id));
        headers.insert("x-compressed-length", broadcast_protocol::encode_min_uint(total));
        headers.insert("x-decompressed-length", broadcast_protocol::encode_min_uint(decompressed_length));
        headers.insert("x-compressed-sha512", wire_sha512.to_vec());
    }

    let header_overhead = estimate_header_overhead(&headers);
    let budget = max_frame.saturating_sub(header_overhead).max(MIN_FRAME_BODY);
    let take = remaining.min(budget).max(if remaining > 0 { 1 } else { 0 });
    (headers, take)
}

fn push_receive_stream_frame(session: &mut Session, identifier: &[u8], part_id: u64, is_final: bool, headers: broadcast_protocol::Headers, body: Vec<u8>) {
    if is_final {
        session.expecting_acks.push_back(ExpectedAck::ConfirmReceive { identifier: identifier.to_vec() });
    } else {
        session.expecting_acks.push_back(ExpectedAck::ContinueReceive { identifier: identifier.to_vec(), part_id });
    }
    session.pending_sends.push_back(PendingSend { headers, msg_type: b2s::RECEIVE_STREAM, body });
}

/// Spec invariant 6 (§3): enforces `websocket_max_pending_sends` before
/// queueing the first part of a new outbound message. `pending_sends`
/// normally drains to empty every loop iteration (the state machine flushes
/// it right after this runs), so this only trips when a single message's
/// own chunking would itself blow the backlog -- an operator config with an
/// unreasonably small `websocket_max_pending_sends` relative to message
/// size, rather than ordinary multi-message buildup.
fn check_pending_sends_capacity(session: &Session) -> SessionResult<()> {
    if session.pending_sends.len() >= session.config.websocket_max_pending_sends {
        return Err(SessionError::ResourceUnavailable("pending_sends is at capacity".into()));
    }
    Ok(())
}

/// Conservative estimate of how many bytes the minimal-header encoding of
/// `headers` will take, used to size the body chunk so the whole frame
/// stays under `outgoing_max_ws_message_size`.
fn estimate_header_overhead(headers: &broadcast_protocol::Headers) -> usize {
    let mut total = 4; // flags + type
    for (_, value) in headers.iter() {
        total += 2 + value.len();
    }
    total
}

/// Announces a newly-ready custom compressor slot (spec §4.5).
pub fn enqueue_compressor_announcement(session: &mut Session, dict: &Dictionary, min_size: u32, max_size: u64) {
    let msg_type = if dict.id < 65_536 { b2s::ENABLE_ZSTD_PRESET } else { b2s::ENABLE_ZSTD_CUSTOM };
    let mut headers = broadcast_protocol::Headers::new();
    headers.insert("x-identifier", broadcast_protocol::encode_min_uint(dict.id));
    headers.insert("x-compression-level", broadcast_protocol::encode_min_uint(dict.level as u64));
    headers.insert("x-min-size", (min_size).to_be_bytes().to_vec());
    headers.insert("x-max-size", max_size.to_be_bytes().to_vec());

    let body = if msg_type == b2s::ENABLE_ZSTD_CUSTOM {
        dict.bytes.as_deref().cloned().unwrap_or_default()
    } else {
        Vec::new()
    };

    session.pending_sends.push_back(PendingSend { headers, msg_type, body });
}
