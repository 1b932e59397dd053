//! Compression Manager (spec §4.5): up to three zstd compressor slots per
//! connection, their background preparation, and the dictionary-rotation
//! rule that keeps at most two custom dictionaries alive at once.

pub mod trainer;

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::{SessionError, SessionResult};
use crate::spool::SpoolBuffer;

/// Chunk size `compress_stream` reads from its source and flushes out of
/// the encoder at a time.
const STREAM_CHUNK: usize = 64 * 1024;

/// Dictionary ID space (spec §4.5): 0 and 1 are reserved, `2..65_536` are
/// operator presets, `65_536..` are session-trained.
pub const NO_COMPRESSION_ID: u64 = 0;
pub const STANDARD_ID: u64 = 1;
pub const FIRST_TRAINED_ID: u64 = 65_536;

/// A zstd dictionary plus the compression level it was trained/configured
/// at. `None` dict bytes means the standard (no-dictionary) compressor.
#[derive(Debug, Clone)]
pub struct Dictionary {
    pub id: u64,
    pub bytes: Option<Arc<Vec<u8>>>,
    pub level: i32,
}

impl Dictionary {
    pub fn standard(level: i32) -> Self {
        Self { id: STANDARD_ID, bytes: None, level }
    }
}

/// A compressor slot's lifecycle: a background task is preparing the
/// dictionary (tagged with the ID it will resolve to, so a `NOTIFY` naming
/// that ID can find and await the right task), or it's ready.
pub enum CompressorSlot {
    Preparing { id: u64, handle: JoinHandle<SessionResult<Dictionary>> },
    Ready(Dictionary),
}

impl CompressorSlot {
    fn cancel_if_preparing(self) {
        if let CompressorSlot::Preparing { handle, .. } = self {
            handle.abort();
        }
    }

    fn id(&self) -> u64 {
        match self {
            CompressorSlot::Preparing { id, .. } => *id,
            CompressorSlot::Ready(dict) => dict.id,
        }
    }
}

/// Holds the three compressor slots for one connection and the next
/// trained-dictionary ID to mint.
pub struct CompressionManager {
    pub standard: Option<CompressorSlot>,
    pub active: Option<CompressorSlot>,
    pub last: Option<CompressorSlot>,
    pub custom_dict_counter: u64,
    pub compression_allowed: bool,
}

impl CompressionManager {
    pub fn new(compression_allowed: bool) -> Self {
        Self {
            standard: None,
            active: None,
            last: None,
            custom_dict_counter: FIRST_TRAINED_ID,
            compression_allowed,
        }
    }

    pub fn mint_trained_id(&mut self) -> u64 {
        let id = self.custom_dict_counter;
        self.custom_dict_counter += 1;
        id
    }

    /// Rotation rule on a newly-ready custom dictionary: cancel `last` if
    /// it's still preparing, shift `active` down into `last`, and install
    /// the new dictionary as `active`.
    pub fn rotate_in(&mut self, ready: Dictionary) {
        if let Some(last) = self.last.take() {
            last.cancel_if_preparing();
        }
        self.last = self.active.take();
        self.active = Some(CompressorSlot::Ready(ready));
    }

    /// Three-slot lookup by ID, used when decompressing an inbound `NOTIFY`
    /// that names a `compressor_id` (spec §4.4).
    pub fn find_ready(&self, id: u64) -> Option<&Dictionary> {
        for slot in [&self.standard, &self.active, &self.last].into_iter().flatten() {
            if let CompressorSlot::Ready(dict) = slot {
                if dict.id == id {
                    return Some(dict);
                }
            }
        }
        None
    }

    /// True if some slot names `id` and is still preparing — callers that
    /// hit this for a `NOTIFY`'s `compressor_id` should await that slot's
    /// task rather than erroring with "unknown compressor ID".
    pub fn is_preparing(&self, id: u64) -> bool {
        [&self.standard, &self.active, &self.last]
            .into_iter()
            .flatten()
            .any(|slot| slot.id() == id && matches!(slot, CompressorSlot::Preparing { .. }))
    }
}

/// Compresses `input` with the given dictionary, returning the compressed
/// bytes. Runs synchronously on the calling task — callers that need this
/// off the session's cooperative loop should wrap it in
/// `tokio::task::spawn_blocking`.
pub fn compress(input: &[u8], dict: &Dictionary) -> SessionResult<Vec<u8>> {
    let out = match &dict.bytes {
        None => zstd::stream::encode_all(input, dict.level)
            .map_err(|e| SessionError::local_fault(format!("zstd compress: {e}")))?,
        Some(bytes) => {
            let mut encoder = zstd::stream::Encoder::with_dictionary(Vec::new(), dict.level, bytes)
                .map_err(|e| SessionError::local_fault(format!("zstd encoder init: {e}")))?;
            std::io::Write::write_all(&mut encoder, input)
                .map_err(|e| SessionError::local_fault(format!("zstd compress: {e}")))?;
            encoder
                .finish()
                .map_err(|e| SessionError::local_fault(format!("zstd finish: {e}")))?
        }
    };
    Ok(out)
}

/// Compresses `source` (read in bounded chunks via `read_chunk`) into
/// `sink`, without ever materializing the whole decompressed or compressed
/// payload in one allocation. Used by the egress pipeline for spooled and
/// streamed notifications, where the whole point of spilling to disk in the
/// first place is defeated by `read_all`-ing it back before compressing.
pub async fn compress_stream(source: &mut SpoolBuffer, sink: &mut SpoolBuffer, dict: &Dictionary) -> SessionResult<()> {
    use std::io::Write;

    let mut encoder = match &dict.bytes {
        None => zstd::stream::write::Encoder::new(Vec::new(), dict.level),
        Some(bytes) => zstd::stream::write::Encoder::with_dictionary(Vec::new(), dict.level, bytes),
    }
    .map_err(|e| SessionError::local_fault(format!("zstd encoder init: {e}")))?;

    loop {
        let chunk = source.read_chunk(STREAM_CHUNK).await?;
        if chunk.is_empty() {
            break;
        }
        encoder.write_all(&chunk).map_err(|e| SessionError::local_fault(format!("zstd compress: {e}")))?;
        encoder.flush().map_err(|e| SessionError::local_fault(format!("zstd flush: {e}")))?;
        let produced = std::mem::take(encoder.get_mut());
        if !produced.is_empty() {
            sink.write(&produced).await?;
        }
    }

    let tail = encoder.finish().map_err(|e| SessionError::local_fault(format!("zstd finish: {e}")))?;
    if !tail.is_empty() {
        sink.write(&tail).await?;
    }
    Ok(())
}

/// Decompresses `input` with the given dictionary, capped by
/// `max_window_size` (spec §4.5, decompression-bomb defense) and the exact
/// expected output length.
///
/// `max_window_size` must be a power of two -- it's converted to zstd's
/// `window_log_max` via `trailing_zeros`, which is only exact for powers of
/// two. Every window-size knob `BroadcasterConfig` exposes is documented as
/// one; this catches a misconfiguration early instead of silently handing
/// zstd a rounded-down (and too permissive or too strict) bound.
pub fn decompress(input: &[u8], dict: &Dictionary, max_window_size: usize, expected_len: u64) -> SessionResult<Vec<u8>> {
    use std::io::Read;

    debug_assert!(
        max_window_size.is_power_of_two(),
        "decompression_max_window_size ({max_window_size}) must be a power of two"
    );

    let mut decoder = match &dict.bytes {
        None => zstd::stream::Decoder::new(input).map_err(|e| SessionError::local_fault(format!("zstd decoder init: {e}")))?,
        Some(bytes) => zstd::stream::Decoder::with_dictionary(input, bytes)
            .map_err(|e| SessionError::local_fault(format!("zstd decoder init: {e}")))?,
    };
    decoder
        .window_log_max(max_window_size.trailing_zeros() as u32)
        .ok();

    let cap = expected_len.min(max_window_size as u64) as usize;
    let mut out = Vec::with_capacity(cap);
    let mut limited = (&mut decoder).take(expected_len + 1);
    limited
        .read_to_end(&mut out)
        .map_err(|e| SessionError::integrity(format!("zstd decompress: {e}")))?;

    if out.len() as u64 != expected_len {
        return Err(SessionError::integrity(format!(
            "decompressed length {} does not match declared {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}
