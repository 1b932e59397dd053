//! The configuration surface the core consumes (spec §6). Loading these
//! values from the environment, a file, or a CLI is the hosting service's
//! job, not this crate's — see `SPEC_FULL.md` §10.4.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// In-memory buffer threshold before a notification body spills to a
    /// temp file.
    pub message_body_spool_size: usize,
    /// Upper bound on a single outbound wire message, if any. `None` means
    /// unbounded (an operator misconfiguration the egress pipeline tolerates
    /// rather than rejects, per §4.4).
    pub outgoing_max_ws_message_size: Option<usize>,
    pub websocket_accept_timeout: Duration,
    pub websocket_large_direct_send_timeout: Option<Duration>,
    pub websocket_max_pending_sends: usize,
    pub websocket_max_unprocessed_receives: usize,
    /// `None` means unbounded (spec: 0 means unbounded; represented here as
    /// `None` so callers can't confuse "unbounded" with "blocks forever").
    pub websocket_send_max_unacknowledged: Option<usize>,
    pub websocket_minimal_headers: bool,
    pub compression_allowed: bool,
    pub allow_training: bool,
    pub compression_min_size: u32,
    pub compression_trained_max_size: u32,
    pub compression_training_low_watermark: u64,
    pub compression_training_high_watermark: u64,
    pub compression_retrain_interval_seconds: f64,
    pub decompression_max_window_size: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            message_body_spool_size: 1024 * 1024,
            outgoing_max_ws_message_size: Some(4 * 1024 * 1024),
            websocket_accept_timeout: Duration::from_secs(10),
            websocket_large_direct_send_timeout: Some(Duration::from_secs(5)),
            websocket_max_pending_sends: 256,
            websocket_max_unprocessed_receives: 256,
            websocket_send_max_unacknowledged: Some(64),
            websocket_minimal_headers: false,
            compression_allowed: true,
            allow_training: true,
            compression_min_size: 32,
            compression_trained_max_size: 16 * 1024,
            compression_training_low_watermark: 100_000,
            compression_training_high_watermark: 10_000_000,
            compression_retrain_interval_seconds: 3600.0,
            decompression_max_window_size: 64 * 1024 * 1024,
        }
    }
}

/// Per-connection negotiated configuration, set once in `WaitingConfigure`
/// (spec §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionConfig {
    pub enable_zstd: bool,
    pub enable_training: bool,
}
