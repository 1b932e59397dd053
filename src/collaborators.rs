//! External collaborator contracts (spec §6). These are the five
//! interfaces the session engine calls out to; none of them are
//! implemented here — production implementations (the persistent
//! subscription store, the outbound HTTP delivery client, the pluggable
//! auth provider, ...) live outside this crate's scope. See
//! `broadcast-test-support` for stub implementations used by this crate's
//! own tests.

use async_trait::async_trait;
use std::pin::Pin;
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot};

use crate::error::SessionResult;
use crate::spool::SpoolBuffer;

/// An owned, one-shot readable body handed across a collaborator boundary --
/// either a fully in-memory cursor or a spooled file, type-erased so callers
/// on both sides don't need to know which.
pub type BodyStream = Pin<Box<dyn tokio::io::AsyncRead + Send>>;

/// Opaque handle a [`FanoutHub`] hands back from `register_receiver`, used
/// to unregister the same queue at teardown.
pub type ReceiverId = u64;

/// Outcome of an authorization check. Anything but `Ok` is fatal for the
/// connection (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    Unauthorized,
    Forbidden,
    Unavailable,
}

impl AuthOutcome {
    pub fn is_ok(self) -> bool {
        matches!(self, AuthOutcome::Ok)
    }
}

/// Verifies inbound authorization URLs minted by the session (spec §4.7).
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn is_subscribe_exact_allowed(
        &self,
        url: &str,
        topic: &[u8],
        now: SystemTime,
        authorization: Option<&str>,
    ) -> AuthOutcome;

    async fn is_subscribe_glob_allowed(
        &self,
        url: &str,
        glob: &str,
        now: SystemTime,
        authorization: Option<&str>,
    ) -> AuthOutcome;

    async fn is_notify_allowed(
        &self,
        url: &str,
        topic: &[u8],
        message_sha512: &[u8; 64],
        now: SystemTime,
        authorization: Option<&str>,
    ) -> AuthOutcome;
}

/// Signs outbound authorization URLs (spec §4.7).
#[async_trait]
pub trait AuthSigner: Send + Sync {
    async fn setup_authorization(
        &self,
        url: &str,
        topic: &[u8],
        message_sha512: &[u8; 64],
        now: SystemTime,
    ) -> Option<String>;
}

/// One entry yielded while iterating matched subscribers during a publish
/// (spec §6 `FanoutHub`).
#[derive(Debug, Clone)]
pub enum MatchedSubscriber {
    Exact { url: String },
    Glob { url: String, glob: String },
    Unavailable,
}

/// The cross-connection router every session registers its subscriptions
/// with and asks to iterate matched subscribers when delivering a publish.
#[async_trait]
pub trait FanoutHub: Send + Sync {
    async fn increment_exact(&self, topic: &[u8]);
    async fn decrement_exact(&self, topic: &[u8]);
    async fn increment_glob(&self, pattern: &str);
    async fn decrement_glob(&self, pattern: &str);

    /// Subscribers matching `topic`, used by the delivery fanout when this
    /// session is the publisher of a notification.
    async fn matched_subscribers(&self, topic: &[u8]) -> Vec<MatchedSubscriber>;

    /// Registers this connection as a delivery target: `sender` is the
    /// sending half of the queue this session polls in its own select loop
    /// (spec §3 "inbound-delivery queue from the fanout hub"). Called once,
    /// on the `WaitingConfigure` -> `Open` transition. The returned id is
    /// handed back to `unregister_receiver` at teardown.
    async fn register_receiver(&self, sender: mpsc::UnboundedSender<FanoutItem>) -> ReceiverId;

    /// Drops this connection as a delivery target. Called once, during
    /// teardown, iff `register_receiver` ran.
    async fn unregister_receiver(&self, id: ReceiverId);
}

/// Result of asking the delivery fanout to forward a verified notification
/// to every matching subscriber URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Ok,
    Unavailable,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryOutcome {
    pub status_succeeded: u32,
    pub status_failed: u32,
}

/// Forwards a fully verified, decompressed notification to each matching
/// subscriber URL (spec §6 `DeliveryFanout`). Out of this crate's scope to
/// implement: it owns the outbound HTTP client.
///
/// `body_stream` is handed over already positioned at the start of exactly
/// `content_length` decompressed bytes; the implementation is expected to
/// read it to completion (spooled notification bodies never got smaller by
/// going through this trait, so this keeps a large notify from doubling its
/// memory footprint on the way out).
#[async_trait]
pub trait DeliveryFanout: Send + Sync {
    async fn handle_trusted_notify(
        &self,
        topic: &[u8],
        body_stream: BodyStream,
        content_length: u64,
        decompressed_sha512: &[u8; 64],
    ) -> SessionResult<(DeliveryStatus, DeliveryOutcome)>;
}

/// One item the fanout hub has handed this session to deliver downstream
/// (spec §4.4).
pub enum FanoutItem {
    Small { topic: Vec<u8>, sha512: [u8; 64], bytes: Vec<u8> },
    LargeSpooled { topic: Vec<u8>, sha512: [u8; 64], body: SpoolBuffer },
    /// An exclusive, one-shot stream straight from the hub (spec §9): the
    /// session must drain it fully and fire `finished_signal` as soon as
    /// the last byte is read -- before compression or chunking finishes --
    /// so the publisher side can release the stream's owner early.
    LargeStreamed {
        topic: Vec<u8>,
        sha512: [u8; 64],
        length: u64,
        stream: BodyStream,
        finished_signal: oneshot::Sender<()>,
    },
}

/// Dictionary lookup and training (spec §6 `DictionaryProvider`).
#[async_trait]
pub trait DictionaryProvider: Send + Sync {
    /// Looks up an operator-preset dictionary (ID in 2..65536) by ID.
    async fn get_compression_dictionary_by_id(&self, id: u64) -> Option<(Vec<u8>, i32)>;

    /// Trains a dictionary from accumulated samples once the low watermark
    /// fires for the first time on a connection.
    async fn train_compression_dict_low_watermark(&self, samples: Vec<Vec<u8>>) -> SessionResult<(Vec<u8>, i32)>;

    /// Trains a dictionary from accumulated samples at the high watermark
    /// (first time, and every retrain thereafter).
    async fn train_compression_dict_high_watermark(&self, samples: Vec<Vec<u8>>) -> SessionResult<(Vec<u8>, i32)>;
}
