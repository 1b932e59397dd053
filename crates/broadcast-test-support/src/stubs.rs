//! Stub collaborator implementations. Each stub is configured up front
//! with the canned outcome it should return, which is enough to drive both
//! the happy path and every rejection path through a session without a
//! real auth service, fanout hub, or HTTP client behind it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;

use broadcaster_session::collaborators::{
    AuthOutcome, AuthSigner, AuthVerifier, BodyStream, DeliveryFanout, DeliveryOutcome, DeliveryStatus,
    DictionaryProvider, FanoutHub, FanoutItem, MatchedSubscriber, ReceiverId,
};
use broadcaster_session::error::SessionResult;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

/// Always returns the same [`AuthOutcome`] for every check.
pub struct StubAuthVerifier {
    pub outcome: AuthOutcome,
}

impl StubAuthVerifier {
    pub fn allow_all() -> Self {
        Self { outcome: AuthOutcome::Ok }
    }

    pub fn deny_all() -> Self {
        Self { outcome: AuthOutcome::Forbidden }
    }
}

#[async_trait]
impl AuthVerifier for StubAuthVerifier {
    async fn is_subscribe_exact_allowed(&self, _url: &str, _topic: &[u8], _now: SystemTime, _authorization: Option<&str>) -> AuthOutcome {
        self.outcome
    }

    async fn is_subscribe_glob_allowed(&self, _url: &str, _glob: &str, _now: SystemTime, _authorization: Option<&str>) -> AuthOutcome {
        self.outcome
    }

    async fn is_notify_allowed(&self, _url: &str, _topic: &[u8], _message_sha512: &[u8; 64], _now: SystemTime, _authorization: Option<&str>) -> AuthOutcome {
        self.outcome
    }
}

/// Never signs anything (returns `None`, i.e. omit the `Authorization`
/// header) unless constructed with `always_sign`.
pub struct StubAuthSigner {
    pub signature: Option<String>,
}

impl StubAuthSigner {
    pub fn never_signs() -> Self {
        Self { signature: None }
    }

    pub fn always_signs(value: impl Into<String>) -> Self {
        Self { signature: Some(value.into()) }
    }
}

#[async_trait]
impl AuthSigner for StubAuthSigner {
    async fn setup_authorization(&self, _url: &str, _topic: &[u8], _message_sha512: &[u8; 64], _now: SystemTime) -> Option<String> {
        self.signature.clone()
    }
}

/// Records increment/decrement calls and reports no other subscribers by
/// default -- enough for single-connection integration tests where this
/// session is both publisher and the only subscriber.
#[derive(Default)]
pub struct StubFanoutHub {
    pub exact_refcounts: Mutex<std::collections::HashMap<Vec<u8>, i64>>,
    pub glob_refcounts: Mutex<std::collections::HashMap<String, i64>>,
    pub receivers: Mutex<std::collections::HashMap<ReceiverId, mpsc::UnboundedSender<FanoutItem>>>,
    next_receiver_id: AtomicU64,
}

#[async_trait]
impl FanoutHub for StubFanoutHub {
    async fn increment_exact(&self, topic: &[u8]) {
        *self.exact_refcounts.lock().unwrap().entry(topic.to_vec()).or_insert(0) += 1;
    }

    async fn decrement_exact(&self, topic: &[u8]) {
        *self.exact_refcounts.lock().unwrap().entry(topic.to_vec()).or_insert(0) -= 1;
    }

    async fn increment_glob(&self, pattern: &str) {
        *self.glob_refcounts.lock().unwrap().entry(pattern.to_owned()).or_insert(0) += 1;
    }

    async fn decrement_glob(&self, pattern: &str) {
        *self.glob_refcounts.lock().unwrap().entry(pattern.to_owned()).or_insert(0) -= 1;
    }

    async fn matched_subscribers(&self, _topic: &[u8]) -> Vec<MatchedSubscriber> {
        Vec::new()
    }

    async fn register_receiver(&self, sender: mpsc::UnboundedSender<FanoutItem>) -> ReceiverId {
        let id = self.next_receiver_id.fetch_add(1, Ordering::SeqCst);
        self.receivers.lock().unwrap().insert(id, sender);
        id
    }

    async fn unregister_receiver(&self, id: ReceiverId) {
        self.receivers.lock().unwrap().remove(&id);
    }
}

/// Reports every `handle_trusted_notify` call as succeeding for exactly
/// one subscriber, and records the bodies it was handed so tests can
/// assert on what made it through decompression/reassembly.
#[derive(Default)]
pub struct StubDeliveryFanout {
    pub delivered: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
}

#[async_trait]
impl DeliveryFanout for StubDeliveryFanout {
    async fn handle_trusted_notify(
        &self,
        topic: &[u8],
        mut body_stream: BodyStream,
        content_length: u64,
        _decompressed_sha512: &[u8; 64],
    ) -> SessionResult<(DeliveryStatus, DeliveryOutcome)> {
        let mut body = Vec::with_capacity(content_length as usize);
        body_stream.read_to_end(&mut body).await?;
        self.delivered.lock().unwrap().push((topic.to_vec(), body));
        Ok((DeliveryStatus::Ok, DeliveryOutcome { status_succeeded: 1, status_failed: 0 }))
    }
}

/// Trains a dictionary deterministically: the "trained" bytes are just a
/// concatenation of the samples' lengths, which is enough to assert a
/// training round happened without needing a real zstd dictionary trainer
/// in test.
pub struct StubDictionaryProvider {
    pub preset: Option<(u64, Vec<u8>, i32)>,
    pub level: i32,
    trainings: AtomicU64,
}

impl StubDictionaryProvider {
    pub fn new() -> Self {
        Self { preset: None, level: 3, trainings: AtomicU64::new(0) }
    }

    pub fn trainings_run(&self) -> u64 {
        self.trainings.load(Ordering::SeqCst)
    }
}

impl Default for StubDictionaryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DictionaryProvider for StubDictionaryProvider {
    async fn get_compression_dictionary_by_id(&self, id: u64) -> Option<(Vec<u8>, i32)> {
        self.preset.as_ref().filter(|(preset_id, _, _)| *preset_id == id).map(|(_, bytes, level)| (bytes.clone(), *level))
    }

    async fn train_compression_dict_low_watermark(&self, samples: Vec<Vec<u8>>) -> SessionResult<(Vec<u8>, i32)> {
        self.trainings.fetch_add(1, Ordering::SeqCst);
        Ok((samples.into_iter().flatten().collect(), self.level))
    }

    async fn train_compression_dict_high_watermark(&self, samples: Vec<Vec<u8>>) -> SessionResult<(Vec<u8>, i32)> {
        self.trainings.fetch_add(1, Ordering::SeqCst);
        Ok((samples.into_iter().flatten().collect(), self.level))
    }
}
