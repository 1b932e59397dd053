//! Session data model (spec §3): the per-connection state a [`Session`]
//! owns, independent of how the state machine drives it (see
//! [`state_machine`]).

pub mod egress;
pub mod ingress;
pub mod state_machine;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use broadcast_protocol::Headers;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::auth::AuthSequencer;
use crate::collaborators::{AuthSigner, AuthVerifier, DeliveryFanout, DictionaryProvider, FanoutHub, ReceiverId};
use crate::compression::trainer::TrainerState;
use crate::compression::CompressionManager;
use crate::config::{BroadcasterConfig, ConnectionConfig};
use crate::error::SessionResult;
use crate::glob::CompiledGlob;
use crate::spool::SpoolBuffer;

pub use crate::collaborators::FanoutItem;
pub use state_machine::{promote_ready_compressors, run_session};

/// The four (plus terminal) states from spec §4.1. `Closed` is not
/// represented explicitly — reaching it is observed by `run_session`
/// returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Accepting,
    WaitingConfigure,
    Open,
    Closing,
}

/// Reassembly state for an in-progress multi-part inbound notification
/// (spec §3 invariant 3, §4.3 `NOTIFY_STREAM`).
pub struct IncomingNotification {
    pub identifier: Vec<u8>,
    pub topic: Vec<u8>,
    pub compressor_id: u64,
    pub compressed_length: u64,
    pub decompressed_length: u64,
    pub compressed_sha512: [u8; 64],
    pub next_expected_part: u64,
    pub body: SpoolBuffer,
}

/// A descriptor of an ack this session expects next, in send order (spec §3
/// invariant 5, §4.3 `CONTINUE_RECEIVE`/`CONFIRM_RECEIVE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedAck {
    ContinueReceive { identifier: Vec<u8>, part_id: u64 },
    ConfirmReceive { identifier: Vec<u8> },
}

/// A unit of outbound work waiting for the send slot (spec §3
/// `pending_sends`).
pub struct PendingSend {
    pub headers: Headers,
    pub msg_type: u16,
    pub body: Vec<u8>,
}

/// The set of external collaborators a session is wired to. Grouped so the
/// state machine can pass one handle around instead of five.
pub struct Collaborators {
    pub auth_verifier: Arc<dyn AuthVerifier>,
    pub auth_signer: Arc<dyn AuthSigner>,
    pub fanout_hub: Arc<dyn FanoutHub>,
    pub delivery_fanout: Arc<dyn DeliveryFanout>,
    pub dictionary_provider: Arc<dyn DictionaryProvider>,
}

/// Everything the session owns for the lifetime of one connection.
pub struct Session {
    pub phase: SessionPhase,
    pub config: BroadcasterConfig,
    pub connection_config: ConnectionConfig,
    pub nonce_b64: String,
    pub auth: AuthSequencer,
    pub compression: CompressionManager,
    pub training: Option<TrainerState>,

    pub exact_subscriptions: HashSet<Vec<u8>>,
    pub glob_subscriptions: Vec<(CompiledGlob, String)>,

    pub incoming_notification: Option<IncomingNotification>,
    pub pending_sends: VecDeque<PendingSend>,
    pub unprocessed_receives: VecDeque<broadcast_protocol::Frame>,
    pub expecting_acks: VecDeque<ExpectedAck>,

    /// The receiving half of the queue this session registered with the
    /// fanout hub (spec §3), `Some` from the `Open` transition onward.
    pub incoming_fanout: Option<mpsc::UnboundedReceiver<FanoutItem>>,
    /// The id `FanoutHub::register_receiver` returned, kept so teardown can
    /// unregister the same queue.
    pub receiver_id: Option<ReceiverId>,
    /// Detached auxiliary tasks the select loop reaps as they finish (spec
    /// §3 `backgrounded`): compressor preparation, dictionary training.
    pub backgrounded: JoinSet<SessionResult<()>>,

    pub spool_dir: Option<std::path::PathBuf>,
    pub started_at: Instant,
}

impl Session {
    pub fn new(config: BroadcasterConfig, spool_dir: Option<std::path::PathBuf>) -> Self {
        Self {
            phase: SessionPhase::Accepting,
            config,
            connection_config: ConnectionConfig::default(),
            nonce_b64: String::new(),
            auth: AuthSequencer::new(&[]),
            compression: CompressionManager::new(true),
            training: None,
            exact_subscriptions: HashSet::new(),
            glob_subscriptions: Vec::new(),
            incoming_notification: None,
            pending_sends: VecDeque::new(),
            unprocessed_receives: VecDeque::new(),
            expecting_acks: VecDeque::new(),
            incoming_fanout: None,
            receiver_id: None,
            backgrounded: JoinSet::new(),
            spool_dir,
            started_at: Instant::now(),
        }
    }

    /// True if `topic` matches an exact subscription or any compiled glob
    /// (spec §4.3): used by the local fast-path when this session is
    /// asking the fanout hub whether *it itself* should receive a publish
    /// it's forwarding. Cross-connection matching is the hub's job.
    pub fn matches_topic(&self, topic: &[u8]) -> bool {
        if self.exact_subscriptions.contains(topic) {
            return true;
        }
        self.glob_subscriptions.iter().any(|(glob, _)| glob.is_match_bytes(topic))
    }
}
