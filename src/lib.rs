//! Stateful per-connection session engine for the notification broadcaster.
//!
//! This crate owns exactly one thing: the state machine that drives a
//! single bidirectional byte-message connection through configure,
//! subscribe/publish traffic, adaptive compression, and teardown (see
//! [`session::run_session`]). Everything around it -- the HTTP control
//! surface, the persistent subscription store, the outbound delivery
//! client -- is injected through the traits in [`collaborators`].

pub mod auth;
pub mod collaborators;
pub mod compression;
pub mod config;
pub mod error;
pub mod glob;
pub mod session;
pub mod spool;
pub mod transport;

pub use config::{BroadcasterConfig, ConnectionConfig};
pub use error::{SessionError, SessionResult};
pub use session::{Session, SessionPhase};
