//! Test doubles for driving a [`broadcaster_session::Session`] without a
//! real socket: an in-memory duplex transport and stub implementations of
//! every external collaborator trait, each configurable enough to exercise
//! both the happy path and the rejection paths.

mod duplex;
mod stubs;

pub use duplex::{duplex_pair, DuplexTransport};
pub use stubs::{
    StubAuthSigner, StubAuthVerifier, StubDeliveryFanout, StubDictionaryProvider, StubFanoutHub,
};
