//! Wire format for the stateful broadcaster session protocol.
//!
//! A `Frame` is the decoded form of one message on the bidirectional
//! byte-message channel: a 16-bit flags word, a 16-bit type code, an ordered
//! header block, and a body. Two header encodings share the same type-code
//! space (§4.2 of the spec this crate implements): *expanded*, which is
//! self-describing, and *minimal*, which relies on a fixed header order per
//! message type to avoid repeating header names on the wire.
//!
//! This crate only knows about framing. It has no opinion on what a
//! `NOTIFY` or `SUBSCRIBE_EXACT` frame should cause to happen; that's
//! `broadcaster_session`'s job.

mod codec;
mod error;
mod types;

pub use codec::{decode, decode_uint, encode, encode_min_uint, MINIMAL_HEADERS_FLAG};
pub use error::CodecError;
pub use types::{b2s, s2b, Frame, Headers, MessageDirection, B2S_TYPE_NAMES, S2B_TYPE_NAMES};
