//! The bidirectional byte-message channel a session drives (spec §5).
//!
//! The engine doesn't know or care whether the underlying transport is a
//! WebSocket, a Unix socket, or an in-memory duplex used by tests. It only
//! needs something that yields whole binary messages and accepts whole
//! binary messages back, each message already framed at the transport level
//! (one WS binary frame == one wire message here).

use futures_util::{Sink, Stream};
use std::pin::Pin;

/// A single binary message moving across the transport in either direction.
pub type WireMessage = Vec<u8>;

/// Anything that can be driven as the session's transport: a stream of
/// inbound binary messages paired with a sink for outbound ones, plus a way
/// to close the underlying connection.
///
/// Implementors are expected to translate their native error type into
/// `TransportError` at the boundary; the session core never matches on a
/// concrete transport error.
pub trait Transport:
    Stream<Item = Result<WireMessage, TransportError>> + Sink<WireMessage, Error = TransportError> + Unpin + Send
{
    /// Closes the underlying connection with an optional informational code
    /// and reason. Best-effort: failures here are logged, not propagated,
    /// since the session is already on its way down by the time this is
    /// called.
    fn close(self: Pin<&mut Self>, code: u16, reason: &str) -> futures_util::future::BoxFuture<'_, ()>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport I/O error: {0}")]
    Io(String),
    #[error("message exceeded transport's own size limit")]
    TooLarge,
}
