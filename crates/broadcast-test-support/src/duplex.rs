//! An in-memory duplex transport: two [`DuplexTransport`] halves connected
//! by a pair of unbounded channels, one per direction. Used in place of a
//! real socket so tests can drive a session with full control over frame
//! timing without binding a port.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use broadcaster_session::transport::{Transport, TransportError, WireMessage};

pub struct DuplexTransport {
    rx: UnboundedReceiverStream<WireMessage>,
    tx: mpsc::UnboundedSender<WireMessage>,
    closed: bool,
}

/// Builds a connected pair: whatever is sent on one side arrives as a
/// `Stream` item on the other.
pub fn duplex_pair() -> (DuplexTransport, DuplexTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        DuplexTransport { rx: UnboundedReceiverStream::new(a_rx), tx: a_tx, closed: false },
        DuplexTransport { rx: UnboundedReceiverStream::new(b_rx), tx: b_tx, closed: false },
    )
}

impl Stream for DuplexTransport {
    type Item = Result<WireMessage, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.rx).poll_next(cx).map(|opt| opt.map(Ok))
    }
}

impl Sink<WireMessage> for DuplexTransport {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WireMessage) -> Result<(), Self::Error> {
        self.tx.send(item).map_err(|_| TransportError::Closed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Transport for DuplexTransport {
    fn close(mut self: Pin<&mut Self>, _code: u16, _reason: &str) -> BoxFuture<'_, ()> {
        self.closed = true;
        Box::pin(async {})
    }
}
