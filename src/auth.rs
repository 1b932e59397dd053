//! Authorization Sequencer (spec §4.7).
//!
//! Mints `stateful:<nonce>:<counter>` URLs handed to the auth verifier on
//! the next frame of a request/response pair. Each direction keeps its own
//! monotonic counter: the broadcaster's counter starts at 1 and increases,
//! the subscriber's starts at -1 and decreases, so a verifier can tell which
//! side minted a given URL just by the sign of the counter without any
//! extra header.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// One minted authorization URL and the counter value it carries, so
/// callers can log or assert on it without re-parsing the URL string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedUrl {
    pub url: String,
    pub counter: i64,
}

/// Mints `stateful:...` URLs for one connection. `nonce` is the connection's
/// session nonce (see [`crate::session::Session::nonce`]), shared verbatim
/// between both directions' URLs.
#[derive(Debug, Clone)]
pub struct AuthSequencer {
    nonce_b64: String,
    broadcaster_counter: i64,
    subscriber_counter: i64,
}

impl AuthSequencer {
    pub fn new(nonce: &[u8]) -> Self {
        Self {
            nonce_b64: URL_SAFE_NO_PAD.encode(nonce),
            broadcaster_counter: 1,
            subscriber_counter: -1,
        }
    }

    /// Mints the next broadcaster-minted URL (e.g. for `CONFIRM_SUBSCRIBE_*`,
    /// outbound `NOTIFY`). Counter increases by one each call, never wraps
    /// in practice (i64 has room for billions of messages per connection).
    pub fn mint_broadcaster_url(&mut self) -> MintedUrl {
        let counter = self.broadcaster_counter;
        self.broadcaster_counter += 1;
        self.render(counter)
    }

    /// Mints the next subscriber-minted URL (e.g. for inbound `NOTIFY`).
    /// Counter decreases by one each call.
    pub fn mint_subscriber_url(&mut self) -> MintedUrl {
        let counter = self.subscriber_counter;
        self.subscriber_counter -= 1;
        self.render(counter)
    }

    fn render(&self, counter: i64) -> MintedUrl {
        let hex_counter = render_counter_hex(counter);
        MintedUrl {
            url: format!("stateful:{}:{}", self.nonce_b64, hex_counter),
            counter,
        }
    }
}

/// Lowercase, unpadded hex for a counter, with a leading `-` for negative
/// values (spec §4.7: "the sign is carried as a literal minus before the
/// hex digits, not two's complement").
fn render_counter_hex(counter: i64) -> String {
    if counter < 0 {
        let magnitude = counter.unsigned_abs();
        format!("-{:x}", magnitude)
    } else {
        format!("{:x}", counter)
    }
}
