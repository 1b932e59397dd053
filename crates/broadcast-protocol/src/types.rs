//! Frame shape and the fixed type/header tables from spec §4.2 and §6.

/// An ordered header block: ASCII-lowercase names to byte-string values.
///
/// Duplicate names are not an error at this layer — `last wins` on decode is
/// implemented by `insert`, which overwrites an existing entry's value in
/// place rather than appending a second one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, Vec<u8>)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, lowercasing its name. A repeated name overwrites
    /// the previous value in place (order of first occurrence is kept).
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        let name = name.into().to_ascii_lowercase();
        let value = value.into();
        if let Some(existing) = self.0.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = value;
        } else {
            self.0.push((name, value));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        let name = name.to_ascii_lowercase();
        self.0.iter().find(|(n, _)| *n == name).map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Vec<u8>)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, Vec<u8>)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A decoded frame: flags, type code, headers, body.
///
/// `flags` bit 0 is `MINIMAL_HEADERS` (see [`crate::MINIMAL_HEADERS_FLAG`]);
/// all other bits are reserved and must be cleared by encoders and ignored
/// by decoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u16,
    pub msg_type: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u16) -> Self {
        Self {
            flags: 0,
            msg_type,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

/// Which side of the connection a frame's type code belongs to. The same
/// numeric type code means different things depending on direction, so a
/// decoder must be told which table to consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Subscriber -> broadcaster.
    SubscriberToBroadcaster,
    /// Broadcaster -> subscriber.
    BroadcasterToSubscriber,
}

/// Subscriber -> broadcaster type codes (§6).
pub mod s2b {
    pub const CONFIGURE: u16 = 1;
    pub const SUBSCRIBE_EXACT: u16 = 2;
    pub const SUBSCRIBE_GLOB: u16 = 3;
    pub const UNSUBSCRIBE_EXACT: u16 = 4;
    pub const UNSUBSCRIBE_GLOB: u16 = 5;
    pub const NOTIFY: u16 = 6;
    pub const NOTIFY_STREAM: u16 = 7;
    pub const CONTINUE_RECEIVE: u16 = 8;
    pub const CONFIRM_RECEIVE: u16 = 9;
}

/// Broadcaster -> subscriber type codes (§6).
pub mod b2s {
    pub const CONFIRM_CONFIGURE: u16 = 1;
    pub const CONFIRM_SUBSCRIBE_EXACT: u16 = 2;
    pub const CONFIRM_SUBSCRIBE_GLOB: u16 = 3;
    pub const CONFIRM_UNSUBSCRIBE_EXACT: u16 = 4;
    pub const CONFIRM_UNSUBSCRIBE_GLOB: u16 = 5;
    pub const CONFIRM_NOTIFY: u16 = 6;
    pub const CONTINUE_NOTIFY: u16 = 7;
    pub const RECEIVE_STREAM: u16 = 8;
    pub const ENABLE_ZSTD_PRESET: u16 = 9;
    pub const ENABLE_ZSTD_CUSTOM: u16 = 10;
}

pub(crate) fn s2b_name(t: u16) -> &'static str {
    match t {
        s2b::CONFIGURE => "configure",
        s2b::SUBSCRIBE_EXACT => "subscribe_exact",
        s2b::SUBSCRIBE_GLOB => "subscribe_glob",
        s2b::UNSUBSCRIBE_EXACT => "unsubscribe_exact",
        s2b::UNSUBSCRIBE_GLOB => "unsubscribe_glob",
        s2b::NOTIFY => "notify",
        s2b::NOTIFY_STREAM => "notify_stream",
        s2b::CONTINUE_RECEIVE => "continue_receive",
        s2b::CONFIRM_RECEIVE => "confirm_receive",
        _ => "unknown",
    }
}

pub(crate) fn b2s_name(t: u16) -> &'static str {
    match t {
        b2s::CONFIRM_CONFIGURE => "confirm_configure",
        b2s::CONFIRM_SUBSCRIBE_EXACT => "confirm_subscribe_exact",
        b2s::CONFIRM_SUBSCRIBE_GLOB => "confirm_subscribe_glob",
        b2s::CONFIRM_UNSUBSCRIBE_EXACT => "confirm_unsubscribe_exact",
        b2s::CONFIRM_UNSUBSCRIBE_GLOB => "confirm_unsubscribe_glob",
        b2s::CONFIRM_NOTIFY => "confirm_notify",
        b2s::CONTINUE_NOTIFY => "continue_notify",
        b2s::RECEIVE_STREAM => "receive_stream",
        b2s::ENABLE_ZSTD_PRESET => "enable_zstd_preset",
        b2s::ENABLE_ZSTD_CUSTOM => "enable_zstd_custom",
        _ => "unknown",
    }
}

/// Human-readable names for subscriber -> broadcaster type codes, for logging.
pub const S2B_TYPE_NAMES: fn(u16) -> &'static str = s2b_name;
/// Human-readable names for broadcaster -> subscriber type codes, for logging.
pub const B2S_TYPE_NAMES: fn(u16) -> &'static str = b2s_name;

/// The fixed, ordered header-name list used by the minimal encoding for a
/// message type that doesn't need `NOTIFY_STREAM`/`RECEIVE_STREAM`'s
/// conditional shape. Returns `None` for the two streaming types, which are
/// handled specially by the codec (`codec::encode_minimal_stream`).
pub(crate) fn minimal_header_order(direction: MessageDirection, msg_type: u16) -> Option<&'static [&'static str]> {
    use MessageDirection::{BroadcasterToSubscriber, SubscriberToBroadcaster};
    match (direction, msg_type) {
        (SubscriberToBroadcaster, s2b::CONFIGURE) => {
            Some(&["x-subscriber-nonce", "x-enable-zstd", "x-enable-training", "x-initial-dict"])
        }
        (SubscriberToBroadcaster, s2b::SUBSCRIBE_EXACT) => Some(&["authorization", "x-topic"]),
        (SubscriberToBroadcaster, s2b::SUBSCRIBE_GLOB) => Some(&["authorization", "x-glob"]),
        (SubscriberToBroadcaster, s2b::UNSUBSCRIBE_EXACT) => Some(&["authorization", "x-topic"]),
        (SubscriberToBroadcaster, s2b::UNSUBSCRIBE_GLOB) => Some(&["authorization", "x-glob"]),
        (SubscriberToBroadcaster, s2b::NOTIFY) => Some(&[
            "authorization",
            "x-topic",
            "x-identifier",
            "x-compressor",
            "x-compressed-length",
            "x-decompressed-length",
            "x-compressed-sha512",
        ]),
        (SubscriberToBroadcaster, s2b::CONTINUE_RECEIVE) => Some(&["x-identifier", "x-part-id"]),
        (SubscriberToBroadcaster, s2b::CONFIRM_RECEIVE) => Some(&["x-identifier"]),
        (BroadcasterToSubscriber, b2s::CONFIRM_CONFIGURE) => Some(&["x-broadcaster-nonce"]),
        (BroadcasterToSubscriber, b2s::CONFIRM_SUBSCRIBE_EXACT) => Some(&["x-topic"]),
        (BroadcasterToSubscriber, b2s::CONFIRM_SUBSCRIBE_GLOB) => Some(&["x-glob"]),
        (BroadcasterToSubscriber, b2s::CONFIRM_UNSUBSCRIBE_EXACT) => Some(&["x-topic"]),
        (BroadcasterToSubscriber, b2s::CONFIRM_UNSUBSCRIBE_GLOB) => Some(&["x-glob"]),
        (BroadcasterToSubscriber, b2s::CONFIRM_NOTIFY) => Some(&["x-identifier", "x-subscribers"]),
        (BroadcasterToSubscriber, b2s::CONTINUE_NOTIFY) => Some(&["x-identifier", "x-part-id"]),
        (BroadcasterToSubscriber, b2s::ENABLE_ZSTD_PRESET | b2s::ENABLE_ZSTD_CUSTOM) => {
            Some(&["x-identifier", "x-compression-level", "x-min-size", "x-max-size"])
        }
        _ => None,
    }
}
