/// Framing-level failure. Anything from here is a protocol violation from
/// the engine's point of view (§7 `ProtocolError`).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame too short: needed {needed} bytes, had {had}")]
    Truncated { needed: usize, had: usize },

    #[error("header name is not ASCII")]
    NonAsciiHeaderName,

    #[error("unknown message type {0} for this direction")]
    UnknownType(u16),

    #[error("value too large to encode: {len} bytes exceeds u16::MAX")]
    ValueTooLarge { len: usize },

    #[error("numeric field does not fit in 8 bytes")]
    NumericFieldTooWide,

    #[error("minimal-header frame is missing required header {0}")]
    MissingMinimalHeader(&'static str),
}
