//! Expanded and minimal header codecs (spec §4.2).

use crate::error::CodecError;
use crate::types::{b2s, minimal_header_order, s2b, Frame, Headers, MessageDirection};

/// Bit 0 of the flags word: minimal (positional) header encoding.
pub const MINIMAL_HEADERS_FLAG: u16 = 0x0001;

/// Header names the `NOTIFY_STREAM` / `RECEIVE_STREAM` minimal shape uses
/// (spec §4.2's literal layout), in wire order.
const STREAM_PREFIX: &[&str] = &["authorization", "x-identifier", "x-part-id"];
const STREAM_PART_ZERO_SUFFIX: &[&str] = &[
    "x-topic",
    "x-compressor",
    "x-compressed-length",
    "x-decompressed-length",
    "x-compressed-sha512",
];

fn is_stream_type(direction: MessageDirection, msg_type: u16) -> bool {
    match direction {
        MessageDirection::SubscriberToBroadcaster => msg_type == s2b::NOTIFY_STREAM,
        MessageDirection::BroadcasterToSubscriber => msg_type == b2s::RECEIVE_STREAM,
    }
}

/// Encodes a value as the minimum number of big-endian bytes that represent
/// it, per spec §6 ("minimum byte count that fits the value"). Zero is
/// still represented by one byte, since every numeric header in this
/// protocol is a required positional field, never an absent one.
pub fn encode_min_uint(value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![0];
    }
    let bytes = value.to_be_bytes();
    let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap();
    bytes[first_nonzero..].to_vec()
}

/// Decodes up to 8 big-endian bytes as an unsigned integer. The decoder
/// accepts any length up to 8 bytes regardless of what the encoder would
/// have produced (spec §6: "arbitrary ≤8 bytes (decoder)").
pub fn decode_uint(bytes: &[u8]) -> Result<u64, CodecError> {
    if bytes.len() > 8 {
        return Err(CodecError::NumericFieldTooWide);
    }
    let mut buf = [0u8; 8];
    buf[8 - bytes.len()..].copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                had: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_len_prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.take_u16()? as usize;
        self.take(len)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

fn write_len_prefixed(out: &mut Vec<u8>, value: &[u8]) -> Result<(), CodecError> {
    if value.len() > u16::MAX as usize {
        return Err(CodecError::ValueTooLarge { len: value.len() });
    }
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
    Ok(())
}

/// Encodes a frame. The encoding (expanded vs. minimal) is chosen by bit 0
/// of `frame.flags`; all other flag bits are cleared on the wire.
pub fn encode(frame: &Frame, direction: MessageDirection) -> Result<Vec<u8>, CodecError> {
    let minimal = frame.flags & MINIMAL_HEADERS_FLAG != 0;
    let mut out = Vec::with_capacity(64 + frame.body.len());
    out.extend_from_slice(&(frame.flags & MINIMAL_HEADERS_FLAG).to_be_bytes());
    out.extend_from_slice(&frame.msg_type.to_be_bytes());

    if minimal {
        encode_minimal_headers(&mut out, frame, direction)?;
    } else {
        encode_expanded_headers(&mut out, frame)?;
    }

    out.extend_from_slice(&frame.body);
    Ok(out)
}

fn encode_expanded_headers(out: &mut Vec<u8>, frame: &Frame) -> Result<(), CodecError> {
    if frame.headers.len() > u16::MAX as usize {
        return Err(CodecError::ValueTooLarge {
            len: frame.headers.len(),
        });
    }
    out.extend_from_slice(&(frame.headers.len() as u16).to_be_bytes());
    for (name, value) in frame.headers.iter() {
        if !name.is_ascii() {
            return Err(CodecError::NonAsciiHeaderName);
        }
        write_len_prefixed(out, name.as_bytes())?;
        write_len_prefixed(out, value)?;
    }
    Ok(())
}

fn encode_minimal_headers(
    out: &mut Vec<u8>,
    frame: &Frame,
    direction: MessageDirection,
) -> Result<(), CodecError> {
    if is_stream_type(direction, frame.msg_type) {
        for name in STREAM_PREFIX {
            let value = frame.headers.get(name).ok_or(CodecError::MissingMinimalHeader(name))?;
            write_len_prefixed(out, value)?;
        }
        let part_id = frame
            .headers
            .get("x-part-id")
            .ok_or(CodecError::MissingMinimalHeader("x-part-id"))?;
        if decode_uint(part_id)? == 0 {
            for name in STREAM_PART_ZERO_SUFFIX {
                let value = frame.headers.get(name).ok_or(CodecError::MissingMinimalHeader(name))?;
                write_len_prefixed(out, value)?;
            }
        }
        return Ok(());
    }

    let order = minimal_header_order(direction, frame.msg_type)
        .ok_or(CodecError::UnknownType(frame.msg_type))?;
    for name in order {
        let value = frame.headers.get(name).ok_or(CodecError::MissingMinimalHeader(name))?;
        write_len_prefixed(out, value)?;
    }
    Ok(())
}

/// Decodes a frame. Which header table applies depends on `direction`: the
/// same numeric type code means different things for subscriber->broadcaster
/// vs. broadcaster->subscriber traffic.
pub fn decode(bytes: &[u8], direction: MessageDirection) -> Result<Frame, CodecError> {
    let mut r = Reader::new(bytes);
    let flags = r.take_u16()?;
    let msg_type = r.take_u16()?;
    let minimal = flags & MINIMAL_HEADERS_FLAG != 0;

    let headers = if minimal {
        decode_minimal_headers(&mut r, direction, msg_type)?
    } else {
        decode_expanded_headers(&mut r)?
    };

    let body = r.rest().to_vec();
    Ok(Frame {
        flags: flags & MINIMAL_HEADERS_FLAG,
        msg_type,
        headers,
        body,
    })
}

fn decode_expanded_headers(r: &mut Reader<'_>) -> Result<Headers, CodecError> {
    let num_headers = r.take_u16()?;
    let mut headers = Headers::new();
    for _ in 0..num_headers {
        let name = r.take_len_prefixed()?;
        let name = std::str::from_utf8(name).map_err(|_| CodecError::NonAsciiHeaderName)?;
        if !name.is_ascii() {
            return Err(CodecError::NonAsciiHeaderName);
        }
        let value = r.take_len_prefixed()?;
        headers.insert(name.to_owned(), value.to_vec());
    }
    Ok(headers)
}

fn decode_minimal_headers(
    r: &mut Reader<'_>,
    direction: MessageDirection,
    msg_type: u16,
) -> Result<Headers, CodecError> {
    let mut headers = Headers::new();

    if is_stream_type(direction, msg_type) {
        for name in STREAM_PREFIX {
            let value = r.take_len_prefixed()?;
            headers.insert((*name).to_owned(), value.to_vec());
        }
        let part_id = headers.get("x-part-id").expect("just inserted");
        if decode_uint(part_id)? == 0 {
            for name in STREAM_PART_ZERO_SUFFIX {
                let value = r.take_len_prefixed()?;
                headers.insert((*name).to_owned(), value.to_vec());
            }
        }
        return Ok(headers);
    }

    let order = minimal_header_order(direction, msg_type).ok_or(CodecError::UnknownType(msg_type))?;
    for name in order {
        let value = r.take_len_prefixed()?;
        headers.insert((*name).to_owned(), value.to_vec());
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{b2s, s2b};

    fn roundtrip(frame: &Frame, direction: MessageDirection) {
        let encoded = encode(frame, direction).expect("encode");
        let decoded = decode(&encoded, direction).expect("decode");
        assert_eq!(decoded.msg_type, frame.msg_type);
        assert_eq!(decoded.body, frame.body);
        for (name, value) in frame.headers.iter() {
            assert_eq!(decoded.headers.get(name), Some(value), "header {name}");
        }
    }

    #[test]
    fn expanded_roundtrip_subscribe_exact() {
        let mut frame = Frame::new(s2b::SUBSCRIBE_EXACT);
        frame.headers.insert("authorization", b"tok".to_vec());
        frame.headers.insert("x-topic", b"room/1".to_vec());
        frame.body = b"".to_vec();
        roundtrip(&frame, MessageDirection::SubscriberToBroadcaster);
    }

    #[test]
    fn minimal_roundtrip_subscribe_exact() {
        let mut frame = Frame::new(s2b::SUBSCRIBE_EXACT);
        frame.flags = MINIMAL_HEADERS_FLAG;
        frame.headers.insert("authorization", b"tok".to_vec());
        frame.headers.insert("x-topic", b"room/1".to_vec());
        roundtrip(&frame, MessageDirection::SubscriberToBroadcaster);
    }

    #[test]
    fn minimal_roundtrip_notify_stream_part_zero() {
        let mut frame = Frame::new(s2b::NOTIFY_STREAM);
        frame.flags = MINIMAL_HEADERS_FLAG;
        frame.headers.insert("authorization", b"tok".to_vec());
        frame.headers.insert("x-identifier", b"abc123".to_vec());
        frame.headers.insert("x-part-id", encode_min_uint(0));
        frame.headers.insert("x-topic", b"room/1".to_vec());
        frame.headers.insert("x-compressor", encode_min_uint(1));
        frame.headers.insert("x-compressed-length", encode_min_uint(1024));
        frame.headers.insert("x-decompressed-length", encode_min_uint(4096));
        frame.headers.insert("x-compressed-sha512", vec![0u8; 64]);
        frame.body = vec![9; 32];
        roundtrip(&frame, MessageDirection::SubscriberToBroadcaster);
    }

    #[test]
    fn minimal_roundtrip_notify_stream_part_nonzero_omits_suffix() {
        let mut frame = Frame::new(s2b::NOTIFY_STREAM);
        frame.flags = MINIMAL_HEADERS_FLAG;
        frame.headers.insert("authorization", b"tok".to_vec());
        frame.headers.insert("x-identifier", b"abc123".to_vec());
        frame.headers.insert("x-part-id", encode_min_uint(3));
        frame.body = vec![1, 2, 3];
        let encoded = encode(&frame, MessageDirection::SubscriberToBroadcaster).unwrap();
        let decoded = decode(&encoded, MessageDirection::SubscriberToBroadcaster).unwrap();
        assert_eq!(decoded.headers.get("x-topic"), None);
        assert_eq!(decoded.body, vec![1, 2, 3]);
    }

    #[test]
    fn expanded_roundtrip_receive_stream() {
        let mut frame = Frame::new(b2s::RECEIVE_STREAM);
        frame.headers.insert("authorization", b"stateful:abc:1".to_vec());
        frame.headers.insert("x-identifier", b"n-1".to_vec());
        frame.headers.insert("x-part-id", encode_min_uint(0));
        frame.headers.insert("x-topic", b"room/1".to_vec());
        frame.headers.insert("x-compressor", encode_min_uint(0));
        frame.headers.insert("x-compressed-length", encode_min_uint(5));
        frame.headers.insert("x-decompressed-length", encode_min_uint(5));
        frame.headers.insert("x-compressed-sha512", vec![1u8; 64]);
        frame.body = b"hello".to_vec();
        roundtrip(&frame, MessageDirection::BroadcasterToSubscriber);
    }

    #[test]
    fn duplicate_header_last_wins() {
        let mut headers = Headers::new();
        headers.insert("x-topic", b"a".to_vec());
        headers.insert("x-topic", b"b".to_vec());
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-topic"), Some(b"b".as_slice()));
    }

    #[test]
    fn min_uint_roundtrip() {
        for v in [0u64, 1, 255, 256, 65535, 65536, u64::MAX] {
            let bytes = encode_min_uint(v);
            assert!(bytes.len() <= 8);
            assert_eq!(decode_uint(&bytes).unwrap(), v);
        }
    }

    #[test]
    fn decoder_accepts_any_width_up_to_eight_bytes() {
        assert_eq!(decode_uint(&[0, 0, 0, 1]).unwrap(), 1);
        assert!(decode_uint(&[0u8; 9]).is_err());
    }

    #[test]
    fn flags_reserved_bits_are_cleared_on_encode() {
        let mut frame = Frame::new(s2b::CONFIRM_RECEIVE);
        frame.flags = 0xFFFF;
        frame.headers.insert("x-identifier", b"n-1".to_vec());
        let encoded = encode(&frame, MessageDirection::SubscriberToBroadcaster).unwrap();
        let flags = u16::from_be_bytes([encoded[0], encoded[1]]);
        assert_eq!(flags, MINIMAL_HEADERS_FLAG);
    }
}
