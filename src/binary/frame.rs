//! Framing around encoded nodes.
//!
//! A frame on the wire is a 3-byte big-endian length followed by the
//! payload. The payload itself starts with a flags byte: bit 0x02 marks a
//! zlib-compressed body. Outgoing payloads are never compressed.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::ZlibDecoder;

use super::decoder::{decode, DecodeError};
use super::encoder::encode;
use super::node::Node;

/// Largest payload a 3-byte length prefix can describe.
pub const FRAME_MAX_SIZE: usize = (1 << 24) - 1;

/// Flags-byte bit marking a zlib-compressed payload.
const FLAG_COMPRESSED: u8 = 0x02;

/// Encodes a node and prepends the flags byte.
pub fn marshal(node: &Node) -> Vec<u8> {
    let encoded = encode(node);
    let mut out = Vec::with_capacity(encoded.len() + 1);
    out.push(0);
    out.extend_from_slice(&encoded);
    out
}

/// Strips the flags byte, inflating the body if it is compressed.
pub fn unpack(data: &[u8]) -> Result<Cow<'_, [u8]>, DecodeError> {
    let (&flags, body) = data
        .split_first()
        .ok_or(DecodeError::UnexpectedEof(0))?;
    if flags & FLAG_COMPRESSED != 0 {
        let mut inflated = Vec::new();
        ZlibDecoder::new(body)
            .take(FRAME_MAX_SIZE as u64)
            .read_to_end(&mut inflated)
            .map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(Cow::Owned(inflated))
    } else {
        Ok(Cow::Borrowed(body))
    }
}

/// Unpacks and decodes one framed payload.
pub fn unmarshal(data: &[u8]) -> Result<Node, DecodeError> {
    let body = unpack(data)?;
    decode(&body)
}

/// Prepends the 3-byte big-endian frame length.
pub fn with_frame_length(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= FRAME_MAX_SIZE);
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 3);
    frame.push((len >> 16) as u8);
    frame.push((len >> 8) as u8);
    frame.push(len as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Reads the 3-byte big-endian frame length.
pub fn frame_length(header: &[u8; 3]) -> usize {
    (usize::from(header[0]) << 16) | (usize::from(header[1]) << 8) | usize::from(header[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn marshal_unmarshal() {
        let node = Node::new("iq").attr("id", "abc").attr("type", "get");
        let framed = marshal(&node);
        assert_eq!(framed[0], 0);
        assert_eq!(unmarshal(&framed).unwrap(), node);
    }

    #[test]
    fn unpack_compressed_payload() {
        let node = Node::new("message").attr("id", "xyz");
        let encoded = super::super::encoder::encode(&node);
        let mut enc = ZlibEncoder::new(Vec::from([FLAG_COMPRESSED]), Compression::default());
        enc.write_all(&encoded).unwrap();
        let compressed = enc.finish().unwrap();
        assert_eq!(unmarshal(&compressed).unwrap(), node);
    }

    #[test]
    fn frame_length_roundtrip() {
        let payload = vec![0xAB; 1234];
        let framed = with_frame_length(&payload);
        let mut header = [0u8; 3];
        header.copy_from_slice(&framed[..3]);
        assert_eq!(frame_length(&header), 1234);
        assert_eq!(&framed[3..], &payload[..]);
    }

    #[test]
    fn unpack_rejects_empty_input() {
        assert!(unpack(&[]).is_err());
    }
}
