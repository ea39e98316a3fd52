//! Decoder for the compact tagged wire form.
//!
//! Rejects unknown tags, enforces list-size bounds and refuses oversized
//! strings so a malformed frame cannot balloon memory.

use thiserror::Error;

use super::encoder::tag;
use super::node::{AttrValue, Attrs, Node, NodeContent};
use super::token::{double_token, single_token};
use crate::types::{servers, JID};

/// Longest single string / byte blob a frame may carry.
pub const MAX_BYTES_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("unexpected end of data at offset {0}")]
    UnexpectedEof(usize),
    #[error("unknown tag 0x{0:02x} at offset {1}")]
    UnknownTag(u8, usize),
    #[error("unknown dictionary token {dict}/{index}")]
    UnknownToken { dict: u8, index: u8 },
    #[error("declared size {0} exceeds remaining input")]
    OversizedList(usize),
    #[error("string of {0} bytes exceeds limit")]
    OversizedString(usize),
    #[error("invalid packed nibble {0}")]
    InvalidNibble(u8),
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("{0} leftover bytes after decoding")]
    LeftoverBytes(usize),
    #[error("node list may not be empty")]
    EmptyNode,
}

pub struct Decoder<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.index
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .data
            .get(self.index)
            .ok_or(DecodeError::UnexpectedEof(self.index))?;
        self.index += 1;
        Ok(b)
    }

    fn read_slice(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEof(self.index));
        }
        let slice = &self.data[self.index..self.index + n];
        self.index += n;
        Ok(slice)
    }

    fn read_int(&mut self, bytes: usize) -> Result<usize, DecodeError> {
        let mut result = 0usize;
        for _ in 0..bytes {
            result = (result << 8) | usize::from(self.read_byte()?);
        }
        Ok(result)
    }

    fn read_bytes_size(&mut self, wire_tag: u8) -> Result<usize, DecodeError> {
        let len = match wire_tag {
            tag::BINARY_8 => self.read_int(1)?,
            tag::BINARY_20 => self.read_int(3)? & 0x000F_FFFF,
            tag::BINARY_32 => self.read_int(4)?,
            t => return Err(DecodeError::UnknownTag(t, self.index)),
        };
        if len > MAX_BYTES_SIZE {
            return Err(DecodeError::OversizedString(len));
        }
        Ok(len)
    }

    fn read_list_size(&mut self, wire_tag: u8) -> Result<usize, DecodeError> {
        let size = match wire_tag {
            tag::LIST_EMPTY => 0,
            tag::LIST_8 => self.read_int(1)?,
            tag::LIST_16 => self.read_int(2)?,
            t => return Err(DecodeError::UnknownTag(t, self.index)),
        };
        // Each list element needs at least one byte of input.
        if size > self.remaining() {
            return Err(DecodeError::OversizedList(size));
        }
        Ok(size)
    }

    fn read_packed(&mut self, wire_tag: u8) -> Result<String, DecodeError> {
        let header = self.read_byte()?;
        let odd = header & 0x80 != 0;
        let byte_count = usize::from(header & 0x7F);
        let packed = self.read_slice(byte_count)?;
        let mut out = String::with_capacity(byte_count * 2);
        for (i, b) in packed.iter().enumerate() {
            out.push(unpack_nibble(wire_tag, b >> 4)?);
            if !(odd && i == byte_count - 1) {
                out.push(unpack_nibble(wire_tag, b & 0x0F)?);
            }
        }
        Ok(out)
    }

    fn read_string(&mut self, wire_tag: u8) -> Result<String, DecodeError> {
        match wire_tag {
            1..=235 => single_token(wire_tag)
                .map(str::to_string)
                .ok_or(DecodeError::UnknownTag(wire_tag, self.index)),
            236..=239 => {
                let dict = wire_tag - tag::DICTIONARY_0;
                let index = self.read_byte()?;
                double_token(dict, index)
                    .map(str::to_string)
                    .ok_or(DecodeError::UnknownToken { dict, index })
            }
            tag::NIBBLE_8 | tag::HEX_8 => self.read_packed(wire_tag),
            tag::BINARY_8 | tag::BINARY_20 | tag::BINARY_32 => {
                let len = self.read_bytes_size(wire_tag)?;
                String::from_utf8(self.read_slice(len)?.to_vec())
                    .map_err(|_| DecodeError::InvalidUtf8)
            }
            t => Err(DecodeError::UnknownTag(t, self.index)),
        }
    }

    fn read_jid(&mut self, wire_tag: u8) -> Result<JID, DecodeError> {
        match wire_tag {
            tag::JID_PAIR => {
                let user_tag = self.read_byte()?;
                let user = if user_tag == tag::LIST_EMPTY {
                    String::new()
                } else {
                    self.read_string(user_tag)?
                };
                let server_tag = self.read_byte()?;
                let server = self.read_string(server_tag)?;
                Ok(JID::new(user, server))
            }
            tag::AD_JID => {
                let agent = self.read_byte()?;
                let device = u16::from(self.read_byte()?);
                let user_tag = self.read_byte()?;
                let user = self.read_string(user_tag)?;
                Ok(match agent {
                    0 => JID {
                        user,
                        device,
                        server: servers::DEFAULT_USER.to_string(),
                        ..Default::default()
                    },
                    1 => JID {
                        user,
                        device,
                        server: servers::HIDDEN_USER.to_string(),
                        ..Default::default()
                    },
                    _ => JID {
                        user,
                        agent,
                        device,
                        server: servers::DEFAULT_USER.to_string(),
                        ..Default::default()
                    },
                })
            }
            t => Err(DecodeError::UnknownTag(t, self.index)),
        }
    }

    fn read_attr_value(&mut self) -> Result<AttrValue, DecodeError> {
        let wire_tag = self.read_byte()?;
        match wire_tag {
            tag::JID_PAIR | tag::AD_JID => Ok(AttrValue::JID(self.read_jid(wire_tag)?)),
            _ => Ok(AttrValue::String(self.read_string(wire_tag)?)),
        }
    }

    fn read_node(&mut self) -> Result<Node, DecodeError> {
        let list_tag = self.read_byte()?;
        let size = self.read_list_size(list_tag)?;
        if size == 0 {
            return Err(DecodeError::EmptyNode);
        }

        let tag_marker = self.read_byte()?;
        let node_tag = self.read_string(tag_marker)?;

        let mut attrs = Attrs::new();
        for _ in 0..(size - 1) / 2 {
            let key_marker = self.read_byte()?;
            let key = self.read_string(key_marker)?;
            attrs.insert(key, self.read_attr_value()?);
        }

        let content = if (size - 1) % 2 == 1 {
            let marker = self.read_byte()?;
            match marker {
                tag::LIST_EMPTY | tag::LIST_8 | tag::LIST_16 => {
                    let len = self.read_list_size(marker)?;
                    let mut children = Vec::with_capacity(len.min(256));
                    for _ in 0..len {
                        children.push(self.read_node()?);
                    }
                    NodeContent::Children(children)
                }
                tag::BINARY_8 | tag::BINARY_20 | tag::BINARY_32 => {
                    let len = self.read_bytes_size(marker)?;
                    NodeContent::Bytes(self.read_slice(len)?.to_vec())
                }
                // Servers occasionally send string-typed content.
                _ => NodeContent::Bytes(self.read_string(marker)?.into_bytes()),
            }
        } else {
            NodeContent::None
        };

        Ok(Node {
            tag: node_tag,
            attrs,
            content,
        })
    }
}

fn unpack_nibble(wire_tag: u8, v: u8) -> Result<char, DecodeError> {
    match (wire_tag, v) {
        (_, 0..=9) => Ok((b'0' + v) as char),
        (tag::NIBBLE_8, 10) => Ok('-'),
        (tag::NIBBLE_8, 11) => Ok('.'),
        (tag::HEX_8, 10..=15) => Ok((b'A' + v - 10) as char),
        _ => Err(DecodeError::InvalidNibble(v)),
    }
}

/// Decodes one node and requires the input to be fully consumed.
pub fn decode(data: &[u8]) -> Result<Node, DecodeError> {
    let mut decoder = Decoder::new(data);
    let node = decoder.read_node()?;
    if decoder.remaining() != 0 {
        return Err(DecodeError::LeftoverBytes(decoder.remaining()));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::super::encoder::encode;
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_string(rng: &mut StdRng, charset: &[u8], len: usize) -> String {
        (0..len)
            .map(|_| charset[rng.gen_range(0..charset.len())] as char)
            .collect()
    }

    fn random_node(rng: &mut StdRng, depth: usize) -> Node {
        let tags = ["message", "iq", "receipt", "presence", "zzcustom"];
        let mut node = Node::new(tags[rng.gen_range(0..tags.len())]);
        for _ in 0..rng.gen_range(0..4) {
            let key_len = rng.gen_range(1..8);
            let key = random_string(rng, b"abcdefgh_", key_len);
            match rng.gen_range(0..4) {
                0 => {
                    let len = rng.gen_range(1..12);
                    node.set_attr(key, random_string(rng, b"0123456789", len))
                }
                1 => {
                    let len = rng.gen_range(1..12);
                    node.set_attr(key, random_string(rng, b"0123456789ABCDEF", len))
                }
                2 => {
                    let user = random_string(rng, b"0123456789", 10);
                    let device = rng.gen_range(0..255);
                    let jid = if rng.gen_bool(0.5) {
                        JID::new(user, "s.whatsapp.net")
                    } else {
                        JID::new_ad(user, 0, device)
                    };
                    node.set_attr(key, jid);
                }
                _ => {
                    let len = rng.gen_range(0..20);
                    node.set_attr(key, random_string(rng, b"abc XYZ!?", len))
                }
            }
        }
        match rng.gen_range(0..3) {
            0 if depth < 3 => {
                let children = (0..rng.gen_range(1..4))
                    .map(|_| random_node(rng, depth + 1))
                    .collect();
                node.content = NodeContent::Children(children);
            }
            1 => {
                let len = rng.gen_range(0..600);
                let bytes = (0..len).map(|_| rng.gen()).collect();
                node.content = NodeContent::Bytes(bytes);
            }
            _ => {}
        }
        node
    }

    #[test]
    fn roundtrip_simple() {
        let node = Node::new("message")
            .attr("id", "3EB0ABC123")
            .attr("to", JID::new("1234567890", "s.whatsapp.net"))
            .attr("type", "text");
        let decoded = decode(&encode(&node)).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn roundtrip_generated_nodes() {
        let mut rng = StdRng::seed_from_u64(0x77616d64);
        for _ in 0..500 {
            let node = random_node(&mut rng, 0);
            let encoded = encode(&node);
            let decoded = decode(&encoded)
                .unwrap_or_else(|e| panic!("decode failed for {node}: {e}"));
            assert_eq!(decoded, node, "roundtrip mismatch for {node}");
        }
    }

    #[test]
    fn roundtrip_lid_jid() {
        let node = Node::new("message")
            .attr("from", JID::new("98765432101234", "lid"))
            .attr("participant", JID {
                user: "98765432101234".into(),
                device: 2,
                server: "lid".into(),
                ..Default::default()
            });
        assert_eq!(decode(&encode(&node)).unwrap(), node);
    }

    #[test]
    fn rejects_truncated_input() {
        let node = Node::new("message").attr("id", "abc123");
        let encoded = encode(&node);
        for cut in 1..encoded.len() {
            assert!(decode(&encoded[..cut]).is_err(), "cut at {cut} accepted");
        }
    }

    #[test]
    fn rejects_leftover_bytes() {
        let mut encoded = encode(&Node::new("message"));
        encoded.push(0x00);
        assert!(matches!(decode(&encoded), Err(DecodeError::LeftoverBytes(1))));
    }

    #[test]
    fn rejects_unknown_top_level_tag() {
        assert!(matches!(decode(&[0xF0]), Err(DecodeError::UnknownTag(0xF0, _))));
    }

    #[test]
    fn rejects_oversized_list_claim() {
        // LIST_16 claiming 65535 entries with no data behind it.
        let data = [super::tag::LIST_16, 0xFF, 0xFF];
        assert!(matches!(decode(&data), Err(DecodeError::OversizedList(_))));
    }

    #[test]
    fn rejects_empty_node() {
        assert!(matches!(decode(&[super::tag::LIST_EMPTY]), Err(DecodeError::EmptyNode)));
    }
}
