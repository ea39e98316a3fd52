//! Encoder for the compact tagged wire form of a node tree.
//!
//! Strings are written as dictionary tokens where possible, then as
//! nibble-packed digits, hex-packed strings, or raw length-prefixed bytes,
//! in that order of preference. JIDs get their own tags.

use super::node::{AttrValue, Node, NodeContent};
use super::token::{index_of_double_token, index_of_single_token};
use crate::types::{servers, JID};

/// Wire tags outside the dictionary range.
pub mod tag {
    pub const LIST_EMPTY: u8 = 0;
    pub const DICTIONARY_0: u8 = 236;
    pub const DICTIONARY_3: u8 = 239;
    pub const AD_JID: u8 = 247;
    pub const LIST_8: u8 = 248;
    pub const LIST_16: u8 = 249;
    pub const JID_PAIR: u8 = 250;
    pub const HEX_8: u8 = 251;
    pub const BINARY_8: u8 = 252;
    pub const BINARY_20: u8 = 253;
    pub const BINARY_32: u8 = 254;
    pub const NIBBLE_8: u8 = 255;
}

/// Longest string that can use the packed encodings (7-bit half-length).
const PACKED_MAX: usize = 254;

pub struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        // Most stanzas are small; one page avoids regrowth for nearly all.
        Self {
            data: Vec::with_capacity(4096),
        }
    }

    fn push(&mut self, b: u8) {
        self.data.push(b);
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn write_list_start(&mut self, size: usize) {
        if size == 0 {
            self.push(tag::LIST_EMPTY);
        } else if size < 256 {
            self.push(tag::LIST_8);
            self.push(size as u8);
        } else {
            self.push(tag::LIST_16);
            self.extend(&(size as u16).to_be_bytes());
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        let len = bytes.len();
        if len < 256 {
            self.push(tag::BINARY_8);
            self.push(len as u8);
        } else if len < (1 << 20) {
            self.push(tag::BINARY_20);
            self.push(((len >> 16) & 0x0F) as u8);
            self.push(((len >> 8) & 0xFF) as u8);
            self.push((len & 0xFF) as u8);
        } else {
            self.push(tag::BINARY_32);
            self.extend(&(len as u32).to_be_bytes());
        }
        self.extend(bytes);
    }

    fn write_packed(&mut self, wire_tag: u8, s: &str, to_nibble: fn(u8) -> u8) {
        let bytes = s.as_bytes();
        let mut header = bytes.len().div_ceil(2) as u8;
        if bytes.len() % 2 != 0 {
            header |= 0x80;
        }
        self.push(wire_tag);
        self.push(header);
        for pair in bytes.chunks(2) {
            let hi = to_nibble(pair[0]);
            let lo = if pair.len() == 2 { to_nibble(pair[1]) } else { 0 };
            self.push((hi << 4) | lo);
        }
    }

    fn write_string(&mut self, s: &str) {
        if let Some(i) = index_of_single_token(s) {
            self.push(i);
        } else if let Some((dict, i)) = index_of_double_token(s) {
            self.push(tag::DICTIONARY_0 + dict);
            self.push(i);
        } else if is_nibble_packable(s) {
            self.write_packed(tag::NIBBLE_8, s, nibble_of);
        } else if is_hex_packable(s) {
            self.write_packed(tag::HEX_8, s, hex_of);
        } else {
            self.write_bytes(s.as_bytes());
        }
    }

    fn write_jid(&mut self, jid: &JID) {
        let wire_agent = wire_agent_of(jid);
        if wire_agent > 0 || jid.device > 0 {
            self.push(tag::AD_JID);
            self.push(wire_agent);
            self.push(jid.device as u8);
            self.write_string(&jid.user);
        } else {
            self.push(tag::JID_PAIR);
            if jid.user.is_empty() {
                self.push(tag::LIST_EMPTY);
            } else {
                self.write_string(&jid.user);
            }
            self.write_string(&jid.server);
        }
    }

    fn write_attr_value(&mut self, value: &AttrValue) {
        match value {
            AttrValue::String(s) => self.write_string(s),
            AttrValue::JID(jid) => self.write_jid(jid),
        }
    }

    fn write_node(&mut self, node: &Node) {
        let has_content = !matches!(node.content, NodeContent::None);
        let size = 1 + 2 * node.attrs.len() + usize::from(has_content);
        self.write_list_start(size);
        self.write_string(&node.tag);
        for (key, value) in &node.attrs {
            self.write_string(key);
            self.write_attr_value(value);
        }
        match &node.content {
            NodeContent::None => {}
            NodeContent::Children(children) => {
                self.write_list_start(children.len());
                for child in children {
                    self.write_node(child);
                }
            }
            NodeContent::Bytes(bytes) => self.write_bytes(bytes),
        }
    }
}

/// The wire agent byte: LID addresses travel as agent 1, everything else
/// carries its structural agent.
pub(super) fn wire_agent_of(jid: &JID) -> u8 {
    if jid.server == servers::HIDDEN_USER {
        1
    } else {
        jid.agent
    }
}

fn is_nibble_packable(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= PACKED_MAX
        && s.bytes().all(|b| b.is_ascii_digit() || b == b'-' || b == b'.')
}

fn is_hex_packable(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= PACKED_MAX
        && s.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

fn nibble_of(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'-' => 10,
        b'.' => 11,
        _ => unreachable!("checked by is_nibble_packable"),
    }
}

fn hex_of(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'A'..=b'F' => b - b'A' + 10,
        _ => unreachable!("checked by is_hex_packable"),
    }
}

/// Encodes a node to the binary wire form (without the frame flags byte).
pub fn encode(node: &Node) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_node(node);
    encoder.data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_encode_as_single_bytes() {
        let node = Node::new("message");
        let encoded = encode(&node);
        // LIST_8, size 1, token for "message"
        assert_eq!(encoded, vec![tag::LIST_8, 1, 19]);
    }

    #[test]
    fn phone_numbers_nibble_pack() {
        let node = Node::new("iq").attr("id", "1234567890");
        let encoded = encode(&node);
        // The ten digit string must shrink to a header plus five bytes.
        assert!(encoded.len() < 3 + 2 + 1 + 10);
        assert!(encoded.contains(&tag::NIBBLE_8));
    }

    #[test]
    fn long_strings_use_binary20() {
        let long = "x".repeat(300);
        let node = Node::new("message").attr("data", long);
        let encoded = encode(&node);
        assert!(encoded.contains(&tag::BINARY_20));
    }
}
