//! Binary codec for the stanza wire format.
//!
//! Node trees are serialized into a compact tagged encoding with shared
//! token dictionaries; frames wrap the encoding with a flags byte and a
//! 3-byte length prefix.

mod decoder;
mod encoder;
mod frame;
mod node;
pub mod token;

pub use decoder::{decode, DecodeError, MAX_BYTES_SIZE};
pub use encoder::{encode, tag};
pub use frame::{frame_length, marshal, unmarshal, unpack, with_frame_length, FRAME_MAX_SIZE};
pub use node::{AttrValue, Attrs, Node, NodeContent};
