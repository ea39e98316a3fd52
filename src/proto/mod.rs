//! Protobuf wire types (hand-written prost structs).

mod wa;

pub use wa::*;
