//! Core protocol types: JIDs, message metadata and events.

pub mod events;
mod jid;
mod message;

pub use jid::*;
pub use message::*;

pub use events::Event;
