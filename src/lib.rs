//! Client library for the WhatsApp multi-device web protocol.
//!
//! Connects to the provider's web endpoint as a linked companion device,
//! performs end-to-end encrypted message exchange with users and groups,
//! and persists cryptographic state across reconnections through the
//! store contracts in [`store`].
//!
//! ## Layers
//!
//! - [`binary`]: the compact tagged node codec and frame layer
//! - [`socket`]: WebSocket framing and the Noise XX tunnel
//! - [`signal`]: pairwise double-ratchet sessions and group sender keys
//! - [`store`]: persistence contracts plus an in-memory reference store
//! - [`Client`]: connection supervisor, pairing, message pipeline, events

pub mod binary;
mod client;
pub mod config;
mod error;
mod message;
pub mod pair;
pub mod proto;
pub mod qr;
mod receipt;
mod request;
pub mod signal;
pub mod socket;
pub mod crypto;
pub mod store;
pub mod types;

pub use client::{Client, EventHandler, HandlerHandle};
pub use config::{ClientConfig, TrustPolicy};
pub use error::{ClientError, IqError, PairError, SignalError, SocketError, StoreError};
pub use message::SendResponse;
pub use request::{InfoQuery, InfoQueryType};
pub use types::{events::Event, MessageID, JID};
