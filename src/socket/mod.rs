//! The encrypted transport: WebSocket framing plus the Noise tunnel.

mod frame;
mod noise;

pub use frame::{FrameSocket, CONN_HEADER};
pub use noise::{do_handshake, NoiseHandshake, NoiseSocket};
