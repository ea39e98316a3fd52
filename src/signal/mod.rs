//! The Signal engine: pairwise double-ratchet sessions and group sender
//! keys.

mod address;
mod cipher;
mod group_cipher;
pub mod protocol;
pub mod ratchet;
mod sender_key;
pub mod session;

pub use address::{ProtocolAddress, SenderKeyName};
pub use cipher::{PreKeyBundle, SessionCipher};
pub use group_cipher::GroupCipher;
pub use protocol::{
    CiphertextMessage, PreKeySignalMessage, SenderKeyDistributionMessage, SenderKeyMessage,
    SignalMessage,
};
pub use sender_key::{SenderKeyRecord, SenderKeyState};

/// Hex fingerprint of an identity key, for out-of-band verification.
pub fn identity_fingerprint(identity_public: &[u8; 32]) -> String {
    hex::encode(crate::crypto::kdf::sha256(identity_public))
}
