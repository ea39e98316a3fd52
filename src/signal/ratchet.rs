//! The double-ratchet key schedule.
//!
//! Chain keys step forward by HMAC with distinct seed constants; message
//! keys expand through HKDF; the root key advances with every DH ratchet.

use serde::{Deserialize, Serialize};

use crate::crypto::kdf::{hkdf, hkdf_split, hmac_sha256};
use crate::crypto::KeyPair;

const MESSAGE_KEY_SEED: [u8; 1] = [0x01];
const CHAIN_KEY_SEED: [u8; 1] = [0x02];

const KDF_INFO_TEXT: &[u8] = b"WhisperText";
const KDF_INFO_RATCHET: &[u8] = b"WhisperRatchet";
const KDF_INFO_MESSAGE_KEYS: &[u8] = b"WhisperMessageKeys";

/// Root of the DH ratchet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootKey(pub [u8; 32]);

impl RootKey {
    /// Advances the root by one DH ratchet step, yielding the new root and
    /// the first chain key of the new chain.
    pub fn create_chain(&self, their_ratchet: &[u8; 32], our_ratchet: &KeyPair) -> (RootKey, ChainKey) {
        let shared = our_ratchet.dh(their_ratchet);
        let (root, chain) = hkdf_split(Some(&self.0), &shared, KDF_INFO_RATCHET);
        (RootKey(root), ChainKey { key: chain, index: 0 })
    }
}

/// One sending or receiving chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainKey {
    pub key: [u8; 32],
    pub index: u32,
}

impl ChainKey {
    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    pub fn next(&self) -> ChainKey {
        ChainKey {
            key: hmac_sha256(&self.key, &CHAIN_KEY_SEED),
            index: self.index + 1,
        }
    }

    pub fn message_keys(&self) -> MessageKeys {
        let seed = hmac_sha256(&self.key, &MESSAGE_KEY_SEED);
        MessageKeys::derive(&seed, self.index)
    }
}

/// Per-message encryption material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageKeys {
    pub cipher_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub iv: [u8; 16],
    pub counter: u32,
}

impl MessageKeys {
    fn derive(seed: &[u8; 32], counter: u32) -> Self {
        let okm = hkdf(None, seed, KDF_INFO_MESSAGE_KEYS, 80);
        let mut cipher_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        let mut iv = [0u8; 16];
        cipher_key.copy_from_slice(&okm[..32]);
        mac_key.copy_from_slice(&okm[32..64]);
        iv.copy_from_slice(&okm[64..]);
        Self {
            cipher_key,
            mac_key,
            iv,
            counter,
        }
    }
}

/// Derives the initial root and chain keys from the X3DH master secret.
pub fn derive_initial_keys(secret_input: &[u8]) -> (RootKey, ChainKey) {
    let (root, chain) = hkdf_split(None, secret_input, KDF_INFO_TEXT);
    (RootKey(root), ChainKey { key: chain, index: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_key_steps_are_distinct() {
        let ck = ChainKey::new([7u8; 32], 0);
        let next = ck.next();
        assert_eq!(next.index, 1);
        assert_ne!(ck.key, next.key);
        // Message key derivation must not equal the next chain key.
        assert_ne!(ck.message_keys().cipher_key[..], next.key[..]);
    }

    #[test]
    fn message_keys_are_deterministic() {
        let ck = ChainKey::new([9u8; 32], 4);
        assert_eq!(ck.message_keys(), ck.message_keys());
        assert_eq!(ck.message_keys().counter, 4);
    }

    #[test]
    fn dh_ratchet_is_symmetric() {
        let root = RootKey([1u8; 32]);
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let (root_a, chain_a) = root.create_chain(&b.public, &a);
        let (root_b, chain_b) = root.create_chain(&a.public, &b);
        assert_eq!(root_a, root_b);
        assert_eq!(chain_a, chain_b);
    }
}
