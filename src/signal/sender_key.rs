//! Sender-key state for group fanout.
//!
//! Each sending device keeps one chain per group; receivers hold a copy of
//! the chain (bootstrapped by a distribution message) plus the sender's
//! signing public key for authenticity.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::crypto::kdf::{hkdf, hmac_sha256};
use crate::error::StoreError;

const MESSAGE_KEY_SEED: [u8; 1] = [0x01];
const CHAIN_KEY_SEED: [u8; 1] = [0x02];
const KDF_INFO_GROUP: &[u8] = b"WhisperGroup";

/// Old chain states kept around for late messages after a rotation.
const MAX_SENDER_KEY_STATES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderChainKey {
    pub iteration: u32,
    pub seed: [u8; 32],
}

impl SenderChainKey {
    pub fn new(iteration: u32, seed: [u8; 32]) -> Self {
        Self { iteration, seed }
    }

    pub fn next(&self) -> SenderChainKey {
        SenderChainKey {
            iteration: self.iteration + 1,
            seed: hmac_sha256(&self.seed, &CHAIN_KEY_SEED),
        }
    }

    pub fn message_key(&self) -> SenderMessageKey {
        let seed = hmac_sha256(&self.seed, &MESSAGE_KEY_SEED);
        let okm = hkdf(None, &seed, KDF_INFO_GROUP, 48);
        let mut iv = [0u8; 16];
        let mut cipher_key = [0u8; 32];
        iv.copy_from_slice(&okm[..16]);
        cipher_key.copy_from_slice(&okm[16..]);
        SenderMessageKey {
            iteration: self.iteration,
            iv,
            cipher_key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderMessageKey {
    pub iteration: u32,
    pub iv: [u8; 16],
    pub cipher_key: [u8; 32],
}

/// One chain: ours (with the signing private key) or a remote sender's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    pub key_id: u32,
    pub chain_key: SenderChainKey,
    pub signing_public: [u8; 32],
    pub signing_private: Option<[u8; 32]>,
    /// FIFO-bounded message keys for skipped iterations.
    pub skipped: VecDeque<SenderMessageKey>,
}

impl SenderKeyState {
    pub fn take_skipped(&mut self, iteration: u32) -> Option<SenderMessageKey> {
        let pos = self.skipped.iter().position(|k| k.iteration == iteration)?;
        self.skipped.remove(pos)
    }

    pub fn push_skipped(&mut self, key: SenderMessageKey, bound: usize) {
        self.skipped.push_back(key);
        while self.skipped.len() > bound {
            self.skipped.pop_front();
        }
    }
}

/// All chain states for one (group, sender) pair, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    pub states: VecDeque<SenderKeyState>,
}

impl SenderKeyRecord {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn newest_mut(&mut self) -> Option<&mut SenderKeyState> {
        self.states.front_mut()
    }

    pub fn state_mut(&mut self, key_id: u32) -> Option<&mut SenderKeyState> {
        self.states.iter_mut().find(|s| s.key_id == key_id)
    }

    pub fn add_state(&mut self, state: SenderKeyState) {
        self.states.push_front(state);
        while self.states.len() > MAX_SENDER_KEY_STATES {
            self.states.pop_back();
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_iterates_deterministically() {
        let ck = SenderChainKey::new(0, [5; 32]);
        let a = ck.next().next().message_key();
        let b = ck.next().next().message_key();
        assert_eq!(a, b);
        assert_eq!(a.iteration, 2);
        assert_ne!(a.cipher_key, ck.message_key().cipher_key);
    }

    #[test]
    fn record_keeps_newest_states() {
        let mut record = SenderKeyRecord::default();
        for id in 0..8u32 {
            record.add_state(SenderKeyState {
                key_id: id,
                chain_key: SenderChainKey::new(0, [id as u8; 32]),
                signing_public: [0; 32],
                signing_private: None,
                skipped: VecDeque::new(),
            });
        }
        assert_eq!(record.states.len(), MAX_SENDER_KEY_STATES);
        assert_eq!(record.newest_mut().unwrap().key_id, 7);
        assert!(record.state_mut(0).is_none());
    }

    #[test]
    fn skipped_keys_consumed_once() {
        let mut state = SenderKeyState {
            key_id: 1,
            chain_key: SenderChainKey::new(0, [1; 32]),
            signing_public: [0; 32],
            signing_private: None,
            skipped: VecDeque::new(),
        };
        state.push_skipped(state.chain_key.message_key(), 10);
        assert!(state.take_skipped(0).is_some());
        assert!(state.take_skipped(0).is_none());
    }
}
