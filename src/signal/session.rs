//! Double-ratchet session state.
//!
//! Modeled as owned flat structures: chains and skipped keys live inline in
//! the session and the whole thing serializes to a single blob per address.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::crypto::KeyPair;
use crate::error::StoreError;
use crate::signal::ratchet::{ChainKey, MessageKeys, RootKey};

/// How many receiving chains are kept for out-of-order ratchet keys.
const MAX_RECEIVER_CHAINS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderChain {
    pub ratchet_key: KeyPair,
    pub chain_key: ChainKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverChain {
    pub ratchet_public: [u8; 32],
    pub chain_key: ChainKey,
}

/// A message key retained for an out-of-order message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedMessageKey {
    pub ratchet_public: [u8; 32],
    pub keys: MessageKeys,
}

/// Unacknowledged X3DH parameters replayed in every outgoing message until
/// the peer answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_version: u8,
    pub local_identity: [u8; 32],
    pub remote_identity: [u8; 32],
    pub root_key: RootKey,
    pub previous_counter: u32,
    pub sender_chain: Option<SenderChain>,
    pub receiver_chains: VecDeque<ReceiverChain>,
    /// FIFO-bounded message keys for messages skipped within a chain.
    pub skipped_keys: VecDeque<SkippedMessageKey>,
    pub pending_pre_key: Option<PendingPreKey>,
    /// Base key of the pkmsg that created this session, for duplicate
    /// session-init detection.
    pub alice_base_key: Option<[u8; 32]>,
}

impl SessionState {
    pub fn new(
        local_identity: [u8; 32],
        remote_identity: [u8; 32],
        root_key: RootKey,
    ) -> Self {
        Self {
            session_version: super::protocol::CIPHERTEXT_VERSION,
            local_identity,
            remote_identity,
            root_key,
            previous_counter: 0,
            sender_chain: None,
            receiver_chains: VecDeque::new(),
            skipped_keys: VecDeque::new(),
            pending_pre_key: None,
            alice_base_key: None,
        }
    }

    pub fn set_sender_chain(&mut self, ratchet_key: KeyPair, chain_key: ChainKey) {
        self.sender_chain = Some(SenderChain {
            ratchet_key,
            chain_key,
        });
    }

    pub fn add_receiver_chain(&mut self, ratchet_public: [u8; 32], chain_key: ChainKey) {
        self.receiver_chains.push_back(ReceiverChain {
            ratchet_public,
            chain_key,
        });
        if self.receiver_chains.len() > MAX_RECEIVER_CHAINS {
            self.receiver_chains.pop_front();
        }
    }

    pub fn receiver_chain_mut(&mut self, ratchet_public: &[u8; 32]) -> Option<&mut ReceiverChain> {
        self.receiver_chains
            .iter_mut()
            .find(|c| &c.ratchet_public == ratchet_public)
    }

    pub fn has_receiver_chain(&self, ratchet_public: &[u8; 32]) -> bool {
        self.receiver_chains
            .iter()
            .any(|c| &c.ratchet_public == ratchet_public)
    }

    /// Stores a skipped message key, evicting the oldest past the bound.
    pub fn push_skipped_key(
        &mut self,
        ratchet_public: [u8; 32],
        keys: MessageKeys,
        bound: usize,
    ) {
        self.skipped_keys.push_back(SkippedMessageKey {
            ratchet_public,
            keys,
        });
        while self.skipped_keys.len() > bound {
            self.skipped_keys.pop_front();
        }
    }

    /// Removes and returns the skipped key for (ratchet, counter), if held.
    pub fn take_skipped_key(
        &mut self,
        ratchet_public: &[u8; 32],
        counter: u32,
    ) -> Option<MessageKeys> {
        let pos = self
            .skipped_keys
            .iter()
            .position(|k| &k.ratchet_public == ratchet_public && k.keys.counter == counter)?;
        self.skipped_keys.remove(pos).map(|k| k.keys)
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
    use crate::signal::ratchet::ChainKey;

    fn state() -> SessionState {
        SessionState::new([1; 32], [2; 32], RootKey([3; 32]))
    }

    #[test]
    fn serialization_roundtrip() {
        let mut s = state();
        s.set_sender_chain(KeyPair::generate(), ChainKey::new([4; 32], 9));
        s.add_receiver_chain([5; 32], ChainKey::new([6; 32], 0));
        let blob = s.serialize().unwrap();
        let back = SessionState::deserialize(&blob).unwrap();
        assert_eq!(back.remote_identity, s.remote_identity);
        assert_eq!(back.sender_chain.as_ref().unwrap().chain_key.index, 9);
        assert!(back.has_receiver_chain(&[5; 32]));
    }

    #[test]
    fn skipped_keys_bounded_fifo() {
        let mut s = state();
        let ck = ChainKey::new([7; 32], 0);
        let mut chain = ck;
        for _ in 0..10 {
            s.push_skipped_key([8; 32], chain.message_keys(), 5);
            chain = chain.next();
        }
        assert_eq!(s.skipped_keys.len(), 5);
        // Oldest five were evicted.
        assert!(s.take_skipped_key(&[8; 32], 0).is_none());
        assert!(s.take_skipped_key(&[8; 32], 5).is_some());
        // Consumed exactly once.
        assert!(s.take_skipped_key(&[8; 32], 5).is_none());
    }

    #[test]
    fn receiver_chains_bounded() {
        let mut s = state();
        for i in 0..8u8 {
            s.add_receiver_chain([i; 32], ChainKey::new([i; 32], 0));
        }
        assert_eq!(s.receiver_chains.len(), 5);
        assert!(!s.has_receiver_chain(&[0; 32]));
        assert!(s.has_receiver_chain(&[7; 32]));
    }
}
