//! Group message encryption over sender keys.

use rand::Rng;
use rand::RngCore;

use crate::crypto::{cbc_decrypt, cbc_encrypt};
use crate::error::SignalError;
use crate::signal::address::SenderKeyName;
use crate::signal::protocol::{SenderKeyDistributionMessage, SenderKeyMessage};
use crate::signal::sender_key::{SenderChainKey, SenderKeyRecord, SenderKeyState};
use crate::store::SenderKeyStore;

pub struct GroupCipher<'a> {
    store: &'a dyn SenderKeyStore,
    name: SenderKeyName,
    max_skipped: usize,
}

impl<'a> GroupCipher<'a> {
    pub fn new(store: &'a dyn SenderKeyStore, name: SenderKeyName, max_skipped: usize) -> Self {
        Self {
            store,
            name,
            max_skipped,
        }
    }

    fn load(&self) -> Result<SenderKeyRecord, SignalError> {
        match self
            .store
            .get_sender_key(self.name.group_id(), &self.name.sender().to_string())?
        {
            Some(blob) => Ok(SenderKeyRecord::deserialize(&blob)?),
            None => Ok(SenderKeyRecord::default()),
        }
    }

    fn save(&self, record: &SenderKeyRecord) -> Result<(), SignalError> {
        Ok(self.store.put_sender_key(
            self.name.group_id(),
            &self.name.sender().to_string(),
            &record.serialize()?,
        )?)
    }

    /// Returns the distribution message for our own chain in this group,
    /// creating the chain on first use.
    pub fn create_distribution_message(
        &self,
    ) -> Result<SenderKeyDistributionMessage, SignalError> {
        let mut record = self.load()?;

        let has_own = record
            .newest_mut()
            .is_some_and(|s| s.signing_private.is_some());
        if !has_own {
            let mut rng = rand::thread_rng();
            let mut seed = [0u8; 32];
            rng.fill_bytes(&mut seed);
            let signing = ed25519_dalek::SigningKey::generate(&mut rng);
            record.add_state(SenderKeyState {
                key_id: rng.gen_range(1..=i32::MAX as u32),
                chain_key: SenderChainKey::new(0, seed),
                signing_public: signing.verifying_key().to_bytes(),
                signing_private: Some(signing.to_bytes()),
                skipped: Default::default(),
            });
            self.save(&record)?;
        }

        let state = record.newest_mut().expect("state was just ensured");
        Ok(SenderKeyDistributionMessage::new(
            state.key_id,
            state.chain_key.iteration,
            state.chain_key.seed,
            state.signing_public,
        ))
    }

    /// Installs a remote sender's chain from its distribution message.
    pub fn process_distribution_message(
        &self,
        message: &SenderKeyDistributionMessage,
    ) -> Result<(), SignalError> {
        let mut record = self.load()?;
        if record.state_mut(message.key_id).is_some() {
            return Ok(());
        }
        record.add_state(SenderKeyState {
            key_id: message.key_id,
            chain_key: SenderChainKey::new(message.iteration, message.chain_key),
            signing_public: message.signing_key,
            signing_private: None,
            skipped: Default::default(),
        });
        self.save(&record)
    }

    /// Encrypts one padded plaintext for group fanout.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SignalError> {
        let mut record = self.load()?;
        let state = record
            .newest_mut()
            .filter(|s| s.signing_private.is_some())
            .ok_or_else(|| SignalError::NoSenderKeyState(self.name.to_string()))?;

        let keys = state.chain_key.message_key();
        let ciphertext = cbc_encrypt(&keys.cipher_key, &keys.iv, plaintext);
        let signing = ed25519_dalek::SigningKey::from_bytes(
            state.signing_private.as_ref().expect("own state has key"),
        );
        let message = SenderKeyMessage::new(state.key_id, keys.iteration, ciphertext, &signing);
        state.chain_key = state.chain_key.next();
        self.save(&record)?;
        Ok(message.serialized)
    }

    /// Decrypts one group fanout message from this sender.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SignalError> {
        let message = SenderKeyMessage::deserialize(data)?;
        let mut record = self.load()?;
        if record.is_empty() {
            return Err(SignalError::NoSenderKeyState(self.name.to_string()));
        }
        let max_skipped = self.max_skipped;
        let state = record
            .state_mut(message.key_id)
            .ok_or_else(|| SignalError::NoSenderKeyState(self.name.to_string()))?;

        if !message.verify_signature(&state.signing_public) {
            return Err(SignalError::InvalidMessage("bad sender key signature"));
        }

        let keys = if let Some(keys) = state.take_skipped(message.iteration) {
            keys
        } else if message.iteration < state.chain_key.iteration {
            return Err(SignalError::DuplicateMessage(
                state.chain_key.iteration,
                message.iteration,
            ));
        } else {
            if message.iteration - state.chain_key.iteration > max_skipped as u32 {
                return Err(SignalError::TooFarInFuture(message.iteration));
            }
            while state.chain_key.iteration < message.iteration {
                let skipped = state.chain_key.message_key();
                state.push_skipped(skipped, max_skipped);
                state.chain_key = state.chain_key.next();
            }
            let keys = state.chain_key.message_key();
            state.chain_key = state.chain_key.next();
            keys
        };

        let plaintext = cbc_decrypt(&keys.cipher_key, &keys.iv, &message.ciphertext)
            .map_err(|_| SignalError::InvalidMessage("CBC padding failure"))?;
        self.save(&record)?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::address::ProtocolAddress;
    use crate::store::MemoryStore;

    fn name() -> SenderKeyName {
        SenderKeyName::new(
            "123456789-987654321@g.us",
            ProtocolAddress::new("1234567890", 0),
        )
    }

    #[test]
    fn group_fanout_roundtrip() {
        let sender_store = MemoryStore::new();
        let receiver_store = MemoryStore::new();
        let sender = GroupCipher::new(&sender_store, name(), 2000);
        let receiver = GroupCipher::new(&receiver_store, name(), 2000);

        let skdm = sender.create_distribution_message().unwrap();
        let parsed = SenderKeyDistributionMessage::deserialize(&skdm.serialized).unwrap();
        receiver.process_distribution_message(&parsed).unwrap();

        for i in 0..5u8 {
            let ct = sender.encrypt(&[i; 32]).unwrap();
            assert_eq!(receiver.decrypt(&ct).unwrap(), vec![i; 32]);
        }
    }

    #[test]
    fn decrypt_without_distribution_fails() {
        let sender_store = MemoryStore::new();
        let receiver_store = MemoryStore::new();
        let sender = GroupCipher::new(&sender_store, name(), 2000);
        let receiver = GroupCipher::new(&receiver_store, name(), 2000);

        sender.create_distribution_message().unwrap();
        let ct = sender.encrypt(b"no skdm yet").unwrap();
        assert!(matches!(
            receiver.decrypt(&ct).unwrap_err(),
            SignalError::NoSenderKeyState(_)
        ));
    }

    #[test]
    fn out_of_order_group_messages() {
        let sender_store = MemoryStore::new();
        let receiver_store = MemoryStore::new();
        let sender = GroupCipher::new(&sender_store, name(), 2000);
        let receiver = GroupCipher::new(&receiver_store, name(), 2000);

        let skdm = sender.create_distribution_message().unwrap();
        receiver.process_distribution_message(&skdm).unwrap();

        let msgs: Vec<_> = (0..4u8).map(|i| sender.encrypt(&[i; 8]).unwrap()).collect();
        for (i, ct) in msgs.iter().enumerate().rev() {
            assert_eq!(receiver.decrypt(ct).unwrap(), vec![i as u8; 8]);
        }
        // Replay of a consumed message is rejected.
        assert!(matches!(
            receiver.decrypt(&msgs[1]).unwrap_err(),
            SignalError::DuplicateMessage(_, _)
        ));
    }

    #[test]
    fn distribution_message_is_idempotent() {
        let sender_store = MemoryStore::new();
        let receiver_store = MemoryStore::new();
        let sender = GroupCipher::new(&sender_store, name(), 2000);
        let receiver = GroupCipher::new(&receiver_store, name(), 2000);

        let skdm = sender.create_distribution_message().unwrap();
        receiver.process_distribution_message(&skdm).unwrap();
        let ct = sender.encrypt(b"first").unwrap();
        assert_eq!(receiver.decrypt(&ct).unwrap(), b"first");

        // Re-processing the same distribution must not reset the chain.
        receiver.process_distribution_message(&skdm).unwrap();
        let ct2 = sender.encrypt(b"second").unwrap();
        assert_eq!(receiver.decrypt(&ct2).unwrap(), b"second");
    }

    #[test]
    fn rotation_creates_fresh_chain() {
        let sender_store = MemoryStore::new();
        let sender = GroupCipher::new(&sender_store, name(), 2000);
        let first = sender.create_distribution_message().unwrap();
        sender_store
            .delete_sender_key(name().group_id(), &name().sender().to_string())
            .unwrap();
        let second = sender.create_distribution_message().unwrap();
        assert_ne!(first.key_id, second.key_id);
        assert_ne!(first.chain_key, second.chain_key);
    }
}
