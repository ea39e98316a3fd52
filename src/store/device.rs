//! The device identity record: everything one linked installation persists
//! about itself.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::crypto::{KeyPair, PreKey, SignedPreKey};
use crate::proto::AdvSignedDeviceIdentity;
use crate::types::JID;

/// One local installation. The registration id, Noise key and identity key
/// are fixed at creation; changing them requires a fresh pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Random 31-bit registration id, immutable after creation.
    pub registration_id: u32,
    /// Static Noise key authenticated during the transport handshake.
    pub noise_key: KeyPair,
    /// Signal identity key pair.
    pub identity_key: KeyPair,
    /// Current signed prekey.
    pub signed_pre_key: SignedPreKey,
    /// Secret shared with the primary device during pairing.
    pub adv_secret_key: [u8; 32],
    /// Signed device identity returned by the server at pair time.
    #[serde(skip)]
    pub account: Option<AdvSignedDeviceIdentity>,
    /// Assigned JID, present once paired.
    pub id: Option<JID>,
    /// Assigned LID, present once paired.
    pub lid: Option<JID>,
    pub push_name: String,
    pub business_name: String,
    pub platform: String,
    /// Next one-time prekey id to allocate.
    pub next_pre_key_id: u32,
}

impl Device {
    /// Generates a fresh, unpaired device.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let identity_key = KeyPair::generate();
        let signed_pre_key = SignedPreKey::new(1, &identity_key);
        Self {
            registration_id: rng.gen_range(1..=0x7FFF_FFFF),
            noise_key: KeyPair::generate(),
            identity_key,
            signed_pre_key,
            adv_secret_key: rng.gen(),
            account: None,
            id: None,
            lid: None,
            push_name: String::new(),
            business_name: String::new(),
            platform: String::new(),
            next_pre_key_id: 1,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.id.is_some()
    }

    /// Allocates `count` fresh one-time prekeys with sequential ids.
    pub fn generate_pre_keys(&mut self, count: usize) -> Vec<PreKey> {
        let start = self.next_pre_key_id;
        self.next_pre_key_id += count as u32;
        (0..count as u32).map(|i| PreKey::new(start + i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_device_is_unpaired() {
        let device = Device::generate();
        assert!(!device.is_paired());
        assert!(device.registration_id > 0);
        assert!(device.registration_id <= 0x7FFF_FFFF);
    }

    #[test]
    fn pre_key_ids_are_sequential_and_unique() {
        let mut device = Device::generate();
        let first = device.generate_pre_keys(10);
        let second = device.generate_pre_keys(5);
        let ids: Vec<u32> = first.iter().chain(&second).map(|k| k.key_id).collect();
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids.len(), 15);
        assert_eq!(ids, deduped);
        assert_eq!(device.next_pre_key_id, 16);
    }
}
