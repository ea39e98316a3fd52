//! In-memory reference implementation of the store contracts, used by the
//! tests and as the default for unpersisted clients.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StoreError;
use crate::store::device::Device;
use crate::store::traits::{
    AppStateStore, ChatSettings, ChatSettingsStore, ContactInfo, ContactStore, DeviceStore,
    IdentityStore, PreKeyRecord, PreKeyStore, SenderKeyStore, SessionStore, StoreResult,
};
use crate::types::JID;

#[derive(Default)]
pub struct MemoryStore {
    device: RwLock<Option<Device>>,
    identities: RwLock<HashMap<String, [u8; 32]>>,
    sessions: RwLock<HashMap<String, Vec<u8>>>,
    pre_keys: RwLock<HashMap<u32, PreKeyRecord>>,
    sender_keys: RwLock<HashMap<(String, String), Vec<u8>>>,
    app_state_versions: RwLock<HashMap<String, u64>>,
    contacts: RwLock<HashMap<String, ContactInfo>>,
    chat_settings: RwLock<HashMap<String, ChatSettings>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(_: impl std::fmt::Debug) -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

impl DeviceStore for MemoryStore {
    fn load_device(&self) -> StoreResult<Option<Device>> {
        Ok(self.device.read().map_err(poisoned)?.clone())
    }

    fn save_device(&self, device: &Device) -> StoreResult<()> {
        *self.device.write().map_err(poisoned)? = Some(device.clone());
        Ok(())
    }

    fn delete_device(&self) -> StoreResult<()> {
        *self.device.write().map_err(poisoned)? = None;
        Ok(())
    }
}

impl IdentityStore for MemoryStore {
    fn put_identity(&self, address: &str, key: [u8; 32]) -> StoreResult<()> {
        self.identities
            .write()
            .map_err(poisoned)?
            .insert(address.to_string(), key);
        Ok(())
    }

    fn get_identity(&self, address: &str) -> StoreResult<Option<[u8; 32]>> {
        Ok(self.identities.read().map_err(poisoned)?.get(address).copied())
    }

    fn delete_identity(&self, address: &str) -> StoreResult<()> {
        self.identities.write().map_err(poisoned)?.remove(address);
        Ok(())
    }
}

impl SessionStore for MemoryStore {
    fn get_session(&self, address: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.sessions.read().map_err(poisoned)?.get(address).cloned())
    }

    fn has_session(&self, address: &str) -> StoreResult<bool> {
        Ok(self.sessions.read().map_err(poisoned)?.contains_key(address))
    }

    fn put_session(&self, address: &str, session: &[u8]) -> StoreResult<()> {
        self.sessions
            .write()
            .map_err(poisoned)?
            .insert(address.to_string(), session.to_vec());
        Ok(())
    }

    fn delete_session(&self, address: &str) -> StoreResult<()> {
        self.sessions.write().map_err(poisoned)?.remove(address);
        Ok(())
    }
}

impl PreKeyStore for MemoryStore {
    fn get_pre_key(&self, id: u32) -> StoreResult<Option<PreKeyRecord>> {
        Ok(self.pre_keys.read().map_err(poisoned)?.get(&id).cloned())
    }

    fn put_pre_keys(&self, records: &[PreKeyRecord]) -> StoreResult<()> {
        let mut map = self.pre_keys.write().map_err(poisoned)?;
        for record in records {
            map.insert(record.key_id, record.clone());
        }
        Ok(())
    }

    fn consume_pre_key(&self, id: u32) -> StoreResult<Option<PreKeyRecord>> {
        // The write lock makes mark-and-return atomic: exactly one caller
        // observes the unconsumed record.
        let mut map = self.pre_keys.write().map_err(poisoned)?;
        match map.get_mut(&id) {
            Some(record) if !record.consumed => {
                record.consumed = true;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    fn unused_pre_key_count(&self) -> StoreResult<usize> {
        Ok(self
            .pre_keys
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|r| !r.consumed)
            .count())
    }

    fn mark_pre_keys_uploaded(&self, up_to_id: u32) -> StoreResult<()> {
        let mut map = self.pre_keys.write().map_err(poisoned)?;
        for record in map.values_mut() {
            if record.key_id <= up_to_id {
                record.uploaded = true;
            }
        }
        Ok(())
    }

    fn delete_pre_key(&self, id: u32) -> StoreResult<()> {
        self.pre_keys.write().map_err(poisoned)?.remove(&id);
        Ok(())
    }
}

impl SenderKeyStore for MemoryStore {
    fn get_sender_key(&self, group: &str, sender: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .sender_keys
            .read()
            .map_err(poisoned)?
            .get(&(group.to_string(), sender.to_string()))
            .cloned())
    }

    fn put_sender_key(&self, group: &str, sender: &str, record: &[u8]) -> StoreResult<()> {
        self.sender_keys
            .write()
            .map_err(poisoned)?
            .insert((group.to_string(), sender.to_string()), record.to_vec());
        Ok(())
    }

    fn delete_sender_key(&self, group: &str, sender: &str) -> StoreResult<()> {
        self.sender_keys
            .write()
            .map_err(poisoned)?
            .remove(&(group.to_string(), sender.to_string()));
        Ok(())
    }
}

impl AppStateStore for MemoryStore {
    fn get_version(&self, name: &str) -> StoreResult<Option<u64>> {
        Ok(self
            .app_state_versions
            .read()
            .map_err(poisoned)?
            .get(name)
            .copied())
    }

    fn set_version(&self, name: &str, version: u64) -> StoreResult<()> {
        self.app_state_versions
            .write()
            .map_err(poisoned)?
            .insert(name.to_string(), version);
        Ok(())
    }
}

impl ContactStore for MemoryStore {
    fn get_contact(&self, jid: &JID) -> StoreResult<Option<ContactInfo>> {
        Ok(self
            .contacts
            .read()
            .map_err(poisoned)?
            .get(&jid.to_string())
            .cloned())
    }

    fn put_contact(&self, contact: &ContactInfo) -> StoreResult<()> {
        self.contacts
            .write()
            .map_err(poisoned)?
            .insert(contact.jid.to_string(), contact.clone());
        Ok(())
    }
}

impl ChatSettingsStore for MemoryStore {
    fn get_chat_settings(&self, chat: &JID) -> StoreResult<Option<ChatSettings>> {
        Ok(self
            .chat_settings
            .read()
            .map_err(poisoned)?
            .get(&chat.to_string())
            .cloned())
    }

    fn put_chat_settings(&self, chat: &JID, settings: &ChatSettings) -> StoreResult<()> {
        self.chat_settings
            .write()
            .map_err(poisoned)?
            .insert(chat.to_string(), settings.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PreKey;
    use std::sync::Arc;

    #[test]
    fn identity_store_roundtrip() {
        let store = MemoryStore::new();
        store.put_identity("1234567890.0", [0xab; 32]).unwrap();
        assert_eq!(store.get_identity("1234567890.0").unwrap(), Some([0xab; 32]));
        assert!(store.is_trusted_identity("1234567890.0", &[0xab; 32]).unwrap());
        assert!(!store.is_trusted_identity("1234567890.0", &[0xcd; 32]).unwrap());
        assert!(store.is_trusted_identity("unknown.0", &[0xcd; 32]).unwrap());
    }

    #[test]
    fn prekey_consume_is_exactly_once_under_concurrency() {
        let store = Arc::new(MemoryStore::new());
        let keys: Vec<PreKeyRecord> = (1..=1u32).map(|i| (&PreKey::new(i)).into()).collect();
        store.put_pre_keys(&keys).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.consume_pre_key(1).unwrap().is_some() as u32
            }));
        }
        let winners: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1, "exactly one consumer may win");
        assert_eq!(store.unused_pre_key_count().unwrap(), 0);
    }

    #[test]
    fn sender_keys_keyed_by_group_and_sender() {
        let store = MemoryStore::new();
        store.put_sender_key("g1@g.us", "111.0", b"aaa").unwrap();
        store.put_sender_key("g1@g.us", "222.0", b"bbb").unwrap();
        assert_eq!(store.get_sender_key("g1@g.us", "111.0").unwrap().unwrap(), b"aaa");
        assert_eq!(store.get_sender_key("g2@g.us", "111.0").unwrap(), None);
        store.delete_sender_key("g1@g.us", "111.0").unwrap();
        assert_eq!(store.get_sender_key("g1@g.us", "111.0").unwrap(), None);
    }

    #[test]
    fn device_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load_device().unwrap().is_none());
        let device = Device::generate();
        store.save_device(&device).unwrap();
        let loaded = store.load_device().unwrap().unwrap();
        assert_eq!(loaded.registration_id, device.registration_id);
        store.delete_device().unwrap();
        assert!(store.load_device().unwrap().is_none());
    }
}
