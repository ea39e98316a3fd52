//! Persistence contracts the external storage layer implements.
//!
//! All keys are structural-JID-derived address strings. Implementations
//! must be safe for concurrent use by the pipeline and fast enough to call
//! from the reader task; per-address serialization is the implementation's
//! responsibility (the in-memory reference store uses coarse locks).

use serde::{Deserialize, Serialize};

use crate::crypto::PreKey;
use crate::error::StoreError;
use crate::store::device::Device;
use crate::types::JID;

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored one-time prekey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyRecord {
    pub key_id: u32,
    pub key_pair: crate::crypto::KeyPair,
    /// Set once the key bootstrapped a session; a consumed key is never
    /// handed out again.
    pub consumed: bool,
    /// Set once the public half was uploaded to the server.
    pub uploaded: bool,
}

impl From<&PreKey> for PreKeyRecord {
    fn from(pk: &PreKey) -> Self {
        Self {
            key_id: pk.key_id,
            key_pair: pk.key_pair.clone(),
            consumed: false,
            uploaded: false,
        }
    }
}

/// Pinned identity keys of remote addresses.
pub trait IdentityStore: Send + Sync {
    fn put_identity(&self, address: &str, key: [u8; 32]) -> StoreResult<()>;
    fn get_identity(&self, address: &str) -> StoreResult<Option<[u8; 32]>>;
    fn delete_identity(&self, address: &str) -> StoreResult<()>;

    /// Trust check: unknown addresses are trusted on first use.
    fn is_trusted_identity(&self, address: &str, key: &[u8; 32]) -> StoreResult<bool> {
        Ok(match self.get_identity(address)? {
            Some(stored) => &stored == key,
            None => true,
        })
    }
}

/// Serialized double-ratchet sessions per address.
pub trait SessionStore: Send + Sync {
    fn get_session(&self, address: &str) -> StoreResult<Option<Vec<u8>>>;
    fn has_session(&self, address: &str) -> StoreResult<bool>;
    fn put_session(&self, address: &str, session: &[u8]) -> StoreResult<()>;
    fn delete_session(&self, address: &str) -> StoreResult<()>;
}

/// One-time prekey pool.
pub trait PreKeyStore: Send + Sync {
    fn get_pre_key(&self, id: u32) -> StoreResult<Option<PreKeyRecord>>;
    /// Bulk insert of freshly generated keys.
    fn put_pre_keys(&self, records: &[PreKeyRecord]) -> StoreResult<()>;
    /// Marks a key consumed. Returns the record exactly once: a second call
    /// for the same id yields `None`, including under concurrent callers.
    fn consume_pre_key(&self, id: u32) -> StoreResult<Option<PreKeyRecord>>;
    fn unused_pre_key_count(&self) -> StoreResult<usize>;
    fn mark_pre_keys_uploaded(&self, up_to_id: u32) -> StoreResult<()>;
    fn delete_pre_key(&self, id: u32) -> StoreResult<()>;
}

/// Sender-key sessions per (group, sender address).
pub trait SenderKeyStore: Send + Sync {
    fn get_sender_key(&self, group: &str, sender: &str) -> StoreResult<Option<Vec<u8>>>;
    fn put_sender_key(&self, group: &str, sender: &str, record: &[u8]) -> StoreResult<()>;
    fn delete_sender_key(&self, group: &str, sender: &str) -> StoreResult<()>;
}

/// App-state key version cursors (the sync engine itself is external).
pub trait AppStateStore: Send + Sync {
    fn get_version(&self, name: &str) -> StoreResult<Option<u64>>;
    fn set_version(&self, name: &str, version: u64) -> StoreResult<()>;
}

/// Contact metadata, opaque to the core except for event-sourced updates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactInfo {
    pub jid: JID,
    pub first_name: String,
    pub full_name: String,
    pub push_name: Option<String>,
    pub business_name: Option<String>,
}

pub trait ContactStore: Send + Sync {
    fn get_contact(&self, jid: &JID) -> StoreResult<Option<ContactInfo>>;
    fn put_contact(&self, contact: &ContactInfo) -> StoreResult<()>;
}

/// Per-chat settings, opaque to the core.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSettings {
    pub muted_until: Option<i64>,
    pub pinned: bool,
    pub archived: bool,
}

pub trait ChatSettingsStore: Send + Sync {
    fn get_chat_settings(&self, chat: &JID) -> StoreResult<Option<ChatSettings>>;
    fn put_chat_settings(&self, chat: &JID, settings: &ChatSettings) -> StoreResult<()>;
}

/// The device identity record itself.
pub trait DeviceStore: Send + Sync {
    fn load_device(&self) -> StoreResult<Option<Device>>;
    fn save_device(&self, device: &Device) -> StoreResult<()>;
    fn delete_device(&self) -> StoreResult<()>;
}

/// The full persistence surface the client needs.
pub trait Store:
    DeviceStore
    + IdentityStore
    + SessionStore
    + PreKeyStore
    + SenderKeyStore
    + AppStateStore
    + ContactStore
    + ChatSettingsStore
{
}

impl<T> Store for T where
    T: DeviceStore
        + IdentityStore
        + SessionStore
        + PreKeyStore
        + SenderKeyStore
        + AppStateStore
        + ContactStore
        + ChatSettingsStore
{
}
