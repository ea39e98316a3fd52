//! Protocol addresses: the store keys for sessions, identities and sender
//! keys.

use std::fmt;

use crate::types::JID;

/// One remote device, as the Signal layer addresses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
    name: String,
    device_id: u32,
}

impl ProtocolAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

impl From<&JID> for ProtocolAddress {
    fn from(jid: &JID) -> Self {
        ProtocolAddress::new(jid.signal_user(), u32::from(jid.device))
    }
}

/// Identifies one sender's chain within one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderKeyName {
    group_id: String,
    sender: ProtocolAddress,
}

impl SenderKeyName {
    pub fn new(group_id: impl Into<String>, sender: ProtocolAddress) -> Self {
        Self {
            group_id: group_id.into(),
            sender,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn sender(&self) -> &ProtocolAddress {
        &self.sender
    }
}

impl fmt::Display for SenderKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.group_id, self.sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_from_jid() {
        let jid: JID = "1234567890:3@s.whatsapp.net".parse().unwrap();
        let addr = ProtocolAddress::from(&jid);
        assert_eq!(addr.to_string(), "1234567890.3");
    }

    #[test]
    fn lid_address_is_distinct() {
        let pn: JID = "1234567890@s.whatsapp.net".parse().unwrap();
        let lid: JID = "1234567890@lid".parse().unwrap();
        assert_ne!(
            ProtocolAddress::from(&pn).to_string(),
            ProtocolAddress::from(&lid).to_string()
        );
    }
}
