//! Message metadata types shared by the pipeline and the event surface.

use chrono::{DateTime, Utc};

use crate::types::jid::{MessageID, JID};

/// Where a message came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageSource {
    /// The chat the message belongs to (user JID for 1:1, group JID for groups).
    pub chat: JID,
    /// The specific device that sent the message.
    pub sender: JID,
    /// The sender's address in the other address space, when the stanza
    /// carried it (`sender_lid` / `sender_pn`).
    pub sender_alt: Option<JID>,
    /// Whether the message was sent by one of our own devices.
    pub is_from_me: bool,
    /// Whether the chat is a group.
    pub is_group: bool,
}

/// Metadata attached to every inbound message event.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageInfo {
    pub source: MessageSource,
    pub id: MessageID,
    pub timestamp: DateTime<Utc>,
    /// Push name advertised by the sender, if any.
    pub push_name: Option<String>,
    pub is_ephemeral: bool,
    pub is_view_once: bool,
    pub is_edit: bool,
}

/// Receipt classification per the `type` attribute of a receipt stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptType {
    /// Message arrived at the recipient device (no `type` attribute).
    Delivered,
    Read,
    Played,
    /// The server accepted the message.
    Server,
    /// The recipient could not decrypt and wants a re-send.
    Retry,
    /// Receipt aimed at the sender's own devices.
    Sender,
}

impl ReceiptType {
    pub fn from_attr(s: Option<&str>) -> Self {
        match s {
            None | Some("") | Some("delivery") => ReceiptType::Delivered,
            Some("read") => ReceiptType::Read,
            Some("played") => ReceiptType::Played,
            Some("server") => ReceiptType::Server,
            Some("retry") => ReceiptType::Retry,
            Some("sender") => ReceiptType::Sender,
            Some(_) => ReceiptType::Delivered,
        }
    }

    pub fn as_attr(&self) -> Option<&'static str> {
        match self {
            ReceiptType::Delivered => None,
            ReceiptType::Read => Some("read"),
            ReceiptType::Played => Some("played"),
            ReceiptType::Server => Some("server"),
            ReceiptType::Retry => Some("retry"),
            ReceiptType::Sender => Some("sender"),
        }
    }
}

/// Why an inbound message could not be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndecryptableKind {
    NoSession,
    NoSenderKey,
    InvalidMessage,
    UntrustedIdentity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_type_attr_roundtrip() {
        for ty in [
            ReceiptType::Delivered,
            ReceiptType::Read,
            ReceiptType::Played,
            ReceiptType::Server,
            ReceiptType::Retry,
            ReceiptType::Sender,
        ] {
            assert_eq!(ReceiptType::from_attr(ty.as_attr()), ty);
        }
    }
}
