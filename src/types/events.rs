//! Typed events surfaced to the application.
//!
//! Handlers receive these through [`crate::Client::add_event_handler`].
//! Dispatch is synchronous per handler; the variants own their data so
//! handlers can move them across tasks freely.

use chrono::{DateTime, Utc};

use crate::binary::Node;
use crate::types::jid::{MessageID, JID};
use crate::types::message::{MessageInfo, MessageSource, ReceiptType, UndecryptableKind};

/// Emitted once the connection is authenticated and live.
#[derive(Debug, Clone)]
pub struct Connected {
    pub is_reconnect: bool,
}

/// Why the connection went away.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// The stream was closed by the server (restart requested).
    StreamRestart,
    /// Another client took over the session.
    Replaced,
    /// Network-level failure.
    Network(String),
    /// Intentional local disconnect.
    Intentional,
}

#[derive(Debug, Clone)]
pub struct Disconnected {
    pub reason: DisconnectReason,
}

/// Account-level logout; the client will not reconnect until state is reset.
#[derive(Debug, Clone, PartialEq)]
pub enum LogoutReason {
    /// 401: the device was removed from the account.
    DeviceRemoved,
    /// 403: the account is banned.
    Banned,
    /// The user logged out locally.
    UserInitiated,
    /// Any other fatal account-level failure code.
    Unknown(u16),
}

#[derive(Debug, Clone)]
pub struct LoggedOut {
    pub reason: LogoutReason,
}

/// A batch of QR codes for pairing; each is shown for ~20 seconds.
#[derive(Debug, Clone)]
pub struct QR {
    pub codes: Vec<String>,
}

/// Pairing completed; the store now holds the assigned identities.
#[derive(Debug, Clone)]
pub struct PairSuccess {
    pub id: JID,
    pub lid: JID,
    pub business_name: String,
    pub platform: String,
}

#[derive(Debug, Clone)]
pub struct PairError {
    pub error: String,
}

/// A decrypted inbound message. The payload is the application-level
/// protobuf, opaque to this crate.
#[derive(Debug, Clone)]
pub struct Message {
    pub info: MessageInfo,
    pub payload: Vec<u8>,
    pub raw: Node,
}

/// A message that could not be decrypted after the retry flow was started.
#[derive(Debug, Clone)]
pub struct UndecryptableMessage {
    pub info: MessageInfo,
    pub kind: UndecryptableKind,
}

#[derive(Debug, Clone)]
pub struct Receipt {
    pub source: MessageSource,
    pub message_ids: Vec<MessageID>,
    pub timestamp: DateTime<Utc>,
    pub receipt_type: ReceiptType,
}

#[derive(Debug, Clone)]
pub struct Presence {
    pub from: JID,
    pub unavailable: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Typing / recording state in a chat.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatPresenceState {
    Composing,
    Paused,
}

#[derive(Debug, Clone)]
pub struct ChatPresence {
    pub chat: JID,
    pub sender: JID,
    pub state: ChatPresenceState,
    /// "audio" when recording a voice note, empty otherwise.
    pub media: String,
}

/// Group membership change observed via a server notification.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

#[derive(Debug, Clone)]
pub struct GroupParticipantsChanged {
    pub group: JID,
    pub action: GroupParticipantAction,
    pub participants: Vec<JID>,
}

/// History sync payload pushed by the primary device; the blob is the
/// compressed history protobuf, opaque to this crate.
#[derive(Debug, Clone)]
pub struct HistorySync {
    pub progress: Option<u32>,
    pub data: Vec<u8>,
}

/// App-state mutation batch; opaque to the core.
#[derive(Debug, Clone)]
pub struct AppState {
    pub name: String,
    pub version: u64,
}

/// All events the client can emit.
#[derive(Debug, Clone)]
pub enum Event {
    Connected(Connected),
    Disconnected(Disconnected),
    LoggedOut(LoggedOut),
    QR(QR),
    PairSuccess(PairSuccess),
    PairError(PairError),
    Message(Message),
    UndecryptableMessage(UndecryptableMessage),
    Receipt(Receipt),
    Presence(Presence),
    ChatPresence(ChatPresence),
    GroupParticipantsChanged(GroupParticipantsChanged),
    HistorySync(HistorySync),
    AppState(AppState),
}
