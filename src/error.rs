//! Crate-wide error taxonomy.
//!
//! Every public operation returns one of these typed errors. The layering
//! mirrors the data flow: socket errors wrap into client errors, signal
//! errors surface through the message pipeline, IQ errors through the
//! request router.

use thiserror::Error;

use crate::binary::DecodeError;
use crate::types::JID;

/// Errors from the encrypted transport (WebSocket + Noise).
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("noise handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("AEAD failure on frame")]
    CipherFailure,
    #[error("socket closed")]
    Closed,
    #[error("not connected")]
    NotConnected,
}

/// Errors from the IQ request/response layer.
#[derive(Debug, Error)]
pub enum IqError {
    #[error("IQ timed out")]
    Timeout,
    #[error("disconnected while waiting for response")]
    Disconnected,
    #[error("not connected")]
    NotConnected,
    #[error("server returned error {code}: {text}")]
    ServerError { code: u16, text: String },
    #[error("server returned malformed response")]
    Malformed,
}

/// Errors from the Signal session layer.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("no session with {0}")]
    NoSession(String),
    #[error("untrusted identity for {0}")]
    UntrustedIdentity(String),
    #[error("message with old counter {1} for chain {0}")]
    DuplicateMessage(u32, u32),
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    #[error("unknown one-time prekey id {0}")]
    InvalidPreKeyId(u32),
    #[error("bad signed prekey signature")]
    InvalidSignature,
    #[error("message counter {0} too far in the future")]
    TooFarInFuture(u32),
    #[error("no sender key state for {0}")]
    NoSenderKeyState(String),
    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("payload decode error: {0}")]
    Proto(#[from] prost::DecodeError),
}

/// Errors from the persistence contracts.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors from the pairing state machine.
#[derive(Debug, Error)]
pub enum PairError {
    #[error("pair-device stanza was malformed: {0}")]
    Malformed(&'static str),
    #[error("device identity HMAC mismatch")]
    IdentityHmacMismatch,
    #[error("account signature verification failed")]
    AccountSignatureMismatch,
    #[error("pairing rejected by server: {0}")]
    Rejected(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Top-level client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("client is not logged in")]
    NotLoggedIn,
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("disconnected")]
    Disconnected,
    #[error("invalid JID: {0}")]
    InvalidJid(String),
    #[error("server returned an error node: {0}")]
    ServerErrorNode(String),
    #[error("prekey fetch failed for all of: {0:?}")]
    PrekeysFetchFailed(Vec<JID>),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Iq(#[from] IqError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pair(#[from] PairError),
    #[error("codec error: {0}")]
    Codec(#[from] DecodeError),
}
