//! Client configuration.

use std::time::Duration;

/// How to react when a remote identity key changes mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Refuse to decrypt and leave the pinned identity and session untouched.
    Strict,
    /// Replace the pinned identity with the new one and retry once.
    TrustOnFirstUse,
}

/// Configuration for [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint URL.
    pub endpoint: String,
    /// Origin header sent with the WebSocket upgrade.
    pub origin: String,
    /// Platform string advertised in the handshake client payload.
    pub platform: String,
    /// App version quadruple advertised in the handshake client payload.
    pub version: [u32; 4],
    /// Reconnect automatically after an unexpected disconnect.
    pub auto_reconnect: bool,
    /// Hold the inbound delivery receipt until all event handlers for a
    /// message have returned.
    pub synchronous_ack: bool,
    /// Identity change policy for incoming messages.
    pub trust_policy: TrustPolicy,
    /// Keepalive ping interval once the connection is live.
    pub keepalive_interval: Duration,
    /// How long to wait for the keepalive pong before declaring the
    /// connection dead.
    pub keepalive_timeout: Duration,
    /// Default timeout for IQ requests.
    pub iq_timeout: Duration,
    /// How long cached usync device lists stay valid.
    pub device_cache_ttl: Duration,
    /// Upper bound on skipped message keys retained per ratchet chain.
    pub max_skipped_message_keys: usize,
    /// Refill one-time prekeys when the unused count drops below this.
    pub prekey_low_water: usize,
    /// Number of one-time prekeys to keep available after a refill.
    pub prekey_refill_to: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://web.whatsapp.com/ws/chat".to_string(),
            origin: "https://web.whatsapp.com".to_string(),
            platform: "web".to_string(),
            version: [2, 3000, 1012170356, 0],
            auto_reconnect: true,
            synchronous_ack: false,
            trust_policy: TrustPolicy::TrustOnFirstUse,
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            iq_timeout: Duration::from_secs(75),
            device_cache_ttl: Duration::from_secs(600),
            max_skipped_message_keys: 2000,
            prekey_low_water: 20,
            prekey_refill_to: 50,
        }
    }
}
