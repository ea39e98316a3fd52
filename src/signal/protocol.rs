//! Wire forms of the Signal messages.
//!
//! Every message starts with a version byte (major/minor nibbles). Session
//! messages end with an 8-byte truncated HMAC binding both identities;
//! sender-key messages end with a 64-byte signature by the sender's signing
//! key.

use prost::Message;

use crate::crypto::kdf::hmac_sha256_parts;
use crate::crypto::{deserialize_public, serialize_public};
use crate::error::SignalError;
use crate::proto;

pub const CIPHERTEXT_VERSION: u8 = 3;
pub const VERSION_BYTE: u8 = (CIPHERTEXT_VERSION << 4) | CIPHERTEXT_VERSION;

pub const MAC_LENGTH: usize = 8;
pub const SIGNATURE_LENGTH: usize = 64;

fn check_version(byte: u8) -> Result<(), SignalError> {
    if byte >> 4 != CIPHERTEXT_VERSION {
        return Err(SignalError::UnsupportedVersion(byte >> 4));
    }
    Ok(())
}

/// A normal double-ratchet message (`enc type="msg"`).
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub ratchet_key: [u8; 32],
    pub counter: u32,
    pub previous_counter: u32,
    pub ciphertext: Vec<u8>,
    pub serialized: Vec<u8>,
}

impl SignalMessage {
    pub fn new(
        mac_key: &[u8; 32],
        sender_identity: &[u8; 32],
        receiver_identity: &[u8; 32],
        ratchet_key: [u8; 32],
        counter: u32,
        previous_counter: u32,
        ciphertext: Vec<u8>,
    ) -> Self {
        let body = proto::encode_proto(&proto::SignalMessageProto {
            ratchet_key: Some(serialize_public(&ratchet_key).to_vec()),
            counter: Some(counter),
            previous_counter: Some(previous_counter),
            ciphertext: Some(ciphertext.clone()),
        });
        let mut serialized = Vec::with_capacity(1 + body.len() + MAC_LENGTH);
        serialized.push(VERSION_BYTE);
        serialized.extend_from_slice(&body);
        let mac = compute_mac(mac_key, sender_identity, receiver_identity, &serialized);
        serialized.extend_from_slice(&mac);
        Self {
            ratchet_key,
            counter,
            previous_counter,
            ciphertext,
            serialized,
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SignalError> {
        if data.len() < 1 + MAC_LENGTH + 1 {
            return Err(SignalError::InvalidMessage("signal message too short"));
        }
        check_version(data[0])?;
        let body = &data[1..data.len() - MAC_LENGTH];
        let msg = proto::SignalMessageProto::decode(body)?;
        let ratchet_key = msg
            .ratchet_key
            .as_deref()
            .and_then(deserialize_public)
            .ok_or(SignalError::InvalidMessage("bad ratchet key"))?;
        Ok(Self {
            ratchet_key,
            counter: msg.counter.unwrap_or(0),
            previous_counter: msg.previous_counter.unwrap_or(0),
            ciphertext: msg
                .ciphertext
                .ok_or(SignalError::InvalidMessage("missing ciphertext"))?,
            serialized: data.to_vec(),
        })
    }

    /// Constant-size MAC check over everything but the trailing MAC itself.
    pub fn verify_mac(
        &self,
        mac_key: &[u8; 32],
        sender_identity: &[u8; 32],
        receiver_identity: &[u8; 32],
    ) -> bool {
        let split = self.serialized.len() - MAC_LENGTH;
        let expected = compute_mac(
            mac_key,
            sender_identity,
            receiver_identity,
            &self.serialized[..split],
        );
        // Short MACs still get a constant-time comparison.
        let mut diff = 0u8;
        for (a, b) in expected.iter().zip(&self.serialized[split..]) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

fn compute_mac(
    mac_key: &[u8; 32],
    sender_identity: &[u8; 32],
    receiver_identity: &[u8; 32],
    data: &[u8],
) -> [u8; MAC_LENGTH] {
    let full = hmac_sha256_parts(
        mac_key,
        &[
            &serialize_public(sender_identity),
            &serialize_public(receiver_identity),
            data,
        ],
    );
    let mut mac = [0u8; MAC_LENGTH];
    mac.copy_from_slice(&full[..MAC_LENGTH]);
    mac
}

/// A session-establishing message (`enc type="pkmsg"`): a [`SignalMessage`]
/// plus everything the receiver needs to run its side of X3DH.
#[derive(Debug, Clone, PartialEq)]
pub struct PreKeySignalMessage {
    pub registration_id: u32,
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: [u8; 32],
    pub identity_key: [u8; 32],
    pub message: SignalMessage,
    pub serialized: Vec<u8>,
}

impl PreKeySignalMessage {
    pub fn new(
        registration_id: u32,
        pre_key_id: Option<u32>,
        signed_pre_key_id: u32,
        base_key: [u8; 32],
        identity_key: [u8; 32],
        message: SignalMessage,
    ) -> Self {
        let body = proto::encode_proto(&proto::PreKeySignalMessageProto {
            pre_key_id,
            base_key: Some(serialize_public(&base_key).to_vec()),
            identity_key: Some(serialize_public(&identity_key).to_vec()),
            message: Some(message.serialized.clone()),
            registration_id: Some(registration_id),
            signed_pre_key_id: Some(signed_pre_key_id),
        });
        let mut serialized = Vec::with_capacity(1 + body.len());
        serialized.push(VERSION_BYTE);
        serialized.extend_from_slice(&body);
        Self {
            registration_id,
            pre_key_id,
            signed_pre_key_id,
            base_key,
            identity_key,
            message,
            serialized,
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SignalError> {
        let (&version, body) = data
            .split_first()
            .ok_or(SignalError::InvalidMessage("empty pkmsg"))?;
        check_version(version)?;
        let msg = proto::PreKeySignalMessageProto::decode(body)?;
        let base_key = msg
            .base_key
            .as_deref()
            .and_then(deserialize_public)
            .ok_or(SignalError::InvalidMessage("bad base key"))?;
        let identity_key = msg
            .identity_key
            .as_deref()
            .and_then(deserialize_public)
            .ok_or(SignalError::InvalidMessage("bad identity key"))?;
        let inner = msg
            .message
            .ok_or(SignalError::InvalidMessage("missing inner message"))?;
        Ok(Self {
            registration_id: msg.registration_id.unwrap_or(0),
            pre_key_id: msg.pre_key_id,
            signed_pre_key_id: msg
                .signed_pre_key_id
                .ok_or(SignalError::InvalidMessage("missing signed prekey id"))?,
            base_key,
            identity_key,
            message: SignalMessage::deserialize(&inner)?,
            serialized: data.to_vec(),
        })
    }
}

/// Either wire form a pairwise encrypt can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum CiphertextMessage {
    PreKey(PreKeySignalMessage),
    Whisper(SignalMessage),
}

impl CiphertextMessage {
    /// The `type` attribute of the `enc` node carrying this message.
    pub fn enc_type(&self) -> &'static str {
        match self {
            CiphertextMessage::PreKey(_) => "pkmsg",
            CiphertextMessage::Whisper(_) => "msg",
        }
    }

    pub fn serialized(&self) -> &[u8] {
        match self {
            CiphertextMessage::PreKey(m) => &m.serialized,
            CiphertextMessage::Whisper(m) => &m.serialized,
        }
    }
}

/// A group fanout message (`enc type="skmsg"`).
#[derive(Debug, Clone, PartialEq)]
pub struct SenderKeyMessage {
    pub key_id: u32,
    pub iteration: u32,
    pub ciphertext: Vec<u8>,
    pub serialized: Vec<u8>,
}

impl SenderKeyMessage {
    /// Builds and signs a sender key message.
    pub fn new(
        key_id: u32,
        iteration: u32,
        ciphertext: Vec<u8>,
        signing_key: &ed25519_dalek::SigningKey,
    ) -> Self {
        use ed25519_dalek::Signer;
        let body = proto::encode_proto(&proto::SenderKeyMessageProto {
            id: Some(key_id),
            iteration: Some(iteration),
            ciphertext: Some(ciphertext.clone()),
        });
        let mut serialized = Vec::with_capacity(1 + body.len() + SIGNATURE_LENGTH);
        serialized.push(VERSION_BYTE);
        serialized.extend_from_slice(&body);
        let signature = signing_key.sign(&serialized);
        serialized.extend_from_slice(&signature.to_bytes());
        Self {
            key_id,
            iteration,
            ciphertext,
            serialized,
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SignalError> {
        if data.len() < 1 + SIGNATURE_LENGTH + 1 {
            return Err(SignalError::InvalidMessage("skmsg too short"));
        }
        check_version(data[0])?;
        let body = &data[1..data.len() - SIGNATURE_LENGTH];
        let msg = proto::SenderKeyMessageProto::decode(body)?;
        Ok(Self {
            key_id: msg.id.ok_or(SignalError::InvalidMessage("missing key id"))?,
            iteration: msg
                .iteration
                .ok_or(SignalError::InvalidMessage("missing iteration"))?,
            ciphertext: msg
                .ciphertext
                .ok_or(SignalError::InvalidMessage("missing ciphertext"))?,
            serialized: data.to_vec(),
        })
    }

    pub fn verify_signature(&self, signing_public: &[u8; 32]) -> bool {
        use ed25519_dalek::Verifier;
        let split = self.serialized.len() - SIGNATURE_LENGTH;
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(signing_public) else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::from_slice(&self.serialized[split..]) else {
            return false;
        };
        key.verify(&self.serialized[..split], &sig).is_ok()
    }
}

/// The bootstrap message that shares a sender chain with one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct SenderKeyDistributionMessage {
    pub key_id: u32,
    pub iteration: u32,
    pub chain_key: [u8; 32],
    pub signing_key: [u8; 32],
    pub serialized: Vec<u8>,
}

impl SenderKeyDistributionMessage {
    pub fn new(key_id: u32, iteration: u32, chain_key: [u8; 32], signing_key: [u8; 32]) -> Self {
        let body = proto::encode_proto(&proto::SenderKeyDistributionMessageProto {
            id: Some(key_id),
            iteration: Some(iteration),
            chain_key: Some(chain_key.to_vec()),
            signing_key: Some(signing_key.to_vec()),
        });
        let mut serialized = Vec::with_capacity(1 + body.len());
        serialized.push(VERSION_BYTE);
        serialized.extend_from_slice(&body);
        Self {
            key_id,
            iteration,
            chain_key,
            signing_key,
            serialized,
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SignalError> {
        let (&version, body) = data
            .split_first()
            .ok_or(SignalError::InvalidMessage("empty skdm"))?;
        check_version(version)?;
        let msg = proto::SenderKeyDistributionMessageProto::decode(body)?;
        let chain_key: [u8; 32] = msg
            .chain_key
            .as_deref()
            .and_then(|b| b.try_into().ok())
            .ok_or(SignalError::InvalidMessage("bad chain key"))?;
        let signing_key: [u8; 32] = msg
            .signing_key
            .as_deref()
            .and_then(|b| b.try_into().ok())
            .ok_or(SignalError::InvalidMessage("bad signing key"))?;
        Ok(Self {
            key_id: msg.id.ok_or(SignalError::InvalidMessage("missing key id"))?,
            iteration: msg
                .iteration
                .ok_or(SignalError::InvalidMessage("missing iteration"))?,
            chain_key,
            signing_key,
            serialized: data.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_message_roundtrip_and_mac() {
        let mac_key = [3u8; 32];
        let sender = [4u8; 32];
        let receiver = [5u8; 32];
        let msg = SignalMessage::new(&mac_key, &sender, &receiver, [6u8; 32], 7, 2, vec![9; 24]);
        let parsed = SignalMessage::deserialize(&msg.serialized).unwrap();
        assert_eq!(parsed.counter, 7);
        assert_eq!(parsed.previous_counter, 2);
        assert!(parsed.verify_mac(&mac_key, &sender, &receiver));
        assert!(!parsed.verify_mac(&mac_key, &receiver, &sender));
    }

    #[test]
    fn corrupted_mac_is_rejected() {
        let msg = SignalMessage::new(&[1; 32], &[2; 32], &[3; 32], [4; 32], 0, 0, vec![5; 16]);
        let mut bytes = msg.serialized.clone();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
        let parsed = SignalMessage::deserialize(&bytes).unwrap();
        assert!(!parsed.verify_mac(&[1; 32], &[2; 32], &[3; 32]));
    }

    #[test]
    fn prekey_message_roundtrip() {
        let inner = SignalMessage::new(&[1; 32], &[2; 32], &[3; 32], [4; 32], 0, 0, vec![5; 16]);
        let msg = PreKeySignalMessage::new(1234, Some(42), 7, [8u8; 32], [9u8; 32], inner);
        let parsed = PreKeySignalMessage::deserialize(&msg.serialized).unwrap();
        assert_eq!(parsed.pre_key_id, Some(42));
        assert_eq!(parsed.signed_pre_key_id, 7);
        assert_eq!(parsed.registration_id, 1234);
        assert_eq!(parsed.message.serialized, msg.message.serialized);
    }

    #[test]
    fn sender_key_message_signature() {
        let signing = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
        let msg = SenderKeyMessage::new(11, 3, vec![1, 2, 3], &signing);
        let parsed = SenderKeyMessage::deserialize(&msg.serialized).unwrap();
        assert!(parsed.verify_signature(&signing.verifying_key().to_bytes()));
        let other = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
        assert!(!parsed.verify_signature(&other.verifying_key().to_bytes()));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut data = vec![(2 << 4) | 2];
        data.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            SignalMessage::deserialize(&data),
            Err(SignalError::UnsupportedVersion(2))
        ));
    }
}
