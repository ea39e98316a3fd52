//! Curve25519 key pairs and prekeys.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use super::xeddsa;

/// Serialized public keys carry this type byte prefix.
pub const DJB_TYPE: u8 = 0x05;

/// A Curve25519 key pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub public: [u8; 32],
    pub private: [u8; 32],
}

impl KeyPair {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private);
        // Clamp per the Curve25519 spec.
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;
        Self::from_private_key(private)
    }

    pub fn from_private_key(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self {
            public: *public.as_bytes(),
            private,
        }
    }

    /// X25519 Diffie-Hellman agreement.
    pub fn dh(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let shared = secret.diffie_hellman(&PublicKey::from(*their_public));
        *shared.as_bytes()
    }

    /// Signs `message` with this key using XEdDSA.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        xeddsa::sign(&self.private, message, &mut rand::thread_rng())
    }

    /// The 33-byte serialized public key (type byte + key).
    pub fn public_serialized(&self) -> [u8; 33] {
        serialize_public(&self.public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[redacted]")
            .finish()
    }
}

/// Prefixes a raw public key with the type byte.
pub fn serialize_public(public: &[u8; 32]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = DJB_TYPE;
    out[1..].copy_from_slice(public);
    out
}

/// Strips and checks the type byte of a serialized public key.
pub fn deserialize_public(data: &[u8]) -> Option<[u8; 32]> {
    match data {
        [DJB_TYPE, rest @ ..] if rest.len() == 32 => {
            let mut key = [0u8; 32];
            key.copy_from_slice(rest);
            Some(key)
        }
        raw if raw.len() == 32 => {
            let mut key = [0u8; 32];
            key.copy_from_slice(raw);
            Some(key)
        }
        _ => None,
    }
}

/// A one-time prekey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKey {
    pub key_pair: KeyPair,
    pub key_id: u32,
}

impl PreKey {
    pub fn new(key_id: u32) -> Self {
        Self {
            key_pair: KeyPair::generate(),
            key_id,
        }
    }
}

/// A signed prekey: the signature covers the serialized public key and is
/// made with the device identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub key_pair: KeyPair,
    pub key_id: u32,
    #[serde(with = "serde_signature")]
    pub signature: [u8; 64],
}

impl SignedPreKey {
    pub fn new(key_id: u32, identity: &KeyPair) -> Self {
        let key_pair = KeyPair::generate();
        let signature = identity.sign(&serialize_public(&key_pair.public));
        Self {
            key_pair,
            key_id,
            signature,
        }
    }

    /// Verifies a signed prekey bundle entry against an identity key.
    pub fn verify(
        identity_public: &[u8; 32],
        prekey_public: &[u8; 32],
        signature: &[u8; 64],
    ) -> bool {
        xeddsa::verify(identity_public, &serialize_public(prekey_public), signature)
    }
}

mod serde_signature {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(sig)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let v: Vec<u8> = Vec::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_agreement_is_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        assert_eq!(alice.dh(&bob.public), bob.dh(&alice.public));
    }

    #[test]
    fn signed_prekey_verifies() {
        let identity = KeyPair::generate();
        let spk = SignedPreKey::new(1, &identity);
        assert!(SignedPreKey::verify(
            &identity.public,
            &spk.key_pair.public,
            &spk.signature
        ));
    }

    #[test]
    fn signed_prekey_rejects_wrong_identity() {
        let identity = KeyPair::generate();
        let other = KeyPair::generate();
        let spk = SignedPreKey::new(1, &identity);
        assert!(!SignedPreKey::verify(
            &other.public,
            &spk.key_pair.public,
            &spk.signature
        ));
    }

    #[test]
    fn public_key_serialization() {
        let kp = KeyPair::generate();
        let ser = kp.public_serialized();
        assert_eq!(ser[0], DJB_TYPE);
        assert_eq!(deserialize_public(&ser), Some(kp.public));
        assert_eq!(deserialize_public(&kp.public), Some(kp.public));
        assert_eq!(deserialize_public(&ser[..20]), None);
    }
}
