//! AES-256-GCM with counter nonces, used for the post-handshake transport.
//!
//! Each direction owns one cipher; the 64-bit counter fills the low 8 bytes
//! of the 12-byte nonce and increases by exactly one per frame. Any AEAD
//! failure is terminal for the connection: the counter is never skipped
//! ahead to resynchronize.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CipherError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

pub struct CounterCipher {
    cipher: Aes256Gcm,
    counter: u64,
}

impl CounterCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new_from_slice(&key).expect("32-byte key"),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        nonce
    }

    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CipherError::EncryptionFailed)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = self.next_nonce();
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CipherError::DecryptionFailed)
    }

    /// Replaces the key and restarts the counter.
    pub fn rekey(&mut self, key: [u8; 32]) {
        self.cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
        self.counter = 0;
    }
}

/// One-shot GCM with an explicit nonce, used during the handshake where the
/// nonce counter belongs to the handshake state.
pub fn gcm_encrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CipherError> {
    Aes256Gcm::new_from_slice(key)
        .expect("32-byte key")
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CipherError::EncryptionFailed)
}

pub fn gcm_decrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CipherError> {
    Aes256Gcm::new_from_slice(key)
        .expect("32-byte key")
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CipherError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_cipher_roundtrip_in_order() {
        let mut tx = CounterCipher::new([0xab; 32]);
        let mut rx = CounterCipher::new([0xab; 32]);
        for i in 0..10u8 {
            let ct = tx.encrypt(&[i; 16], &[]).unwrap();
            assert_eq!(rx.decrypt(&ct, &[]).unwrap(), vec![i; 16]);
        }
    }

    #[test]
    fn out_of_order_frame_fails_closed() {
        let mut tx = CounterCipher::new([0xab; 32]);
        let mut rx = CounterCipher::new([0xab; 32]);
        let _skipped = tx.encrypt(b"first", &[]).unwrap();
        let second = tx.encrypt(b"second", &[]).unwrap();
        assert!(rx.decrypt(&second, &[]).is_err());
    }

    #[test]
    fn wrong_aad_fails() {
        let mut tx = CounterCipher::new([0x01; 32]);
        let mut rx = CounterCipher::new([0x01; 32]);
        let ct = tx.encrypt(b"data", b"good").unwrap();
        assert!(rx.decrypt(&ct, b"bad").is_err());
    }

    #[test]
    fn rekey_restarts_counter() {
        let mut tx = CounterCipher::new([0x02; 32]);
        let _ = tx.encrypt(b"x", &[]).unwrap();
        tx.rekey([0x03; 32]);
        let mut rx = CounterCipher::new([0x03; 32]);
        let ct = tx.encrypt(b"after rekey", &[]).unwrap();
        assert_eq!(rx.decrypt(&ct, &[]).unwrap(), b"after rekey");
    }
}
