//! AES-256-CBC with PKCS#7 padding, the body cipher for ratchet messages.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CbcError {
    #[error("bad padding in ciphertext")]
    BadPadding,
}

pub fn cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn cbc_decrypt(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, CbcError> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CbcError::BadPadding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [0x11; 32];
        let iv = [0x22; 16];
        for len in [0, 1, 15, 16, 17, 255] {
            let pt = vec![0x5a; len];
            let ct = cbc_encrypt(&key, &iv, &pt);
            assert_eq!(ct.len() % 16, 0);
            assert_eq!(cbc_decrypt(&key, &iv, &ct).unwrap(), pt);
        }
    }

    #[test]
    fn wrong_key_is_detected() {
        let ct = cbc_encrypt(&[0x11; 32], &[0x22; 16], b"some plaintext bytes");
        // Either bad padding or garbage; bad padding is the overwhelmingly
        // likely outcome and the one the ratchet MAC backstops.
        if let Ok(pt) = cbc_decrypt(&[0x12; 32], &[0x22; 16], &ct) {
            assert_ne!(pt, b"some plaintext bytes");
        }
    }
}
