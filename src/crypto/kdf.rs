//! HKDF-SHA256 and HMAC helpers used by the Noise transport and the
//! ratchet key schedule.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// One-shot HMAC-SHA256.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// HMAC-SHA256 over several concatenated parts without allocating.
pub fn hmac_sha256_parts(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// HKDF-SHA256 (RFC 5869) extract-then-expand.
pub fn hkdf(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    let prk = hmac_sha256(salt.unwrap_or(&[0u8; 32]), ikm);

    let mut output = Vec::with_capacity(length);
    let mut block: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while output.len() < length {
        let mut mac = HmacSha256::new_from_slice(&prk).expect("HMAC accepts any key length");
        mac.update(&block);
        mac.update(info);
        mac.update(&[counter]);
        block = mac.finalize().into_bytes().to_vec();
        let take = (length - output.len()).min(block.len());
        output.extend_from_slice(&block[..take]);
        counter += 1;
    }
    output
}

/// HKDF producing two 32-byte keys, the split used all over the transport.
pub fn hkdf_split(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let out = hkdf(salt, ikm, info, 64);
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&out[..32]);
    b.copy_from_slice(&out[32..]);
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_rfc5869_case_1() {
        // RFC 5869 appendix A.1
        let ikm = [0x0b; 22];
        let salt: Vec<u8> = (0..13).collect();
        let info: Vec<u8> = (0xf0..0xfa).collect();
        let okm = hkdf(Some(&salt), &ikm, &info, 42);
        assert_eq!(
            hex::encode(&okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn hkdf_split_halves_differ() {
        let (a, b) = hkdf_split(Some(&[1u8; 32]), &[2u8; 32], b"test");
        assert_ne!(a, b);
    }

    #[test]
    fn hmac_parts_equals_concat() {
        let key = [7u8; 32];
        let joined = hmac_sha256(&key, b"hello world");
        let parts = hmac_sha256_parts(&key, &[b"hello", b" ", b"world"]);
        assert_eq!(joined, parts);
    }
}
