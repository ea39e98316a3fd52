//! XEdDSA: Ed25519-style signatures made with Curve25519 key material.
//!
//! The signer derives the Edwards form of its Montgomery private key and
//! carries the sign bit of the derived public point in the high bit of the
//! final signature byte, so verifiers can reconstruct the Edwards public
//! key from the Montgomery one.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{clamp_integer, Scalar};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};

const SIGN_BIT: u8 = 0x80;

/// Signs `message` with a Curve25519 private key.
pub fn sign<R: CryptoRng + RngCore>(private: &[u8; 32], message: &[u8], rng: &mut R) -> [u8; 64] {
    let a = Scalar::from_bytes_mod_order(clamp_integer(*private));
    let ed_public = EdwardsPoint::mul_base(&a).compress();
    let sign_bit = ed_public.as_bytes()[31] & SIGN_BIT;

    let mut random = [0u8; 64];
    rng.fill_bytes(&mut random);

    // Nonce hash uses the reserved prefix so it can never collide with a
    // plain Ed25519 message hash.
    let mut h1 = Sha512::new();
    h1.update([0xFEu8]);
    h1.update([0xFFu8; 31]);
    h1.update(private);
    h1.update(message);
    h1.update(random);
    let r = Scalar::from_hash(h1);

    let cap_r = EdwardsPoint::mul_base(&r).compress();

    let mut h2 = Sha512::new();
    h2.update(cap_r.as_bytes());
    h2.update(ed_public.as_bytes());
    h2.update(message);
    let h = Scalar::from_hash(h2);

    let s = (h * a) + r;

    let mut signature = [0u8; 64];
    signature[..32].copy_from_slice(cap_r.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    signature[63] &= !SIGN_BIT;
    signature[63] |= sign_bit;
    signature
}

/// Verifies a signature against a Curve25519 public key.
pub fn verify(public: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let sign_bit = (signature[63] & SIGN_BIT) >> 7;
    let Some(ed_public) = MontgomeryPoint(*public).to_edwards(sign_bit) else {
        return false;
    };

    let mut cap_r = [0u8; 32];
    cap_r.copy_from_slice(&signature[..32]);
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&signature[32..]);
    s_bytes[31] &= !SIGN_BIT;

    // Reject non-canonical scalars.
    let Some(s): Option<Scalar> = Scalar::from_canonical_bytes(s_bytes).into() else {
        return false;
    };

    let cap_a = ed_public.compress();
    let mut h2 = Sha512::new();
    h2.update(cap_r);
    h2.update(cap_a.as_bytes());
    h2.update(message);
    let h = Scalar::from_hash(h2);

    let check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-ed_public, &s);
    check.compress() == CompressedEdwardsY(cap_r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = KeyPair::generate();
        let msg = b"prekey signature input";
        let sig = sign(&kp.private, msg, &mut rand::thread_rng());
        assert!(verify(&kp.public, msg, &sig));
    }

    #[test]
    fn tampered_message_fails() {
        let kp = KeyPair::generate();
        let sig = sign(&kp.private, b"original", &mut rand::thread_rng());
        assert!(!verify(&kp.public, b"tampered", &sig));
    }

    #[test]
    fn tampered_signature_fails() {
        let kp = KeyPair::generate();
        let mut sig = sign(&kp.private, b"message", &mut rand::thread_rng());
        sig[5] ^= 0x01;
        assert!(!verify(&kp.public, b"message", &sig));
    }

    #[test]
    fn wrong_key_fails() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = sign(&kp.private, b"message", &mut rand::thread_rng());
        assert!(!verify(&other.public, b"message", &sig));
    }

    #[test]
    fn signatures_are_randomized_but_all_verify() {
        let kp = KeyPair::generate();
        let sig1 = sign(&kp.private, b"m", &mut rand::thread_rng());
        let sig2 = sign(&kp.private, b"m", &mut rand::thread_rng());
        assert_ne!(sig1, sig2);
        assert!(verify(&kp.public, b"m", &sig1));
        assert!(verify(&kp.public, b"m", &sig2));
    }
}
