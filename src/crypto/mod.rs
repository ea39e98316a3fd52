//! Cryptographic primitives: key pairs, XEdDSA signatures, HKDF, and the
//! AEAD / CBC ciphers used by the transport and the ratchet.

mod cbc;
mod gcm;
pub mod kdf;
mod keypair;
pub mod xeddsa;

pub use cbc::{cbc_decrypt, cbc_encrypt, CbcError};
pub use gcm::{gcm_decrypt, gcm_encrypt, CipherError, CounterCipher};
pub use keypair::{
    deserialize_public, serialize_public, KeyPair, PreKey, SignedPreKey, DJB_TYPE,
};
