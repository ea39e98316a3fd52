//! Noise_XX_25519_AESGCM_SHA256 handshake and the post-handshake transport.
//!
//! The handshake state mirrors the pattern reference: a running hash for
//! authentication data, a chaining salt, the current cipher key and a
//! nonce counter that resets on every key mix. After `finish`, each
//! direction owns an AES-256-GCM cipher whose 64-bit counter increases by
//! one per frame; any AEAD failure closes the connection.

use std::sync::Mutex;
use std::time::Duration;

use prost::Message as ProstMessage;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::crypto::kdf::{hkdf_split, sha256};
use crate::crypto::{gcm_decrypt, gcm_encrypt, xeddsa, CounterCipher, KeyPair};
use crate::error::SocketError;
use crate::proto;
use crate::socket::frame::{FrameSocket, CONN_HEADER};
use crate::store::Device;

const NOISE_PATTERN: &[u8; 32] = b"Noise_XX_25519_AESGCM_SHA256\x00\x00\x00\x00";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Pinned root key the server certificate chain must descend from.
const SERVER_CERT_ROOT: [u8; 32] = [
    0x14, 0x23, 0x75, 0x57, 0x4d, 0x0a, 0x58, 0x71, 0x66, 0xaa, 0xe7, 0x1e, 0xbe, 0x51, 0x64,
    0x37, 0xc4, 0xa2, 0x8b, 0x73, 0xe3, 0x69, 0x5c, 0x6c, 0xe1, 0xf7, 0xf9, 0x54, 0x5d, 0xa8,
    0xee, 0x6b,
];

/// Running handshake state.
pub struct NoiseHandshake {
    hash: [u8; 32],
    salt: [u8; 32],
    key: [u8; 32],
    counter: u32,
}

impl NoiseHandshake {
    pub fn new(prologue: &[u8]) -> Self {
        let hash = *NOISE_PATTERN;
        let mut state = Self {
            hash,
            salt: hash,
            key: hash,
            counter: 0,
        };
        state.authenticate(prologue);
        state
    }

    /// Mixes data into the running hash.
    pub fn authenticate(&mut self, data: &[u8]) {
        let mut buf = Vec::with_capacity(64 + data.len());
        buf.extend_from_slice(&self.hash);
        buf.extend_from_slice(data);
        self.hash = sha256(&buf);
    }

    fn nonce(&self) -> [u8; 12] {
        let mut iv = [0u8; 12];
        iv[8..].copy_from_slice(&self.counter.to_be_bytes());
        iv
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SocketError> {
        let ciphertext = gcm_encrypt(&self.key, &self.nonce(), plaintext, &self.hash)
            .map_err(|_| SocketError::HandshakeFailed("handshake encrypt".into()))?;
        self.counter += 1;
        self.authenticate(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SocketError> {
        let plaintext = gcm_decrypt(&self.key, &self.nonce(), ciphertext, &self.hash)
            .map_err(|_| SocketError::HandshakeFailed("handshake decrypt".into()))?;
        self.counter += 1;
        self.authenticate(ciphertext);
        Ok(plaintext)
    }

    /// Mixes a DH result into the chaining key; the nonce counter restarts.
    pub fn mix_shared_secret(&mut self, private: &[u8; 32], public: &[u8; 32]) {
        let shared = x25519_dalek::x25519(*private, *public);
        let (salt, key) = hkdf_split(Some(&self.salt), &shared, b"");
        self.salt = salt;
        self.key = key;
        self.counter = 0;
    }

    /// Splits the final write/read transport keys.
    pub fn finish(&self) -> ([u8; 32], [u8; 32]) {
        hkdf_split(Some(&self.salt), &[], b"")
    }
}

/// One direction of the tunnel: the current chain key plus its cipher.
struct Direction {
    key: [u8; 32],
    cipher: CounterCipher,
}

impl Direction {
    fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            cipher: CounterCipher::new(key),
        }
    }

    /// Ratchets this direction's chain key forward.
    fn rekey(&mut self) {
        let (next, _) = hkdf_split(Some(&self.key), &[], b"wa-noise-rekey");
        self.key = next;
        self.cipher.rekey(next);
    }
}

/// The authenticated, encrypted tunnel.
pub struct NoiseSocket {
    write: Mutex<Direction>,
    read: Mutex<Direction>,
}

impl NoiseSocket {
    fn new(write_key: [u8; 32], read_key: [u8; 32]) -> Self {
        Self {
            write: Mutex::new(Direction::new(write_key)),
            read: Mutex::new(Direction::new(read_key)),
        }
    }

    /// Encrypts a plaintext frame body. The frame layer adds the length
    /// prefix on the way out.
    pub fn encrypt_frame(&self, plaintext: &[u8]) -> Result<Vec<u8>, SocketError> {
        self.write
            .lock()
            .expect("cipher lock")
            .cipher
            .encrypt(plaintext, &[])
            .map_err(|_| SocketError::CipherFailure)
    }

    /// Decrypts one received frame payload. Fails closed: the counter never
    /// skips ahead past an undecryptable frame.
    pub fn decrypt_frame(&self, payload: &[u8]) -> Result<Vec<u8>, SocketError> {
        self.read
            .lock()
            .expect("cipher lock")
            .cipher
            .decrypt(payload, &[])
            .map_err(|_| SocketError::CipherFailure)
    }

    /// Rotates both directions' chain keys and restarts their counters.
    /// Both peers must rekey at the same point in the stream.
    pub fn rekey(&self) {
        self.write.lock().expect("cipher lock").rekey();
        self.read.lock().expect("cipher lock").rekey();
    }
}

/// Verifies the certificate chain presented in the server hello payload:
/// intermediate signed by the pinned root, leaf signed by the intermediate,
/// leaf key equal to the authenticated static key.
fn verify_server_cert(payload: &[u8], server_static: &[u8; 32]) -> Result<(), SocketError> {
    let chain = proto::CertChain::decode(payload)
        .map_err(|_| SocketError::HandshakeFailed("unparseable cert chain".into()))?;

    let intermediate = chain
        .intermediate
        .ok_or_else(|| SocketError::HandshakeFailed("missing intermediate cert".into()))?;
    let int_details_raw = intermediate
        .details
        .ok_or_else(|| SocketError::HandshakeFailed("missing intermediate details".into()))?;
    let int_sig: [u8; 64] = intermediate
        .signature
        .as_deref()
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| SocketError::HandshakeFailed("bad intermediate signature".into()))?;
    if !xeddsa::verify(&SERVER_CERT_ROOT, &int_details_raw, &int_sig) {
        return Err(SocketError::HandshakeFailed(
            "intermediate cert not signed by root".into(),
        ));
    }
    let int_details = proto::NoiseCertificateDetails::decode(&int_details_raw[..])
        .map_err(|_| SocketError::HandshakeFailed("bad intermediate details".into()))?;
    let int_key: [u8; 32] = int_details
        .key
        .as_deref()
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| SocketError::HandshakeFailed("missing intermediate key".into()))?;

    let leaf = chain
        .leaf
        .ok_or_else(|| SocketError::HandshakeFailed("missing leaf cert".into()))?;
    let leaf_details_raw = leaf
        .details
        .ok_or_else(|| SocketError::HandshakeFailed("missing leaf details".into()))?;
    let leaf_sig: [u8; 64] = leaf
        .signature
        .as_deref()
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| SocketError::HandshakeFailed("bad leaf signature".into()))?;
    if !xeddsa::verify(&int_key, &leaf_details_raw, &leaf_sig) {
        return Err(SocketError::HandshakeFailed(
            "leaf cert not signed by intermediate".into(),
        ));
    }
    let leaf_details = proto::NoiseCertificateDetails::decode(&leaf_details_raw[..])
        .map_err(|_| SocketError::HandshakeFailed("bad leaf details".into()))?;
    match leaf_details.key.as_deref() {
        Some(key) if key == server_static => Ok(()),
        _ => Err(SocketError::HandshakeFailed(
            "certificate does not attest the static key".into(),
        )),
    }
}

/// Runs the client side of the XX handshake over an open frame socket.
pub async fn do_handshake(
    device: &Device,
    config: &ClientConfig,
    frame_socket: &mut FrameSocket,
    frames_rx: &mut mpsc::Receiver<Vec<u8>>,
) -> Result<NoiseSocket, SocketError> {
    let ephemeral = KeyPair::generate();
    let mut noise = NoiseHandshake::new(&CONN_HEADER);

    // -> e
    noise.authenticate(&ephemeral.public);
    let hello = proto::HandshakeMessage {
        client_hello: Some(proto::ClientHello {
            ephemeral: Some(ephemeral.public.to_vec()),
        }),
        ..Default::default()
    };
    frame_socket.send_frame(&proto::encode_proto(&hello)).await?;

    // <- e, ee, s, es
    let response = timeout(HANDSHAKE_TIMEOUT, frames_rx.recv())
        .await
        .map_err(|_| SocketError::HandshakeFailed("timed out waiting for server hello".into()))?
        .ok_or(SocketError::Closed)?;
    let server_hello = proto::HandshakeMessage::decode(&response[..])
        .map_err(|e| SocketError::HandshakeFailed(format!("bad server hello: {e}")))?
        .server_hello
        .ok_or_else(|| SocketError::HandshakeFailed("missing server hello".into()))?;

    let server_ephemeral: [u8; 32] = server_hello
        .ephemeral
        .as_deref()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SocketError::HandshakeFailed("bad server ephemeral".into()))?;
    let static_ciphertext = server_hello
        .r#static
        .ok_or_else(|| SocketError::HandshakeFailed("missing server static".into()))?;
    let cert_ciphertext = server_hello
        .payload
        .ok_or_else(|| SocketError::HandshakeFailed("missing server payload".into()))?;

    noise.authenticate(&server_ephemeral);
    noise.mix_shared_secret(&ephemeral.private, &server_ephemeral);

    let server_static: [u8; 32] = noise
        .decrypt(&static_ciphertext)?
        .as_slice()
        .try_into()
        .map_err(|_| SocketError::HandshakeFailed("bad server static length".into()))?;
    noise.mix_shared_secret(&ephemeral.private, &server_static);

    let cert_payload = noise.decrypt(&cert_ciphertext)?;
    verify_server_cert(&cert_payload, &server_static)?;

    // -> s, se
    let static_encrypted = noise.encrypt(&device.noise_key.public)?;
    noise.mix_shared_secret(&device.noise_key.private, &server_ephemeral);

    let client_payload = match &device.id {
        Some(jid) => proto::login_payload(
            jid.user.parse().unwrap_or(0),
            jid.device,
            &config.platform,
            config.version,
        ),
        None => proto::registration_payload(
            device.registration_id,
            &device.identity_key.public_serialized(),
            device.signed_pre_key.key_id,
            &device.signed_pre_key.key_pair.public_serialized(),
            &device.signed_pre_key.signature,
            &config.platform,
            config.version,
        ),
    };
    let payload_encrypted = noise.encrypt(&proto::encode_proto(&client_payload))?;

    let finish = proto::HandshakeMessage {
        client_finish: Some(proto::ClientFinish {
            r#static: Some(static_encrypted),
            payload: Some(payload_encrypted),
        }),
        ..Default::default()
    };
    frame_socket.send_frame(&proto::encode_proto(&finish)).await?;

    let (write_key, read_key) = noise.finish();
    Ok(NoiseSocket::new(write_key, read_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives both sides of the pattern in-process to check that the state
    /// machines converge on the same transport keys.
    #[test]
    fn handshake_state_machines_converge() {
        let client_static = KeyPair::generate();
        let server_static = KeyPair::generate();
        let client_eph = KeyPair::generate();
        let server_eph = KeyPair::generate();

        let mut client = NoiseHandshake::new(&CONN_HEADER);
        let mut server = NoiseHandshake::new(&CONN_HEADER);

        // -> e
        client.authenticate(&client_eph.public);
        server.authenticate(&client_eph.public);

        // <- e, ee, s, es
        client.authenticate(&server_eph.public);
        server.authenticate(&server_eph.public);
        client.mix_shared_secret(&client_eph.private, &server_eph.public);
        server.mix_shared_secret(&server_eph.private, &client_eph.public);

        let static_ct = server.encrypt(&server_static.public).unwrap();
        let static_pt = client.decrypt(&static_ct).unwrap();
        assert_eq!(static_pt, server_static.public);

        client.mix_shared_secret(&client_eph.private, &server_static.public);
        server.mix_shared_secret(&server_static.private, &client_eph.public);

        let cert_ct = server.encrypt(b"certificate payload").unwrap();
        assert_eq!(client.decrypt(&cert_ct).unwrap(), b"certificate payload");

        // -> s, se
        let cstatic_ct = client.encrypt(&client_static.public).unwrap();
        assert_eq!(server.decrypt(&cstatic_ct).unwrap(), client_static.public);
        client.mix_shared_secret(&client_static.private, &server_eph.public);
        server.mix_shared_secret(&server_eph.private, &client_static.public);

        let payload_ct = client.encrypt(b"client payload").unwrap();
        assert_eq!(server.decrypt(&payload_ct).unwrap(), b"client payload");

        let (c_write, c_read) = client.finish();
        let (s_write, s_read) = server.finish();
        assert_eq!(c_write, s_write);
        assert_eq!(c_read, s_read);
    }

    #[test]
    fn transport_frames_flow_both_ways() {
        let socket_a = NoiseSocket::new([1; 32], [2; 32]);
        let socket_b = NoiseSocket::new([2; 32], [1; 32]);

        let frame = socket_a.encrypt_frame(b"stanza bytes").unwrap();
        assert_eq!(socket_b.decrypt_frame(&frame).unwrap(), b"stanza bytes");

        let reply = socket_b.encrypt_frame(b"reply").unwrap();
        assert_eq!(socket_a.decrypt_frame(&reply).unwrap(), b"reply");
    }

    #[test]
    fn rekey_stays_in_sync() {
        let socket_a = NoiseSocket::new([1; 32], [2; 32]);
        let socket_b = NoiseSocket::new([2; 32], [1; 32]);
        socket_a.rekey();
        socket_b.rekey();
        let frame = socket_a.encrypt_frame(b"post rekey").unwrap();
        assert_eq!(socket_b.decrypt_frame(&frame).unwrap(), b"post rekey");
    }

    #[test]
    fn tampered_frame_fails_closed() {
        let socket_a = NoiseSocket::new([1; 32], [2; 32]);
        let socket_b = NoiseSocket::new([2; 32], [1; 32]);
        let mut frame = socket_a.encrypt_frame(b"data").unwrap();
        let len = frame.len();
        frame[len - 1] ^= 0xFF;
        assert!(socket_b.decrypt_frame(&frame).is_err());
    }
}
