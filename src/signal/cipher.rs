//! The pairwise session cipher: X3DH session setup and double-ratchet
//! message encryption/decryption against the store contracts.
//!
//! All state mutation is copy-on-success: a session is loaded, worked on,
//! and persisted only after the operation fully succeeds, so a failed MAC
//! or an untrusted identity never corrupts stored state. Callers serialize
//! per-address access (the pipeline holds a per-address lock).

use crate::config::TrustPolicy;
use crate::crypto::{cbc_decrypt, cbc_encrypt, KeyPair, SignedPreKey};
use crate::error::SignalError;
use crate::signal::address::ProtocolAddress;
use crate::signal::protocol::{CiphertextMessage, PreKeySignalMessage, SignalMessage};
use crate::signal::ratchet::derive_initial_keys;
use crate::signal::session::SessionState;
use crate::store::{IdentityStore, PreKeyStore, SessionStore};

/// A prekey bundle fetched from the server for one device.
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub pre_key_id: Option<u32>,
    pub pre_key: Option<[u8; 32]>,
}

pub struct SessionCipher<'a> {
    sessions: &'a dyn SessionStore,
    identities: &'a dyn IdentityStore,
    pre_keys: &'a dyn PreKeyStore,
    local_identity: KeyPair,
    local_registration_id: u32,
    local_signed_pre_key: SignedPreKey,
    policy: TrustPolicy,
    max_skipped: usize,
}

impl<'a> SessionCipher<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: &'a dyn SessionStore,
        identities: &'a dyn IdentityStore,
        pre_keys: &'a dyn PreKeyStore,
        local_identity: KeyPair,
        local_registration_id: u32,
        local_signed_pre_key: SignedPreKey,
        policy: TrustPolicy,
        max_skipped: usize,
    ) -> Self {
        Self {
            sessions,
            identities,
            pre_keys,
            local_identity,
            local_registration_id,
            local_signed_pre_key,
            policy,
            max_skipped,
        }
    }

    pub fn has_session(&self, address: &ProtocolAddress) -> Result<bool, SignalError> {
        Ok(self.sessions.has_session(&address.to_string())?)
    }

    fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionState>, SignalError> {
        match self.sessions.get_session(&address.to_string())? {
            Some(blob) => Ok(Some(SessionState::deserialize(&blob)?)),
            None => Ok(None),
        }
    }

    fn store_session(
        &self,
        address: &ProtocolAddress,
        session: &SessionState,
    ) -> Result<(), SignalError> {
        Ok(self
            .sessions
            .put_session(&address.to_string(), &session.serialize()?)?)
    }

    fn check_trusted(
        &self,
        address: &ProtocolAddress,
        their_identity: &[u8; 32],
    ) -> Result<(), SignalError> {
        let key = address.to_string();
        match self.identities.get_identity(&key)? {
            Some(pinned) if &pinned != their_identity => match self.policy {
                TrustPolicy::Strict => Err(SignalError::UntrustedIdentity(key)),
                TrustPolicy::TrustOnFirstUse => {
                    log::warn!(target: "Signal", "replacing changed identity for {key}");
                    self.identities.put_identity(&key, *their_identity)?;
                    Ok(())
                }
            },
            Some(_) => Ok(()),
            None => {
                self.identities.put_identity(&key, *their_identity)?;
                Ok(())
            }
        }
    }

    /// Establishes an outgoing session from a fetched prekey bundle. A
    /// no-op if a live session already exists.
    pub fn init_outgoing_session(
        &self,
        address: &ProtocolAddress,
        bundle: &PreKeyBundle,
    ) -> Result<(), SignalError> {
        if self.has_session(address)? {
            return Ok(());
        }
        if !SignedPreKey::verify(
            &bundle.identity_key,
            &bundle.signed_pre_key,
            &bundle.signed_pre_key_signature,
        ) {
            return Err(SignalError::InvalidSignature);
        }
        self.check_trusted(address, &bundle.identity_key)?;

        let base_key = KeyPair::generate();

        // X3DH: DH1 = DH(IK_a, SPK_b), DH2 = DH(EK_a, IK_b),
        // DH3 = DH(EK_a, SPK_b), DH4 = DH(EK_a, OPK_b).
        let mut secrets = Vec::with_capacity(32 * 5);
        secrets.extend_from_slice(&[0xFFu8; 32]);
        secrets.extend_from_slice(&self.local_identity.dh(&bundle.signed_pre_key));
        secrets.extend_from_slice(&base_key.dh(&bundle.identity_key));
        secrets.extend_from_slice(&base_key.dh(&bundle.signed_pre_key));
        if let Some(opk) = &bundle.pre_key {
            secrets.extend_from_slice(&base_key.dh(opk));
        }

        let (root_key, chain_key) = derive_initial_keys(&secrets);

        let sending_ratchet = KeyPair::generate();
        let (sending_root, sending_chain) =
            root_key.create_chain(&bundle.signed_pre_key, &sending_ratchet);

        let mut session = SessionState::new(
            self.local_identity.public,
            bundle.identity_key,
            sending_root,
        );
        session.add_receiver_chain(bundle.signed_pre_key, chain_key);
        session.set_sender_chain(sending_ratchet, sending_chain);
        session.alice_base_key = Some(base_key.public);
        session.pending_pre_key = Some(crate::signal::session::PendingPreKey {
            pre_key_id: bundle.pre_key_id,
            signed_pre_key_id: bundle.signed_pre_key_id,
            base_key: base_key.public,
        });

        self.store_session(address, &session)
    }

    /// Encrypts one plaintext, advancing the sending chain atomically.
    pub fn encrypt(
        &self,
        address: &ProtocolAddress,
        plaintext: &[u8],
    ) -> Result<CiphertextMessage, SignalError> {
        let mut session = self
            .load_session(address)?
            .ok_or_else(|| SignalError::NoSession(address.to_string()))?;

        let chain = session
            .sender_chain
            .as_mut()
            .ok_or(SignalError::InvalidMessage("session has no sending chain"))?;

        let keys = chain.chain_key.message_keys();
        let ciphertext = cbc_encrypt(&keys.cipher_key, &keys.iv, plaintext);

        let message = SignalMessage::new(
            &keys.mac_key,
            &session.local_identity,
            &session.remote_identity,
            chain.ratchet_key.public,
            keys.counter,
            session.previous_counter,
            ciphertext,
        );
        chain.chain_key = chain.chain_key.next();

        let result = match &session.pending_pre_key {
            Some(pending) => CiphertextMessage::PreKey(PreKeySignalMessage::new(
                self.local_registration_id,
                pending.pre_key_id,
                pending.signed_pre_key_id,
                pending.base_key,
                self.local_identity.public,
                message,
            )),
            None => CiphertextMessage::Whisper(message),
        };

        self.store_session(address, &session)?;
        Ok(result)
    }

    /// Decrypts a normal ratchet message.
    pub fn decrypt_message(
        &self,
        address: &ProtocolAddress,
        data: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        let message = SignalMessage::deserialize(data)?;
        let mut session = self
            .load_session(address)?
            .ok_or_else(|| SignalError::NoSession(address.to_string()))?;

        let plaintext = self.decrypt_with_state(&mut session, &message)?;
        // Receiving a whisper message acknowledges our session init.
        session.pending_pre_key = None;
        self.store_session(address, &session)?;
        Ok(plaintext)
    }

    /// Decrypts a session-establishing message, creating the session if the
    /// embedded X3DH parameters are new.
    pub fn decrypt_prekey_message(
        &self,
        address: &ProtocolAddress,
        data: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        let message = PreKeySignalMessage::deserialize(data)?;
        self.check_trusted(address, &message.identity_key)?;

        let existing = self.load_session(address)?;
        let (mut session, consumed_pre_key) = match existing {
            Some(s) if s.alice_base_key == Some(message.base_key) => (s, None),
            _ => self.init_incoming_session(&message)?,
        };

        let plaintext = self.decrypt_with_state(&mut session, &message.message)?;
        self.store_session(address, &session)?;

        // The one-time prekey is burned only once the message it bootstraps
        // actually decrypts.
        if let Some(id) = consumed_pre_key {
            self.pre_keys.consume_pre_key(id)?;
        }
        Ok(plaintext)
    }

    fn init_incoming_session(
        &self,
        message: &PreKeySignalMessage,
    ) -> Result<(SessionState, Option<u32>), SignalError> {
        if message.signed_pre_key_id != self.local_signed_pre_key.key_id {
            return Err(SignalError::InvalidMessage("unknown signed prekey id"));
        }

        let one_time = match message.pre_key_id {
            Some(id) => Some(
                self.pre_keys
                    .get_pre_key(id)?
                    .filter(|r| !r.consumed)
                    .ok_or(SignalError::InvalidPreKeyId(id))?,
            ),
            None => None,
        };

        let spk = &self.local_signed_pre_key.key_pair;

        let mut secrets = Vec::with_capacity(32 * 5);
        secrets.extend_from_slice(&[0xFFu8; 32]);
        secrets.extend_from_slice(&spk.dh(&message.identity_key));
        secrets.extend_from_slice(&self.local_identity.dh(&message.base_key));
        secrets.extend_from_slice(&spk.dh(&message.base_key));
        if let Some(opk) = &one_time {
            secrets.extend_from_slice(&opk.key_pair.dh(&message.base_key));
        }

        let (root_key, chain_key) = derive_initial_keys(&secrets);

        let mut session = SessionState::new(
            self.local_identity.public,
            message.identity_key,
            root_key,
        );
        session.set_sender_chain(spk.clone(), chain_key);
        session.alice_base_key = Some(message.base_key);

        Ok((session, one_time.map(|r| r.key_id)))
    }

    fn decrypt_with_state(
        &self,
        session: &mut SessionState,
        message: &SignalMessage,
    ) -> Result<Vec<u8>, SignalError> {
        // Out-of-order messages resolve from the skipped-key cache first.
        if let Some(keys) = session.take_skipped_key(&message.ratchet_key, message.counter) {
            return self.open_message(session, message, &keys);
        }

        if !session.has_receiver_chain(&message.ratchet_key) {
            // Remote ratchet stepped: derive the new receiving chain and
            // rotate our own sending ratchet.
            let sender_chain = session
                .sender_chain
                .clone()
                .ok_or(SignalError::InvalidMessage("session has no sending chain"))?;
            let (receiver_root, receiver_chain) = session
                .root_key
                .create_chain(&message.ratchet_key, &sender_chain.ratchet_key);

            let new_ratchet = KeyPair::generate();
            let (sending_root, sending_chain) =
                receiver_root.create_chain(&message.ratchet_key, &new_ratchet);

            session.root_key = sending_root;
            session.previous_counter = sender_chain.chain_key.index.saturating_sub(1);
            session.add_receiver_chain(message.ratchet_key, receiver_chain);
            session.set_sender_chain(new_ratchet, sending_chain);
        }

        let max_skipped = self.max_skipped;
        let chain = session
            .receiver_chain_mut(&message.ratchet_key)
            .expect("receiver chain was just ensured");

        if message.counter < chain.chain_key.index {
            // Skipped-key lookup above already failed, so this was seen.
            return Err(SignalError::DuplicateMessage(
                chain.chain_key.index,
                message.counter,
            ));
        }
        if message.counter - chain.chain_key.index > max_skipped as u32 {
            return Err(SignalError::TooFarInFuture(message.counter));
        }

        // Walk the chain up to the message counter, caching what we skip.
        let mut chain_key = chain.chain_key.clone();
        let mut skipped = Vec::new();
        while chain_key.index < message.counter {
            skipped.push(chain_key.message_keys());
            chain_key = chain_key.next();
        }
        let keys = chain_key.message_keys();
        let advanced = chain_key.next();

        let plaintext = self.open_message(session, message, &keys)?;

        // Commit chain movement only after authentication succeeded.
        for sk in skipped {
            session.push_skipped_key(message.ratchet_key, sk, max_skipped);
        }
        let chain = session
            .receiver_chain_mut(&message.ratchet_key)
            .expect("receiver chain still present");
        chain.chain_key = advanced;
        Ok(plaintext)
    }

    fn open_message(
        &self,
        session: &SessionState,
        message: &SignalMessage,
        keys: &crate::signal::ratchet::MessageKeys,
    ) -> Result<Vec<u8>, SignalError> {
        if !message.verify_mac(
            &keys.mac_key,
            &session.remote_identity,
            &session.local_identity,
        ) {
            return Err(SignalError::InvalidMessage("MAC verification failed"));
        }
        cbc_decrypt(&keys.cipher_key, &keys.iv, &message.ciphertext)
            .map_err(|_| SignalError::InvalidMessage("CBC padding failure"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PreKey;
    use crate::signal::protocol::CiphertextMessage;
    use crate::store::{MemoryStore, PreKeyRecord};

    struct Party {
        store: MemoryStore,
        identity: KeyPair,
        signed_pre_key: SignedPreKey,
        registration_id: u32,
    }

    impl Party {
        fn new(registration_id: u32) -> Self {
            let identity = KeyPair::generate();
            let signed_pre_key = SignedPreKey::new(1, &identity);
            Self {
                store: MemoryStore::new(),
                identity,
                signed_pre_key,
                registration_id,
            }
        }

        fn cipher(&self) -> SessionCipher<'_> {
            SessionCipher::new(
                &self.store,
                &self.store,
                &self.store,
                self.identity.clone(),
                self.registration_id,
                self.signed_pre_key.clone(),
                TrustPolicy::TrustOnFirstUse,
                2000,
            )
        }

        fn cipher_with_policy(&self, policy: TrustPolicy) -> SessionCipher<'_> {
            SessionCipher::new(
                &self.store,
                &self.store,
                &self.store,
                self.identity.clone(),
                self.registration_id,
                self.signed_pre_key.clone(),
                policy,
                2000,
            )
        }

        /// Publishes a bundle with one one-time prekey, mirroring the
        /// server-side `get_prekeys` response.
        fn bundle(&self, pre_key_id: u32) -> PreKeyBundle {
            let pre_key = PreKey::new(pre_key_id);
            self.store
                .put_pre_keys(&[PreKeyRecord::from(&pre_key)])
                .unwrap();
            PreKeyBundle {
                registration_id: self.registration_id,
                identity_key: self.identity.public,
                signed_pre_key_id: self.signed_pre_key.key_id,
                signed_pre_key: self.signed_pre_key.key_pair.public,
                signed_pre_key_signature: self.signed_pre_key.signature,
                pre_key_id: Some(pre_key_id),
                pre_key: Some(pre_key.key_pair.public),
            }
        }
    }

    fn addr(name: &str) -> ProtocolAddress {
        ProtocolAddress::new(name, 0)
    }

    fn establish(alice: &Party, bob: &Party) {
        let bundle = bob.bundle(100);
        alice.cipher().init_outgoing_session(&addr("bob"), &bundle).unwrap();
        let msg = alice.cipher().encrypt(&addr("bob"), b"bootstrap").unwrap();
        let CiphertextMessage::PreKey(pkmsg) = &msg else {
            panic!("first message must be a pkmsg");
        };
        let pt = bob
            .cipher()
            .decrypt_prekey_message(&addr("alice"), &pkmsg.serialized)
            .unwrap();
        assert_eq!(pt, b"bootstrap");
    }

    #[test]
    fn session_bootstrap_and_two_way_traffic() {
        let alice = Party::new(1111);
        let bob = Party::new(2222);
        establish(&alice, &bob);

        // Bob answers, which completes the DH ratchet on both sides.
        let reply = bob.cipher().encrypt(&addr("alice"), b"hello alice").unwrap();
        assert_eq!(reply.enc_type(), "msg");
        let pt = alice
            .cipher()
            .decrypt_message(&addr("bob"), reply.serialized())
            .unwrap();
        assert_eq!(pt, b"hello alice");

        // A longer alternating conversation survives ratchet rotations.
        for i in 0..10u8 {
            let (from, to, from_name, to_name) = if i % 2 == 0 {
                (&alice, &bob, "alice", "bob")
            } else {
                (&bob, &alice, "bob", "alice")
            };
            let body = vec![i; 17];
            let msg = from.cipher().encrypt(&addr(to_name), &body).unwrap();
            let pt = match msg {
                CiphertextMessage::PreKey(ref m) => to
                    .cipher()
                    .decrypt_prekey_message(&addr(from_name), &m.serialized)
                    .unwrap(),
                CiphertextMessage::Whisper(ref m) => to
                    .cipher()
                    .decrypt_message(&addr(from_name), &m.serialized)
                    .unwrap(),
            };
            assert_eq!(pt, body);
        }
    }

    #[test]
    fn out_of_order_delivery_within_bound() {
        let alice = Party::new(1);
        let bob = Party::new(2);
        establish(&alice, &bob);

        let msgs: Vec<_> = (0..5u8)
            .map(|i| {
                let m = alice.cipher().encrypt(&addr("bob"), &[i; 8]).unwrap();
                m.serialized().to_vec()
            })
            .collect();

        // Deliver in reverse order; all must decrypt via the skipped-key
        // cache (the first few establish the session as pkmsgs).
        for (i, data) in msgs.iter().enumerate().rev() {
            let pt = bob
                .cipher()
                .decrypt_prekey_message(&addr("alice"), data)
                .unwrap();
            assert_eq!(pt, vec![i as u8; 8]);
        }
    }

    #[test]
    fn duplicate_message_is_rejected() {
        let alice = Party::new(1);
        let bob = Party::new(2);
        establish(&alice, &bob);

        let msg = alice.cipher().encrypt(&addr("bob"), b"once").unwrap();
        let data = msg.serialized().to_vec();
        bob.cipher()
            .decrypt_prekey_message(&addr("alice"), &data)
            .unwrap();
        let err = bob
            .cipher()
            .decrypt_prekey_message(&addr("alice"), &data)
            .unwrap_err();
        assert!(matches!(err, SignalError::DuplicateMessage(_, _)));
    }

    #[test]
    fn missing_session_is_reported() {
        let bob = Party::new(2);
        let stray = SignalMessage::new(&[1; 32], &[2; 32], &[3; 32], [4; 32], 0, 0, vec![9; 16]);
        let err = bob
            .cipher()
            .decrypt_message(&addr("stranger"), &stray.serialized)
            .unwrap_err();
        assert!(matches!(err, SignalError::NoSession(_)));
    }

    #[test]
    fn strict_policy_rejects_identity_change_without_mutation() {
        let alice = Party::new(1);
        let bob = Party::new(2);
        establish(&alice, &bob);

        // A "new phone" for alice: same address, fresh identity.
        let alice2 = Party::new(3);
        let bundle = bob.bundle(101);
        alice2
            .cipher()
            .init_outgoing_session(&addr("bob"), &bundle)
            .unwrap();
        let msg = alice2.cipher().encrypt(&addr("bob"), b"new identity").unwrap();

        let session_before = bob.store.get_session(&addr("alice").to_string()).unwrap();
        let err = bob
            .cipher_with_policy(TrustPolicy::Strict)
            .decrypt_prekey_message(&addr("alice"), msg.serialized())
            .unwrap_err();
        assert!(matches!(err, SignalError::UntrustedIdentity(_)));
        let session_after = bob.store.get_session(&addr("alice").to_string()).unwrap();
        assert_eq!(session_before, session_after, "session must not change");

        // TrustOnFirstUse accepts the new identity instead.
        let pt = bob
            .cipher_with_policy(TrustPolicy::TrustOnFirstUse)
            .decrypt_prekey_message(&addr("alice"), msg.serialized())
            .unwrap();
        assert_eq!(pt, b"new identity");
    }

    #[test]
    fn bad_signed_prekey_signature_rejected() {
        let alice = Party::new(1);
        let bob = Party::new(2);
        let mut bundle = bob.bundle(100);
        bundle.signed_pre_key_signature[10] ^= 0xFF;
        let err = alice
            .cipher()
            .init_outgoing_session(&addr("bob"), &bundle)
            .unwrap_err();
        assert!(matches!(err, SignalError::InvalidSignature));
    }

    #[test]
    fn one_time_prekey_consumed_exactly_once() {
        let alice = Party::new(1);
        let bob = Party::new(2);
        establish(&alice, &bob);

        // The bootstrap consumed bob's prekey 100.
        let record = bob.store.get_pre_key(100).unwrap().unwrap();
        assert!(record.consumed);
        assert!(bob.store.consume_pre_key(100).unwrap().is_none());
    }
}
