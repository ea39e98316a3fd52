//! The message pipeline.
//!
//! Outbound: resolve the recipient device set, bootstrap missing sessions
//! from prekey bundles, pad and encrypt per device (plus a sender-key copy
//! for groups), assemble the stanza and wait for the server ack.
//!
//! Inbound: decrypt each `enc` child with the matching session type,
//! sending retry receipts on failure, then unpad, dedupe and surface the
//! payload as an event. Work is serialized per chat and per session so
//! ratchets never advance concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use prost::Message as ProstMessage;
use rand::Rng;
use tokio::sync::Mutex;

use crate::binary::{Node, NodeContent};
use crate::client::{CachedDeviceList, Client};
use crate::error::{ClientError, IqError, SignalError};
use crate::proto;
use crate::request::{InfoQuery, InfoQueryType};
use crate::signal::{
    CiphertextMessage, GroupCipher, PreKeyBundle, ProtocolAddress, SenderKeyDistributionMessage,
    SenderKeyName, SessionCipher,
};
use crate::store::PreKeyRecord;
use crate::types::events::{self, Event};
use crate::types::{
    MessageID, MessageInfo, MessageSource, UndecryptableKind, JID,
};

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct SendResponse {
    pub id: MessageID,
    pub timestamp: DateTime<Utc>,
}

/// Tail padding: 1..=15 bytes, each holding the pad length.
pub(crate) fn pad_message(mut plaintext: Vec<u8>) -> Vec<u8> {
    let pad = rand::thread_rng().gen_range(1..=15u8);
    plaintext.extend(std::iter::repeat(pad).take(usize::from(pad)));
    plaintext
}

pub(crate) fn unpad_message(data: &[u8]) -> Result<&[u8], SignalError> {
    let pad = *data
        .last()
        .ok_or(SignalError::InvalidMessage("empty plaintext"))?;
    if pad == 0 || pad > 15 || usize::from(pad) > data.len() {
        return Err(SignalError::InvalidMessage("bad padding byte"));
    }
    Ok(&data[..data.len() - usize::from(pad)])
}

/// Message ids look like the web client's: a fixed prefix plus random hex.
pub(crate) fn generate_message_id() -> MessageID {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    format!("3EB0{}", hex::encode_upper(bytes))
}

impl Client {
    /// Sends an application payload (opaque protobuf bytes) to a user or
    /// group, returning once the server acks the stanza.
    pub async fn send_message(&self, to: JID, payload: &[u8]) -> Result<SendResponse, ClientError> {
        self.send_message_impl(to, payload, generate_message_id())
            .await
    }

    pub(crate) async fn send_message_impl(
        &self,
        to: JID,
        payload: &[u8],
        id: MessageID,
    ) -> Result<SendResponse, ClientError> {
        if !self.is_logged_in() {
            return Err(ClientError::NotLoggedIn);
        }
        let own_jid = self.own_jid().await.ok_or(ClientError::NotLoggedIn)?;

        // 1. Resolve the recipient device set.
        let is_group = to.is_group();
        let users = if is_group {
            self.group_participants(&to).await?
        } else {
            let mut users = vec![to.to_non_ad()];
            if to.user != own_jid.user {
                users.push(own_jid.to_non_ad());
            }
            users
        };
        let mut devices = self.get_user_devices(&users).await?;
        devices.retain(|d| !(d.user == own_jid.user && d.device == own_jid.device));

        // 2. Bootstrap sessions for devices we have none with.
        let devices = self.ensure_sessions(devices).await?;
        if devices.is_empty() {
            return Err(ClientError::PrekeysFetchFailed(users));
        }

        // 3. Serialize once, pad to blunt length analysis.
        let envelope = proto::Envelope {
            payload: Some(payload.to_vec()),
            sender_key_distribution_message: None,
        };
        let padded = pad_message(proto::encode_proto(&envelope));

        // 4. Encrypt per device; groups get one sender-key copy plus
        // pairwise distribution messages for newcomers.
        let mut children = Vec::new();
        let any_pkmsg;
        if is_group {
            let sender_address = self.own_group_sender_address().await;
            let name = SenderKeyName::new(to.to_string(), sender_address);
            let (skmsg, skdm) = {
                let group = GroupCipher::new(
                    self.store.as_ref(),
                    name,
                    self.config.max_skipped_message_keys,
                );
                let skdm = group.create_distribution_message()?;
                (group.encrypt(&padded)?, skdm)
            };

            let needs_skdm = self.devices_needing_distribution(&to, &devices);
            let skdm_envelope = proto::Envelope {
                payload: None,
                sender_key_distribution_message: Some(skdm.serialized.clone()),
            };
            let skdm_padded = pad_message(proto::encode_proto(&skdm_envelope));
            let (to_nodes, pkmsg) = self.encrypt_for_devices(&needs_skdm, &skdm_padded).await?;
            any_pkmsg = pkmsg;
            if !to_nodes.is_empty() {
                children.push(Node::new("participants").children(to_nodes));
            }
            children.push(
                Node::new("enc")
                    .attr("v", "2")
                    .attr("type", "skmsg")
                    .bytes(skmsg),
            );
            self.mark_distribution_shared(&to, &needs_skdm);
        } else {
            let (to_nodes, pkmsg) = self.encrypt_for_devices(&devices, &padded).await?;
            any_pkmsg = pkmsg;
            if to_nodes.is_empty() {
                return Err(ClientError::PrekeysFetchFailed(users));
            }
            children.push(Node::new("participants").children(to_nodes));
        }

        // Recipients need our signed identity to validate fresh sessions.
        if any_pkmsg {
            if let Some(account) = self.device.read().await.account.clone() {
                children.push(Node::new("device-identity").bytes(proto::encode_proto(&account)));
            }
        }

        // 5. Assemble and send, then wait for the server ack.
        let timestamp = Utc::now();
        let stanza = Node::new("message")
            .attr("id", id.clone())
            .attr("to", to.clone())
            .attr("type", "text")
            .attr("t", timestamp.timestamp() as u64)
            .children(children);

        self.recent_sent
            .lock()
            .expect("recent lock")
            .insert(to.clone(), id.clone(), payload.to_vec());

        let rx = self.register_waiter(&id);
        if let Err(e) = self.send_node(stanza).await {
            self.cancel_waiter(&id);
            return Err(e);
        }
        let ack = self
            .wait_response(&id, rx, self.config.iq_timeout)
            .await
            .map_err(ClientError::Iq)?;
        if let Some(error) = ack.child_by_tag("error") {
            return Err(ClientError::ServerErrorNode(error.to_string()));
        }

        let timestamp = ack
            .attr_u64("t")
            .and_then(|t| DateTime::from_timestamp(t as i64, 0))
            .unwrap_or(timestamp);
        Ok(SendResponse { id, timestamp })
    }

    /// Signal-encrypts one plaintext for every device, serializing on the
    /// per-address lock. Returns the `<to>` nodes and whether any ciphertext
    /// is a session-establishing pkmsg.
    async fn encrypt_for_devices(
        &self,
        devices: &[JID],
        padded: &[u8],
    ) -> Result<(Vec<Node>, bool), ClientError> {
        let device_snapshot = self.device.read().await.clone();
        let mut nodes = Vec::with_capacity(devices.len());
        let mut any_pkmsg = false;

        for jid in devices {
            let address = ProtocolAddress::from(jid);
            let _guard = self.session_lock(&address).await;

            let cipher = SessionCipher::new(
                self.store.as_ref(),
                self.store.as_ref(),
                self.store.as_ref(),
                device_snapshot.identity_key.clone(),
                device_snapshot.registration_id,
                device_snapshot.signed_pre_key.clone(),
                self.config.trust_policy,
                self.config.max_skipped_message_keys,
            );
            let message = match cipher.encrypt(&address, padded) {
                Ok(m) => m,
                Err(SignalError::NoSession(_)) => {
                    debug!(target: "Client/Send", "skipping {jid}: still no session");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            any_pkmsg |= matches!(message, CiphertextMessage::PreKey(_));

            nodes.push(Node::new("to").attr("jid", jid.clone()).children(vec![
                Node::new("enc")
                    .attr("v", "2")
                    .attr("type", message.enc_type())
                    .bytes(message.serialized().to_vec()),
            ]));
        }
        Ok((nodes, any_pkmsg))
    }

    /// Fetches prekey bundles for devices without sessions and initializes
    /// sessions. Devices the server has no bundle for are dropped from the
    /// recipient set.
    async fn ensure_sessions(&self, devices: Vec<JID>) -> Result<Vec<JID>, ClientError> {
        let mut missing = Vec::new();
        for jid in &devices {
            let address = ProtocolAddress::from(jid);
            if !self.store.has_session(&address.to_string())? {
                missing.push(jid.clone());
            }
        }
        if missing.is_empty() {
            return Ok(devices);
        }

        let bundles = self.fetch_pre_keys(&missing).await?;
        let device_snapshot = self.device.read().await.clone();
        let mut dropped: HashSet<JID> = HashSet::new();

        for jid in &missing {
            let Some(bundle) = bundles.get(jid) else {
                warn!(target: "Client/Send", "no prekey bundle for {jid}, dropping from send");
                dropped.insert(jid.clone());
                continue;
            };
            let address = ProtocolAddress::from(jid);
            let _guard = self.session_lock(&address).await;
            let cipher = SessionCipher::new(
                self.store.as_ref(),
                self.store.as_ref(),
                self.store.as_ref(),
                device_snapshot.identity_key.clone(),
                device_snapshot.registration_id,
                device_snapshot.signed_pre_key.clone(),
                self.config.trust_policy,
                self.config.max_skipped_message_keys,
            );
            if let Err(e) = cipher.init_outgoing_session(&address, bundle) {
                warn!(target: "Client/Send", "session init failed for {jid}: {e}");
                dropped.insert(jid.clone());
            }
        }

        Ok(devices.into_iter().filter(|d| !dropped.contains(d)).collect())
    }

    /// Requests prekey bundles for a batch of devices.
    pub(crate) async fn fetch_pre_keys(
        &self,
        devices: &[JID],
    ) -> Result<HashMap<JID, PreKeyBundle>, ClientError> {
        let users: Vec<Node> = devices
            .iter()
            .map(|jid| Node::new("user").attr("jid", jid.clone()))
            .collect();
        let key_node = Node::new("key").children(users);

        let response = self
            .send_iq(InfoQuery {
                namespace: "encrypt",
                query_type: InfoQueryType::Get,
                to: crate::types::SERVER_JID.clone(),
                target: None,
                id: None,
                content: NodeContent::Children(vec![key_node]),
                timeout: None,
            })
            .await
            .map_err(|e| match e {
                IqError::ServerError { code: 404, .. } => {
                    ClientError::PrekeysFetchFailed(devices.to_vec())
                }
                other => ClientError::Iq(other),
            })?;

        let mut bundles = HashMap::new();
        let Some(list) = response.child_by_tag("list") else {
            return Ok(bundles);
        };
        for user in list.children_by_tag("user") {
            let Some(jid) = user.attr_jid("jid") else {
                continue;
            };
            match parse_pre_key_bundle(user) {
                Some(bundle) => {
                    bundles.insert(jid, bundle);
                }
                None => warn!(target: "Client/Send", "malformed prekey bundle for {jid}"),
            }
        }
        Ok(bundles)
    }

    /// Enumerates all devices of the given users via a usync query, with a
    /// TTL cache per user.
    pub(crate) async fn get_user_devices(&self, users: &[JID]) -> Result<Vec<JID>, ClientError> {
        let mut result = Vec::new();
        let mut uncached = Vec::new();
        for user in users {
            let user = user.to_non_ad();
            match self.device_cache.get(&user) {
                Some(entry) if entry.fetched_at.elapsed() < self.config.device_cache_ttl => {
                    result.extend(entry.devices.iter().cloned());
                }
                _ => uncached.push(user),
            }
        }
        if uncached.is_empty() {
            return Ok(result);
        }

        let user_nodes: Vec<Node> = uncached
            .iter()
            .map(|jid| Node::new("user").attr("jid", jid.clone()))
            .collect();
        let usync = Node::new("usync")
            .attr("context", "message")
            .attr("index", "0")
            .attr("last", "true")
            .attr("mode", "query")
            .attr("sid", self.generate_request_id())
            .children(vec![
                Node::new("query").children(vec![Node::new("devices").attr("version", "2")]),
                Node::new("list").children(user_nodes),
            ]);

        let response = self
            .send_iq(InfoQuery {
                namespace: "usync",
                query_type: InfoQueryType::Get,
                to: crate::types::SERVER_JID.clone(),
                target: None,
                id: None,
                content: NodeContent::Children(vec![usync]),
                timeout: None,
            })
            .await?;

        let list = response
            .child_by_path(&["usync", "list"])
            .ok_or(ClientError::ServerErrorNode("usync response without list".into()))?;
        for user_node in list.children_by_tag("user") {
            let Some(user_jid) = user_node.attr_jid("jid") else {
                continue;
            };
            let mut devices = Vec::new();
            if let Some(device_list) = user_node.child_by_path(&["devices", "device-list"]) {
                for device_node in device_list.children_by_tag("device") {
                    if let Some(device_id) = device_node.attr_u64("id") {
                        devices.push(user_jid.with_device(device_id as u16));
                    }
                }
            }
            result.extend(devices.iter().cloned());
            self.device_cache.insert(
                user_jid.to_non_ad(),
                CachedDeviceList {
                    devices,
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(result)
    }

    /// Fetches the participant list of a group.
    pub(crate) async fn group_participants(&self, group: &JID) -> Result<Vec<JID>, ClientError> {
        let response = self
            .send_iq(InfoQuery {
                namespace: "w:g2",
                query_type: InfoQueryType::Get,
                to: group.clone(),
                target: None,
                id: None,
                content: NodeContent::Children(vec![
                    Node::new("query").attr("request", "interactive"),
                ]),
                timeout: None,
            })
            .await?;

        let group_node = response
            .child_by_tag("group")
            .ok_or(ClientError::ServerErrorNode("group info without group".into()))?;
        Ok(group_node
            .children_by_tag("participant")
            .filter_map(|p| p.attr_jid("jid"))
            .collect())
    }

    /// Our sender address for group chains: the LID identity when assigned.
    pub(crate) async fn own_group_sender_address(&self) -> ProtocolAddress {
        let device = self.device.read().await;
        let own = device.id.clone().unwrap_or_default();
        match &device.lid {
            Some(lid) => ProtocolAddress::from(&lid.with_device(own.device)),
            None => ProtocolAddress::from(&own),
        }
    }

    fn devices_needing_distribution(&self, group: &JID, devices: &[JID]) -> Vec<JID> {
        match self.sender_key_shared.get(group) {
            Some(shared) => devices
                .iter()
                .filter(|d| !shared.contains(*d))
                .cloned()
                .collect(),
            None => devices.to_vec(),
        }
    }

    fn mark_distribution_shared(&self, group: &JID, devices: &[JID]) {
        let mut entry = self.sender_key_shared.entry(group.clone()).or_default();
        entry.extend(devices.iter().cloned());
    }

    /// Drops our own sender key for a group so the next send creates a
    /// fresh chain and redistributes it.
    pub(crate) async fn rotate_own_sender_key(&self, group: &JID) -> Result<(), ClientError> {
        let sender = self.own_group_sender_address().await;
        self.store
            .delete_sender_key(&group.to_string(), &sender.to_string())?;
        self.sender_key_shared.remove(group);
        Ok(())
    }

    pub(crate) async fn session_lock(&self, address: &ProtocolAddress) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = self
            .session_locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    // -- inbound -----------------------------------------------------------

    pub(crate) async fn handle_message(self: &Arc<Self>, node: &Node) {
        let info = match self.parse_message_info(node).await {
            Ok(info) => info,
            Err(e) => {
                warn!(target: "Client/Recv", "cannot parse message info: {e}");
                return;
            }
        };

        // Serialize per chat so earlier messages finish before later ones.
        let chat_mutex = self
            .chat_locks
            .entry(info.source.chat.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _chat_guard = chat_mutex.lock().await;

        let own_pn = self.own_jid().await;
        let mut enc_nodes: Vec<&Node> = node.children_by_tag("enc").collect();
        if let Some(participants) = node.child_by_tag("participants") {
            for to_node in participants.children_by_tag("to") {
                let matches_us = match (&own_pn, to_node.attr_jid("jid")) {
                    (Some(own), Some(jid)) => {
                        jid.user == own.user && jid.device == own.device
                    }
                    _ => false,
                };
                if matches_us {
                    enc_nodes.extend(to_node.children_by_tag("enc"));
                }
            }
        }
        if enc_nodes.is_empty() {
            debug!(target: "Client/Recv", "message {} without enc payload", info.id);
            return;
        }

        let mut delivered_payload = false;
        for enc in enc_nodes {
            let Some(ciphertext) = enc.content_bytes() else {
                continue;
            };
            let enc_type = enc.attr_str("type").unwrap_or("");
            let result = match enc_type {
                "pkmsg" | "msg" => self.decrypt_session_enc(&info, enc_type, ciphertext).await,
                "skmsg" => self.decrypt_group_enc(&info, ciphertext).await,
                other => {
                    debug!(target: "Client/Recv", "ignoring enc type {other}");
                    continue;
                }
            };

            match result {
                Ok(padded) => {
                    if self.handle_plaintext(&info, node, &padded).await {
                        delivered_payload = true;
                    }
                }
                Err(SignalError::DuplicateMessage(chain, counter)) => {
                    debug!(
                        target: "Client/Recv",
                        "duplicate ciphertext from {} (chain {chain}, counter {counter})",
                        info.source.sender
                    );
                }
                Err(e) => {
                    let kind = match &e {
                        SignalError::NoSession(_) => UndecryptableKind::NoSession,
                        SignalError::NoSenderKeyState(_) => UndecryptableKind::NoSenderKey,
                        SignalError::UntrustedIdentity(_) => UndecryptableKind::UntrustedIdentity,
                        _ => UndecryptableKind::InvalidMessage,
                    };
                    warn!(
                        target: "Client/Recv",
                        "failed to decrypt {} from {} ({e}); requesting retry",
                        info.id, info.source.sender
                    );
                    self.send_retry_receipt(&info, kind).await;
                }
            }
        }

        if delivered_payload {
            // Delivery receipt; with synchronous_ack the handlers already
            // returned by this point, giving at-least-once semantics.
            self.send_delivery_receipt(&info).await;
        }
    }

    async fn decrypt_session_enc(
        &self,
        info: &MessageInfo,
        enc_type: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        let sender = &info.source.sender;
        let address = ProtocolAddress::from(sender);
        let _guard = self.session_lock(&address).await;

        let device_snapshot = self.device.read().await.clone();
        let cipher = SessionCipher::new(
            self.store.as_ref(),
            self.store.as_ref(),
            self.store.as_ref(),
            device_snapshot.identity_key.clone(),
            device_snapshot.registration_id,
            device_snapshot.signed_pre_key.clone(),
            self.config.trust_policy,
            self.config.max_skipped_message_keys,
        );
        if enc_type == "pkmsg" {
            cipher.decrypt_prekey_message(&address, ciphertext)
        } else {
            cipher.decrypt_message(&address, ciphertext)
        }
    }

    async fn decrypt_group_enc(
        &self,
        info: &MessageInfo,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SignalError> {
        let name = SenderKeyName::new(
            info.source.chat.to_string(),
            ProtocolAddress::from(&info.source.sender),
        );
        let group = GroupCipher::new(
            self.store.as_ref(),
            name,
            self.config.max_skipped_message_keys,
        );
        group.decrypt(ciphertext)
    }

    /// Unpads, opens the envelope and dispatches. Returns true if an
    /// application payload was surfaced.
    async fn handle_plaintext(
        self: &Arc<Self>,
        info: &MessageInfo,
        raw: &Node,
        padded: &[u8],
    ) -> bool {
        let plaintext = match unpad_message(padded) {
            Ok(p) => p,
            Err(e) => {
                warn!(target: "Client/Recv", "bad padding on {}: {e}", info.id);
                return false;
            }
        };
        let envelope = match proto::Envelope::decode(plaintext) {
            Ok(env) => env,
            Err(e) => {
                warn!(target: "Client/Recv", "bad envelope on {}: {e}", info.id);
                return false;
            }
        };

        if let Some(skdm_bytes) = &envelope.sender_key_distribution_message {
            match SenderKeyDistributionMessage::deserialize(skdm_bytes) {
                Ok(skdm) => {
                    let name = SenderKeyName::new(
                        info.source.chat.to_string(),
                        ProtocolAddress::from(&info.source.sender),
                    );
                    let group = GroupCipher::new(
                        self.store.as_ref(),
                        name,
                        self.config.max_skipped_message_keys,
                    );
                    if let Err(e) = group.process_distribution_message(&skdm) {
                        warn!(target: "Client/Recv", "failed to store sender key: {e}");
                    } else {
                        info!(
                            target: "Client/Recv",
                            "stored sender key for {} from {}",
                            info.source.chat, info.source.sender
                        );
                    }
                }
                Err(e) => warn!(target: "Client/Recv", "bad distribution message: {e}"),
            }
        }

        let Some(payload) = envelope.payload else {
            return false;
        };

        // Duplicate fanout copies surface exactly once.
        let fresh = self
            .recent_ids
            .lock()
            .expect("recent lock")
            .insert(info.source.sender.clone(), info.id.clone());
        if !fresh {
            debug!(target: "Client/Recv", "suppressing duplicate {}", info.id);
            return false;
        }

        self.dispatch_event(Event::Message(events::Message {
            info: info.clone(),
            payload,
            raw: raw.clone(),
        }));
        true
    }

    pub(crate) async fn parse_message_info(&self, node: &Node) -> Result<MessageInfo, ClientError> {
        let from = node
            .attr_jid("from")
            .ok_or_else(|| ClientError::InvalidJid("message without from".into()))?;
        let id = node
            .attr_str("id")
            .ok_or_else(|| ClientError::ServerErrorNode("message without id".into()))?
            .to_string();

        let is_group = from.is_group() || from.is_broadcast();
        let sender = if is_group {
            node.attr_jid("participant")
                .ok_or_else(|| ClientError::InvalidJid("group message without participant".into()))?
        } else {
            from.clone()
        };
        let sender_alt = node
            .attr_jid("participant_lid")
            .or_else(|| node.attr_jid("sender_lid"));

        let own = self.own_jid().await;
        let is_from_me = own.map(|own| own.user == sender.user).unwrap_or(false);

        let timestamp = node
            .attr_u64("t")
            .and_then(|t| DateTime::from_timestamp(t as i64, 0))
            .unwrap_or_else(Utc::now);

        Ok(MessageInfo {
            source: MessageSource {
                chat: from.to_non_ad(),
                sender,
                sender_alt,
                is_from_me,
                is_group,
            },
            id,
            timestamp,
            push_name: node.attr_str("notify").map(str::to_string),
            is_ephemeral: node.attr_str("expiration").is_some(),
            is_view_once: node.attr_str("mediatype") == Some("view_once"),
            is_edit: node.attr_str("edit").is_some(),
        })
    }

    // -- prekey maintenance ------------------------------------------------

    /// Tops the server-side prekey pool up when it runs low.
    pub(crate) async fn refill_pre_keys_if_needed(&self) -> Result<(), ClientError> {
        let unused = self.store.unused_pre_key_count()?;
        if unused >= self.config.prekey_low_water {
            return Ok(());
        }
        self.upload_pre_keys().await
    }

    /// Generates a fresh batch of one-time prekeys and registers them.
    pub(crate) async fn upload_pre_keys(&self) -> Result<(), ClientError> {
        let (keys, registration_id, identity, signed_pre_key) = {
            let mut device = self.device.write().await;
            let keys = device.generate_pre_keys(self.config.prekey_refill_to);
            self.store.save_device(&device)?;
            (
                keys,
                device.registration_id,
                device.identity_key.clone(),
                device.signed_pre_key.clone(),
            )
        };
        let records: Vec<PreKeyRecord> = keys.iter().map(PreKeyRecord::from).collect();
        self.store.put_pre_keys(&records)?;

        let key_nodes: Vec<Node> = keys
            .iter()
            .map(|k| {
                Node::new("key").children(vec![
                    Node::new("id").bytes(k.key_id.to_be_bytes()[1..].to_vec()),
                    Node::new("value").bytes(k.key_pair.public.to_vec()),
                ])
            })
            .collect();

        let content = vec![
            Node::new("registration").bytes(registration_id.to_be_bytes().to_vec()),
            Node::new("type").bytes(vec![crate::crypto::DJB_TYPE]),
            Node::new("identity").bytes(identity.public.to_vec()),
            Node::new("list").children(key_nodes),
            Node::new("skey").children(vec![
                Node::new("id").bytes(signed_pre_key.key_id.to_be_bytes()[1..].to_vec()),
                Node::new("value").bytes(signed_pre_key.key_pair.public.to_vec()),
                Node::new("signature").bytes(signed_pre_key.signature.to_vec()),
            ]),
        ];

        self.send_iq(InfoQuery {
            namespace: "encrypt",
            query_type: InfoQueryType::Set,
            to: crate::types::SERVER_JID.clone(),
            target: None,
            id: None,
            content: NodeContent::Children(content),
            timeout: None,
        })
        .await?;

        let max_id = keys.iter().map(|k| k.key_id).max().unwrap_or(0);
        self.store.mark_pre_keys_uploaded(max_id)?;
        info!(target: "Client", "uploaded {} prekeys", keys.len());
        Ok(())
    }
}

/// Parses one `<user>` entry of a prekey fetch response.
fn parse_pre_key_bundle(user: &Node) -> Option<PreKeyBundle> {
    fn be_u32(bytes: &[u8]) -> u32 {
        bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
    }

    let registration_id = be_u32(user.child_by_tag("registration")?.content_bytes()?);
    let identity_key: [u8; 32] = user
        .child_by_tag("identity")?
        .content_bytes()?
        .try_into()
        .ok()?;

    let skey = user.child_by_tag("skey")?;
    let signed_pre_key_id = be_u32(skey.child_by_tag("id")?.content_bytes()?);
    let signed_pre_key: [u8; 32] = skey.child_by_tag("value")?.content_bytes()?.try_into().ok()?;
    let signed_pre_key_signature: [u8; 64] = skey
        .child_by_tag("signature")?
        .content_bytes()?
        .try_into()
        .ok()?;

    let (pre_key_id, pre_key) = match user.child_by_tag("key") {
        Some(key) => {
            let id = be_u32(key.child_by_tag("id")?.content_bytes()?);
            let value: [u8; 32] = key.child_by_tag("value")?.content_bytes()?.try_into().ok()?;
            (Some(id), Some(value))
        }
        None => (None, None),
    };

    Some(PreKeyBundle {
        registration_id,
        identity_key,
        signed_pre_key_id,
        signed_pre_key,
        signed_pre_key_signature,
        pre_key_id,
        pre_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_roundtrip() {
        for len in [0usize, 1, 16, 100] {
            let plaintext = vec![0x42; len];
            let padded = pad_message(plaintext.clone());
            assert!(padded.len() > plaintext.len());
            assert!(padded.len() <= plaintext.len() + 15);
            assert_eq!(unpad_message(&padded).unwrap(), &plaintext[..]);
        }
    }

    #[test]
    fn unpad_rejects_garbage() {
        assert!(unpad_message(&[]).is_err());
        assert!(unpad_message(&[0]).is_err());
        assert!(unpad_message(&[16]).is_err());
        // Pad length longer than the buffer.
        assert!(unpad_message(&[9, 9]).is_err());
    }

    #[test]
    fn message_ids_are_unique_and_prefixed() {
        let a = generate_message_id();
        let b = generate_message_id();
        assert!(a.starts_with("3EB0"));
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
    }

    #[test]
    fn bundle_parsing_handles_missing_one_time_key() {
        let user = Node::new("user").children(vec![
            Node::new("registration").bytes(vec![0, 0, 0, 7]),
            Node::new("identity").bytes(vec![1; 32]),
            Node::new("skey").children(vec![
                Node::new("id").bytes(vec![0, 0, 1]),
                Node::new("value").bytes(vec![2; 32]),
                Node::new("signature").bytes(vec![3; 64]),
            ]),
        ]);
        let bundle = parse_pre_key_bundle(&user).unwrap();
        assert_eq!(bundle.registration_id, 7);
        assert_eq!(bundle.signed_pre_key_id, 1);
        assert_eq!(bundle.pre_key_id, None);

        let with_key = {
            let mut u = user.clone();
            u.add_child(Node::new("key").children(vec![
                Node::new("id").bytes(vec![0, 0, 42]),
                Node::new("value").bytes(vec![4; 32]),
            ]));
            u
        };
        let bundle = parse_pre_key_bundle(&with_key).unwrap();
        assert_eq!(bundle.pre_key_id, Some(42));
    }

    #[test]
    fn malformed_bundle_is_rejected() {
        let user = Node::new("user").children(vec![
            Node::new("registration").bytes(vec![0, 0, 0, 7]),
            Node::new("identity").bytes(vec![1; 31]),
        ]);
        assert!(parse_pre_key_bundle(&user).is_none());
    }
}
