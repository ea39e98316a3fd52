//! The pairing state machine: QR and phone-code linking against an
//! already-logged-in primary device.
//!
//! The server drives pairing over `iq` stanzas: first a `pair-device` with
//! QR refs, then (after the user scans or enters a code) a `pair-success`
//! carrying the account-signed device identity. We verify the identity
//! chain, counter-sign it, persist everything and confirm back.

use std::sync::Arc;

use log::{info, warn};
use prost::Message as ProstMessage;
use rand::Rng;

use crate::binary::{Node, NodeContent};
use crate::client::Client;
use crate::crypto::kdf::hmac_sha256;
use crate::crypto::xeddsa;
use crate::error::{ClientError, PairError};
use crate::proto;
use crate::qr::{make_qr_codes, start_qr_rotation, QrEvent};
use crate::types::events::{Event, PairSuccess};
use crate::types::JID;

/// Progress of the linking flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Unpaired,
    /// QR refs received; codes are rotating.
    AwaitingScan,
    /// A `pair-success` arrived and is being verified.
    Pairing,
    Paired,
}

/// Signature domain separators for the signed device identity.
const ACCOUNT_SIGNATURE_PREFIX: [u8; 2] = [0x06, 0x00];
const DEVICE_SIGNATURE_PREFIX: [u8; 2] = [0x06, 0x01];

/// Routes pairing-related IQs. Returns false if the node is not ours.
pub(crate) async fn handle_pair_iq(client: &Arc<Client>, node: &Node) -> bool {
    if let Some(pair_device) = node.child_by_tag("pair-device") {
        *client.pair_state.lock().expect("pair lock") = PairState::AwaitingScan;
        handle_pair_device(client, node, pair_device).await;
        true
    } else if let Some(pair_success) = node.child_by_tag("pair-success") {
        *client.pair_state.lock().expect("pair lock") = PairState::Pairing;
        let pair_success = pair_success.clone();
        match handle_pair_success(client, node, &pair_success).await {
            Ok(event) => {
                info!(target: "Pair", "paired as {}", event.id);
                *client.pair_state.lock().expect("pair lock") = PairState::Paired;
                client.finish_qr(QrEvent::Success);
                client.dispatch_event(Event::PairSuccess(event));
            }
            Err(e) => {
                warn!(target: "Pair", "pairing failed: {e}");
                *client.pair_state.lock().expect("pair lock") = PairState::Unpaired;
                send_pair_error(client, node, &e).await;
                client.finish_qr(QrEvent::Error(e.to_string()));
                client.dispatch_event(Event::PairError(crate::types::events::PairError {
                    error: e.to_string(),
                }));
            }
        }
        true
    } else {
        false
    }
}

/// Acks the offer and starts rotating QR codes built from the refs.
async fn handle_pair_device(client: &Arc<Client>, node: &Node, pair_device: &Node) {
    ack_iq(client, node).await;

    let refs: Vec<String> = pair_device
        .children_by_tag("ref")
        .filter_map(|r| r.content_bytes())
        .filter_map(|b| String::from_utf8(b.to_vec()).ok())
        .collect();
    if refs.is_empty() {
        warn!(target: "Pair", "pair-device offer carried no refs");
        return;
    }

    let device = client.device.read().await.clone();
    let codes = make_qr_codes(&device, &refs);
    client.dispatch_event(Event::QR(crate::types::events::QR {
        codes: codes.clone(),
    }));
    start_qr_rotation(client.clone(), codes);
}

/// Verifies and stores the signed device identity from `pair-success`.
async fn handle_pair_success(
    client: &Arc<Client>,
    node: &Node,
    pair_success: &Node,
) -> Result<PairSuccess, PairError> {
    let identity_bytes = pair_success
        .child_by_tag("device-identity")
        .and_then(|n| n.content_bytes())
        .ok_or(PairError::Malformed("missing device-identity"))?;
    let own_jid = pair_success
        .child_by_tag("device")
        .and_then(|n| n.attr_jid("jid"))
        .ok_or(PairError::Malformed("missing assigned jid"))?;
    let own_lid = pair_success
        .child_by_tag("device")
        .and_then(|n| n.attr_jid("lid"))
        .unwrap_or_default();
    let business_name = pair_success
        .child_by_tag("biz")
        .and_then(|n| n.attr_str("name"))
        .unwrap_or("")
        .to_string();
    let platform = pair_success
        .child_by_tag("platform")
        .and_then(|n| n.attr_str("name"))
        .unwrap_or("")
        .to_string();

    let (key_index, signed_identity) = {
        let device = client.device.read().await;

        // Layer 1: the HMAC container proves the payload came through the
        // primary device that knows our adv secret.
        let container = proto::AdvSignedDeviceIdentityHmac::decode(identity_bytes)
            .map_err(|_| PairError::Malformed("bad identity container"))?;
        let details = container
            .details
            .ok_or(PairError::Malformed("identity container without details"))?;
        let hmac = container
            .hmac
            .ok_or(PairError::Malformed("identity container without hmac"))?;
        if hmac_sha256(&device.adv_secret_key, &details)[..] != hmac[..] {
            return Err(PairError::IdentityHmacMismatch);
        }

        // Layer 2: the account signature binds our identity key to the
        // primary device's account key.
        let mut identity = proto::AdvSignedDeviceIdentity::decode(&details[..])
            .map_err(|_| PairError::Malformed("bad signed identity"))?;
        let inner_details = identity
            .details
            .clone()
            .ok_or(PairError::Malformed("signed identity without details"))?;
        let account_signature_key: [u8; 32] = identity
            .account_signature_key
            .as_deref()
            .and_then(|k| k.try_into().ok())
            .ok_or(PairError::Malformed("bad account signature key"))?;
        let account_signature: [u8; 64] = identity
            .account_signature
            .as_deref()
            .and_then(|s| s.try_into().ok())
            .ok_or(PairError::Malformed("bad account signature"))?;

        let mut signed_msg =
            Vec::with_capacity(2 + inner_details.len() + device.identity_key.public.len());
        signed_msg.extend_from_slice(&ACCOUNT_SIGNATURE_PREFIX);
        signed_msg.extend_from_slice(&inner_details);
        signed_msg.extend_from_slice(&device.identity_key.public);
        if !xeddsa::verify(&account_signature_key, &signed_msg, &account_signature) {
            return Err(PairError::AccountSignatureMismatch);
        }

        // Counter-sign: our identity key attests the same details.
        let mut device_msg = Vec::with_capacity(signed_msg.len() + 32);
        device_msg.extend_from_slice(&DEVICE_SIGNATURE_PREFIX);
        device_msg.extend_from_slice(&inner_details);
        device_msg.extend_from_slice(&device.identity_key.public);
        device_msg.extend_from_slice(&account_signature_key);
        let device_signature = device.identity_key.sign(&device_msg);
        identity.device_signature = Some(device_signature.to_vec());

        let key_index = proto::AdvDeviceIdentity::decode(&inner_details[..])
            .map_err(|_| PairError::Malformed("bad identity details"))?
            .key_index
            .unwrap_or(0);

        (key_index, identity)
    };

    // Persist the new identity before confirming to the server.
    {
        let mut device = client.device.write().await;
        device.id = Some(own_jid.clone());
        device.lid = if own_lid.is_empty() {
            None
        } else {
            Some(own_lid.clone())
        };
        device.account = Some(signed_identity.clone());
        device.business_name = business_name.clone();
        device.platform = platform.clone();
        client.store.save_device(&device)?;
    }

    // Confirm with the counter-signed identity, omitting the account
    // signature key as the server already holds it.
    let mut reply_identity = signed_identity;
    reply_identity.account_signature_key = None;
    let reply = Node::new("pair-device-sign").children(vec![Node::new("device-identity")
        .attr("key-index", u64::from(key_index))
        .bytes(proto::encode_proto(&reply_identity))]);

    let mut confirm = Node::new("iq").attr("type", "result");
    if let Some(id) = node.attr_str("id") {
        confirm.set_attr("id", id);
    }
    confirm.set_attr("to", crate::types::SERVER_JID.clone());
    confirm.content = NodeContent::Children(vec![reply]);
    if let Err(e) = client.send_node(confirm).await {
        warn!(target: "Pair", "failed to send pair confirmation: {e}");
    }

    Ok(PairSuccess {
        id: own_jid,
        lid: own_lid,
        business_name,
        platform,
    })
}

async fn ack_iq(client: &Arc<Client>, node: &Node) {
    let mut ack = Node::new("iq").attr("type", "result");
    if let Some(id) = node.attr_str("id") {
        ack.set_attr("id", id);
    }
    ack.set_attr("to", crate::types::SERVER_JID.clone());
    if let Err(e) = client.send_node(ack).await {
        warn!(target: "Pair", "failed to ack pairing iq: {e}");
    }
}

async fn send_pair_error(client: &Arc<Client>, node: &Node, error: &PairError) {
    let code = match error {
        PairError::IdentityHmacMismatch | PairError::AccountSignatureMismatch => 401,
        _ => 500,
    };
    let mut reply = Node::new("iq").attr("type", "error");
    if let Some(id) = node.attr_str("id") {
        reply.set_attr("id", id);
    }
    reply.set_attr("to", crate::types::SERVER_JID.clone());
    reply.content = NodeContent::Children(vec![Node::new("error")
        .attr("code", i64::from(code))
        .attr("text", "internal-error")]);
    if let Err(e) = client.send_node(reply).await {
        warn!(target: "Pair", "failed to send pair error: {e}");
    }
}

/// Alphabet for phone-linking codes: no confusable characters.
const PAIR_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTVWXYZ123456789";

impl Client {
    /// Requests linking by 8-character code instead of QR. The returned
    /// code (formatted `XXXX-XXXX`) is typed on the primary device; the
    /// flow then converges on the same `pair-success` stanza as QR.
    pub async fn get_pair_code(&self, phone: &str) -> Result<String, ClientError> {
        use crate::request::{InfoQuery, InfoQueryType};

        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(ClientError::InvalidJid(phone.to_string()));
        }
        let phone_jid = JID::new(digits, crate::types::servers::DEFAULT_USER);

        let mut rng = rand::thread_rng();
        let code: String = (0..8)
            .map(|_| PAIR_CODE_ALPHABET[rng.gen_range(0..PAIR_CODE_ALPHABET.len())] as char)
            .collect();

        // Announce the code binding so the primary can find us by it.
        let device = self.device.read().await;
        let code_hash = hmac_sha256(&device.adv_secret_key, code.as_bytes());
        let companion_hello = Node::new("link_code_companion_reg")
            .attr("jid", phone_jid)
            .attr("stage", "companion_hello")
            .children(vec![
                Node::new("link_code_pairing_nonce").bytes(code_hash.to_vec()),
                Node::new("companion_identity_public")
                    .bytes(device.identity_key.public.to_vec()),
            ]);
        drop(device);

        self.send_iq(InfoQuery {
            namespace: "md",
            query_type: InfoQueryType::Set,
            to: crate::types::SERVER_JID.clone(),
            target: None,
            id: None,
            content: NodeContent::Children(vec![companion_hello]),
            timeout: None,
        })
        .await?;

        Ok(format!("{}-{}", &code[..4], &code[4..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::store::Device;

    /// Builds the identity container the primary device would produce.
    fn make_identity_container(
        device: &Device,
        account_key: &KeyPair,
        key_index: u32,
    ) -> Vec<u8> {
        let details = proto::encode_proto(&proto::AdvDeviceIdentity {
            raw_id: Some(42),
            timestamp: Some(1_700_000_000),
            key_index: Some(key_index),
        });

        let mut signed_msg = Vec::new();
        signed_msg.extend_from_slice(&ACCOUNT_SIGNATURE_PREFIX);
        signed_msg.extend_from_slice(&details);
        signed_msg.extend_from_slice(&device.identity_key.public);
        let account_signature = account_key.sign(&signed_msg);

        let identity = proto::encode_proto(&proto::AdvSignedDeviceIdentity {
            details: Some(details),
            account_signature_key: Some(account_key.public.to_vec()),
            account_signature: Some(account_signature.to_vec()),
            device_signature: None,
        });

        proto::encode_proto(&proto::AdvSignedDeviceIdentityHmac {
            hmac: Some(hmac_sha256(&device.adv_secret_key, &identity).to_vec()),
            details: Some(identity),
        })
    }

    #[test]
    fn identity_container_verifies() {
        let device = Device::generate();
        let account_key = KeyPair::generate();
        let bytes = make_identity_container(&device, &account_key, 1);

        let container = proto::AdvSignedDeviceIdentityHmac::decode(&bytes[..]).unwrap();
        let details = container.details.unwrap();
        assert_eq!(
            hmac_sha256(&device.adv_secret_key, &details)[..],
            container.hmac.unwrap()[..]
        );

        let identity = proto::AdvSignedDeviceIdentity::decode(&details[..]).unwrap();
        let inner = identity.details.unwrap();
        let mut msg = Vec::new();
        msg.extend_from_slice(&ACCOUNT_SIGNATURE_PREFIX);
        msg.extend_from_slice(&inner);
        msg.extend_from_slice(&device.identity_key.public);
        let key: [u8; 32] = identity.account_signature_key.unwrap().try_into().unwrap();
        let sig: [u8; 64] = identity.account_signature.unwrap().try_into().unwrap();
        assert!(xeddsa::verify(&key, &msg, &sig));
    }

    #[test]
    fn tampered_container_fails_hmac() {
        let device = Device::generate();
        let account_key = KeyPair::generate();
        let bytes = make_identity_container(&device, &account_key, 1);

        let mut container = proto::AdvSignedDeviceIdentityHmac::decode(&bytes[..]).unwrap();
        let mut details = container.details.unwrap();
        details[0] ^= 0xFF;
        container.details = Some(details);
        assert_ne!(
            hmac_sha256(&device.adv_secret_key, container.details.as_ref().unwrap())[..],
            container.hmac.unwrap()[..]
        );
    }
}
