//! Receipts and the decryption-failure retry flow.
//!
//! Delivered receipts go out automatically after a successful decrypt;
//! read receipts are application-driven. When we cannot decrypt, we ask
//! the sender for a retry (rate limited per message); when a peer asks us
//! for one, we tear the session down and re-send the cached payload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::binary::Node;
use crate::client::{Client, RetryState};
use crate::error::ClientError;
use crate::signal::ProtocolAddress;
use crate::types::events::{Event, Receipt, UndecryptableMessage};
use crate::types::{MessageID, MessageInfo, MessageSource, ReceiptType, UndecryptableKind, JID};

/// Ceiling for the retry backoff schedule (1s, 2s, 4s, ... capped here).
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Give up asking for retries of one message after this many requests.
const MAX_RETRY_COUNT: u32 = 5;

fn retry_backoff(count: u32) -> Duration {
    Duration::from_secs(1u64 << count.saturating_sub(1).min(5)).min(RETRY_BACKOFF_CAP)
}

impl Client {
    // -- outgoing receipts ---------------------------------------------------

    /// Automatic delivered acknowledgement for a decrypted message.
    pub(crate) async fn send_delivery_receipt(&self, info: &MessageInfo) {
        let mut receipt = Node::new("receipt")
            .attr("id", info.id.clone())
            .attr("to", info.source.chat.clone());
        if info.source.is_group {
            receipt.set_attr("participant", info.source.sender.clone());
        }
        if let Err(e) = self.send_node(receipt).await {
            debug!(target: "Client", "failed to send delivery receipt: {e}");
        }
    }

    /// Application-driven read acknowledgement for one or more messages.
    pub async fn mark_read(
        &self,
        chat: JID,
        sender: Option<JID>,
        ids: Vec<MessageID>,
    ) -> Result<(), ClientError> {
        let Some((first, rest)) = ids.split_first() else {
            return Ok(());
        };
        let mut receipt = Node::new("receipt")
            .attr("id", first.clone())
            .attr("to", chat.clone())
            .attr("type", "read")
            .attr("t", Utc::now().timestamp() as u64);
        if let Some(sender) = sender {
            if chat.is_group() {
                receipt.set_attr("participant", sender);
            }
        }
        if !rest.is_empty() {
            let items: Vec<Node> = rest
                .iter()
                .map(|id| Node::new("item").attr("id", id.clone()))
                .collect();
            receipt.add_child(Node::new("list").children(items));
        }
        self.send_node(receipt).await
    }

    /// Asks the sender to re-send a message we could not decrypt. Rate
    /// limited per (sender, message-id) with exponential backoff; after the
    /// budget is exhausted an [`UndecryptableMessage`] event surfaces.
    pub(crate) async fn send_retry_receipt(&self, info: &MessageInfo, kind: UndecryptableKind) {
        let key = (info.source.sender.to_string(), info.id.clone());
        let now = Instant::now();
        let count = {
            let mut state = self.retry_counters.entry(key).or_insert(RetryState {
                count: 0,
                next_allowed: now,
            });
            if state.count >= MAX_RETRY_COUNT {
                drop(state);
                info!(
                    target: "Client/Recv",
                    "retry budget exhausted for {} from {}", info.id, info.source.sender
                );
                self.dispatch_event(Event::UndecryptableMessage(UndecryptableMessage {
                    info: info.clone(),
                    kind,
                }));
                return;
            }
            if now < state.next_allowed {
                debug!(target: "Client/Recv", "retry for {} rate limited", info.id);
                return;
            }
            state.count += 1;
            state.next_allowed = now + retry_backoff(state.count);
            state.count
        };

        let device = self.device.read().await.clone();
        let mut receipt = Node::new("receipt")
            .attr("id", info.id.clone())
            .attr("to", info.source.chat.clone())
            .attr("type", "retry");
        if info.source.is_group {
            receipt.set_attr("participant", info.source.sender.clone());
        }
        receipt.add_child(
            Node::new("retry")
                .attr("count", u64::from(count))
                .attr("id", info.id.clone())
                .attr("t", info.timestamp.timestamp() as u64)
                .attr("v", "1"),
        );
        receipt.add_child(
            Node::new("registration").bytes(device.registration_id.to_be_bytes().to_vec()),
        );

        // From the second attempt on, ship fresh keys so the sender can
        // build a whole new session without a server round trip.
        if count > 1 {
            let pre_key = {
                let mut dev = self.device.write().await;
                let keys = dev.generate_pre_keys(1);
                if let Err(e) = self.store.save_device(&dev) {
                    warn!(target: "Client", "failed to persist prekey allocation: {e}");
                }
                keys.into_iter().next().expect("generated one key")
            };
            if let Err(e) = self
                .store
                .put_pre_keys(&[crate::store::PreKeyRecord::from(&pre_key)])
            {
                warn!(target: "Client", "failed to store retry prekey: {e}");
            }

            let mut keys_node = Node::new("keys").children(vec![
                Node::new("type").bytes(vec![crate::crypto::DJB_TYPE]),
                Node::new("identity").bytes(device.identity_key.public.to_vec()),
                Node::new("key").children(vec![
                    Node::new("id").bytes(pre_key.key_id.to_be_bytes()[1..].to_vec()),
                    Node::new("value").bytes(pre_key.key_pair.public.to_vec()),
                ]),
                Node::new("skey").children(vec![
                    Node::new("id").bytes(device.signed_pre_key.key_id.to_be_bytes()[1..].to_vec()),
                    Node::new("value").bytes(device.signed_pre_key.key_pair.public.to_vec()),
                    Node::new("signature").bytes(device.signed_pre_key.signature.to_vec()),
                ]),
            ]);
            if let Some(account) = &device.account {
                keys_node.add_child(
                    Node::new("device-identity").bytes(crate::proto::encode_proto(account)),
                );
            }
            receipt.add_child(keys_node);
        }

        if let Err(e) = self.send_node(receipt).await {
            warn!(target: "Client/Recv", "failed to send retry receipt: {e}");
        }
    }

    // -- incoming receipts ---------------------------------------------------

    pub(crate) async fn handle_receipt(self: &Arc<Self>, node: &Node) {
        self.send_ack(node).await;

        let Some(from) = node.attr_jid("from") else {
            return;
        };
        let Some(id) = node.attr_str("id").map(str::to_string) else {
            return;
        };
        let participant = node.attr_jid("participant");
        let receipt_type = ReceiptType::from_attr(node.attr_str("type"));

        let mut message_ids = vec![id.clone()];
        if let Some(list) = node.child_by_tag("list") {
            message_ids.extend(
                list.children_by_tag("item")
                    .filter_map(|i| i.attr_str("id").map(str::to_string)),
            );
        }

        let sender = match (&participant, from.is_group()) {
            (Some(p), true) => p.clone(),
            _ => from.clone(),
        };
        let source = MessageSource {
            chat: from.to_non_ad(),
            sender: sender.clone(),
            sender_alt: None,
            is_from_me: false,
            is_group: from.is_group(),
        };
        let timestamp = node
            .attr_u64("t")
            .and_then(|t| DateTime::from_timestamp(t as i64, 0))
            .unwrap_or_else(Utc::now);

        if receipt_type == ReceiptType::Retry {
            let client = self.clone();
            let node = node.clone();
            let source = source.clone();
            tokio::spawn(async move {
                if let Err(e) = client.handle_retry_request(&node, &source).await {
                    warn!(
                        target: "Client",
                        "failed to service retry receipt from {}: {e}", source.sender
                    );
                }
            });
            return;
        }

        self.dispatch_event(Event::Receipt(Receipt {
            source,
            message_ids,
            timestamp,
            receipt_type,
        }));
    }

    /// A peer failed to decrypt one of our messages: drop the state that
    /// produced the ciphertext and re-send from the cache with a fresh
    /// session.
    async fn handle_retry_request(
        &self,
        node: &Node,
        source: &MessageSource,
    ) -> Result<(), ClientError> {
        let retry = node
            .child_by_tag("retry")
            .ok_or(ClientError::ServerErrorNode("retry receipt without retry".into()))?;
        let message_id = retry
            .attr_str("id")
            .ok_or(ClientError::ServerErrorNode("retry without id".into()))?
            .to_string();

        let payload = self
            .recent_sent
            .lock()
            .expect("recent lock")
            .get(&source.chat, &message_id)
            .cloned();
        let Some(payload) = payload else {
            warn!(
                target: "Client",
                "no cached copy of {message_id} for retry from {}", source.sender
            );
            return Ok(());
        };

        // Tear down the pairwise session with the requester.
        let address = ProtocolAddress::from(&source.sender);
        let _guard = self.session_lock(&address).await;
        self.store.delete_session(&address.to_string())?;
        drop(_guard);

        // For groups the requester may also be missing the sender key.
        if source.chat.is_group() {
            if let Some(mut shared) = self.sender_key_shared.get_mut(&source.chat) {
                shared.remove(&source.sender);
            }
        }

        info!(
            target: "Client",
            "re-sending {message_id} to {} after retry receipt", source.chat
        );
        self.send_message_impl(source.chat.clone(), &payload, message_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        assert_eq!(retry_backoff(1), Duration::from_secs(1));
        assert_eq!(retry_backoff(2), Duration::from_secs(2));
        assert_eq!(retry_backoff(4), Duration::from_secs(8));
        assert_eq!(retry_backoff(5), Duration::from_secs(16));
        assert_eq!(retry_backoff(40), Duration::from_secs(30));
    }
}
