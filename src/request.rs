//! Stanza correlation: pending request slots keyed by id.
//!
//! Outgoing `iq` stanzas (and `message` stanzas waiting for their server
//! ack) register a single-shot slot under their id; the reader completes
//! the slot when a node with that id arrives. Disconnecting fails every
//! outstanding slot exactly once.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::binary::{Node, NodeContent};
use crate::client::Client;
use crate::error::IqError;
use crate::types::JID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoQueryType {
    Get,
    Set,
}

impl InfoQueryType {
    fn as_attr(self) -> &'static str {
        match self {
            InfoQueryType::Get => "get",
            InfoQueryType::Set => "set",
        }
    }
}

/// One request/reply exchange.
pub struct InfoQuery<'a> {
    pub namespace: &'a str,
    pub query_type: InfoQueryType,
    pub to: JID,
    pub target: Option<JID>,
    /// Generated when absent.
    pub id: Option<String>,
    pub content: NodeContent,
    /// Falls back to the configured IQ timeout.
    pub timeout: Option<Duration>,
}

impl Client {
    /// Short unique id: a per-client random base32 prefix (40 bits) plus a
    /// monotone counter, so ids never repeat within a connection.
    pub(crate) fn generate_request_id(&self) -> String {
        format!(
            "{}-{}",
            self.unique_id,
            self.id_counter.fetch_add(1, Ordering::Relaxed)
        )
    }

    pub(crate) fn register_waiter(&self, id: &str) -> oneshot::Receiver<Node> {
        let (tx, rx) = oneshot::channel();
        self.response_waiters
            .lock()
            .expect("waiter lock")
            .insert(id.to_string(), tx);
        rx
    }

    /// Cancels a pending slot; a second cancel for the same id is a no-op.
    pub(crate) fn cancel_waiter(&self, id: &str) {
        self.response_waiters.lock().expect("waiter lock").remove(id);
    }

    /// Completes the slot matching this node's id, if any.
    pub(crate) fn complete_response(&self, node: &Node) -> bool {
        let Some(id) = node.attr_str("id") else {
            return false;
        };
        let Some(tx) = self.response_waiters.lock().expect("waiter lock").remove(id) else {
            return false;
        };
        tx.send(node.clone()).is_ok()
    }

    /// Drops every outstanding slot; each waiter observes `Disconnected`.
    pub(crate) fn fail_all_pending(&self) {
        self.response_waiters.lock().expect("waiter lock").clear();
    }

    /// Awaits a node with the given id, with a deadline. Used for both `iq`
    /// replies and `message` acks.
    pub(crate) async fn wait_response(
        &self,
        id: &str,
        rx: oneshot::Receiver<Node>,
        deadline: Duration,
    ) -> Result<Node, IqError> {
        match timeout(deadline, rx).await {
            Err(_) => {
                self.cancel_waiter(id);
                Err(IqError::Timeout)
            }
            Ok(Err(_)) => Err(IqError::Disconnected),
            Ok(Ok(node)) => Ok(node),
        }
    }

    /// Sends an `iq` and awaits its reply.
    pub async fn send_iq(&self, query: InfoQuery<'_>) -> Result<Node, IqError> {
        let id = query
            .id
            .clone()
            .unwrap_or_else(|| self.generate_request_id());
        let rx = self.register_waiter(&id);

        let mut node = Node::new("iq")
            .attr("id", id.clone())
            .attr("xmlns", query.namespace)
            .attr("type", query.query_type.as_attr());
        if !query.to.is_empty() {
            node.set_attr("to", query.to.clone());
        }
        if let Some(target) = &query.target {
            node.set_attr("target", target.clone());
        }
        node.content = query.content;

        if self.send_node(node).await.is_err() {
            self.cancel_waiter(&id);
            return Err(IqError::NotConnected);
        }

        let deadline = query.timeout.unwrap_or(self.config.iq_timeout);
        let reply = self.wait_response(&id, rx, deadline).await?;

        if reply.attr_str("type") == Some("error") {
            return Err(parse_iq_error(&reply));
        }
        Ok(reply)
    }
}

/// Extracts the typed error from an `iq type="error"` reply.
pub(crate) fn parse_iq_error(node: &Node) -> IqError {
    match node.child_by_tag("error") {
        Some(error) => IqError::ServerError {
            code: error.attr_u64("code").unwrap_or(0) as u16,
            text: error.attr_str("text").unwrap_or("").to_string(),
        },
        None => IqError::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn client() -> Client {
        Client::new(Arc::new(MemoryStore::new()), ClientConfig::default()).unwrap()
    }

    #[test]
    fn request_ids_do_not_repeat() {
        let client = client();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(client.generate_request_id()));
        }
    }

    #[tokio::test]
    async fn response_completes_matching_slot() {
        let client = client();
        let rx = client.register_waiter("abc-1");

        let reply = Node::new("iq").attr("id", "abc-1").attr("type", "result");
        assert!(client.complete_response(&reply));
        let got = client.wait_response("abc-1", rx, Duration::from_secs(1)).await;
        assert_eq!(got.unwrap().attr_str("id"), Some("abc-1"));

        // A reply with no matching slot is not handled.
        assert!(!client.complete_response(&reply));
    }

    #[tokio::test]
    async fn disconnect_fails_every_outstanding_slot_once() {
        let client = client();
        let rx1 = client.register_waiter("a");
        let rx2 = client.register_waiter("b");
        client.fail_all_pending();

        for (id, rx) in [("a", rx1), ("b", rx2)] {
            let err = client
                .wait_response(id, rx, Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, IqError::Disconnected));
        }
    }

    #[tokio::test]
    async fn timeout_deregisters_slot() {
        let client = client();
        let rx = client.register_waiter("slow");
        let err = client
            .wait_response("slow", rx, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, IqError::Timeout));
        // The slot is gone: a late reply finds nothing to complete.
        let late = Node::new("iq").attr("id", "slow");
        assert!(!client.complete_response(&late));
    }

    #[test]
    fn iq_error_parsing() {
        let reply = Node::new("iq").attr("type", "error").children(vec![
            Node::new("error").attr("code", "404").attr("text", "item-not-found"),
        ]);
        match parse_iq_error(&reply) {
            IqError::ServerError { code, text } => {
                assert_eq!(code, 404);
                assert_eq!(text, "item-not-found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
