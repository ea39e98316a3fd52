//! The client: connection supervisor, stanza routing and event dispatch.
//!
//! A single reader drains decrypted frames and routes decoded nodes; a
//! single writer task owns the socket write side and drains a bounded
//! queue, so stanzas hit the wire in submission order. Everything else
//! (sends, IQ waits, pairing) runs on caller tasks and talks to the
//! connection through those two.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use rand::RngCore;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio::time::{sleep, Duration};

use crate::binary::{marshal, unmarshal, Node};
use crate::config::ClientConfig;
use crate::error::{ClientError, SocketError};
use crate::socket::{do_handshake, FrameSocket, NoiseSocket};
use crate::store::{Device, Store};
use crate::types::events::{
    self, ChatPresence, ChatPresenceState, Connected, DisconnectReason, Disconnected, Event,
    LoggedOut, LogoutReason, Presence,
};
use crate::types::{MessageID, JID};

pub type EventHandler = Box<dyn Fn(Arc<Event>) + Send + Sync>;

pub(crate) struct WrappedHandler {
    id: u64,
    handler: EventHandler,
}

type NodePredicate = Box<dyn Fn(&Node) -> bool + Send + Sync>;
type NodeCallback = Box<dyn Fn(&Node) + Send + Sync>;

pub(crate) struct NodeHandler {
    id: u64,
    predicate: NodePredicate,
    callback: NodeCallback,
}

/// Opaque registration handle; pass back to remove a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerHandle(pub(crate) u64);

/// Cached usync device list for one user.
pub(crate) struct CachedDeviceList {
    pub(crate) devices: Vec<JID>,
    pub(crate) fetched_at: Instant,
}

/// Per-(sender, message-id) retry receipt budget.
pub(crate) struct RetryState {
    pub(crate) count: u32,
    pub(crate) next_allowed: Instant,
}

/// Bounded cache of sent payloads, consulted when a peer asks for a retry.
#[derive(Default)]
pub(crate) struct RecentSentCache {
    pub(crate) map: HashMap<(JID, MessageID), Vec<u8>>,
    pub(crate) order: VecDeque<(JID, MessageID)>,
}

impl RecentSentCache {
    const CAPACITY: usize = 256;

    pub(crate) fn insert(&mut self, chat: JID, id: MessageID, payload: Vec<u8>) {
        if self.order.len() >= Self::CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
            }
        }
        self.order.push_back((chat.clone(), id.clone()));
        self.map.insert((chat, id), payload);
    }

    pub(crate) fn get(&self, chat: &JID, id: &str) -> Option<&Vec<u8>> {
        self.map.get(&(chat.clone(), id.to_string()))
    }
}

/// Bounded set of recently surfaced message ids, for duplicate fanout.
#[derive(Default)]
pub(crate) struct RecentIdSet {
    set: HashSet<(JID, MessageID)>,
    order: VecDeque<(JID, MessageID)>,
}

impl RecentIdSet {
    const CAPACITY: usize = 512;

    /// Returns true if the id was fresh (and records it).
    pub(crate) fn insert(&mut self, sender: JID, id: MessageID) -> bool {
        let key = (sender, id);
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > Self::CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

pub struct Client {
    pub(crate) config: ClientConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) device: RwLock<Device>,

    pub(crate) noise_socket: StdMutex<Option<Arc<NoiseSocket>>>,
    pub(crate) frames_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    pub(crate) writer_tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,

    pub(crate) is_logged_in: AtomicBool,
    is_connecting: AtomicBool,
    is_running: AtomicBool,
    pub(crate) expected_disconnect: AtomicBool,
    pub(crate) enable_auto_reconnect: AtomicBool,
    reconnect_errors: AtomicU32,
    pub(crate) shutdown: Notify,

    pub(crate) response_waiters: StdMutex<HashMap<String, oneshot::Sender<Node>>>,
    pub(crate) unique_id: String,
    pub(crate) id_counter: AtomicU64,
    next_handler_id: AtomicU64,

    event_handlers: StdRwLock<Vec<WrappedHandler>>,
    node_handlers: StdRwLock<Vec<NodeHandler>>,

    pub(crate) chat_locks: DashMap<JID, Arc<Mutex<()>>>,
    pub(crate) session_locks: DashMap<String, Arc<Mutex<()>>>,
    pub(crate) device_cache: DashMap<JID, CachedDeviceList>,
    pub(crate) recent_sent: StdMutex<RecentSentCache>,
    pub(crate) recent_ids: StdMutex<RecentIdSet>,
    pub(crate) retry_counters: DashMap<(String, MessageID), RetryState>,
    /// Devices that already hold our current sender key, per group.
    pub(crate) sender_key_shared: DashMap<JID, HashSet<JID>>,
    pub(crate) qr_tx: StdMutex<Option<mpsc::Sender<crate::qr::QrEvent>>>,
    pub(crate) pair_state: StdMutex<crate::pair::PairState>,
}

impl Client {
    /// Creates a client over a store. A fresh device record is generated and
    /// persisted if the store holds none.
    pub fn new(store: Arc<dyn Store>, config: ClientConfig) -> Result<Self, ClientError> {
        let device = match store.load_device()? {
            Some(device) => device,
            None => {
                let device = Device::generate();
                store.save_device(&device)?;
                device
            }
        };

        let mut id_bytes = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let device_paired = device.is_paired();

        Ok(Self {
            config,
            store,
            device: RwLock::new(device),
            noise_socket: StdMutex::new(None),
            frames_rx: Mutex::new(None),
            writer_tx: StdMutex::new(None),
            is_logged_in: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            expected_disconnect: AtomicBool::new(false),
            enable_auto_reconnect: AtomicBool::new(true),
            reconnect_errors: AtomicU32::new(0),
            shutdown: Notify::new(),
            response_waiters: StdMutex::new(HashMap::new()),
            unique_id: base32_token(&id_bytes),
            id_counter: AtomicU64::new(0),
            next_handler_id: AtomicU64::new(1),
            event_handlers: StdRwLock::new(Vec::new()),
            node_handlers: StdRwLock::new(Vec::new()),
            chat_locks: DashMap::new(),
            session_locks: DashMap::new(),
            device_cache: DashMap::new(),
            recent_sent: StdMutex::new(RecentSentCache::default()),
            recent_ids: StdMutex::new(RecentIdSet::default()),
            retry_counters: DashMap::new(),
            sender_key_shared: DashMap::new(),
            qr_tx: StdMutex::new(None),
            pair_state: StdMutex::new(if device_paired {
                crate::pair::PairState::Paired
            } else {
                crate::pair::PairState::Unpaired
            }),
        })
    }

    /// Where the linking flow currently stands.
    pub fn pair_state(&self) -> crate::pair::PairState {
        *self.pair_state.lock().expect("pair lock")
    }

    pub fn is_connected(&self) -> bool {
        self.noise_socket.lock().expect("socket lock").is_some()
    }

    pub fn is_logged_in(&self) -> bool {
        self.is_logged_in.load(Ordering::Relaxed)
    }

    pub async fn own_jid(&self) -> Option<JID> {
        self.device.read().await.id.clone()
    }

    // -- event dispatch ----------------------------------------------------

    pub fn add_event_handler(&self, handler: EventHandler) -> HandlerHandle {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.event_handlers
            .write()
            .expect("handler lock")
            .push(WrappedHandler { id, handler });
        HandlerHandle(id)
    }

    pub fn remove_event_handler(&self, handle: HandlerHandle) -> bool {
        let mut handlers = self.event_handlers.write().expect("handler lock");
        let before = handlers.len();
        handlers.retain(|h| h.id != handle.0);
        handlers.len() < before
    }

    /// Synchronous per handler: each handler returns before the next event
    /// reaches it.
    pub(crate) fn dispatch_event(&self, event: Event) {
        let event = Arc::new(event);
        let handlers = self.event_handlers.read().expect("handler lock");
        for wrapped in handlers.iter() {
            (wrapped.handler)(event.clone());
        }
    }

    /// Registers a callback for unsolicited stanzas matching a predicate.
    pub fn register_node_handler(
        &self,
        predicate: impl Fn(&Node) -> bool + Send + Sync + 'static,
        callback: impl Fn(&Node) + Send + Sync + 'static,
    ) -> HandlerHandle {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.node_handlers
            .write()
            .expect("handler lock")
            .push(NodeHandler {
                id,
                predicate: Box::new(predicate),
                callback: Box::new(callback),
            });
        HandlerHandle(id)
    }

    pub fn remove_node_handler(&self, handle: HandlerHandle) -> bool {
        let mut handlers = self.node_handlers.write().expect("handler lock");
        let before = handlers.len();
        handlers.retain(|h| h.id != handle.0);
        handlers.len() < before
    }

    fn run_node_handlers(&self, node: &Node) -> bool {
        let handlers = self.node_handlers.read().expect("handler lock");
        let mut handled = false;
        for h in handlers.iter() {
            if (h.predicate)(node) {
                (h.callback)(node);
                handled = true;
            }
        }
        handled
    }

    // -- lifecycle ---------------------------------------------------------

    /// Connects and runs until disconnected or shut down, reconnecting with
    /// exponential backoff when enabled.
    pub async fn run(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Client", "run called while already running");
            return;
        }
        while self.is_running.load(Ordering::Relaxed) {
            self.expected_disconnect.store(false, Ordering::Relaxed);

            match self.connect().await {
                Ok(()) => {
                    if let Err(e) = self.read_loop().await {
                        warn!(target: "Client", "connection lost: {e}");
                    }
                    self.cleanup_connection().await;
                }
                Err(e) => error!(target: "Client", "connect failed: {e}"),
            }

            if !self.enable_auto_reconnect.load(Ordering::Relaxed)
                || !self.is_running.load(Ordering::Relaxed)
            {
                break;
            }
            let errors = self.reconnect_errors.fetch_add(1, Ordering::SeqCst);
            let delay = Duration::from_secs((1u64 << errors.min(9)).min(300));
            info!(target: "Client", "reconnecting in {delay:?} (attempt {})", errors + 1);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.notified() => break,
            }
        }
        self.is_running.store(false, Ordering::Relaxed);
        info!(target: "Client", "run loop finished");
    }

    /// Opens the socket, performs the Noise handshake and starts the writer
    /// and keepalive tasks.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }

        let (mut frame_socket, mut frames_rx) =
            FrameSocket::connect(&self.config.endpoint, &self.config.origin).await?;
        let device = self.device.read().await.clone();
        let noise = Arc::new(
            do_handshake(&device, &self.config, &mut frame_socket, &mut frames_rx).await?,
        );

        let (writer_tx, writer_rx) = mpsc::channel::<Vec<u8>>(32);
        *self.noise_socket.lock().expect("socket lock") = Some(noise.clone());
        *self.writer_tx.lock().expect("writer lock") = Some(writer_tx);
        *self.frames_rx.lock().await = Some(frames_rx);

        tokio::spawn(writer_loop(frame_socket, noise, writer_rx));
        let keepalive_client = self.clone();
        tokio::spawn(async move { keepalive_client.keepalive_loop().await });
        Ok(())
    }

    /// Intentional disconnect; does not emit `LoggedOut`.
    pub async fn disconnect(&self) {
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.is_running.store(false, Ordering::Relaxed);
        self.shutdown.notify_waiters();
        self.cleanup_connection().await;
        self.dispatch_event(Event::Disconnected(Disconnected {
            reason: DisconnectReason::Intentional,
        }));
    }

    /// Unlinks this device from the account and stops reconnecting.
    pub async fn logout(&self) -> Result<(), ClientError> {
        use crate::binary::NodeContent;
        use crate::request::{InfoQuery, InfoQueryType};

        let own = self.own_jid().await.ok_or(ClientError::NotLoggedIn)?;
        let remove = Node::new("remove-companion-device")
            .attr("jid", own)
            .attr("reason", "user_initiated");
        self.send_iq(InfoQuery {
            namespace: "md",
            query_type: InfoQueryType::Set,
            to: crate::types::SERVER_JID.clone(),
            target: None,
            id: None,
            content: NodeContent::Children(vec![remove]),
            timeout: None,
        })
        .await?;

        self.enable_auto_reconnect.store(false, Ordering::Relaxed);
        self.dispatch_event(Event::LoggedOut(LoggedOut {
            reason: LogoutReason::UserInitiated,
        }));
        self.disconnect().await;
        Ok(())
    }

    pub(crate) async fn cleanup_connection(&self) {
        self.is_logged_in.store(false, Ordering::Relaxed);
        *self.noise_socket.lock().expect("socket lock") = None;
        // Dropping the sender ends the writer task, which closes the socket.
        *self.writer_tx.lock().expect("writer lock") = None;
        *self.frames_rx.lock().await = None;
        self.fail_all_pending();
    }

    /// The reader: owns the Noise read side for the life of the connection.
    async fn read_loop(self: &Arc<Self>) -> Result<(), ClientError> {
        let mut frames_rx = self
            .frames_rx
            .lock()
            .await
            .take()
            .ok_or(ClientError::NotConnected)?;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    debug!(target: "Client", "reader shutting down");
                    return Ok(());
                }
                frame = frames_rx.recv() => {
                    match frame {
                        Some(frame) => self.process_frame(&frame).await?,
                        None => {
                            if self.expected_disconnect.load(Ordering::Relaxed) {
                                return Ok(());
                            }
                            self.dispatch_event(Event::Disconnected(Disconnected {
                                reason: DisconnectReason::Network("socket closed".into()),
                            }));
                            return Err(SocketError::Closed.into());
                        }
                    }
                }
            }
        }
    }

    async fn process_frame(self: &Arc<Self>, frame: &[u8]) -> Result<(), ClientError> {
        let noise = self
            .noise_socket
            .lock()
            .expect("socket lock")
            .clone()
            .ok_or(ClientError::NotConnected)?;

        // An AEAD failure here is unrecoverable by design: counters never
        // skip ahead.
        let plaintext = noise.decrypt_frame(frame)?;
        match unmarshal(&plaintext) {
            Ok(node) => self.process_node(node).await,
            Err(e) => {
                warn!(target: "Client/Recv", "failed to decode frame: {e}");
                Ok(())
            }
        }
    }

    pub(crate) async fn process_node(self: &Arc<Self>, node: Node) -> Result<(), ClientError> {
        debug!(target: "Client/Recv", "{node}");

        match node.tag.as_str() {
            "xmlstreamend" => {
                warn!(target: "Client", "received xmlstreamend, treating as disconnect");
                self.shutdown.notify_waiters();
            }
            "success" => self.handle_success(&node).await,
            "failure" => self.handle_connect_failure(&node).await,
            "stream:error" => self.handle_stream_error(&node).await,
            "iq" => {
                if self.complete_response(&node) {
                    return Ok(());
                }
                if self.handle_ping(&node).await || crate::pair::handle_pair_iq(self, &node).await {
                    return Ok(());
                }
                if !self.run_node_handlers(&node) {
                    warn!(target: "Client", "unhandled iq: {node}");
                }
            }
            "ack" => {
                self.complete_response(&node);
            }
            "receipt" => self.handle_receipt(&node).await,
            "message" => self.handle_message(&node).await,
            "notification" => self.handle_notification(&node).await,
            "presence" => self.handle_presence(&node),
            "chatstate" => self.handle_chatstate(&node),
            _ => {
                if !self.run_node_handlers(&node) {
                    warn!(target: "Client", "unknown top-level node: {node}");
                }
            }
        }
        Ok(())
    }

    async fn handle_ping(&self, node: &Node) -> bool {
        if node.attr_str("type") != Some("get") || node.child_by_tag("ping").is_none() {
            return false;
        }
        let mut pong = Node::new("iq").attr("type", "result");
        if let Some(id) = node.attr_str("id") {
            pong.set_attr("id", id);
        }
        if let Some(from) = node.attr_jid("from") {
            pong.set_attr("to", from);
        }
        if let Err(e) = self.send_node(pong).await {
            warn!(target: "Client", "failed to send pong: {e}");
        }
        true
    }

    async fn handle_success(self: &Arc<Self>, node: &Node) {
        info!(target: "Client", "authenticated");
        self.is_logged_in.store(true, Ordering::Relaxed);
        let is_reconnect = self.reconnect_errors.swap(0, Ordering::Relaxed) > 0;

        let lid = node.attr_jid("lid");
        let push_name = node.attr_str("pushname").map(str::to_string);
        {
            let mut device = self.device.write().await;
            let mut dirty = false;
            if let Some(lid) = lid {
                if device.lid.as_ref() != Some(&lid) {
                    device.lid = Some(lid);
                    dirty = true;
                }
            }
            if let Some(name) = push_name {
                if device.push_name != name {
                    device.push_name = name;
                    dirty = true;
                }
            }
            if dirty {
                if let Err(e) = self.store.save_device(&device) {
                    warn!(target: "Client", "failed to persist device update: {e}");
                }
            }
        }

        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.set_passive(false).await {
                warn!(target: "Client", "post-connect passive iq failed: {e}");
            }
            if let Err(e) = client.send_presence(true).await {
                debug!(target: "Client", "initial presence not sent: {e}");
            }
            if let Err(e) = client.refill_pre_keys_if_needed().await {
                warn!(target: "Client", "prekey refill failed: {e}");
            }
            client.dispatch_event(Event::Connected(Connected { is_reconnect }));
        });
    }

    async fn handle_stream_error(&self, node: &Node) {
        self.is_logged_in.store(false, Ordering::Relaxed);
        let code = node.attr_str("code").unwrap_or("");
        let conflict = node
            .child_by_tag("conflict")
            .and_then(|c| c.attr_str("type"))
            .unwrap_or("");

        match (code, conflict) {
            ("515", _) => {
                info!(target: "Client", "server requested stream restart");
                self.dispatch_event(Event::Disconnected(Disconnected {
                    reason: DisconnectReason::StreamRestart,
                }));
            }
            ("401", _) => {
                info!(target: "Client", "device removed, logging out");
                self.expected_disconnect.store(true, Ordering::Relaxed);
                self.enable_auto_reconnect.store(false, Ordering::Relaxed);
                self.dispatch_event(Event::LoggedOut(LoggedOut {
                    reason: LogoutReason::DeviceRemoved,
                }));
            }
            (_, "replaced") => {
                info!(target: "Client", "session replaced by another client");
                self.expected_disconnect.store(true, Ordering::Relaxed);
                self.enable_auto_reconnect.store(false, Ordering::Relaxed);
                self.dispatch_event(Event::Disconnected(Disconnected {
                    reason: DisconnectReason::Replaced,
                }));
            }
            ("503", _) => {
                info!(target: "Client", "service unavailable, will reconnect");
            }
            _ => {
                error!(target: "Client", "stream error: {node}");
            }
        }
        self.shutdown.notify_waiters();
    }

    async fn handle_connect_failure(&self, node: &Node) {
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();

        let reason = node.attr_u64("reason").unwrap_or(0) as u16;
        match reason {
            401 | 403 => {
                self.enable_auto_reconnect.store(false, Ordering::Relaxed);
                let reason = if reason == 401 {
                    LogoutReason::DeviceRemoved
                } else {
                    LogoutReason::Banned
                };
                info!(target: "Client", "connect failure {reason:?}, logging out");
                self.dispatch_event(Event::LoggedOut(LoggedOut { reason }));
            }
            405 | 503 => {
                // Transient; the run loop will retry.
                self.expected_disconnect.store(false, Ordering::Relaxed);
            }
            other => {
                warn!(target: "Client", "unhandled connect failure {other}: {node}");
                self.enable_auto_reconnect.store(false, Ordering::Relaxed);
                self.dispatch_event(Event::LoggedOut(LoggedOut {
                    reason: LogoutReason::Unknown(other),
                }));
            }
        }
    }

    fn handle_presence(&self, node: &Node) {
        let Some(from) = node.attr_jid("from") else {
            return;
        };
        let unavailable = node.attr_str("type") == Some("unavailable");
        let last_seen = node
            .attr_u64("last")
            .and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0));
        self.dispatch_event(Event::Presence(Presence {
            from,
            unavailable,
            last_seen,
        }));
    }

    fn handle_chatstate(&self, node: &Node) {
        let Some(from) = node.attr_jid("from") else {
            return;
        };
        let sender = node.attr_jid("participant").unwrap_or_else(|| from.clone());
        let Some(child) = node.get_children().first() else {
            return;
        };
        let (state, media) = match child.tag.as_str() {
            "composing" => (
                ChatPresenceState::Composing,
                child.attr_str("media").unwrap_or("").to_string(),
            ),
            "paused" => (ChatPresenceState::Paused, String::new()),
            _ => return,
        };
        self.dispatch_event(Event::ChatPresence(ChatPresence {
            chat: from,
            sender,
            state,
            media,
        }));
    }

    // -- notifications -----------------------------------------------------

    async fn handle_notification(self: &Arc<Self>, node: &Node) {
        self.send_ack(node).await;
        let ty = node.attr_str("type").unwrap_or("");
        match ty {
            "devices" => {
                if let Some(from) = node.attr_jid("from") {
                    self.device_cache.remove(&from.to_non_ad());
                    // The new device has no sender keys; redistribute on the
                    // next group send.
                    self.sender_key_shared.clear();
                    debug!(target: "Client", "invalidated device cache for {from}");
                }
            }
            "w:gp2" => self.handle_group_notification(node).await,
            "encrypt" => {
                let count = node
                    .child_by_tag("count")
                    .and_then(|c| c.attr_u64("value"))
                    .unwrap_or(0) as usize;
                if count < self.config.prekey_low_water {
                    let client = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = client.upload_pre_keys().await {
                            warn!(target: "Client", "prekey upload failed: {e}");
                        }
                    });
                }
            }
            "server_sync" => {
                for collection in node.children_by_tag("collection") {
                    let name = collection.attr_str("name").unwrap_or("").to_string();
                    let version = collection.attr_u64("version").unwrap_or(0);
                    self.dispatch_event(Event::AppState(events::AppState { name, version }));
                }
            }
            _ => debug!(target: "Client", "unhandled notification type {ty}"),
        }
    }

    async fn handle_group_notification(&self, node: &Node) {
        use crate::types::events::{GroupParticipantAction, GroupParticipantsChanged};
        let Some(group) = node.attr_jid("from") else {
            return;
        };
        for child in node.get_children() {
            let action = match child.tag.as_str() {
                "add" => GroupParticipantAction::Add,
                "remove" => GroupParticipantAction::Remove,
                "promote" => GroupParticipantAction::Promote,
                "demote" => GroupParticipantAction::Demote,
                _ => continue,
            };
            let participants: Vec<JID> = child
                .children_by_tag("participant")
                .filter_map(|p| p.attr_jid("jid"))
                .collect();

            // Membership changed: rotate our sender key on next send.
            if matches!(
                action,
                GroupParticipantAction::Add | GroupParticipantAction::Remove
            ) {
                if let Err(e) = self.rotate_own_sender_key(&group).await {
                    warn!(target: "Client", "sender key rotation failed for {group}: {e}");
                }
                for participant in &participants {
                    self.device_cache.remove(&participant.to_non_ad());
                }
            }

            self.dispatch_event(Event::GroupParticipantsChanged(GroupParticipantsChanged {
                group: group.clone(),
                action,
                participants,
            }));
        }
    }

    pub(crate) async fn send_ack(&self, node: &Node) {
        let Some(id) = node.attr_str("id") else {
            return;
        };
        let mut ack = Node::new("ack")
            .attr("class", node.tag.clone())
            .attr("id", id);
        if let Some(from) = node.attr_jid("from") {
            ack.set_attr("to", from);
        }
        if let Some(participant) = node.attr_jid("participant") {
            ack.set_attr("participant", participant);
        }
        if let Err(e) = self.send_node(ack).await {
            debug!(target: "Client", "failed to ack {}: {e}", node.tag);
        }
    }

    // -- keepalive ---------------------------------------------------------

    async fn keepalive_loop(self: Arc<Self>) {
        use crate::binary::NodeContent;
        use crate::request::{InfoQuery, InfoQueryType};

        loop {
            tokio::select! {
                _ = sleep(self.config.keepalive_interval) => {}
                _ = self.shutdown.notified() => return,
            }
            if !self.is_connected() {
                return;
            }
            let ping = InfoQuery {
                namespace: "w:p",
                query_type: InfoQueryType::Get,
                to: crate::types::SERVER_JID.clone(),
                target: None,
                id: None,
                content: NodeContent::Children(vec![Node::new("ping")]),
                timeout: Some(self.config.keepalive_timeout),
            };
            if let Err(e) = self.send_iq(ping).await {
                if self.is_connected() {
                    warn!(target: "Client", "keepalive failed ({e}), dropping connection");
                    self.shutdown.notify_waiters();
                }
                return;
            }
        }
    }

    // -- misc sends --------------------------------------------------------

    pub(crate) async fn set_passive(&self, passive: bool) -> Result<(), ClientError> {
        use crate::binary::NodeContent;
        use crate::request::{InfoQuery, InfoQueryType};

        let tag = if passive { "passive" } else { "active" };
        self.send_iq(InfoQuery {
            namespace: "passive",
            query_type: InfoQueryType::Set,
            to: crate::types::SERVER_JID.clone(),
            target: None,
            id: None,
            content: NodeContent::Children(vec![Node::new(tag)]),
            timeout: None,
        })
        .await?;
        Ok(())
    }

    /// Sends our presence; requires a push name.
    pub async fn send_presence(&self, available: bool) -> Result<(), ClientError> {
        let push_name = self.device.read().await.push_name.clone();
        if push_name.is_empty() {
            return Err(ClientError::NotLoggedIn);
        }
        let node = Node::new("presence")
            .attr("type", if available { "available" } else { "unavailable" })
            .attr("name", push_name);
        self.send_node(node).await
    }

    /// Writes a node into the outbound queue (FIFO on the wire).
    pub async fn send_node(&self, node: Node) -> Result<(), ClientError> {
        let tx = self
            .writer_tx
            .lock()
            .expect("writer lock")
            .clone()
            .ok_or(ClientError::NotConnected)?;
        debug!(target: "Client/Send", "{node}");
        tx.send(marshal(&node))
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

/// Owns the write side: drains the queue in order, encrypts, sends.
async fn writer_loop(
    mut frame_socket: FrameSocket,
    noise: Arc<NoiseSocket>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(payload) = rx.recv().await {
        let frame = match noise.encrypt_frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                error!(target: "Client/Send", "frame encryption failed: {e}");
                break;
            }
        };
        if let Err(e) = frame_socket.send_frame(&frame).await {
            warn!(target: "Client/Send", "socket write failed: {e}");
            break;
        }
    }
    frame_socket.close().await;
    debug!(target: "Client/Send", "writer finished");
}

/// Lowercase base32 of arbitrary bytes, used for request-id prefixes.
pub(crate) fn base32_token(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity(bytes.len() * 8 / 5 + 1);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[(acc >> bits) as usize & 31] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[(acc << (5 - bits)) as usize & 31] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_client() -> Arc<Client> {
        Arc::new(Client::new(Arc::new(MemoryStore::new()), ClientConfig::default()).unwrap())
    }

    #[test]
    fn base32_token_has_expected_length() {
        // 5 bytes = 40 bits = 8 base32 chars.
        assert_eq!(base32_token(&[0xde, 0xad, 0xbe, 0xef, 0x01]).len(), 8);
        assert_eq!(base32_token(&[]), "");
    }

    #[test]
    fn event_handlers_register_and_remove() {
        let client = test_client();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let handle = client.add_event_handler(Box::new(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        client.dispatch_event(Event::Connected(Connected {
            is_reconnect: false,
        }));
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        assert!(client.remove_event_handler(handle));
        assert!(!client.remove_event_handler(handle));
        client.dispatch_event(Event::Connected(Connected {
            is_reconnect: false,
        }));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn recent_sent_cache_evicts_fifo() {
        let mut cache = RecentSentCache::default();
        let chat: JID = "1@s.whatsapp.net".parse().unwrap();
        for i in 0..300 {
            cache.insert(chat.clone(), format!("id{i}"), vec![i as u8]);
        }
        assert!(cache.get(&chat, "id0").is_none());
        assert!(cache.get(&chat, "id299").is_some());
    }

    #[test]
    fn recent_id_set_detects_duplicates() {
        let mut set = RecentIdSet::default();
        let sender: JID = "1@s.whatsapp.net".parse().unwrap();
        assert!(set.insert(sender.clone(), "a".into()));
        assert!(!set.insert(sender.clone(), "a".into()));
        assert!(set.insert(sender, "b".into()));
    }

    #[test]
    fn fresh_client_is_disconnected_and_unpaired() {
        let client = test_client();
        assert!(!client.is_connected());
        assert!(!client.is_logged_in());
    }

    #[tokio::test]
    async fn send_node_without_connection_fails() {
        let client = test_client();
        let err = client.send_node(Node::new("presence")).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }
}
