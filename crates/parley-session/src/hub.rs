//! In-process transport hub.
//!
//! `MemoryHub` plays the server: it verifies tokens, assigns per-channel
//! message ids and fans events out to every link subscribed to a channel.
//! `MemoryTransport` is one client's link to it. The hub also exposes fault
//! injection for exercising reconnect paths.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use parley_auth::{TokenVerifier, VerifiedToken};
use parley_types::{
    Annotation, AuthError, LinkStatus, Message, MessageId, Token, TransportEvent,
    validate_channel_name,
};

use crate::transport::{AnnotationRequest, EventStream, Transport, TransportError};

#[derive(Default)]
struct ChannelHistory {
    next_id: u64,
    /// Ascending by id.
    messages: Vec<Message>,
}

struct Connection {
    identity: String,
    subscriptions: HashSet<String>,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

struct HubInner {
    verifier: Arc<dyn TokenVerifier>,
    /// Lock order: `channels` before `connections`.
    channels: Mutex<HashMap<String, ChannelHistory>>,
    connections: Mutex<HashMap<u64, Connection>>,
    next_conn: AtomicU64,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU64,
    offline: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                verifier,
                channels: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                next_conn: AtomicU64::new(1),
                failing_connects: AtomicU32::new(0),
                connect_attempts: AtomicU64::new(0),
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// A new client link to this hub.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(&self.inner),
            conn: Mutex::new(None),
        }
    }

    /// Drop every open link. Returns how many were dropped.
    pub fn sever_all(&self, reason: &str) -> usize {
        self.sever_where(reason, |_| true)
    }

    /// Drop the links opened by `identity`.
    pub fn sever(&self, identity: &str, reason: &str) -> usize {
        self.sever_where(reason, |conn| conn.identity == identity)
    }

    fn sever_where(&self, reason: &str, pred: impl Fn(&Connection) -> bool) -> usize {
        let mut connections = self.inner.connections.lock();
        let doomed: Vec<u64> = connections
            .iter()
            .filter(|(_, conn)| pred(conn))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            if let Some(conn) = connections.remove(id) {
                let _ = conn.tx.send(TransportEvent::Status(LinkStatus::Down {
                    reason: reason.to_string(),
                }));
            }
        }
        info!(count = doomed.len(), reason, "severed links");
        doomed.len()
    }

    /// Make the next `n` connect attempts fail with a network error.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// While offline every client request fails with a network error.
    /// Open links stay open.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
        info!(offline, "hub availability changed");
    }

    /// Publish as `sender_id` without a token, as another server-side
    /// producer would.
    pub fn inject(&self, channel: &str, sender_id: &str, body: &str) -> MessageId {
        self.inner.append(channel, sender_id, body)
    }

    /// Deliver a stored message again to current subscribers.
    pub fn redeliver(&self, channel: &str, message_id: MessageId) -> bool {
        let channels = self.inner.channels.lock();
        let Some(message) = channels
            .get(channel)
            .and_then(|h| h.messages.iter().find(|m| m.id == message_id))
        else {
            return false;
        };
        self.inner
            .fan_out(channel, TransportEvent::Message(message.clone()));
        true
    }

    /// Channels subscribed by any link opened as `identity`.
    pub fn subscriptions_of(&self, identity: &str) -> BTreeSet<String> {
        self.inner
            .connections
            .lock()
            .values()
            .filter(|conn| conn.identity == identity)
            .flat_map(|conn| conn.subscriptions.iter().cloned())
            .collect()
    }

    /// Connect calls received, successful or not.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn history_len(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map_or(0, |h| h.messages.len())
    }
}

impl HubInner {
    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Network("hub is offline".into()));
        }
        Ok(())
    }

    fn verify(&self, token: &Token) -> Result<VerifiedToken, TransportError> {
        self.verifier.verify(&token.value).map_err(|e| match e {
            AuthError::Denied(reason) => TransportError::Denied(reason),
            AuthError::Expired => TransportError::Denied("token expired".into()),
            AuthError::Network(reason) => TransportError::Network(reason),
        })
    }

    fn check_channel(channel: &str) -> Result<(), TransportError> {
        validate_channel_name(channel).map_err(|e| TransportError::InvalidChannel(e.to_string()))
    }

    /// Send `event` to every link subscribed to `channel`. Callers hold the
    /// `channels` lock so per-channel order matches id order.
    fn fan_out(&self, channel: &str, event: TransportEvent) {
        let connections = self.connections.lock();
        for conn in connections
            .values()
            .filter(|c| c.subscriptions.contains(channel))
        {
            let _ = conn.tx.send(event.clone());
        }
    }

    fn append(&self, channel: &str, sender_id: &str, body: &str) -> MessageId {
        let mut channels = self.channels.lock();
        let history = channels.entry(channel.to_string()).or_default();
        history.next_id += 1;
        let message = Message {
            id: MessageId(history.next_id),
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
            annotations: Vec::new(),
        };
        let id = message.id;
        history.messages.push(message.clone());
        trace!(channel, %id, sender_id, "message accepted");
        self.fan_out(channel, TransportEvent::Message(message));
        id
    }
}

/// One client's link to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<HubInner>,
    conn: Mutex<Option<u64>>,
}

impl MemoryTransport {
    fn conn_id(&self) -> Result<u64, TransportError> {
        let id = (*self.conn.lock()).ok_or(TransportError::NotConnected)?;
        if self.hub.connections.lock().contains_key(&id) {
            Ok(id)
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn close_link(&self) {
        let id = self.conn.lock().take();
        if let Some(id) = id {
            self.hub.connections.lock().remove(&id);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, token: &Token) -> Result<EventStream, TransportError> {
        self.hub.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.hub.check_online()?;
        let failing = self
            .hub
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::Network("handshake refused".into()));
        }
        let verified = self.hub.verify(token)?;

        self.close_link();
        let id = self.hub.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Status(LinkStatus::Up));
        self.hub.connections.lock().insert(
            id,
            Connection {
                identity: verified.identity.clone(),
                subscriptions: HashSet::new(),
                tx,
            },
        );
        *self.conn.lock() = Some(id);
        debug!(conn = id, identity = %verified.identity, "link opened");

        let events = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
        Ok(events.boxed())
    }

    async fn subscribe(&self, token: &Token, channels: &[String]) -> Result<(), TransportError> {
        let id = self.conn_id()?;
        self.hub.check_online()?;
        let verified = self.hub.verify(token)?;
        for channel in channels {
            HubInner::check_channel(channel)?;
            if !verified.grants.can_read(channel) {
                return Err(TransportError::Denied(format!("no read grant for {}", channel)));
            }
        }

        let mut connections = self.hub.connections.lock();
        let conn = connections.get_mut(&id).ok_or(TransportError::NotConnected)?;
        conn.subscriptions.extend(channels.iter().cloned());
        debug!(conn = id, ?channels, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[String]) -> Result<(), TransportError> {
        let id = self.conn_id()?;
        let mut connections = self.hub.connections.lock();
        let conn = connections.get_mut(&id).ok_or(TransportError::NotConnected)?;
        for channel in channels {
            conn.subscriptions.remove(channel);
        }
        debug!(conn = id, ?channels, "unsubscribed");
        Ok(())
    }

    async fn publish(
        &self,
        token: &Token,
        channel: &str,
        body: &str,
    ) -> Result<MessageId, TransportError> {
        self.conn_id()?;
        self.hub.check_online()?;
        let verified = self.hub.verify(token)?;
        HubInner::check_channel(channel)?;
        if !verified.grants.can_write(channel) {
            return Err(TransportError::Denied(format!("no write grant for {}", channel)));
        }
        Ok(self.hub.append(channel, &verified.identity, body))
    }

    async fn annotate(
        &self,
        token: &Token,
        channel: &str,
        message_id: MessageId,
        request: AnnotationRequest,
    ) -> Result<(), TransportError> {
        self.conn_id()?;
        self.hub.check_online()?;
        let verified = self.hub.verify(token)?;
        HubInner::check_channel(channel)?;
        if !verified.grants.can_read(channel) {
            return Err(TransportError::Denied(format!("no read grant for {}", channel)));
        }

        let annotation = Annotation::new(request.kind, verified.identity, request.value);
        let mut channels = self.hub.channels.lock();
        let message = channels
            .get_mut(channel)
            .and_then(|h| h.messages.iter_mut().find(|m| m.id == message_id))
            .ok_or(TransportError::NotFound(message_id))?;
        message.attach(annotation.clone());

        // Duplicates are broadcast too; receivers dedupe.
        self.hub.fan_out(
            channel,
            TransportEvent::Annotation {
                channel: channel.to_string(),
                message_id,
                annotation,
            },
        );
        Ok(())
    }

    async fn history(
        &self,
        token: &Token,
        channel: &str,
        after: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, TransportError> {
        self.conn_id()?;
        self.hub.check_online()?;
        let verified = self.hub.verify(token)?;
        HubInner::check_channel(channel)?;
        if !verified.grants.can_read(channel) {
            return Err(TransportError::Denied(format!("no read grant for {}", channel)));
        }

        let channels = self.hub.channels.lock();
        let Some(history) = channels.get(channel) else {
            return Ok(Vec::new());
        };
        let page = match after {
            Some(after) => history
                .messages
                .iter()
                .filter(|m| m.id > after)
                .take(limit)
                .cloned()
                .collect(),
            None => {
                let skip = history.messages.len().saturating_sub(limit);
                history.messages.iter().skip(skip).cloned().collect()
            }
        };
        Ok(page)
    }

    async fn range(
        &self,
        token: &Token,
        channel: &str,
        from: MessageId,
        through: MessageId,
    ) -> Result<Vec<Message>, TransportError> {
        self.conn_id()?;
        self.hub.check_online()?;
        let verified = self.hub.verify(token)?;
        HubInner::check_channel(channel)?;
        if !verified.grants.can_read(channel) {
            return Err(TransportError::Denied(format!("no read grant for {}", channel)));
        }

        let channels = self.hub.channels.lock();
        Ok(channels
            .get(channel)
            .map(|history| {
                history
                    .messages
                    .iter()
                    .filter(|m| m.id >= from && m.id <= through)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn disconnect(&self) {
        self.close_link();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close_link();
    }
}
