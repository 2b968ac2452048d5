use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use parley_auth::TokenCache;
use parley_store::{AnnotateOutcome, AppendOutcome, MessageStore};
use parley_types::{
    Annotation, AnnotationKind, AuthError, ConnectionError, ConnectionStatus, LinkStatus, Message,
    MessageId, NotFoundError, PublishError, SessionError, Token, TransportEvent,
    validate_channel_name,
};

use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::observer::{ListenerId, Listeners, SessionEvent, SessionObserver};
use crate::registry::ChannelRegistry;
use crate::transport::{AnnotationRequest, EventStream, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal. Reported to observers as `Disconnected`.
    Closed,
}

impl SessionState {
    /// What observers are told. `Connecting` is not reported.
    pub fn status(self) -> Option<ConnectionStatus> {
        match self {
            Self::Connected => Some(ConnectionStatus::Connected),
            Self::Reconnecting => Some(ConnectionStatus::Reconnecting),
            Self::Disconnected | Self::Closed => Some(ConnectionStatus::Disconnected),
            Self::Connecting => None,
        }
    }
}

/// A chat session: one transport link, one token cache and the channels
/// subscribed over that link.
///
/// Dropping the client stops its background tasks; call [`close`] to also
/// release the transport cleanly.
///
/// [`close`]: SessionClient::close
pub struct SessionClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenCache>,
    registry: Mutex<ChannelRegistry>,
    store: Arc<MessageStore>,
    listeners: Listeners,
    state: watch::Sender<SessionState>,
    reported: Mutex<ConnectionStatus>,
    /// Inbound events held back per channel while its history is fetched.
    /// Also serializes every write into the store.
    syncing: Mutex<HashMap<String, Vec<TransportEvent>>>,
    /// Held across transport subscription changes and the handshake, so a
    /// channel subscribed during a reconnect is never missed.
    link: tokio::sync::Mutex<()>,
    /// One connect or reconnect episode at a time.
    connect_gate: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    refresh_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionClient {
    pub fn new(transport: Arc<dyn Transport>, tokens: Arc<TokenCache>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                store: Arc::new(MessageStore::with_capacity(config.store_capacity)),
                listeners: Listeners::new(config.observer_capacity),
                config,
                transport,
                tokens,
                registry: Mutex::new(ChannelRegistry::new()),
                state,
                reported: Mutex::new(ConnectionStatus::Disconnected),
                syncing: Mutex::new(HashMap::new()),
                link: tokio::sync::Mutex::new(()),
                connect_gate: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                refresh_started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    // -- Lifecycle --

    /// Connect and subscribe every queued channel.
    ///
    /// Transport failures are retried with backoff until the link is up or
    /// the session is closed. Authorization failures return immediately.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let _gate = inner.connect_gate.lock().await;
        match inner.current() {
            SessionState::Closed => return Err(ConnectionError::Closed),
            SessionState::Connected => return Ok(()),
            _ => {}
        }

        inner.transition(SessionState::Connecting);
        info!(identity = %inner.tokens.identity(), "connecting");
        let mut backoff = Backoff::new(inner.config.backoff);
        loop {
            let attempt = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => return Err(ConnectionError::Closed),
                attempt = inner.handshake() => attempt,
            };
            match attempt {
                Ok(events) => {
                    self.start(events);
                    return Ok(());
                }
                Err(ConnectionError::Auth(e)) => {
                    error!(error = %e, "connect refused");
                    inner.transition(SessionState::Disconnected);
                    return Err(ConnectionError::Auth(e));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, attempt = backoff.attempts(), ?delay, "connect failed, retrying");
                    tokio::select! {
                        biased;
                        _ = inner.shutdown.cancelled() => return Err(ConnectionError::Closed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn start(&self, events: EventStream) {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock();
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(tokio::spawn(Arc::clone(inner).drive(events)));
        if !inner.refresh_started.swap(true, Ordering::SeqCst) {
            tasks.push(inner.tokens.spawn_refresh_task(inner.shutdown.child_token()));
        }
    }

    /// Tear the session down. Idempotent; the session cannot be reused.
    pub async fn close(&self) {
        let inner = &self.inner;
        if !inner.transition(SessionState::Closed) {
            return;
        }
        inner.shutdown.cancel();

        let channels = {
            let _link = inner.link.lock().await;
            let channels = inner.registry.lock().deactivate_all();
            channels
        };
        if !channels.is_empty() {
            if let Err(e) = inner.transport.unsubscribe(&channels).await {
                debug!(error = %e, "unsubscribe on close failed");
            }
        }
        inner.transport.disconnect().await;

        for handle in inner.tasks.lock().drain(..) {
            handle.abort();
        }
        inner.listeners.close();
        info!(?channels, "session closed");
    }

    // -- Channels --

    /// Subscribe to `channel` and fetch its recent history.
    ///
    /// While not connected the channel is queued and subscribed by the next
    /// handshake. A transient transport failure keeps the channel queued and
    /// drops the link, so the receive loop reconnects and subscribes it. A
    /// denial removes it again.
    pub async fn subscribe(&self, channel: &str) -> Result<(), SessionError> {
        validate_channel_name(channel)?;
        let inner = &self.inner;
        if inner.current() == SessionState::Closed {
            return Err(SessionError::Closed);
        }

        let _link = inner.link.lock().await;
        let newly = inner.registry.lock().subscribe(channel);
        if inner.current() != SessionState::Connected {
            debug!(channel, "subscription queued until connected");
            return Ok(());
        }

        let rollback = |inner: &Inner| {
            if newly {
                inner.registry.lock().unsubscribe(channel);
            }
        };

        let token = match inner.tokens.get_token().await {
            Ok(token) => token,
            Err(e) => {
                rollback(inner);
                return Err(e.into());
            }
        };

        match inner.subscribe_channel(&token, channel).await {
            Ok(()) => {
                info!(channel, "subscribed");
                Ok(())
            }
            Err(TransportError::Denied(reason)) => {
                rollback(inner);
                warn!(channel, %reason, "subscription denied");
                Err(SessionError::Auth(AuthError::Denied(reason)))
            }
            Err(TransportError::InvalidChannel(reason)) => {
                rollback(inner);
                Err(SessionError::ChannelInvalid(reason))
            }
            Err(e) => {
                warn!(channel, error = %e, "subscribe failed, channel stays queued");
                inner.transport.disconnect().await;
                Ok(())
            }
        }
    }

    /// Stop receiving `channel`. Idempotent. The cursor is kept so a later
    /// subscribe resumes from it.
    pub async fn unsubscribe(&self, channel: &str) {
        let inner = &self.inner;
        let _link = inner.link.lock().await;
        if !inner.registry.lock().unsubscribe(channel) {
            return;
        }
        info!(channel, "unsubscribed");

        if inner.current() == SessionState::Connected {
            let channels = [channel.to_string()];
            let unsubscribe = inner.transport.unsubscribe(&channels);
            if let Err(e) = within(inner.config.connect_timeout, unsubscribe).await {
                debug!(channel, error = %e, "transport unsubscribe failed");
            }
        }
    }

    pub fn active_channels(&self) -> BTreeSet<String> {
        self.inner.registry.lock().list_active()
    }

    // -- Outbound --

    /// Publish `body` to `channel` and wait for the server-assigned id.
    ///
    /// While connecting or reconnecting, waits up to `publish_timeout` for
    /// the link to come back. Not retried once sent. The message reaches the
    /// local store through the subscription stream, if subscribed.
    pub async fn publish(&self, channel: &str, body: &str) -> Result<MessageId, PublishError> {
        validate_channel_name(channel)?;
        let inner = &self.inner;
        match inner.settled(inner.config.publish_timeout).await {
            SessionState::Connected => {}
            SessionState::Closed => return Err(PublishError::Network("session closed".into())),
            state => {
                return Err(PublishError::Network(format!(
                    "session is not connected ({:?})",
                    state
                )));
            }
        }

        let token = inner.tokens.get_token().await?;
        if !token.grants.can_write(channel) {
            return Err(PublishError::AuthDenied(format!("no write grant for {}", channel)));
        }

        let publish = inner.transport.publish(&token, channel, body);
        let id = within(inner.config.publish_timeout, publish).await?;
        debug!(channel, %id, "published");
        Ok(id)
    }

    /// Attach a message action. The applied annotation arrives back through
    /// the event stream. Waits out a reconnect like [`publish`](Self::publish).
    pub async fn annotate(
        &self,
        channel: &str,
        message_id: MessageId,
        kind: AnnotationKind,
        value: &str,
    ) -> Result<(), SessionError> {
        validate_channel_name(channel)?;
        let inner = &self.inner;
        if !inner.store.contains(channel, message_id) {
            return Err(NotFoundError {
                channel: channel.to_string(),
                message_id,
            }
            .into());
        }
        match inner.settled(inner.config.publish_timeout).await {
            SessionState::Connected => {}
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Disconnected => return Err(ConnectionError::NotConnected.into()),
            SessionState::Connecting | SessionState::Reconnecting => {
                return Err(ConnectionError::Timeout.into());
            }
        }

        let token = inner.tokens.get_token().await?;
        let request = AnnotationRequest {
            kind,
            value: value.to_string(),
        };
        let annotate = inner.transport.annotate(&token, channel, message_id, request);
        match within(inner.config.publish_timeout, annotate).await {
            Ok(()) => {
                debug!(channel, %message_id, %kind, "annotation sent");
                Ok(())
            }
            Err(TransportError::NotFound(message_id)) => Err(NotFoundError {
                channel: channel.to_string(),
                message_id,
            }
            .into()),
            Err(e) => Err(PublishError::from(e).into()),
        }
    }

    pub async fn react(&self, channel: &str, message_id: MessageId, emoji: &str) -> Result<(), SessionError> {
        self.annotate(channel, message_id, AnnotationKind::Reaction, emoji)
            .await
    }

    pub async fn flag(&self, channel: &str, message_id: MessageId, reason: &str) -> Result<(), SessionError> {
        self.annotate(channel, message_id, AnnotationKind::Flag, reason)
            .await
    }

    pub async fn soft_delete(&self, channel: &str, message_id: MessageId) -> Result<(), SessionError> {
        self.annotate(channel, message_id, AnnotationKind::Delete, "deleted")
            .await
    }

    // -- Observers --

    pub fn add_listener(&self, observer: Arc<dyn SessionObserver>) -> ListenerId {
        self.inner.listeners.add(observer)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Raw feed of the events observers receive. Bounded like an observer
    /// queue; a lagging receiver gets `RecvError::Lagged`.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.listeners.subscribe()
    }

    // -- Inspection --

    pub fn state(&self) -> SessionState {
        self.inner.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// The most recent `limit` messages of `channel`, ascending.
    pub fn messages(&self, channel: &str, limit: usize) -> Vec<Message> {
        self.inner.store.list(channel, limit)
    }

    pub fn store(&self) -> Arc<MessageStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.inner.tokens
    }

    pub fn identity(&self) -> String {
        self.inner.tokens.identity()
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait out `Connecting` and `Reconnecting` for at most `limit`. Returns
    /// the state the session settled in, or the transitional one on timeout.
    async fn settled(&self, limit: Duration) -> SessionState {
        let mut state = self.state.subscribe();
        let settle = state.wait_for(|s| {
            !matches!(s, SessionState::Connecting | SessionState::Reconnecting)
        });
        let settled = match tokio::time::timeout(limit, settle).await {
            Ok(Ok(settled)) => *settled,
            Ok(Err(_)) => SessionState::Closed,
            Err(_) => self.current(),
        };
        settled
    }

    /// Move to `next`. Refused once closed. Observers hear about status
    /// changes only.
    fn transition(&self, next: SessionState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closed || *state == next {
                return false;
            }
            from = Some(*state);
            *state = next;
            true
        });
        let Some(from) = from else {
            return false;
        };
        debug!(?from, to = ?next, "session state changed");

        if let Some(status) = next.status() {
            let mut reported = self.reported.lock();
            if *reported != status {
                *reported = status;
                self.listeners.emit(SessionEvent::Status(status));
            }
        }
        true
    }

    /// Open a link, resubscribe every active channel with catch-up, then
    /// report `Connected`.
    async fn handshake(&self) -> Result<EventStream, ConnectionError> {
        let token = self.tokens.get_token().await?;

        let _link = self.link.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        let events = match within(self.config.connect_timeout, self.transport.connect(&token)).await {
            Ok(events) => events,
            Err(TransportError::Denied(reason)) => {
                return Err(ConnectionError::Auth(AuthError::Denied(reason)));
            }
            Err(TransportError::Timeout) => return Err(ConnectionError::Timeout),
            Err(e) => return Err(ConnectionError::HandshakeFailed(e.to_string())),
        };

        let channels: Vec<String> = self.registry.lock().list_active().into_iter().collect();
        for channel in &channels {
            match self.subscribe_channel(&token, channel).await {
                Ok(()) => {}
                Err(TransportError::Denied(reason) | TransportError::InvalidChannel(reason)) => {
                    error!(channel, %reason, "channel refused on resubscribe, dropping it");
                    self.registry.lock().unsubscribe(channel);
                }
                Err(e) => {
                    self.transport.disconnect().await;
                    return Err(ConnectionError::HandshakeFailed(format!(
                        "resubscribe {}: {}",
                        channel, e
                    )));
                }
            }
        }

        if !self.transition(SessionState::Connected) {
            self.transport.disconnect().await;
            return Err(ConnectionError::Closed);
        }
        info!(channels = channels.len(), "connected");
        Ok(events)
    }

    /// Subscribe one channel on the open link and catch it up from its
    /// cursor. Live events for the channel are held back until the catch-up
    /// has been applied.
    async fn subscribe_channel(&self, token: &Token, channel: &str) -> Result<(), TransportError> {
        self.syncing.lock().entry(channel.to_string()).or_default();

        let channels = [channel.to_string()];
        let subscribe = self.transport.subscribe(token, &channels);
        if let Err(e) = within(self.config.connect_timeout, subscribe).await {
            self.finish_sync(channel, CatchUp::default());
            return Err(e);
        }

        match self.catch_up(token, channel).await {
            Ok(caught_up) => {
                debug!(
                    channel,
                    fetched = caught_up.history.len(),
                    reconciled = caught_up.window.len(),
                    "channel caught up"
                );
                self.finish_sync(channel, caught_up);
                Ok(())
            }
            Err(e) if e.is_transient() => {
                self.finish_sync(channel, CatchUp::default());
                Err(e)
            }
            Err(e) => {
                warn!(channel, error = %e, "history unavailable, continuing without it");
                self.finish_sync(channel, CatchUp::default());
                Ok(())
            }
        }
    }

    /// Fetch what `channel` missed. Without a cursor that is the latest
    /// page. With one, pages forward from it until a short page, and
    /// re-reads the locally held messages for annotations made meanwhile.
    async fn catch_up(&self, token: &Token, channel: &str) -> Result<CatchUp, TransportError> {
        let cursor = self.registry.lock().cursor(channel);
        let limit = self.config.history_fetch;
        let mut caught_up = CatchUp::default();

        if let (Some(cursor), Some(first)) = (cursor, self.store.first_id(channel)) {
            let window = self.transport.range(token, channel, first, cursor);
            caught_up.window = within(self.config.connect_timeout, window).await?;
        }

        let mut after = cursor;
        loop {
            let history = self.transport.history(token, channel, after, limit);
            let page = within(self.config.connect_timeout, history).await?;
            let full = limit > 0 && page.len() == limit;
            if let Some(last) = page.last() {
                after = Some(last.id);
            }
            caught_up.history.extend(page);
            if cursor.is_none() || !full {
                return Ok(caught_up);
            }
            trace!(channel, ?after, "history page full, fetching the next");
        }
    }

    fn finish_sync(&self, channel: &str, caught_up: CatchUp) {
        let mut syncing = self.syncing.lock();
        let held = syncing.remove(channel).unwrap_or_default();
        for message in caught_up.window {
            for annotation in message.annotations {
                self.apply_annotation(channel.to_string(), message.id, annotation);
            }
        }
        for message in caught_up.history {
            self.apply_message(message);
        }
        for event in held {
            self.apply_event(event);
        }
    }

    fn on_live_event(&self, event: TransportEvent) {
        let mut syncing = self.syncing.lock();
        if let Some(held) = event.channel().and_then(|c| syncing.get_mut(c)) {
            held.push(event);
            return;
        }
        self.apply_event(event);
    }

    fn apply_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => self.apply_message(message),
            TransportEvent::Annotation {
                channel,
                message_id,
                annotation,
            } => self.apply_annotation(channel, message_id, annotation),
            TransportEvent::Status(_) => {}
        }
    }

    fn apply_message(&self, message: Message) {
        let channel = message.channel.clone();
        if !self.registry.lock().is_active(&channel) {
            trace!(channel, id = %message.id, "dropping message for inactive channel");
            return;
        }
        if let AppendOutcome::Stored = self.store.append(&channel, message.clone()) {
            self.registry.lock().advance_cursor(&channel, message.id);
            self.listeners.emit(SessionEvent::Message(message));
        }
    }

    fn apply_annotation(&self, channel: String, message_id: MessageId, annotation: Annotation) {
        if !self.registry.lock().is_active(&channel) {
            return;
        }
        match self.store.annotate(&channel, message_id, annotation.clone()) {
            Ok(AnnotateOutcome::Applied) => self.listeners.emit(SessionEvent::Annotation {
                channel,
                message_id,
                annotation,
            }),
            Ok(AnnotateOutcome::Duplicate) => {
                trace!(channel, %message_id, "duplicate annotation ignored");
            }
            Err(e) => debug!(error = %e, "annotation for a message not held locally"),
        }
    }

    /// Receive loop. Owns reconnection after the first successful connect.
    async fn drive(self: Arc<Self>, mut events: EventStream) {
        loop {
            let Some(reason) = self.pump(&mut events).await else {
                break;
            };
            warn!(%reason, "link lost");
            match self.recover().await {
                Ok(next) => events = next,
                Err(ConnectionError::Closed) => break,
                Err(e) => {
                    error!(error = %e, "giving up on the link");
                    break;
                }
            }
        }
        debug!("receive loop stopped");
    }

    /// Apply events until the link drops (returning why) or the session
    /// shuts down.
    async fn pump(&self, events: &mut EventStream) -> Option<String> {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                event = events.next() => event,
            };
            match event {
                Some(TransportEvent::Status(LinkStatus::Up)) => trace!("link up"),
                Some(TransportEvent::Status(LinkStatus::Down { reason })) => return Some(reason),
                Some(event) => self.on_live_event(event),
                None => return Some("event stream ended".into()),
            }
        }
    }

    async fn recover(&self) -> Result<EventStream, ConnectionError> {
        let _gate = self.connect_gate.lock().await;
        if !self.transition(SessionState::Reconnecting) {
            return Err(ConnectionError::Closed);
        }

        let started = Instant::now();
        let mut backoff = Backoff::new(self.config.backoff);
        loop {
            if let Some(max) = self.config.max_retry_duration {
                if started.elapsed() >= max {
                    self.transition(SessionState::Disconnected);
                    return Err(ConnectionError::RetriesExhausted(max));
                }
            }

            let delay = backoff.next_delay();
            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(ConnectionError::Closed),
                attempt = async {
                    tokio::time::sleep(delay).await;
                    self.handshake().await
                } => attempt,
            };
            match attempt {
                Ok(events) => {
                    info!(attempts = backoff.attempts(), "reconnected");
                    return Ok(events);
                }
                Err(ConnectionError::Auth(e)) => {
                    self.transition(SessionState::Disconnected);
                    return Err(ConnectionError::Auth(e));
                }
                Err(ConnectionError::Closed) => return Err(ConnectionError::Closed),
                Err(e) => {
                    debug!(error = %e, attempt = backoff.attempts(), "reconnect attempt failed");
                }
            }
        }
    }
}

/// What a (re)subscribed channel missed while it was not on a link.
#[derive(Default)]
struct CatchUp {
    /// Locally held messages as the server has them now.
    window: Vec<Message>,
    /// Messages after the cursor, ascending.
    history: Vec<Message>,
}

/// Bound a transport call by `limit`.
async fn within<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(TransportError::Timeout))
}
