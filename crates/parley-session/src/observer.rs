use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parley_types::{Annotation, ConnectionStatus, Message, MessageId, OverflowError};

/// Receives session events. Every method defaults to a no-op.
///
/// Callbacks run on the observer's own task and should return quickly;
/// while one is running, that observer's queue fills up.
pub trait SessionObserver: Send + Sync + 'static {
    fn on_message(&self, _message: &Message) {}

    fn on_annotation(&self, _channel: &str, _message_id: MessageId, _annotation: &Annotation) {}

    fn on_status(&self, _status: ConnectionStatus) {}

    /// This observer fell behind and lost the oldest queued events.
    fn on_overflow(&self, _error: OverflowError) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Message(Message),
    Annotation {
        channel: String,
        message_id: MessageId,
        annotation: Annotation,
    },
    Status(ConnectionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Fan-out to observers. Each observer drains its own bounded queue.
pub(crate) struct Listeners {
    tx: Mutex<Option<broadcast::Sender<SessionEvent>>>,
    handles: Mutex<HashMap<ListenerId, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Listeners {
    /// Queues hold `capacity` events, rounded up to a power of two.
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn add(&self, observer: Arc<dyn SessionObserver>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let Some(rx) = self.tx.lock().as_ref().map(|tx| tx.subscribe()) else {
            debug!(?id, "listener added after close, it will receive nothing");
            return id;
        };
        let handle = tokio::spawn(drain(id, rx, observer));
        self.handles.lock().insert(id, handle);
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        match self.handles.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Stop accepting events. Observers drain what is queued and their
    /// tasks exit.
    pub(crate) fn close(&self) {
        self.tx.lock().take();
        self.handles.lock().retain(|_, handle| !handle.is_finished());
    }
}

async fn drain(
    id: ListenerId,
    mut rx: broadcast::Receiver<SessionEvent>,
    observer: Arc<dyn SessionObserver>,
) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::Message(message)) => observer.on_message(&message),
            Ok(SessionEvent::Annotation {
                channel,
                message_id,
                annotation,
            }) => observer.on_annotation(&channel, message_id, &annotation),
            Ok(SessionEvent::Status(status)) => observer.on_status(status),
            Err(RecvError::Lagged(dropped)) => {
                warn!(?id, dropped, "observer fell behind, oldest events dropped");
                observer.on_overflow(OverflowError { dropped });
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!(?id, "listener stopped");
}
