//! End-to-end session behavior against the in-memory hub.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use parley_auth::{FixedIdentity, JwtAuthorizer, TokenCache, TokenConfig};
use parley_session::{
    BackoffConfig, MemoryHub, SessionClient, SessionConfig, SessionObserver, SessionState,
};
use parley_types::{
    Annotation, AnnotationKind, AuthError, ConnectionError, ConnectionStatus, Message, MessageId,
    Permissions, PublishError, ResourceGrants, SessionError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Records everything an observer hears. On every `Connected` it also
/// snapshots what the hub has subscribed for this identity.
struct Recorder {
    hub: MemoryHub,
    identity: String,
    messages: Mutex<Vec<Message>>,
    annotations: Mutex<Vec<(String, MessageId, Annotation)>>,
    statuses: Mutex<Vec<ConnectionStatus>>,
    subscribed_when_connected: Mutex<Vec<BTreeSet<String>>>,
}

impl SessionObserver for Recorder {
    fn on_message(&self, message: &Message) {
        self.messages.lock().push(message.clone());
    }

    fn on_annotation(&self, channel: &str, message_id: MessageId, annotation: &Annotation) {
        self.annotations
            .lock()
            .push((channel.to_string(), message_id, annotation.clone()));
    }

    fn on_status(&self, status: ConnectionStatus) {
        if status == ConnectionStatus::Connected {
            let subs = self.hub.subscriptions_of(&self.identity);
            self.subscribed_when_connected.lock().push(subs);
        }
        self.statuses.lock().push(status);
    }
}

struct World {
    auth: Arc<JwtAuthorizer>,
    hub: MemoryHub,
}

impl World {
    fn new() -> Self {
        init_tracing();
        let auth = Arc::new(JwtAuthorizer::new("test-secret"));
        let hub = MemoryHub::new(auth.clone());
        Self { auth, hub }
    }

    fn session(&self, identity: &str) -> (SessionClient, Arc<Recorder>) {
        self.session_with(identity, ResourceGrants::all_channels(Permissions::READ_WRITE), fast_config())
    }

    fn session_with(
        &self,
        identity: &str,
        grants: ResourceGrants,
        config: SessionConfig,
    ) -> (SessionClient, Arc<Recorder>) {
        let tokens = TokenCache::new(
            self.auth.clone(),
            Arc::new(FixedIdentity::new(identity)),
            TokenConfig {
                grants,
                ..TokenConfig::default()
            },
        );
        let client = SessionClient::new(Arc::new(self.hub.transport()), Arc::new(tokens), config);
        let recorder = Arc::new(Recorder {
            hub: self.hub.clone(),
            identity: identity.to_string(),
            messages: Mutex::new(Vec::new()),
            annotations: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            subscribed_when_connected: Mutex::new(Vec::new()),
        });
        client.add_listener(recorder.clone());
        (client, recorder)
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        backoff: BackoffConfig {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(40),
        },
        max_retry_duration: Some(Duration::from_secs(5)),
        connect_timeout: Duration::from_secs(1),
        publish_timeout: Duration::from_secs(1),
        ..SessionConfig::default()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_state(client: &SessionClient, target: SessionState) {
    let mut state = client.watch_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", target))
        .unwrap();
}

fn ids(messages: &[Message]) -> Vec<u64> {
    messages.iter().map(|m| m.id.0).collect()
}

fn channel_set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn publish_needs_a_connection_and_queued_channels_subscribe_on_connect() {
    let world = World::new();
    let (alice, recorder) = world.session("alice");

    alice.subscribe("default").await.unwrap();
    assert_eq!(alice.state(), SessionState::Disconnected);
    assert!(world.hub.subscriptions_of("alice").is_empty());

    assert!(matches!(
        alice.publish("default", "too early").await,
        Err(PublishError::Network(_))
    ));

    alice.connect().await.unwrap();
    assert_eq!(alice.state(), SessionState::Connected);
    assert_eq!(world.hub.subscriptions_of("alice"), channel_set(&["default"]));
    assert_eq!(alice.tokens().requests_issued(), 1);

    let mut last = MessageId(0);
    for body in ["one", "two", "three"] {
        let id = alice.publish("default", body).await.unwrap();
        assert!(id > last);
        last = id;
    }

    eventually("own messages echoed", || alice.messages("default", 10).len() == 3).await;
    let bodies: Vec<String> = alice
        .messages("default", 10)
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec!["one", "two", "three"]);
    eventually("connected reported", || !recorder.statuses.lock().is_empty()).await;
    assert_eq!(recorder.statuses.lock().first(), Some(&ConnectionStatus::Connected));

    alice.close().await;
}

#[tokio::test]
async fn subscribers_see_messages_in_id_order() {
    let world = World::new();
    let (alice, _) = world.session("alice");
    let (bob, bob_recorder) = world.session("bob");
    for session in [&alice, &bob] {
        session.subscribe("default").await.unwrap();
        session.connect().await.unwrap();
    }

    for i in 0..20 {
        alice.publish("default", &format!("m{}", i)).await.unwrap();
    }

    eventually("bob received all", || bob.messages("default", 100).len() == 20).await;
    assert_eq!(ids(&bob.messages("default", 100)), (1..=20).collect::<Vec<_>>());
    eventually("bob observer drained", || bob_recorder.messages.lock().len() == 20).await;
    assert_eq!(ids(&bob_recorder.messages.lock()), (1..=20).collect::<Vec<_>>());
    assert!(bob_recorder.messages.lock().iter().all(|m| m.sender_id == "alice"));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn reconnect_resubscribes_every_channel_before_reporting_connected() {
    let world = World::new();
    let (alice, recorder) = world.session("alice");
    for channel in ["a", "b", "c"] {
        alice.subscribe(channel).await.unwrap();
    }
    alice.connect().await.unwrap();

    world.hub.fail_next_connects(3);
    assert_eq!(world.hub.sever("alice", "network blip"), 1);

    eventually("reconnected", || recorder.statuses.lock().len() == 3).await;
    assert_eq!(
        *recorder.statuses.lock(),
        vec![
            ConnectionStatus::Connected,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Connected,
        ]
    );
    for subs in recorder.subscribed_when_connected.lock().iter() {
        assert_eq!(*subs, channel_set(&["a", "b", "c"]));
    }
    assert_eq!(alice.state(), SessionState::Connected);
    assert_eq!(alice.active_channels(), channel_set(&["a", "b", "c"]));
    // The cached token was still fresh, so no second grant was needed.
    assert_eq!(alice.tokens().requests_issued(), 1);

    alice.close().await;
}

#[tokio::test]
async fn messages_sent_during_an_outage_are_caught_up() {
    let world = World::new();
    let (alice, recorder) = world.session("alice");
    alice.subscribe("default").await.unwrap();
    alice.connect().await.unwrap();

    world.hub.inject("default", "bob", "before 1");
    world.hub.inject("default", "bob", "before 2");
    eventually("live messages", || alice.messages("default", 10).len() == 2).await;

    world.hub.set_offline(true);
    world.hub.sever("alice", "outage");
    eventually("reconnecting", || {
        recorder.statuses.lock().last() == Some(&ConnectionStatus::Reconnecting)
    })
    .await;
    for i in 0..3 {
        world.hub.inject("default", "bob", &format!("during {}", i));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    world.hub.set_offline(false);

    eventually("caught up", || alice.messages("default", 10).len() == 5).await;
    assert_eq!(ids(&alice.messages("default", 10)), vec![1, 2, 3, 4, 5]);
    eventually("connected again", || {
        recorder.statuses.lock().last() == Some(&ConnectionStatus::Connected)
    })
    .await;

    alice.close().await;
}

#[tokio::test]
async fn redelivered_messages_are_applied_once() {
    let world = World::new();
    let (alice, recorder) = world.session("alice");
    let (bob, _) = world.session("bob");
    alice.subscribe("default").await.unwrap();
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    let first = bob.publish("default", "hello").await.unwrap();
    eventually("first message", || alice.messages("default", 10).len() == 1).await;

    assert!(world.hub.redeliver("default", first));
    bob.publish("default", "again").await.unwrap();
    eventually("second message", || alice.messages("default", 10).len() == 2).await;

    assert_eq!(alice.store().stats().stale_dropped, 1);
    eventually("observer drained", || recorder.messages.lock().len() == 2).await;
    assert_eq!(ids(&recorder.messages.lock()), vec![1, 2]);

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn reactions_from_two_actors_persist_and_deletes_collapse() {
    let world = World::new();
    let (alice, recorder) = world.session("alice");
    let (bob, _) = world.session("bob");
    for session in [&alice, &bob] {
        session.subscribe("default").await.unwrap();
        session.connect().await.unwrap();
    }

    let id = alice.publish("default", "vote here").await.unwrap();
    eventually("both hold the message", || {
        alice.store().contains("default", id) && bob.store().contains("default", id)
    })
    .await;

    alice.react("default", id, "👍").await.unwrap();
    bob.react("default", id, "👍").await.unwrap();
    bob.react("default", id, "👍").await.unwrap();
    alice.soft_delete("default", id).await.unwrap();
    bob.soft_delete("default", id).await.unwrap();
    bob.flag("default", id, "spam").await.unwrap();

    eventually("annotations applied", || {
        alice
            .store()
            .get("default", id)
            .is_some_and(|m| m.annotations.len() == 4)
    })
    .await;

    let message = alice.store().get("default", id).unwrap();
    let groups = message.reactions();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].emoji, "👍");
    assert_eq!(groups[0].count, 2);
    assert!(message.is_deleted());
    assert_eq!(message.deletion().map(|a| a.actor_id.as_str()), Some("alice"));
    assert!(message.is_flagged());
    assert!(alice.store().list_visible("default", 10).is_empty());
    assert_eq!(alice.messages("default", 10).len(), 1);

    eventually("observer saw applied annotations", || recorder.annotations.lock().len() == 4).await;
    let kinds: Vec<AnnotationKind> = recorder
        .annotations
        .lock()
        .iter()
        .map(|(_, _, a)| a.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            AnnotationKind::Reaction,
            AnnotationKind::Reaction,
            AnnotationKind::Delete,
            AnnotationKind::Flag,
        ]
    );

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn denied_identity_fails_to_connect_without_retrying() {
    let world = World::new();
    world.auth.deny("mallory");
    let (mallory, _) = world.session("mallory");

    let err = mallory.connect().await.unwrap_err();
    assert!(matches!(err, ConnectionError::Auth(AuthError::Denied(_))));
    assert_eq!(mallory.state(), SessionState::Disconnected);
    assert_eq!(mallory.tokens().requests_issued(), 1);
    assert_eq!(world.hub.connection_count(), 0);
}

#[tokio::test]
async fn grants_limit_what_a_session_may_do() {
    let world = World::new();
    let grants = ResourceGrants::new()
        .channel("default", Permissions::READ_WRITE)
        .channel("announcements", Permissions::READ_ONLY);
    let (carol, _) = world.session_with("carol", grants, fast_config());
    carol.connect().await.unwrap();

    carol.subscribe("announcements").await.unwrap();
    assert!(matches!(
        carol.publish("announcements", "hi").await,
        Err(PublishError::AuthDenied(_))
    ));

    let err = carol.subscribe("secret").await.unwrap_err();
    assert!(matches!(err, SessionError::Auth(AuthError::Denied(_))));
    assert_eq!(carol.active_channels(), channel_set(&["announcements"]));

    carol.close().await;
}

#[tokio::test]
async fn invalid_channels_and_unknown_messages_are_rejected() {
    let world = World::new();
    let (alice, _) = world.session("alice");
    alice.connect().await.unwrap();

    assert!(matches!(
        alice.subscribe("bad name").await,
        Err(SessionError::ChannelInvalid(_))
    ));
    assert!(matches!(
        alice.publish("a:b", "x").await,
        Err(PublishError::ChannelInvalid(_))
    ));
    assert!(matches!(
        alice.react("default", MessageId(42), "👍").await,
        Err(SessionError::NotFound(_))
    ));

    alice.close().await;
}

#[tokio::test]
async fn unsubscribe_stops_delivery_and_resubscribe_resumes_from_cursor() {
    let world = World::new();
    let (alice, _) = world.session("alice");
    alice.subscribe("default").await.unwrap();
    alice.connect().await.unwrap();

    world.hub.inject("default", "bob", "first");
    eventually("first message", || alice.messages("default", 10).len() == 1).await;

    alice.unsubscribe("default").await;
    alice.unsubscribe("default").await;
    assert!(world.hub.subscriptions_of("alice").is_empty());

    world.hub.inject("default", "bob", "second");
    world.hub.inject("default", "bob", "third");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(alice.messages("default", 10).len(), 1);

    alice.subscribe("default").await.unwrap();
    assert_eq!(ids(&alice.messages("default", 10)), vec![1, 2, 3]);

    alice.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_terminal() {
    let world = World::new();
    let (alice, recorder) = world.session("alice");
    alice.subscribe("default").await.unwrap();
    alice.connect().await.unwrap();

    alice.close().await;
    alice.close().await;

    assert_eq!(alice.state(), SessionState::Closed);
    assert_eq!(world.hub.connection_count(), 0);
    assert!(alice.active_channels().is_empty());
    assert_eq!(alice.connect().await, Err(ConnectionError::Closed));
    assert_eq!(alice.subscribe("default").await, Err(SessionError::Closed));
    assert!(alice.publish("default", "x").await.is_err());

    eventually("disconnect reported", || {
        recorder.statuses.lock().last() == Some(&ConnectionStatus::Disconnected)
    })
    .await;
}

#[tokio::test]
async fn gives_up_after_the_retry_budget_and_can_connect_again() {
    let world = World::new();
    let config = SessionConfig {
        max_retry_duration: Some(Duration::from_millis(150)),
        ..fast_config()
    };
    let (alice, recorder) =
        world.session_with("alice", ResourceGrants::all_channels(Permissions::READ_WRITE), config);
    alice.subscribe("default").await.unwrap();
    alice.connect().await.unwrap();

    world.hub.set_offline(true);
    world.hub.sever_all("maintenance");

    let mut state = alice.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SessionState::Disconnected),
    )
    .await
    .expect("gave up in time")
    .unwrap();
    eventually("disconnect reported", || {
        recorder.statuses.lock().last() == Some(&ConnectionStatus::Disconnected)
    })
    .await;
    assert_eq!(alice.active_channels(), channel_set(&["default"]));

    world.hub.set_offline(false);
    alice.connect().await.unwrap();
    assert_eq!(alice.state(), SessionState::Connected);
    assert_eq!(world.hub.subscriptions_of("alice"), channel_set(&["default"]));

    alice.close().await;
}

#[tokio::test]
async fn publish_waits_out_a_reconnect() {
    let world = World::new();
    let (alice, _) = world.session("alice");
    alice.subscribe("default").await.unwrap();
    alice.connect().await.unwrap();

    world.hub.fail_next_connects(u32::MAX);
    world.hub.sever("alice", "network blip");
    wait_for_state(&alice, SessionState::Reconnecting).await;

    let hub = world.hub.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.fail_next_connects(0);
    });

    let id = alice.publish("default", "sent mid-reconnect").await.unwrap();
    assert_eq!(alice.state(), SessionState::Connected);
    eventually("message echoed", || alice.store().contains("default", id)).await;

    alice.close().await;
}

#[tokio::test]
async fn actions_fail_with_connection_errors_while_the_link_stays_down() {
    let world = World::new();
    let config = SessionConfig {
        publish_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let (alice, _) =
        world.session_with("alice", ResourceGrants::all_channels(Permissions::READ_WRITE), config);
    alice.subscribe("default").await.unwrap();
    alice.connect().await.unwrap();
    let id = alice.publish("default", "hello").await.unwrap();
    eventually("message echoed", || alice.store().contains("default", id)).await;

    world.hub.fail_next_connects(u32::MAX);
    world.hub.sever("alice", "long outage");
    wait_for_state(&alice, SessionState::Reconnecting).await;

    assert!(matches!(
        alice.publish("default", "lost").await,
        Err(PublishError::Network(_))
    ));
    assert_eq!(
        alice.react("default", id, "👍").await,
        Err(SessionError::Connection(ConnectionError::Timeout))
    );
    assert_eq!(alice.state(), SessionState::Reconnecting);

    alice.close().await;
    assert_eq!(alice.react("default", id, "👍").await, Err(SessionError::Closed));
}

#[tokio::test]
async fn subscribe_during_a_transient_failure_is_completed_by_the_reconnect() {
    let world = World::new();
    let (alice, _) = world.session("alice");
    alice.subscribe("a").await.unwrap();
    alice.connect().await.unwrap();

    world.hub.set_offline(true);
    assert_eq!(alice.subscribe("b").await, Ok(()));
    assert_eq!(alice.active_channels(), channel_set(&["a", "b"]));
    world.hub.set_offline(false);

    eventually("both channels on the hub", || {
        world.hub.subscriptions_of("alice") == channel_set(&["a", "b"])
    })
    .await;
    wait_for_state(&alice, SessionState::Connected).await;

    world.hub.inject("b", "bob", "on b");
    eventually("b delivers", || alice.messages("b", 10).len() == 1).await;

    alice.close().await;
}

#[tokio::test]
async fn an_outage_longer_than_one_history_page_is_caught_up_in_full() {
    let world = World::new();
    let config = SessionConfig {
        history_fetch: 3,
        ..fast_config()
    };
    let (alice, recorder) =
        world.session_with("alice", ResourceGrants::all_channels(Permissions::READ_WRITE), config);
    alice.subscribe("default").await.unwrap();
    alice.connect().await.unwrap();

    world.hub.inject("default", "bob", "before");
    eventually("live message", || alice.messages("default", 100).len() == 1).await;

    world.hub.set_offline(true);
    world.hub.sever("alice", "outage");
    wait_for_state(&alice, SessionState::Reconnecting).await;
    for i in 2..=10 {
        world.hub.inject("default", "bob", &format!("during {}", i));
    }
    world.hub.set_offline(false);

    eventually("caught up", || alice.messages("default", 100).len() == 10).await;
    assert_eq!(ids(&alice.messages("default", 100)), (1..=10).collect::<Vec<_>>());
    eventually("observer drained", || recorder.messages.lock().len() == 10).await;
    assert_eq!(ids(&recorder.messages.lock()), (1..=10).collect::<Vec<_>>());

    alice.close().await;
}

#[tokio::test]
async fn annotations_made_during_an_outage_are_reconciled() {
    let world = World::new();
    let (alice, recorder) = world.session("alice");
    let (bob, _) = world.session("bob");
    for session in [&alice, &bob] {
        session.subscribe("default").await.unwrap();
        session.connect().await.unwrap();
    }
    let id = bob.publish("default", "regrettable").await.unwrap();
    eventually("both hold the message", || {
        alice.store().contains("default", id) && bob.store().contains("default", id)
    })
    .await;

    world.hub.fail_next_connects(u32::MAX);
    world.hub.sever("alice", "blip");
    wait_for_state(&alice, SessionState::Reconnecting).await;

    bob.soft_delete("default", id).await.unwrap();
    bob.react("default", id, "🎉").await.unwrap();
    eventually("bob sees the delete", || {
        bob.store().get("default", id).is_some_and(|m| m.is_deleted())
    })
    .await;
    assert!(!alice.store().get("default", id).unwrap().is_deleted());

    world.hub.fail_next_connects(0);
    eventually("alice sees the delete", || {
        alice.store().get("default", id).is_some_and(|m| m.is_deleted())
    })
    .await;
    let message = alice.store().get("default", id).unwrap();
    assert_eq!(message.reactions().len(), 1);
    assert!(alice.store().list_visible("default", 10).is_empty());
    eventually("observer told", || recorder.annotations.lock().len() == 2).await;

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn close_cancels_a_pending_connect_and_an_ongoing_reconnect() {
    let world = World::new();

    // Initial connect retries without a budget.
    let (alice, _) = world.session("alice");
    let alice = Arc::new(alice);
    world.hub.fail_next_connects(u32::MAX);
    let pending = tokio::spawn({
        let alice = alice.clone();
        async move { alice.connect().await }
    });
    eventually("connect retrying", || world.hub.connect_attempts() >= 2).await;

    alice.close().await;
    assert_eq!(pending.await.unwrap(), Err(ConnectionError::Closed));
    let attempts = world.hub.connect_attempts();
    world.hub.fail_next_connects(0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(world.hub.connect_attempts(), attempts);
    assert_eq!(world.hub.connection_count(), 0);
    assert_eq!(alice.state(), SessionState::Closed);

    // Reconnect loop owned by the receive task.
    let (bob, recorder) = world.session("bob");
    bob.subscribe("default").await.unwrap();
    bob.connect().await.unwrap();
    let connected_at = world.hub.connect_attempts();

    world.hub.fail_next_connects(u32::MAX);
    world.hub.sever("bob", "blip");
    wait_for_state(&bob, SessionState::Reconnecting).await;
    eventually("reconnect retrying", || {
        world.hub.connect_attempts() >= connected_at + 2
    })
    .await;

    bob.close().await;
    let attempts = world.hub.connect_attempts();
    world.hub.fail_next_connects(0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(world.hub.connect_attempts(), attempts);
    assert_eq!(world.hub.connection_count(), 0);
    assert_eq!(bob.state(), SessionState::Closed);
    eventually("disconnect reported", || {
        recorder.statuses.lock().last() == Some(&ConnectionStatus::Disconnected)
    })
    .await;
}
