use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use parley_auth::{IdentityProvider, JwtAuthorizer, RandomIdentity, TokenCache};
use parley_session::{ClientSettings, MemoryHub, SessionClient, SessionObserver};
use parley_types::{Annotation, ConnectionStatus, Message, MessageId, OverflowError};

/// Logs everything a session hears.
struct LogObserver {
    name: String,
}

impl SessionObserver for LogObserver {
    fn on_message(&self, message: &Message) {
        info!(
            session = %self.name,
            channel = %message.channel,
            id = %message.id,
            from = %message.sender_id,
            body = %message.body,
            "message"
        );
    }

    fn on_annotation(&self, channel: &str, message_id: MessageId, annotation: &Annotation) {
        info!(
            session = %self.name,
            channel,
            id = %message_id,
            kind = %annotation.kind,
            by = %annotation.actor_id,
            value = %annotation.value,
            "annotation"
        );
    }

    fn on_status(&self, status: ConnectionStatus) {
        info!(session = %self.name, ?status, "status");
    }

    fn on_overflow(&self, error: OverflowError) {
        warn!(session = %self.name, dropped = error.dropped, "observer overflow");
    }
}

fn session(
    settings: &ClientSettings,
    authorizer: &Arc<JwtAuthorizer>,
    hub: &MemoryHub,
    identity: Arc<dyn IdentityProvider>,
) -> SessionClient {
    let tokens = TokenCache::new(authorizer.clone(), identity, settings.tokens.clone());
    let client = SessionClient::new(
        Arc::new(hub.transport()),
        Arc::new(tokens),
        settings.session.clone(),
    );
    client.add_listener(Arc::new(LogObserver {
        name: client.identity(),
    }));
    client
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "parley=info,parley_session=debug,parley_auth=debug,parley_store=debug".into()
            }),
        )
        .init();

    let settings = ClientSettings::from_env()?;
    let channel = settings
        .channels
        .first()
        .cloned()
        .unwrap_or_else(|| "default".to_string());

    // In-process collaborators
    let authorizer = Arc::new(JwtAuthorizer::new(settings.secret.clone()));
    let hub = MemoryHub::new(authorizer.clone());

    let host = session(&settings, &authorizer, &hub, settings.identity_provider());
    let guest = session(&settings, &authorizer, &hub, Arc::new(RandomIdentity::new()));
    info!(host = %host.identity(), guest = %guest.identity(), %channel, "starting demo");

    for client in [&host, &guest] {
        for name in &settings.channels {
            client.subscribe(name).await?;
        }
        client.connect().await?;
    }

    let greeting = host.publish(&channel, "hello, anyone around?").await?;
    let reply = guest.publish(&channel, "hi! first time here").await?;
    let spam = guest.publish(&channel, "buy cheap tokens now").await?;

    // Message actions need the message to have arrived locally.
    wait_for(&host, &channel, spam).await?;
    wait_for(&guest, &channel, spam).await?;

    guest.react(&channel, greeting, "👋").await?;
    host.react(&channel, reply, "🎉").await?;
    guest.react(&channel, reply, "🎉").await?;
    host.flag(&channel, spam, "spam").await?;
    host.soft_delete(&channel, spam).await?;

    // A dropped link is recovered transparently.
    hub.sever(&guest.identity(), "demo network blip");
    let late = host.publish(&channel, "did everyone get that?").await?;
    wait_for(&guest, &channel, late).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let visible = host.store().list_visible(&channel, settings.session.history_fetch);
    println!("{}", serde_json::to_string_pretty(&visible)?);
    info!(stats = ?host.store().stats(), "host store");

    for client in [&host, &guest] {
        client.close().await;
    }

    info!("demo finished");
    Ok(())
}

async fn wait_for(client: &SessionClient, channel: &str, id: MessageId) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !client.store().contains(channel, id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("message {} never reached {}", id, client.identity()))
}
