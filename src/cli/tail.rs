//! `eventlink` tail: follow the live event stream and print it as JSON lines
//!
//! Events go to stdout, logs to stderr, so the output can be piped.

use anyhow::{Context, Result, bail};
use eventlink::channel::event_types;
use eventlink::{ChannelState, ChannelStatus, Config, EventChannel, Role, SessionBinding, SessionStore, User, WebSocketTransport};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::watch;

pub struct TailOptions {
    pub config_path: String,
    pub token: String,
    pub user_id: String,
    pub tenant_id: String,
    pub role: String,
    pub events: Vec<String>,
}

pub const DEFAULT_EVENTS: [&str; 7] = [
    event_types::FACE_DETECTION,
    event_types::VEHICLE_DETECTION,
    event_types::INTRUSION,
    event_types::OBJECT_DETECTION,
    event_types::EVENT,
    event_types::ALERT,
    event_types::CAMERA_STATUS,
];

pub async fn run(options: TailOptions) -> Result<()> {
    let config = Config::load(&options.config_path)
        .with_context(|| format!("Failed to load {}", options.config_path))?;
    tracing::info!("eventlink {} using {}", config.get_version(), options.config_path);

    let user = User {
        id: options.user_id,
        email: String::new(),
        full_name: String::new(),
        role: parse_role(&options.role)?,
        tenant_id: options.tenant_id,
    };
    // fail early on an identity the endpoint template cannot address
    config
        .channel
        .endpoint_for(&eventlink::Session {
            user: user.clone(),
            token: options.token.clone(),
        })
        .context("Cannot address the event source for this user")?;

    let store = Arc::new(SessionStore::new());
    let channel = EventChannel::new(config.channel.clone(), store.clone(), Arc::new(WebSocketTransport::new()))
        .context("Invalid channel configuration")?;

    let event_types = subscribed_types(options.events);
    for event_type in &event_types {
        let status = channel.watch_status();
        let name = event_type.clone();
        channel.subscribe(event_type.clone(), move |payload: &Value| {
            let epoch = status.borrow().epoch;
            println!("{}", render(epoch, &name, payload));
        });
    }
    tracing::info!("Subscribed to {}", event_types.join(", "));

    let watcher = tokio::spawn(log_transitions(channel.watch_status()));
    let binding = SessionBinding::spawn(store.clone(), channel.clone());

    store.set_auth(user, options.token);

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    store.logout();
    channel.stop().await;
    drop(binding);
    watcher.abort();
    Ok(())
}

fn subscribed_types(requested: Vec<String>) -> Vec<String> {
    let requested: Vec<String> = requested
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();

    if requested.is_empty() {
        DEFAULT_EVENTS.iter().map(|name| name.to_string()).collect()
    } else {
        requested
    }
}

fn parse_role(role: &str) -> Result<Role> {
    match role.to_lowercase().as_str() {
        "admin" => Ok(Role::Admin),
        "security" => Ok(Role::Security),
        "manager" => Ok(Role::Manager),
        other => bail!("Unknown role '{}', expected admin, security or manager", other),
    }
}

fn render(epoch: u64, event_type: &str, payload: &Value) -> String {
    json!({ "epoch": epoch, "eventType": event_type, "payload": payload }).to_string()
}

async fn log_transitions(mut status: watch::Receiver<ChannelStatus>) {
    let mut seen = status.borrow_and_update().clone();
    while status.changed().await.is_ok() {
        let now = status.borrow_and_update().clone();

        if now.state != seen.state {
            match now.state {
                ChannelState::Backoff => tracing::warn!(
                    retry = now.retry_count,
                    delay_ms = now.next_retry_ms.unwrap_or_default(),
                    "Event stream interrupted"
                ),
                state => tracing::info!(epoch = now.epoch, "Event stream {}", state),
            }
        }
        if now.crossed_epoch(seen.epoch) && seen.epoch > 0 {
            tracing::warn!(
                from = seen.epoch,
                to = now.epoch,
                "Reconnected, events sent while disconnected were missed"
            );
        }
        seen = now;
    }
}
