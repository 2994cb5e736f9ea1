//! Event channel: one live connection to the event source plus the
//! subscriber registry it feeds.
//!
//! All state lives in a single driver task. Public calls, connection
//! signals and backoff timers reach it through mailboxes and are handled one
//! at a time, which gives the ordering guarantees for free: frames are
//! dispatched in arrival order and `stop()` settles before the next command
//! is looked at.
//!
//! Every connection attempt and every backoff timer carries the generation
//! it was started under. `stop()` and each new attempt bump the generation,
//! so anything still in flight from an abandoned attempt is ignored when it
//! reports back.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::backoff::Backoff;
use super::frame::{EventFrame, ping_message};
use super::registry::{Subscription, SubscriptionHandle, SubscriptionRegistry};
use super::state::{ChannelState, ChannelStatus};
use crate::config::{ChannelConfig, ConfigError};
use crate::session::SessionGate;
use crate::transport::{Connection, Transport, TransportError};

enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

enum Signal {
    Opened { generation: u64 },
    OpenFailed { generation: u64, error: TransportError },
    Frame { generation: u64, text: String },
    /// Open connection went away; `None` means the peer closed cleanly
    Lost { generation: u64, error: Option<TransportError> },
    RetryDue { generation: u64 },
}

impl Signal {
    fn generation(&self) -> u64 {
        match self {
            Signal::Opened { generation }
            | Signal::OpenFailed { generation, .. }
            | Signal::Frame { generation, .. }
            | Signal::Lost { generation, .. }
            | Signal::RetryDue { generation } => *generation,
        }
    }
}

/// Handle to an event channel. Cheap to clone; the driver shuts down once
/// every handle is dropped.
#[derive(Clone)]
pub struct EventChannel {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<SubscriptionRegistry>,
    status: watch::Receiver<ChannelStatus>,
}

impl EventChannel {
    /// Spawns the driver task, so this must run inside a tokio runtime.
    /// Fails without spawning anything if the config does not validate.
    pub fn new(
        config: ChannelConfig,
        session: Arc<dyn SessionGate>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(SubscriptionRegistry::new());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ChannelStatus::default());

        let driver = Driver {
            backoff: Backoff::new(config.reconnect.clone()),
            config,
            session,
            transport,
            registry: registry.clone(),
            status: status_tx,
            signals,
            state: ChannelState::Idle,
            generation: 0,
            epoch: 0,
            retry_count: 0,
            next_retry: None,
            last_activity: None,
            link: None,
            retry_timer: None,
        };
        tokio::spawn(driver.run(command_rx, signal_rx));

        Ok(Self {
            commands,
            registry,
            status,
        })
    }

    /// Begin connecting if a session is active and nothing is open or pending.
    /// Returns once the request has been handled, not once the connection is open.
    pub async fn start(&self) {
        self.request(Command::Start).await;
    }

    /// Tear down any open or pending connection and cancel a scheduled
    /// reconnect. Returns once the channel has settled in `Closed`.
    pub async fn stop(&self) {
        self.request(Command::Stop).await;
    }

    async fn request(&self, command: fn(oneshot::Sender<()>) -> Command) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(command(ack)).is_err() {
            warn!("Event channel driver is gone");
            return;
        }
        let _ = done.await;
    }

    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.registry.subscribe(event_type, handler)
    }

    pub fn subscribe_typed<T, F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.registry.subscribe_typed(event_type, handler)
    }

    /// Like `subscribe`, but the registration is removed when the returned
    /// guard is dropped
    pub fn subscribe_scoped<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let handle = self.registry.subscribe(event_type, handler);
        Subscription::new(&self.registry, handle)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.registry.unsubscribe(handle);
    }

    pub fn epoch(&self) -> u64 {
        self.status.borrow().epoch
    }

    pub fn state(&self) -> ChannelState {
        self.status.borrow().state
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }
}

/// Connection task of one generation
struct Link {
    generation: u64,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Driver {
    config: ChannelConfig,
    session: Arc<dyn SessionGate>,
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    status: watch::Sender<ChannelStatus>,
    signals: mpsc::UnboundedSender<Signal>,

    state: ChannelState,
    generation: u64,
    epoch: u64,
    backoff: Backoff,
    retry_count: u32,
    next_retry: Option<Duration>,
    last_activity: Option<chrono::DateTime<Utc>>,
    link: Option<Link>,
    retry_timer: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start(ack)) => {
                        self.start();
                        let _ = ack.send(());
                    }
                    Some(Command::Stop(ack)) => {
                        self.stop().await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
            }
        }

        self.stop().await;
        debug!("Event channel driver exited");
    }

    fn start(&mut self) {
        match self.state {
            ChannelState::Connecting | ChannelState::Open | ChannelState::Backoff => {
                trace!(state = %self.state, "Start ignored, connection already active or pending");
            }
            ChannelState::Idle | ChannelState::Closed => {
                if self.session.is_active() {
                    self.connect();
                } else {
                    debug!(state = %self.state, "Start ignored, no active session");
                }
            }
        }
    }

    async fn stop(&mut self) {
        if self.link.is_none() && self.retry_timer.is_none() && !self.is_live() {
            trace!(state = %self.state, "Stop ignored, nothing to tear down");
            return;
        }

        self.generation += 1;
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.close_link().await;

        self.next_retry = None;
        self.set_state(ChannelState::Closed);
        info!(epoch = self.epoch, "Event channel closed");
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state,
            ChannelState::Connecting | ChannelState::Open | ChannelState::Backoff
        )
    }

    fn connect(&mut self) {
        let Some(session) = self.session.current() else {
            self.settle_closed("session ended before connecting");
            return;
        };

        self.generation += 1;
        let generation = self.generation;

        let url = match self.config.endpoint_for(&session) {
            Ok(url) => url,
            Err(e) => {
                warn!(generation, "Cannot build event source address: {}", e);
                self.schedule_retry();
                return;
            }
        };

        let connection_id = Uuid::new_v4();
        info!(
            generation,
            connection_id = %connection_id,
            endpoint = %redacted(&url),
            "Connecting to event source"
        );

        let (shutdown, shutdown_rx) = oneshot::channel();
        let params = LinkParams {
            generation,
            transport: self.transport.clone(),
            address: url.to_string(),
            signals: self.signals.clone(),
            connect_timeout: self.config.connect_timeout(),
            heartbeat: self.config.heartbeat_interval(),
            idle_timeout: self.config.idle_timeout(),
        };
        let task = tokio::spawn(run_link(params, shutdown_rx));

        self.link = Some(Link {
            generation,
            shutdown,
            task,
        });
        self.set_state(ChannelState::Connecting);
    }

    async fn handle_signal(&mut self, signal: Signal) {
        if signal.generation() != self.generation {
            trace!(
                stale = signal.generation(),
                current = self.generation,
                "Ignoring signal from an abandoned connection"
            );
            return;
        }

        match signal {
            Signal::Opened { generation } => {
                self.epoch += 1;
                self.retry_count = 0;
                self.next_retry = None;
                self.backoff.reset();
                self.last_activity = Some(Utc::now());
                self.set_state(ChannelState::Open);
                info!(generation, epoch = self.epoch, "Event channel open");
            }
            Signal::OpenFailed { generation, error } => {
                warn!(generation, "Event source handshake failed: {}", error);
                self.reap_link().await;
                self.schedule_retry();
            }
            Signal::Frame { text, .. } => self.on_frame(&text),
            Signal::Lost { generation, error } => {
                match error {
                    Some(e) => warn!(generation, epoch = self.epoch, "Event source connection lost: {}", e),
                    None => info!(generation, epoch = self.epoch, "Event source closed the connection"),
                }
                self.reap_link().await;
                self.schedule_retry();
            }
            Signal::RetryDue { generation } => {
                self.retry_timer = None;
                if self.state != ChannelState::Backoff {
                    return;
                }
                if !self.session.is_active() {
                    self.settle_closed("session ended during backoff");
                    return;
                }
                debug!(generation, retry = self.retry_count, "Backoff elapsed, reconnecting");
                self.connect();
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        if self.state != ChannelState::Open {
            return;
        }
        self.last_activity = Some(Utc::now());

        let frame = match EventFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(epoch = self.epoch, "Dropping malformed frame: {}", e);
                self.publish();
                return;
            }
        };

        if frame.is_control() {
            trace!(event_type = %frame.event_type, "Keep-alive reply");
        } else {
            let delivered = self.registry.dispatch(&frame);
            debug!(event_type = %frame.event_type, delivered, epoch = self.epoch, "Dispatched frame");
        }
        self.publish();
    }

    fn schedule_retry(&mut self) {
        if !self.session.is_active() {
            self.settle_closed("session no longer active");
            return;
        }

        let delay = self.backoff.next_delay();
        self.retry_count = self.retry_count.saturating_add(1);
        self.next_retry = Some(delay);

        let generation = self.generation;
        let signals = self.signals.clone();
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(Signal::RetryDue { generation });
        }));

        self.set_state(ChannelState::Backoff);
        info!(
            generation,
            retry = self.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
    }

    /// Close without a `stop()` call, e.g. the session went away while a
    /// reconnect was pending
    fn settle_closed(&mut self, reason: &str) {
        self.generation += 1;
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.next_retry = None;
        self.set_state(ChannelState::Closed);
        info!(epoch = self.epoch, "Event channel closed: {}", reason);
    }

    /// Ask the current connection task to close and wait for it, bounded by
    /// the close timeout
    async fn close_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let Link {
            generation,
            shutdown,
            mut task,
        } = link;

        let _ = shutdown.send(());
        if tokio::time::timeout(self.config.close_timeout(), &mut task).await.is_err() {
            warn!(generation, "Connection did not close in time, dropping it");
            task.abort();
            let _ = task.await;
        }
    }

    /// Collect a connection task that has already reported its own end
    async fn reap_link(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.task.await;
        }
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Channel state changed");
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(ChannelStatus {
            state: self.state,
            epoch: self.epoch,
            retry_count: self.retry_count,
            next_retry_ms: self.next_retry.map(|d| d.as_millis() as u64),
            last_activity: self.last_activity,
        });
    }
}

/// Endpoint without the query string, which carries the token
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

struct LinkParams {
    generation: u64,
    transport: Arc<dyn Transport>,
    address: String,
    signals: mpsc::UnboundedSender<Signal>,
    connect_timeout: Duration,
    heartbeat: Option<Duration>,
    idle_timeout: Option<Duration>,
}

enum Inbound {
    Message(String),
    Failed(TransportError),
    Ended,
    Idle,
}

/// Body of a connection task: handshake, then pump inbound messages to the
/// driver until the connection dies or the driver asks it to close.
async fn run_link(params: LinkParams, mut shutdown: oneshot::Receiver<()>) {
    let LinkParams {
        generation,
        transport,
        address,
        signals,
        connect_timeout,
        heartbeat,
        idle_timeout,
    } = params;

    let opened = tokio::select! {
        _ = &mut shutdown => return,
        opened = tokio::time::timeout(connect_timeout, transport.open(&address)) => opened,
    };

    let mut connection = match opened {
        Ok(Ok(connection)) => connection,
        Ok(Err(error)) => {
            let _ = signals.send(Signal::OpenFailed { generation, error });
            return;
        }
        Err(_) => {
            let error = TransportError::HandshakeTimeout(connect_timeout.as_millis() as u64);
            let _ = signals.send(Signal::OpenFailed { generation, error });
            return;
        }
    };
    let _ = signals.send(Signal::Opened { generation });

    let mut pings = heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut idle_deadline = idle_timeout.map(|limit| Instant::now() + limit);

    let error = loop {
        tokio::select! {
            _ = &mut shutdown => {
                connection.close().await;
                return;
            }
            _ = next_tick(&mut pings) => {
                if let Err(e) = connection.send(ping_message()).await {
                    break Some(e);
                }
            }
            inbound = next_inbound(&mut connection, idle_deadline) => match inbound {
                Inbound::Message(text) => {
                    idle_deadline = idle_timeout.map(|limit| Instant::now() + limit);
                    let _ = signals.send(Signal::Frame { generation, text });
                }
                Inbound::Failed(e) => break Some(e),
                Inbound::Ended => break None,
                Inbound::Idle => {
                    let limit = idle_timeout.unwrap_or_default();
                    connection.close().await;
                    break Some(TransportError::IdleTimeout(limit.as_millis() as u64));
                }
            },
        }
    };

    let _ = signals.send(Signal::Lost { generation, error });
}

async fn next_tick(pings: &mut Option<Interval>) {
    match pings {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn next_inbound(connection: &mut Box<dyn Connection>, deadline: Option<Instant>) -> Inbound {
    let received = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, connection.recv()).await {
            Ok(received) => received,
            Err(_) => return Inbound::Idle,
        },
        None => connection.recv().await,
    };

    match received {
        Some(Ok(text)) => Inbound::Message(text),
        Some(Err(e)) => Inbound::Failed(e),
        None => Inbound::Ended,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::frame::CameraStatusUpdate;
    use crate::config::ReconnectConfig;
    use crate::session::SessionStore;
    use crate::session::gate::demo_user;
    use crate::transport::scripted::{Remote, ScriptedTransport};
    use serde_json::json;
    use std::sync::Mutex;

    const TOKEN: &str = "mock-security-token";
    const WAIT: Duration = Duration::from_secs(300);

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            endpoint: "ws://events.test/ws/{tenant_id}/{user_id}".to_string(),
            connect_timeout_ms: 1_000,
            close_timeout_ms: 500,
            heartbeat_interval_ms: None,
            idle_timeout_ms: None,
            reconnect: ReconnectConfig {
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                multiplier: 2.0,
                jitter_factor: 0.0,
            },
        }
    }

    fn setup(config: ChannelConfig) -> (Arc<SessionStore>, Arc<ScriptedTransport>, EventChannel) {
        let store = Arc::new(SessionStore::new());
        let transport = ScriptedTransport::new();
        let channel = EventChannel::new(config, store.clone(), transport.clone()).unwrap();
        (store, transport, channel)
    }

    fn logged_in(config: ChannelConfig) -> (Arc<SessionStore>, Arc<ScriptedTransport>, EventChannel) {
        let (store, transport, channel) = setup(config);
        store.set_auth(demo_user(), TOKEN);
        (store, transport, channel)
    }

    async fn wait_for(
        channel: &EventChannel,
        what: &str,
        ready: impl FnMut(&ChannelStatus) -> bool,
    ) -> ChannelStatus {
        let mut status = channel.watch_status();
        match tokio::time::timeout(WAIT, status.wait_for(ready)).await {
            Ok(Ok(seen)) => seen.clone(),
            _ => panic!("timed out waiting for {}: {:?}", what, channel.status()),
        }
    }

    async fn wait_open(channel: &EventChannel, epoch: u64) -> ChannelStatus {
        wait_for(channel, "open", |s| s.state == ChannelState::Open && s.epoch == epoch).await
    }

    /// Handler on a marker type, used to know when earlier frames were dispatched
    fn sync_point(channel: &EventChannel) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.subscribe("test_sync", move |_: &Value| {
            let _ = tx.send(());
        });
        rx
    }

    async fn flush(remote: &Remote, sync: &mut mpsc::UnboundedReceiver<()>) {
        remote.push_json(json!({ "eventType": "test_sync" }));
        tokio::time::timeout(WAIT, sync.recv())
            .await
            .expect("frames were not dispatched")
            .expect("sync handler dropped");
    }

    fn record(channel: &EventChannel, event_type: &str) -> (SubscriptionHandle, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let seen = seen.clone();
            channel.subscribe(event_type, move |payload: &Value| seen.lock().unwrap().push(payload.clone()))
        };
        (handle, seen)
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_up_front() {
        let store = Arc::new(SessionStore::new());
        let transport = ScriptedTransport::new();

        let mut config = test_config();
        config.reconnect.base_delay_ms = 0;
        let result = EventChannel::new(config, store.clone(), transport.clone());
        assert!(matches!(result, Err(ConfigError::Reconnect(_))));

        let mut config = test_config();
        config.idle_timeout_ms = Some(0);
        let result = EventChannel::new(config, store.clone(), transport.clone());
        assert!(matches!(result, Err(ConfigError::Timeout(_))));

        let mut config = test_config();
        config.endpoint = "http://events.test/ws".to_string();
        let result = EventChannel::new(config, store, transport);
        assert!(matches!(result, Err(ConfigError::Endpoint { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_session_stays_idle() {
        let (_store, transport, channel) = setup(test_config());
        channel.start().await;

        assert_eq!(channel.state(), ChannelState::Idle);
        assert_eq!(channel.epoch(), 0);
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let (_store, transport, channel) = logged_in(test_config());
        let _remote = transport.accept();

        channel.start().await;
        channel.start().await;
        wait_open(&channel, 1).await;
        channel.start().await;

        assert_eq!(transport.opens(), 1);
        assert_eq!(channel.epoch(), 1);
        assert_eq!(
            transport.addresses(),
            vec![format!("ws://events.test/ws/demo-tenant/2?token={}", TOKEN)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn frames_reach_matching_subscribers_until_unsubscribed() {
        let (_store, transport, channel) = logged_in(test_config());
        let remote = transport.accept();
        let mut sync = sync_point(&channel);
        let (a, intrusions) = record(&channel, "intrusion");
        let (_b, faces) = record(&channel, "face_detection");

        channel.start().await;
        wait_open(&channel, 1).await;

        remote.push_json(json!({ "eventType": "intrusion", "payload": { "area": "restricted" } }));
        remote.push_json(json!({ "eventType": "face_detection", "payload": { "name": "J" } }));
        flush(&remote, &mut sync).await;

        assert_eq!(*intrusions.lock().unwrap(), vec![json!({ "area": "restricted" })]);
        assert_eq!(*faces.lock().unwrap(), vec![json!({ "name": "J" })]);

        channel.unsubscribe(&a);
        remote.push_json(json!({ "eventType": "intrusion", "payload": { "area": "lobby" } }));
        flush(&remote, &mut sync).await;

        assert_eq!(intrusions.lock().unwrap().len(), 1);
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_types_and_malformed_frames_are_dropped() {
        let (_store, transport, channel) = logged_in(test_config());
        let remote = transport.accept();
        let mut sync = sync_point(&channel);
        let (_handle, intrusions) = record(&channel, "intrusion");

        channel.start().await;
        wait_open(&channel, 1).await;

        remote.push_json(json!({ "eventType": "unregistered_type", "payload": {} }));
        remote.push("not json");
        remote.push(r#"{"payload":{"area":"restricted"}}"#);
        remote.push_json(json!({ "type": "intrusion", "data": { "area": "gate" } }));
        flush(&remote, &mut sync).await;

        assert_eq!(*intrusions.lock().unwrap(), vec![json!({ "area": "gate" })]);
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.epoch(), 1);
        assert!(channel.status().last_activity.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_is_isolated() {
        let (_store, transport, channel) = logged_in(test_config());
        let remote = transport.accept();
        let mut sync = sync_point(&channel);
        channel.subscribe("alert", |_: &Value| panic!("widget failed"));
        let (_handle, alerts) = record(&channel, "alert");

        channel.start().await;
        wait_open(&channel, 1).await;

        remote.push_json(json!({ "eventType": "alert", "payload": 1 }));
        remote.push_json(json!({ "eventType": "alert", "payload": 2 }));
        flush(&remote, &mut sync).await;

        assert_eq!(*alerts.lock().unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_is_not_dispatched() {
        let (_store, transport, channel) = logged_in(test_config());
        let remote = transport.accept();
        let mut sync = sync_point(&channel);
        let (_handle, pongs) = record(&channel, "pong");

        channel.start().await;
        wait_open(&channel, 1).await;

        remote.push_json(json!({ "type": "pong" }));
        flush(&remote, &mut sync).await;

        assert!(pongs.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn typed_and_scoped_subscriptions() {
        let (_store, transport, channel) = logged_in(test_config());
        let remote = transport.accept();
        let mut sync = sync_point(&channel);

        let removed = Arc::new(Mutex::new(Vec::new()));
        {
            let removed = removed.clone();
            channel.subscribe_typed("camera_status", move |update: CameraStatusUpdate| {
                removed.lock().unwrap().push(update.camera_id().to_string());
            });
        }
        let scoped_hits = Arc::new(Mutex::new(0));
        let scoped = {
            let scoped_hits = scoped_hits.clone();
            channel.subscribe_scoped("camera_status", move |_: &Value| *scoped_hits.lock().unwrap() += 1)
        };

        channel.start().await;
        wait_open(&channel, 1).await;

        remote.push_json(json!({ "type": "camera_status", "data": { "action": "deleted", "camera_id": "cam-7" } }));
        flush(&remote, &mut sync).await;
        drop(scoped);
        remote.push_json(json!({ "type": "camera_status", "data": { "action": "deleted", "camera_id": "cam-8" } }));
        flush(&remote, &mut sync).await;

        assert_eq!(*removed.lock().unwrap(), vec!["cam-7", "cam-8"]);
        assert_eq!(*scoped_hits.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_back_off_then_open() {
        let (_store, transport, channel) = logged_in(test_config());
        transport.fail();
        transport.fail();
        transport.fail();
        let _remote = transport.accept();

        let started = tokio::time::Instant::now();
        channel.start().await;
        let status = wait_open(&channel, 1).await;

        // 100 + 200 + 400 with no jitter
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert_eq!(transport.opens(), 4);
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.next_retry_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_status_reports_the_pending_retry() {
        let (_store, transport, channel) = logged_in(test_config());
        transport.fail();

        channel.start().await;
        let status = wait_for(&channel, "backoff", |s| s.state == ChannelState::Backoff).await;

        assert_eq!(status.retry_count, 1);
        assert_eq!(status.next_retry_ms, Some(100));
        assert_eq!(status.epoch, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_schedules_a_retry() {
        let (_store, transport, channel) = logged_in(test_config());

        channel.start().await;
        wait_for(&channel, "backoff", |s| s.state == ChannelState::Backoff).await;
        let _remote = transport.accept();
        wait_open(&channel, 1).await;

        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_reconnects_into_a_new_epoch() {
        let (_store, transport, channel) = logged_in(test_config());
        let first = transport.accept();
        let second = transport.accept();

        channel.start().await;
        wait_open(&channel, 1).await;

        first.hang_up();
        wait_open(&channel, 2).await;

        second.break_with(TransportError::Receive("connection reset".to_string()));
        let status = wait_for(&channel, "backoff", |s| s.state == ChannelState::Backoff).await;
        assert_eq!(status.epoch, 2);
        assert!(status.crossed_epoch(1));
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_the_open_connection() {
        let (_store, transport, channel) = logged_in(test_config());
        let remote = transport.accept();
        let mut sync = sync_point(&channel);
        let (_handle, intrusions) = record(&channel, "intrusion");

        channel.start().await;
        wait_open(&channel, 1).await;

        channel.stop().await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(remote.is_closed());

        channel.stop().await;
        assert_eq!(channel.state(), ChannelState::Closed);

        // a frame the remote still had queued never reaches subscribers
        remote.push_json(json!({ "eventType": "intrusion", "payload": {} }));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(intrusions.lock().unwrap().is_empty());
        assert_eq!(transport.opens(), 1);

        let again = transport.accept();
        channel.start().await;
        wait_open(&channel, 2).await;
        again.push_json(json!({ "eventType": "intrusion", "payload": { "area": "dock" } }));
        flush(&again, &mut sync).await;
        assert_eq!(*intrusions.lock().unwrap(), vec![json!({ "area": "dock" })]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_cancels_the_retry() {
        let (_store, transport, channel) = logged_in(test_config());
        transport.fail();

        channel.start().await;
        wait_for(&channel, "backoff", |s| s.state == ChannelState::Backoff).await;
        channel.stop().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.status().next_retry_ms, None);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_handshake_abandons_it() {
        let (_store, transport, channel) = logged_in(test_config());

        channel.start().await;
        assert_eq!(channel.state(), ChannelState::Connecting);
        channel.stop().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.epoch(), 0);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_during_backoff_settles_closed() {
        let (store, transport, channel) = logged_in(test_config());
        transport.fail();

        channel.start().await;
        wait_for(&channel, "backoff", |s| s.state == ChannelState::Backoff).await;
        store.logout();

        wait_for(&channel, "closed", |s| s.state == ChannelState::Closed).await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_sends_pings() {
        let mut config = test_config();
        config.heartbeat_interval_ms = Some(1_000);
        let (_store, transport, channel) = logged_in(config);
        let mut remote = transport.accept();

        channel.start().await;
        wait_open(&channel, 1).await;

        let sent = tokio::time::timeout(WAIT, remote.next_sent())
            .await
            .expect("no ping sent")
            .expect("connection dropped");
        let sent: Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(sent, json!({ "type": "ping" }));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_hits_the_idle_timeout() {
        let mut config = test_config();
        config.idle_timeout_ms = Some(5_000);
        let (_store, transport, channel) = logged_in(config);
        let first = transport.accept();
        let _second = transport.accept();

        channel.start().await;
        wait_open(&channel, 1).await;
        let opened = tokio::time::Instant::now();

        wait_open(&channel, 2).await;
        assert!(opened.elapsed() >= Duration::from_secs(5));
        assert!(first.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_closes_the_connection() {
        let (_store, transport, channel) = logged_in(test_config());
        let remote = transport.accept();
        let other = channel.clone();

        channel.start().await;
        wait_open(&channel, 1).await;
        drop(channel);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!remote.is_closed());

        drop(other);
        for _ in 0..100 {
            if remote.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(remote.is_closed());
    }
}
