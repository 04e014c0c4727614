//! Event listener: applies the push channel of feed events to the feed store.
//!
//! One listener owns at most one subscription. A background task consumes the
//! stream; every state write from that task is tagged with the generation it
//! was started for, so a task that was torn down can never overwrite the
//! state of its successor.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedsync_api_types::FeedEventEnvelope;
use futures::StreamExt;
use metrics::counter;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::domain::error::DomainError;
use crate::domain::events::{FeedEvent, FeedEventKind};

use super::feed_store::FeedStore;
use super::lock::recover;
use super::ports::{EventChannel, EventStream, GatewayError};

const SOURCE: &str = "application::listener";
const METRIC_EVENTS: &str = "feedsync_feed_events_total";
const METRIC_RECONNECTS: &str = "feedsync_listener_reconnects_total";

pub const DEFAULT_RECENT_EVENT_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting { .. } => "RECONNECTING",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Reconnecting { attempt } => write!(f, "RECONNECTING({attempt})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Exponential backoff between reconnect attempts after a channel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Zero disables reconnecting.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_attempts: 0,
        }
    }

    /// Delay before attempt `attempt` (1-based): doubles each time, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    pub reconnect: ReconnectPolicy,
    pub recent_event_limit: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            recent_event_limit: DEFAULT_RECENT_EVENT_LIMIT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to subscribe to feed `{feed_id}`: {source}")]
    Subscribe {
        feed_id: String,
        #[source]
        source: GatewayError,
    },
    #[error("listener is not connected")]
    NotConnected,
    #[error(transparent)]
    Decode(#[from] DomainError),
    #[error("failed to apply `{kind}` event: {source}")]
    Apply {
        kind: &'static str,
        #[source]
        source: GatewayError,
    },
}

#[derive(Debug, Default)]
struct Control {
    generation: u64,
    feed_id: Option<String>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    store: Arc<FeedStore>,
    channel: Arc<dyn EventChannel>,
    options: ListenerOptions,
    control: Mutex<Control>,
    state: watch::Sender<ConnectionState>,
    recent: Mutex<VecDeque<FeedEventEnvelope>>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        recover(self.control.lock(), SOURCE, "is_current").generation == generation
    }

    /// Publish `state` only while `generation` is still the active one.
    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let control = recover(self.control.lock(), SOURCE, "set_state");
        if control.generation != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    fn record_error(&self, error: &dyn fmt::Display) {
        *recover(self.last_error.lock(), SOURCE, "record_error") = Some(error.to_string());
    }

    fn remember(&self, envelope: &FeedEventEnvelope) {
        let mut recent = recover(self.recent.lock(), SOURCE, "remember");
        recent.push_front(envelope.clone());
        recent.truncate(self.options.recent_event_limit);
    }

    async fn apply(&self, feed_id: &str, envelope: FeedEventEnvelope) -> Result<(), ListenerError> {
        self.remember(&envelope);
        let event = match FeedEvent::try_from(envelope) {
            Ok(event) => event,
            Err(err) => {
                counter!(METRIC_EVENTS, "kind" => "invalid").increment(1);
                return Err(err.into());
            }
        };
        let kind = event.kind.wire_name();
        counter!(METRIC_EVENTS, "kind" => kind).increment(1);

        match event.kind {
            FeedEventKind::PostCreated | FeedEventKind::PostUpdated => {
                self.store
                    .reload(feed_id)
                    .await
                    .map_err(|source| ListenerError::Apply { kind, source })?;
            }
            FeedEventKind::ModerationUpdated { status, reason } => {
                let found = self.store.apply_moderation_update(&event.post_id, status);
                debug!(
                    post_id = %event.post_id,
                    status = status.as_str(),
                    reason = reason.as_deref(),
                    found,
                    "moderation update applied"
                );
            }
            FeedEventKind::CommentCreated { .. } => {
                self.store
                    .reload_comments(&event.post_id)
                    .await
                    .map_err(|source| ListenerError::Apply { kind, source })?;
            }
            FeedEventKind::LikeUpdated { like_count } => {
                debug!(post_id = %event.post_id, ?like_count, "like update ignored");
            }
        }
        Ok(())
    }
}

pub struct EventListener {
    shared: Arc<Shared>,
}

impl EventListener {
    pub fn new(
        store: Arc<FeedStore>,
        channel: Arc<dyn EventChannel>,
        options: ListenerOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                store,
                channel,
                options,
                control: Mutex::new(Control::default()),
                state,
                recent: Mutex::new(VecDeque::new()),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Received events, newest first.
    pub fn recent_events(&self) -> Vec<FeedEventEnvelope> {
        recover(self.shared.recent.lock(), SOURCE, "recent_events")
            .iter()
            .cloned()
            .collect()
    }

    pub fn last_error(&self) -> Option<String> {
        recover(self.shared.last_error.lock(), SOURCE, "last_error").clone()
    }

    pub fn current_feed(&self) -> Option<String> {
        recover(self.shared.control.lock(), SOURCE, "current_feed")
            .feed_id
            .clone()
    }

    /// Subscribe to `feed_id`, replacing any existing subscription.
    #[instrument(skip(self))]
    pub async fn connect(&self, feed_id: &str) -> Result<(), ListenerError> {
        let generation = {
            let mut control = recover(self.shared.control.lock(), SOURCE, "connect");
            if let Some(task) = control.task.take() {
                task.abort();
            }
            control.generation += 1;
            control.feed_id = Some(feed_id.to_string());
            self.shared.state.send_replace(ConnectionState::Connecting);
            control.generation
        };
        *recover(self.shared.last_error.lock(), SOURCE, "connect") = None;

        let stream = match self.shared.channel.subscribe(feed_id).await {
            Ok(stream) => stream,
            Err(source) => {
                self.shared.record_error(&source);
                let mut control = recover(self.shared.control.lock(), SOURCE, "connect_failed");
                if control.generation == generation {
                    control.feed_id = None;
                    self.shared.state.send_replace(ConnectionState::Disconnected);
                }
                warn!(error = %source, "subscription failed");
                return Err(ListenerError::Subscribe {
                    feed_id: feed_id.to_string(),
                    source,
                });
            }
        };

        let mut control = recover(self.shared.control.lock(), SOURCE, "connect_spawn");
        if control.generation != generation {
            debug!("connect superseded before the subscription was established");
            return Ok(());
        }
        self.shared.state.send_replace(ConnectionState::Connected);
        control.task = Some(tokio::spawn(run(
            self.shared.clone(),
            generation,
            feed_id.to_string(),
            stream,
        )));
        info!("listener connected");
        Ok(())
    }

    /// Stop applying events and release the subscription.
    pub fn disconnect(&self) {
        let mut control = recover(self.shared.control.lock(), SOURCE, "disconnect");
        if let Some(task) = control.task.take() {
            task.abort();
        }
        control.generation += 1;
        let was_connected = control.feed_id.take().is_some();
        self.shared.state.send_replace(ConnectionState::Disconnected);
        if was_connected {
            info!("listener disconnected");
        }
    }

    /// Apply one event to the store as if it had arrived on the subscription.
    pub async fn handle_event(&self, envelope: FeedEventEnvelope) -> Result<(), ListenerError> {
        let feed_id = self.current_feed().ok_or(ListenerError::NotConnected)?;
        self.shared.apply(&feed_id, envelope).await
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        let mut control = recover(self.shared.control.lock(), SOURCE, "drop");
        if let Some(task) = control.task.take() {
            task.abort();
        }
        control.generation += 1;
    }
}

async fn run(shared: Arc<Shared>, generation: u64, feed_id: String, mut stream: EventStream) {
    loop {
        let failure = loop {
            match stream.next().await {
                Some(Ok(envelope)) => {
                    if !shared.is_current(generation) {
                        return;
                    }
                    let kind = envelope.kind.clone();
                    if let Err(err) = shared.apply(&feed_id, envelope).await {
                        warn!(feed_id = %feed_id, event_kind = %kind, error = %err, "failed to apply feed event");
                    }
                }
                Some(Err(err)) => break err,
                None => break GatewayError::ChannelClosed,
            }
        };

        if !shared.is_current(generation) {
            return;
        }
        shared.record_error(&failure);
        warn!(feed_id = %feed_id, error = %failure, "event subscription failed");

        match reconnect(&shared, generation, &feed_id).await {
            Some(next) => stream = next,
            None => return,
        }
    }
}

async fn reconnect(shared: &Shared, generation: u64, feed_id: &str) -> Option<EventStream> {
    let policy = shared.options.reconnect;
    for attempt in 1..=policy.max_attempts {
        if !shared.set_state(generation, ConnectionState::Reconnecting { attempt }) {
            return None;
        }
        counter!(METRIC_RECONNECTS).increment(1);
        tokio::time::sleep(policy.backoff_for(attempt)).await;

        if !shared.set_state(generation, ConnectionState::Connecting) {
            return None;
        }
        match shared.channel.subscribe(feed_id).await {
            Ok(stream) => {
                // Events may have been missed while the channel was down.
                if let Err(err) = shared.store.reload(feed_id).await {
                    warn!(feed_id, error = %err, "reload after reconnect failed");
                }
                if !shared.set_state(generation, ConnectionState::Connected) {
                    return None;
                }
                info!(feed_id, attempt, "listener reconnected");
                return Some(stream);
            }
            Err(err) => {
                shared.record_error(&err);
                warn!(feed_id, attempt, error = %err, "reconnect attempt failed");
            }
        }
    }

    if shared.set_state(generation, ConnectionState::Disconnected) {
        let mut control = recover(shared.control.lock(), SOURCE, "give_up");
        if control.generation == generation {
            control.feed_id = None;
            control.task = None;
        }
        warn!(feed_id, attempts = policy.max_attempts, "listener gave up reconnecting");
    }
    None
}
