//! Inter-swarm messaging over Redis pub/sub.
//!
//! Six channel patterns (broadcast, targeted, coordination, agent, task,
//! event) plus request/response correlation and a bounded per-channel
//! history. Delivery is at-most-once; the history list is best-effort
//! replay, not a durable queue.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{MessageEnvelope, MessageKind};
use crate::domain::ports::{MessageCodec, MessageHandler};
use crate::infrastructure::redis::{KeySpace, RedisHandle};

/// Messenger tunables.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// History entries retained per channel.
    pub message_retention: usize,
    /// History list expiry.
    pub message_ttl: Duration,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            message_retention: 1000,
            message_ttl: Duration::from_secs(3600),
        }
    }
}

/// Monotonic messenger counters.
#[derive(Debug, Default)]
pub struct MessengerStats {
    pub published: AtomicU64,
    pub received: AtomicU64,
    pub loopback_dropped: AtomicU64,
    pub decode_errors: AtomicU64,
    pub request_timeouts: AtomicU64,
    pub late_responses: AtomicU64,
}

/// Read-only view of [`MessengerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessengerStatsSnapshot {
    pub published: u64,
    pub received: u64,
    pub loopback_dropped: u64,
    pub decode_errors: u64,
    pub request_timeouts: u64,
    pub late_responses: u64,
}

impl MessengerStats {
    fn snapshot(&self) -> MessengerStatsSnapshot {
        MessengerStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            loopback_dropped: self.loopback_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
        }
    }
}

enum SubscriberCommand {
    Subscribe(String),
    SubscribePattern(String),
    Unsubscribe(String),
}

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<MessageEnvelope>>>>;
type HandlerMap = Arc<RwLock<HashMap<MessageKind, Arc<dyn MessageHandler>>>>;

/// Reliable-enough inter-swarm pub/sub with request/response and history.
pub struct SwarmMessenger {
    swarm_id: String,
    keys: KeySpace,
    redis: RedisHandle,
    codec: Arc<dyn MessageCodec>,
    config: MessengerConfig,
    pending: PendingMap,
    handlers: HandlerMap,
    default_handler: Arc<RwLock<Option<Arc<dyn MessageHandler>>>>,
    control_tx: Mutex<Option<mpsc::Sender<SubscriberCommand>>>,
    cancel: CancellationToken,
    stats: Arc<MessengerStats>,
}

impl SwarmMessenger {
    pub fn new(
        swarm_id: impl Into<String>,
        redis: RedisHandle,
        keys: KeySpace,
        codec: Arc<dyn MessageCodec>,
        config: MessengerConfig,
    ) -> Self {
        Self {
            swarm_id: swarm_id.into(),
            keys,
            redis,
            codec,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            default_handler: Arc::new(RwLock::new(None)),
            control_tx: Mutex::new(None),
            cancel: CancellationToken::new(),
            stats: Arc::new(MessengerStats::default()),
        }
    }

    pub fn swarm_id(&self) -> &str {
        &self.swarm_id
    }

    pub fn stats(&self) -> MessengerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Open the dedicated pub/sub connection, subscribe to this swarm's
    /// channels, and spawn the subscriber task.
    pub async fn start(&self) -> SwarmResult<JoinHandle<()>> {
        let mut pubsub = self.redis.client().get_async_pubsub().await?;

        let channels = vec![
            self.keys.swarm_channel(&self.swarm_id),
            self.keys.agent_channel(&self.swarm_id),
            self.keys.global_channel(),
            self.keys.coordination_channel(),
            self.keys.task_channel(),
            self.keys.event_channel(),
        ];
        for channel in &channels {
            pubsub.subscribe(channel).await?;
        }

        let (control_tx, control_rx) = mpsc::channel(32);
        *self.control_tx.lock().await = Some(control_tx);

        let task = SubscriberTask {
            swarm_id: self.swarm_id.clone(),
            redis: self.redis.clone(),
            codec: self.codec.clone(),
            pending: self.pending.clone(),
            handlers: self.handlers.clone(),
            default_handler: self.default_handler.clone(),
            stats: self.stats.clone(),
            cancel: self.cancel.clone(),
            channels: channels.into_iter().collect(),
            patterns: HashSet::new(),
            warned_kinds: HashSet::new(),
        };
        Ok(tokio::spawn(task.run(pubsub, control_rx)))
    }

    /// Stop the subscriber task, drop pending requests, and clear the
    /// handler table (handlers may hold an `Arc` back to this messenger).
    /// Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.control_tx.lock().await.take();
        self.pending.lock().await.clear();
        self.handlers.write().await.clear();
        self.default_handler.write().await.take();
    }

    /// Register a handler for a payload kind.
    pub async fn on_message(&self, kind: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .await
            .insert(MessageKind::parse(kind), handler);
    }

    /// Register the fallback for payload kinds nothing else claims.
    pub async fn on_unknown(&self, handler: Arc<dyn MessageHandler>) {
        *self.default_handler.write().await = Some(handler);
    }

    /// Targeted swarm-to-swarm send.
    pub async fn send_to(&self, target_swarm: &str, payload: Value) -> SwarmResult<Uuid> {
        let envelope = MessageEnvelope::targeted(&self.swarm_id, target_swarm, payload);
        self.publish_envelope(&self.keys.swarm_channel(target_swarm), &envelope)
            .await?;
        Ok(envelope.id)
    }

    /// Announce to every swarm.
    pub async fn broadcast(&self, payload: Value) -> SwarmResult<Uuid> {
        let envelope = MessageEnvelope::broadcast(&self.swarm_id, payload);
        self.publish_envelope(&self.keys.global_channel(), &envelope)
            .await?;
        Ok(envelope.id)
    }

    /// Leader-election and cluster-control traffic.
    pub async fn send_coordination(&self, payload: Value) -> SwarmResult<Uuid> {
        let envelope = MessageEnvelope::coordination(&self.swarm_id, payload);
        self.publish_envelope(&self.keys.coordination_channel(), &envelope)
            .await?;
        Ok(envelope.id)
    }

    /// Deliver to a specific agent inside a swarm.
    pub async fn send_agent(
        &self,
        target_swarm: &str,
        target_agent: &str,
        payload: Value,
    ) -> SwarmResult<Uuid> {
        let envelope = MessageEnvelope::agent(&self.swarm_id, target_swarm, target_agent, payload);
        self.publish_envelope(&self.keys.agent_channel(target_swarm), &envelope)
            .await?;
        Ok(envelope.id)
    }

    /// Task lifecycle traffic.
    pub async fn send_task(&self, payload: Value) -> SwarmResult<Uuid> {
        let envelope = MessageEnvelope::task(&self.swarm_id, payload);
        self.publish_envelope(&self.keys.task_channel(), &envelope)
            .await?;
        Ok(envelope.id)
    }

    /// Non-actionable telemetry.
    pub async fn publish_event(&self, payload: Value) -> SwarmResult<Uuid> {
        let envelope = MessageEnvelope::event(&self.swarm_id, payload);
        self.publish_envelope(&self.keys.event_channel(), &envelope)
            .await?;
        Ok(envelope.id)
    }

    /// Send a request and await its correlated response.
    ///
    /// On timeout the pending entry is removed so a late response is
    /// discarded instead of invoking a stale callback.
    pub async fn request(
        &self,
        target_swarm: &str,
        payload: Value,
        timeout: Duration,
    ) -> SwarmResult<MessageEnvelope> {
        let envelope = MessageEnvelope::request(&self.swarm_id, target_swarm, payload);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(envelope.id, tx);

        if let Err(err) = self
            .publish_envelope(&self.keys.swarm_channel(target_swarm), &envelope)
            .await
        {
            self.pending.lock().await.remove(&envelope.id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(message) = response.payload.get("error").and_then(Value::as_str) {
                    return Err(SwarmError::RemoteError {
                        swarm_id: response.from_swarm,
                        message: message.to_string(),
                    });
                }
                Ok(response)
            }
            Ok(Err(_closed)) => Err(SwarmError::Internal("messenger closed".into())),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&envelope.id);
                self.stats.request_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(SwarmError::Timeout(timeout))
            }
        }
    }

    /// Answer a request envelope.
    pub async fn respond(&self, original: &MessageEnvelope, payload: Value) -> SwarmResult<Uuid> {
        let envelope = MessageEnvelope::response_to(original, &self.swarm_id, payload);
        self.publish_envelope(&self.keys.swarm_channel(&original.from_swarm), &envelope)
            .await?;
        Ok(envelope.id)
    }

    /// Answer a request envelope with an error the requester surfaces as
    /// `RemoteError`.
    pub async fn respond_error(
        &self,
        original: &MessageEnvelope,
        message: &str,
    ) -> SwarmResult<Uuid> {
        self.respond(original, serde_json::json!({ "error": message }))
            .await
    }

    /// Route an envelope straight into the local handler table.
    ///
    /// Used when the local swarm is itself the target (e.g. the leader
    /// assigning a task to its own swarm): pub/sub delivery would be
    /// discarded by loopback suppression.
    pub async fn deliver_local(&self, envelope: MessageEnvelope) {
        let handler = match envelope.message_kind() {
            Some(kind) => self.handlers.read().await.get(&kind).cloned(),
            None => None,
        };
        let handler = match handler {
            Some(handler) => Some(handler),
            None => self.default_handler.read().await.clone(),
        };
        match handler {
            Some(handler) => {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move { handler.handle(envelope).await });
            }
            None => {
                debug!(kind = ?envelope.payload_kind(), "no local handler for self-delivery");
            }
        }
    }

    /// Subscribe the receive loop to an additional channel.
    pub async fn subscribe(&self, channel: &str) -> SwarmResult<()> {
        self.send_command(SubscriberCommand::Subscribe(channel.to_string()))
            .await
    }

    /// Subscribe with a glob pattern.
    pub async fn subscribe_pattern(&self, pattern: &str) -> SwarmResult<()> {
        self.send_command(SubscriberCommand::SubscribePattern(pattern.to_string()))
            .await
    }

    pub async fn unsubscribe(&self, channel: &str) -> SwarmResult<()> {
        self.send_command(SubscriberCommand::Unsubscribe(channel.to_string()))
            .await
    }

    async fn send_command(&self, command: SubscriberCommand) -> SwarmResult<()> {
        let guard = self.control_tx.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| SwarmError::Internal("messenger not started".into()))?;
        tx.send(command)
            .await
            .map_err(|_| SwarmError::Internal("messenger subscriber gone".into()))
    }

    /// Read back recent envelopes from a channel's history, newest first.
    pub async fn get_history(
        &self,
        channel: &str,
        limit: usize,
    ) -> SwarmResult<Vec<MessageEnvelope>> {
        let key = self.keys.history(channel);
        let upper = limit.min(self.config.message_retention);
        if upper == 0 {
            return Ok(Vec::new());
        }
        let frames: Vec<Vec<u8>> = self
            .redis
            .with_retry("messenger.get_history", |mut con| {
                let key = key.clone();
                async move {
                    redis::cmd("LRANGE")
                        .arg(&key)
                        .arg(0)
                        .arg((upper - 1) as isize)
                        .query_async(&mut con)
                        .await
                }
            })
            .await?;

        // batch decoding pays off once we are past a handful of frames
        let results = if frames.len() > 5 {
            self.codec.batch_decode(&frames)
        } else {
            frames.iter().map(|f| self.codec.decode(f)).collect()
        };

        let mut envelopes = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(envelope) => envelopes.push(envelope),
                Err(err) => {
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(channel, error = %err, "skipping malformed history entry");
                }
            }
        }
        Ok(envelopes)
    }

    /// Encode, publish, and append to the channel history in one pipeline.
    pub async fn publish_envelope(
        &self,
        channel: &str,
        envelope: &MessageEnvelope,
    ) -> SwarmResult<()> {
        if envelope.from_swarm != self.swarm_id {
            return Err(SwarmError::Internal(
                "envelope fromSwarm must be the local swarm id".into(),
            ));
        }
        let bytes = self.codec.encode(envelope)?;
        let history_key = self.keys.history(channel);
        let retention = self.config.message_retention;
        let ttl_secs = self.config.message_ttl.as_secs();

        let _: () = self
            .redis
            .with_retry("messenger.publish", |mut con| {
                let bytes = bytes.clone();
                let channel = channel.to_string();
                let history_key = history_key.clone();
                async move {
                    redis::pipe()
                        .cmd("PUBLISH")
                        .arg(&channel)
                        .arg(bytes.as_slice())
                        .ignore()
                        .cmd("LPUSH")
                        .arg(&history_key)
                        .arg(bytes.as_slice())
                        .ignore()
                        .cmd("LTRIM")
                        .arg(&history_key)
                        .arg(0)
                        .arg((retention - 1) as isize)
                        .ignore()
                        .cmd("EXPIRE")
                        .arg(&history_key)
                        .arg(ttl_secs)
                        .ignore()
                        .query_async(&mut con)
                        .await
                }
            })
            .await?;

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// The single task draining the pub/sub connection.
///
/// Handlers are spawned onto worker tasks so nothing here ever blocks the
/// drain loop.
struct SubscriberTask {
    swarm_id: String,
    redis: RedisHandle,
    codec: Arc<dyn MessageCodec>,
    pending: PendingMap,
    handlers: HandlerMap,
    default_handler: Arc<RwLock<Option<Arc<dyn MessageHandler>>>>,
    stats: Arc<MessengerStats>,
    cancel: CancellationToken,
    channels: HashSet<String>,
    patterns: HashSet<String>,
    warned_kinds: HashSet<String>,
}

enum Step {
    Cancelled,
    Command(Option<SubscriberCommand>),
    Message(Option<Vec<u8>>),
}

impl SubscriberTask {
    async fn run(
        mut self,
        mut pubsub: redis::aio::PubSub,
        mut control_rx: mpsc::Receiver<SubscriberCommand>,
    ) {
        debug!(swarm_id = %self.swarm_id, "messenger subscriber started");
        loop {
            let step = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    () = self.cancel.cancelled() => Step::Cancelled,
                    command = control_rx.recv() => Step::Command(command),
                    message = stream.next() => {
                        Step::Message(message.map(|m| m.get_payload_bytes().to_vec()))
                    }
                }
            };

            match step {
                Step::Cancelled | Step::Command(None) => break,
                Step::Command(Some(command)) => {
                    self.apply_command(&mut pubsub, command).await;
                }
                Step::Message(Some(bytes)) => self.route(&bytes).await,
                Step::Message(None) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    match self.reconnect().await {
                        Some(rebuilt) => pubsub = rebuilt,
                        None => break,
                    }
                }
            }
        }
        debug!(swarm_id = %self.swarm_id, "messenger subscriber stopped");
    }

    async fn apply_command(&mut self, pubsub: &mut redis::aio::PubSub, command: SubscriberCommand) {
        let result = match command {
            SubscriberCommand::Subscribe(channel) => {
                let outcome = pubsub.subscribe(&channel).await;
                self.channels.insert(channel);
                outcome
            }
            SubscriberCommand::SubscribePattern(pattern) => {
                let outcome = pubsub.psubscribe(&pattern).await;
                self.patterns.insert(pattern);
                outcome
            }
            SubscriberCommand::Unsubscribe(channel) => {
                self.channels.remove(&channel);
                pubsub.unsubscribe(&channel).await
            }
        };
        if let Err(err) = result {
            warn!(error = %err, "subscription change failed");
        }
    }

    /// Rebuild the pub/sub connection after a drop, with backoff. Gives up
    /// only when cancelled.
    async fn reconnect(&self) -> Option<redis::aio::PubSub> {
        let mut delay = Duration::from_millis(200);
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            warn!(swarm_id = %self.swarm_id, "pub/sub connection lost, reconnecting");
            match self.redis.client().get_async_pubsub().await {
                Ok(mut pubsub) => {
                    let mut ok = true;
                    for channel in &self.channels {
                        if pubsub.subscribe(channel).await.is_err() {
                            ok = false;
                            break;
                        }
                    }
                    for pattern in &self.patterns {
                        if pubsub.psubscribe(pattern).await.is_err() {
                            ok = false;
                            break;
                        }
                    }
                    if ok {
                        debug!(swarm_id = %self.swarm_id, "pub/sub reconnected");
                        return Some(pubsub);
                    }
                }
                Err(err) => {
                    debug!(error = %err, "pub/sub reconnect attempt failed");
                }
            }
            tokio::select! {
                () = self.cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(Duration::from_secs(5));
        }
    }

    async fn route(&mut self, bytes: &[u8]) {
        let envelope = match self.codec.decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "dropping undecodable message");
                return;
            }
        };

        // loopback suppression: never deliver our own traffic
        if envelope.from_swarm == self.swarm_id {
            self.stats.loopback_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        // response correlation runs before handler dispatch
        if envelope.channel_kind == crate::domain::models::ChannelKind::Response {
            if let Some(request_id) = envelope.request_id {
                let sender = self.pending.lock().await.remove(&request_id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(envelope);
                    }
                    None => {
                        // request already timed out; discard silently
                        self.stats.late_responses.fetch_add(1, Ordering::Relaxed);
                    }
                }
                return;
            }
        }

        let Some(kind) = envelope.message_kind() else {
            self.dispatch_unknown("<untyped>", envelope).await;
            return;
        };

        let handler = self.handlers.read().await.get(&kind).cloned();
        match handler {
            Some(handler) => {
                // long handler work must not stall the drain loop
                tokio::spawn(async move { handler.handle(envelope).await });
            }
            None => {
                let kind_name = kind.as_str().to_string();
                self.dispatch_unknown(&kind_name, envelope).await;
            }
        }
    }

    async fn dispatch_unknown(&mut self, kind: &str, envelope: MessageEnvelope) {
        if let Some(handler) = self.default_handler.read().await.clone() {
            tokio::spawn(async move { handler.handle(envelope).await });
            return;
        }
        if self.warned_kinds.insert(kind.to_string()) {
            warn!(kind, "no handler for message kind; dropping (logged once)");
        } else {
            debug!(kind, "no handler for message kind; dropping");
        }
    }
}
