//! Swarm coordinator — the public orchestration API.
//!
//! One coordinator per process. It owns the registry, messenger, elector,
//! dispatcher, arbiter, resolver, and state store by unique ownership;
//! children report upward only through the event bus and the election
//! channel, never through back-pointers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{
    Conflict, ConflictVote, CoordinatorConfig, CoordinatorEvent, MessageEnvelope, RecoveryCheckpoint,
    Resolution, ResourceAllocation, SnapshotReceipt, SwarmRecord, SwarmStatus, TaskSpec,
};
use crate::domain::ports::{handler_fn, MessageHandler};
use crate::infrastructure::codec::JsonCodec;
use crate::infrastructure::compressor::GzipCompressor;
use crate::infrastructure::redis::{KeySpace, RedisHandle};
use crate::services::conflict_resolver::{ConflictResolver, ResolverConfig};
use crate::services::event_bus::{BusEvent, EventBus};
use crate::services::leader_elector::{ElectionEvent, ElectorConfig, LeaderElector};
use crate::services::messenger::{MessengerConfig, SwarmMessenger};
use crate::services::registry::{HeartbeatConfig, HeartbeatDaemon, HeartbeatHandle, SwarmRegistry};
use crate::services::resource_arbiter::ResourceArbiter;
use crate::services::state_store::{StateStoreConfig, SwarmStateStore};
use crate::services::task_dispatcher::{strategy_for, DispatcherConfig, TaskDispatcher};

/// Deadline for follower-to-leader forwarded calls.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Acknowledgement for a task submission; not a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitAck {
    /// The leader placed the task directly.
    Dispatched { target: String },
    /// The task waits in the shared queue.
    Queued { entry_id: Uuid },
    /// A follower forwarded the task to the current leader.
    Forwarded { leader: String },
}

/// Read-only snapshot of coordinator counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    pub swarm_id: String,
    pub is_leader: bool,
    pub current_leader: Option<String>,
    pub leadership_changes: u64,
    pub tasks_submitted: u64,
    pub tasks_dispatched: u64,
    pub tasks_queued: u64,
    pub tasks_requeued: u64,
    pub tasks_dead_lettered: u64,
    pub conflicts_resolved: u64,
    pub resources_allocated: u64,
    pub resources_released: u64,
    pub resource_denials: u64,
    pub messages_published: u64,
    pub messages_received: u64,
    pub loopback_dropped: u64,
    pub decode_errors: u64,
    pub request_timeouts: u64,
    pub heartbeats_sent: u64,
}

/// Everything the leader-only loops need; children only, no coordinator
/// back-pointer.
#[derive(Clone)]
struct LeaderCtx {
    swarm_id: String,
    config: CoordinatorConfig,
    registry: Arc<SwarmRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    arbiter: Arc<ResourceArbiter>,
    messenger: Arc<SwarmMessenger>,
    event_bus: Arc<EventBus>,
}

/// Composes the subsystems and exposes the orchestration API.
pub struct SwarmCoordinator {
    swarm_id: String,
    config: CoordinatorConfig,
    registry: Arc<SwarmRegistry>,
    messenger: Arc<SwarmMessenger>,
    elector: Arc<LeaderElector>,
    dispatcher: Arc<TaskDispatcher>,
    arbiter: Arc<ResourceArbiter>,
    resolver: Arc<ConflictResolver>,
    state_store: Arc<SwarmStateStore>,
    event_bus: Arc<EventBus>,
    heartbeat_handle: HeartbeatHandle,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tasks_submitted: AtomicU64,
    shut_down: AtomicBool,
}

impl SwarmCoordinator {
    /// Register, subscribe, and join leader election under `swarm_id`.
    pub async fn initialize(
        swarm_id: impl Into<String>,
        config: CoordinatorConfig,
    ) -> SwarmResult<Arc<Self>> {
        Self::initialize_with(
            SwarmRecord::new(swarm_id),
            config,
            CancellationToken::new(),
        )
        .await
    }

    /// Full-control initializer: caller supplies the registry record
    /// (capabilities, priority, tags) and a cancellation token. Partial
    /// setup is undone when the token fires or a step fails.
    pub async fn initialize_with(
        record: SwarmRecord,
        config: CoordinatorConfig,
        cancel: CancellationToken,
    ) -> SwarmResult<Arc<Self>> {
        config
            .validate()
            .map_err(|err| SwarmError::Internal(format!("invalid configuration: {err}")))?;
        let swarm_id = record.swarm_id.clone();
        info!(swarm_id = %swarm_id, "initializing coordinator");

        let redis = RedisHandle::connect(&config.redis_url).await?;
        let keys = KeySpace::new(config.key_prefix.clone());
        let codec = Arc::new(JsonCodec::new(config.max_message_size));
        let event_bus = Arc::new(EventBus::default());

        let registry = Arc::new(SwarmRegistry::new(redis.clone(), keys.clone()));
        ensure_live(&cancel)?;

        registry.register(&record).await?;

        // from here on, teardown on any failure
        let result = Self::bring_up(
            record, config, cancel, redis, keys, codec, event_bus, registry.clone(),
        )
        .await;
        if let Err(ref err) = result {
            warn!(swarm_id = %swarm_id, error = %err, "initialization failed, undoing setup");
            let _ = registry.deregister(&swarm_id, "initialization failed").await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn bring_up(
        record: SwarmRecord,
        config: CoordinatorConfig,
        cancel: CancellationToken,
        redis: RedisHandle,
        keys: KeySpace,
        codec: Arc<JsonCodec>,
        event_bus: Arc<EventBus>,
        registry: Arc<SwarmRegistry>,
    ) -> SwarmResult<Arc<Self>> {
        let swarm_id = record.swarm_id.clone();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let messenger = Arc::new(SwarmMessenger::new(
            swarm_id.clone(),
            redis.clone(),
            keys.clone(),
            codec,
            MessengerConfig {
                message_retention: config.message_retention,
                message_ttl: config.message_ttl(),
            },
        ));
        match messenger.start().await {
            Ok(handle) => tasks.push(handle),
            Err(err) => return Err(err),
        }
        if ensure_live(&cancel).is_err() {
            abort_setup(&messenger, &mut tasks).await;
            return Err(cancelled());
        }

        let (election_tx, election_rx) = mpsc::channel(32);
        let elector = Arc::new(LeaderElector::new(
            swarm_id.clone(),
            redis.clone(),
            keys.clone(),
            ElectorConfig {
                leader_ttl: config.leader_ttl(),
                renew_interval: config.leader_renew_interval(),
            },
            election_tx,
        ));

        let dispatcher = Arc::new(TaskDispatcher::new(
            swarm_id.clone(),
            redis.clone(),
            keys.clone(),
            registry.clone(),
            messenger.clone(),
            event_bus.clone(),
            strategy_for(config.task_strategy),
            DispatcherConfig {
                max_attempts: config.max_attempts,
                dead_letter_ttl: config.dead_letter_ttl(),
            },
        ));
        let arbiter = Arc::new(ResourceArbiter::new(redis.clone(), keys.clone()));
        let resolver = Arc::new(ConflictResolver::new(
            swarm_id.clone(),
            registry.clone(),
            messenger.clone(),
            ResolverConfig {
                strategy: config.conflict_strategy,
                vote_timeout: config.vote_timeout(),
            },
        ));
        let state_store = Arc::new(SwarmStateStore::new(
            redis.clone(),
            keys.clone(),
            Arc::new(GzipCompressor::new()),
            StateStoreConfig {
                state_ttl: config.state_ttl(),
                checkpoint_ttl: config.checkpoint_ttl(),
            },
        ));

        wire_handlers(
            &messenger,
            &dispatcher,
            &arbiter,
            &resolver,
            &event_bus,
            elector.leader_flag(),
            &swarm_id,
        )
        .await;

        // subscriptions are up: announce ourselves live
        if let Err(err) = registry.update_status(&swarm_id, SwarmStatus::Active).await {
            abort_setup(&messenger, &mut tasks).await;
            return Err(err);
        }
        if ensure_live(&cancel).is_err() {
            abort_setup(&messenger, &mut tasks).await;
            return Err(cancelled());
        }

        let heartbeat = HeartbeatDaemon::new(
            registry.clone(),
            record,
            HeartbeatConfig {
                interval: config.heartbeat_interval(),
                max_consecutive_failures: 3,
            },
        );
        let heartbeat_handle = heartbeat.handle();
        tasks.push(tokio::spawn(heartbeat.run()));

        tasks.push(tokio::spawn(elector.clone().run()));

        let ctx = LeaderCtx {
            swarm_id: swarm_id.clone(),
            config: config.clone(),
            registry: registry.clone(),
            dispatcher: dispatcher.clone(),
            arbiter: arbiter.clone(),
            messenger: messenger.clone(),
            event_bus: event_bus.clone(),
        };
        let root = CancellationToken::new();
        tasks.push(tokio::spawn(election_pump(
            election_rx,
            ctx,
            root.clone(),
        )));

        event_bus.publish(
            &swarm_id,
            CoordinatorEvent::Initialized {
                swarm_id: swarm_id.clone(),
            },
        );
        info!(swarm_id = %swarm_id, "coordinator initialized");

        Ok(Arc::new(Self {
            swarm_id,
            config,
            registry,
            messenger,
            elector,
            dispatcher,
            arbiter,
            resolver,
            state_store,
            event_bus,
            heartbeat_handle,
            cancel: root,
            tasks: Mutex::new(tasks),
            tasks_submitted: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn swarm_id(&self) -> &str {
        &self.swarm_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    pub async fn current_leader(&self) -> Option<String> {
        self.elector.current_leader().await
    }

    /// Subscribe to the coordinator's event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.event_bus.subscribe()
    }

    /// Register a typed message handler.
    pub async fn on_message(&self, kind: &str, handler: Arc<dyn MessageHandler>) {
        self.messenger.on_message(kind, handler).await;
    }

    /// Submit a task. Leaders dispatch; followers forward to the leader or
    /// queue when no leader is known. The ack is not a completion.
    pub async fn submit_task(&self, task: TaskSpec) -> SwarmResult<SubmitAck> {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        let result = self.submit_task_inner(task).await;
        self.note_err(result)
    }

    async fn submit_task_inner(&self, task: TaskSpec) -> SwarmResult<SubmitAck> {
        if self.is_leader() {
            return match self.dispatcher.dispatch(&task).await {
                Ok(target) => Ok(SubmitAck::Dispatched { target }),
                Err(SwarmError::NoEligibleSwarm(_)) => {
                    let entry_id = self.dispatcher.enqueue(task).await?;
                    Ok(SubmitAck::Queued { entry_id })
                }
                Err(err) => Err(err),
            };
        }

        match self.current_leader().await {
            Some(leader) if leader != self.swarm_id => {
                self.messenger
                    .send_to(&leader, json!({ "type": "task_submit", "task": task }))
                    .await?;
                Ok(SubmitAck::Forwarded { leader })
            }
            _ => {
                // no (usable) leader yet; any future leader drains the queue
                let entry_id = self.dispatcher.enqueue(task).await?;
                Ok(SubmitAck::Queued { entry_id })
            }
        }
    }

    /// Seed a resource pool. Administrative; idempotent.
    pub async fn create_pool(&self, resource_type: &str, capacity: i64) -> SwarmResult<bool> {
        let result = self.arbiter.create_pool(resource_type, capacity).await;
        self.note_err(result)
    }

    /// Allocate from a pool for this swarm; forwarded to the leader when we
    /// are a follower.
    pub async fn allocate(
        &self,
        resource_type: &str,
        amount: i64,
    ) -> SwarmResult<ResourceAllocation> {
        let result = self.allocate_inner(resource_type, amount).await;
        self.note_err(result)
    }

    async fn allocate_inner(
        &self,
        resource_type: &str,
        amount: i64,
    ) -> SwarmResult<ResourceAllocation> {
        if self.is_leader() {
            let allocation = self
                .arbiter
                .allocate(resource_type, &self.swarm_id, amount)
                .await?;
            self.event_bus.publish(
                &self.swarm_id,
                CoordinatorEvent::ResourceAllocated {
                    resource_type: resource_type.to_string(),
                    swarm_id: self.swarm_id.clone(),
                    amount,
                },
            );
            return Ok(allocation);
        }

        let leader = self.leader_for_forwarding().await?;
        let response = self
            .messenger
            .request(
                &leader,
                json!({
                    "type": "resource_request",
                    "op": "allocate",
                    "resourceType": resource_type,
                    "amount": amount,
                }),
                FORWARD_TIMEOUT,
            )
            .await?;
        let allocation = response
            .payload
            .get("allocation")
            .cloned()
            .ok_or_else(|| SwarmError::Internal("allocation response missing body".into()))?;
        let allocation: ResourceAllocation = serde_json::from_value(allocation)
            .map_err(|err| SwarmError::Internal(format!("allocation response: {err}")))?;
        self.event_bus.publish(
            &self.swarm_id,
            CoordinatorEvent::ResourceAllocated {
                resource_type: resource_type.to_string(),
                swarm_id: self.swarm_id.clone(),
                amount,
            },
        );
        Ok(allocation)
    }

    /// Release back into a pool; forwarded to the leader when we are a
    /// follower. Returns the pool's new available count.
    pub async fn release(&self, resource_type: &str, amount: i64) -> SwarmResult<i64> {
        let result = self.release_inner(resource_type, amount).await;
        self.note_err(result)
    }

    async fn release_inner(&self, resource_type: &str, amount: i64) -> SwarmResult<i64> {
        if self.is_leader() {
            let available = self
                .arbiter
                .release(resource_type, &self.swarm_id, amount)
                .await?;
            self.event_bus.publish(
                &self.swarm_id,
                CoordinatorEvent::ResourceReleased {
                    resource_type: resource_type.to_string(),
                    swarm_id: self.swarm_id.clone(),
                    amount,
                },
            );
            return Ok(available);
        }

        let leader = self.leader_for_forwarding().await?;
        let response = self
            .messenger
            .request(
                &leader,
                json!({
                    "type": "resource_request",
                    "op": "release",
                    "resourceType": resource_type,
                    "amount": amount,
                }),
                FORWARD_TIMEOUT,
            )
            .await?;
        let available = response
            .payload
            .get("available")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| SwarmError::Internal("release response missing body".into()))?;
        self.event_bus.publish(
            &self.swarm_id,
            CoordinatorEvent::ResourceReleased {
                resource_type: resource_type.to_string(),
                swarm_id: self.swarm_id.clone(),
                amount,
            },
        );
        Ok(available)
    }

    async fn leader_for_forwarding(&self) -> SwarmResult<String> {
        match self.current_leader().await {
            Some(leader) if leader != self.swarm_id => Ok(leader),
            _ => Err(SwarmError::Unavailable("no leader elected yet".into())),
        }
    }

    /// Targeted message passthrough.
    pub async fn send_to(&self, target_swarm: &str, payload: serde_json::Value) -> SwarmResult<Uuid> {
        let result = self.messenger.send_to(target_swarm, payload).await;
        self.note_err(result)
    }

    /// Broadcast passthrough.
    pub async fn broadcast(&self, payload: serde_json::Value) -> SwarmResult<Uuid> {
        let result = self.messenger.broadcast(payload).await;
        self.note_err(result)
    }

    /// Request/response passthrough.
    pub async fn request(
        &self,
        target_swarm: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> SwarmResult<MessageEnvelope> {
        let result = self.messenger.request(target_swarm, payload, timeout).await;
        self.note_err(result)
    }

    /// Telemetry passthrough.
    pub async fn publish_event(&self, payload: serde_json::Value) -> SwarmResult<Uuid> {
        let result = self.messenger.publish_event(payload).await;
        self.note_err(result)
    }

    /// Agent-directed message passthrough.
    pub async fn send_agent(
        &self,
        target_swarm: &str,
        target_agent: &str,
        payload: serde_json::Value,
    ) -> SwarmResult<Uuid> {
        let result = self
            .messenger
            .send_agent(target_swarm, target_agent, payload)
            .await;
        self.note_err(result)
    }

    /// Task-channel message passthrough.
    pub async fn send_task(&self, payload: serde_json::Value) -> SwarmResult<Uuid> {
        let result = self.messenger.send_task(payload).await;
        self.note_err(result)
    }

    /// Subscribe the messenger to an additional channel.
    pub async fn subscribe(&self, channel: &str) -> SwarmResult<()> {
        self.messenger.subscribe(channel).await
    }

    /// Subscribe the messenger to a channel pattern.
    pub async fn subscribe_pattern(&self, pattern: &str) -> SwarmResult<()> {
        self.messenger.subscribe_pattern(pattern).await
    }

    /// Drop an extra channel subscription.
    pub async fn unsubscribe(&self, channel: &str) -> SwarmResult<()> {
        self.messenger.unsubscribe(channel).await
    }

    /// Read back recent envelopes from a channel's history, newest first.
    pub async fn get_history(
        &self,
        channel: &str,
        limit: usize,
    ) -> SwarmResult<Vec<MessageEnvelope>> {
        self.messenger.get_history(channel, limit).await
    }

    /// Resolve a conflict with the configured strategy.
    pub async fn resolve_conflict(&self, conflict: &Conflict) -> SwarmResult<Resolution> {
        let result = self.resolver.resolve(conflict).await;
        let result = self.note_err(result);
        if let Ok(ref resolution) = result {
            self.event_bus.publish(
                &self.swarm_id,
                CoordinatorEvent::ConflictResolved {
                    conflict_id: resolution.conflict_id,
                    winner: resolution.winner.clone(),
                    strategy: resolution.strategy,
                },
            );
        }
        result
    }

    /// Store this swarm's state snapshot.
    pub async fn snapshot(&self, state: &serde_json::Value) -> SwarmResult<SnapshotReceipt> {
        let result = self.state_store.snapshot(&self.swarm_id, state).await;
        self.note_err(result)
    }

    /// Restore the latest snapshot of this swarm's state.
    pub async fn restore_latest(&self) -> SwarmResult<serde_json::Value> {
        let result = self.state_store.restore_latest(&self.swarm_id).await;
        self.note_err(result)
    }

    /// Take a durable recovery checkpoint.
    pub async fn checkpoint(
        &self,
        phase: &str,
        confidence: f64,
        state: &serde_json::Value,
    ) -> SwarmResult<RecoveryCheckpoint> {
        let result = self
            .state_store
            .checkpoint(&self.swarm_id, phase, confidence, state)
            .await;
        self.note_err(result)
    }

    /// List this swarm's checkpoints, newest first.
    pub async fn list_checkpoints(&self) -> SwarmResult<Vec<RecoveryCheckpoint>> {
        self.state_store.list_checkpoints(&self.swarm_id).await
    }

    /// Read-only counter snapshot.
    pub async fn statistics(&self) -> Statistics {
        let messenger = self.messenger.stats();
        let dispatcher = self.dispatcher.stats();
        let arbiter = self.arbiter.stats();
        let heartbeat = self.heartbeat_handle.status().await;
        Statistics {
            swarm_id: self.swarm_id.clone(),
            is_leader: self.is_leader(),
            current_leader: self.current_leader().await,
            leadership_changes: self.elector.leadership_changes(),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_dispatched: dispatcher.dispatched,
            tasks_queued: dispatcher.queued,
            tasks_requeued: dispatcher.requeued,
            tasks_dead_lettered: dispatcher.dead_lettered,
            conflicts_resolved: self.resolver.resolved_count(),
            resources_allocated: arbiter.allocations,
            resources_released: arbiter.releases,
            resource_denials: arbiter.denials,
            messages_published: messenger.published,
            messages_received: messenger.received,
            loopback_dropped: messenger.loopback_dropped,
            decode_errors: messenger.decode_errors,
            request_timeouts: messenger.request_timeouts,
            heartbeats_sent: heartbeat.beats_sent,
        }
    }

    /// Graceful stop: leader duties end, the lease is released, loops are
    /// cancelled and awaited, resources returned, record removed.
    /// Idempotent; a second call returns immediately.
    pub async fn shutdown(&self) -> SwarmResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(swarm_id = %self.swarm_id, "shutting down coordinator");

        let was_leader = self.elector.is_leader();
        self.cancel.cancel();
        self.elector.stop();
        self.heartbeat_handle.stop();
        if was_leader {
            if let Err(err) = self.elector.release().await {
                warn!(error = %err, "could not release leadership lease");
            }
        }
        self.messenger.close().await;

        for handle in self.tasks.lock().await.drain(..) {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    debug!(error = %err, "background task ended abnormally");
                }
            }
        }

        if let Err(err) = self.arbiter.deallocate_all(&self.swarm_id).await {
            warn!(error = %err, "could not return outstanding allocations");
        }
        if let Err(err) = self
            .registry
            .deregister(&self.swarm_id, "graceful shutdown")
            .await
        {
            warn!(error = %err, "could not deregister");
        }

        self.event_bus.publish(
            &self.swarm_id,
            CoordinatorEvent::Shutdown {
                swarm_id: self.swarm_id.clone(),
            },
        );
        info!(swarm_id = %self.swarm_id, "coordinator stopped");
        Ok(())
    }

    /// Mirror failures onto the event bus so observers can react without
    /// wrapping every call.
    fn note_err<T>(&self, result: SwarmResult<T>) -> SwarmResult<T> {
        if let Err(ref err) = result {
            self.event_bus.publish(
                &self.swarm_id,
                CoordinatorEvent::Error {
                    kind: err.kind(),
                    message: err.to_string(),
                },
            );
        }
        result
    }
}

fn cancelled() -> SwarmError {
    SwarmError::Internal("initialization cancelled".into())
}

/// Undo partial bring-up: close the messenger and stop spawned loops.
async fn abort_setup(messenger: &Arc<SwarmMessenger>, tasks: &mut Vec<JoinHandle<()>>) {
    messenger.close().await;
    for handle in tasks.drain(..) {
        handle.abort();
    }
}

fn ensure_live(cancel: &CancellationToken) -> SwarmResult<()> {
    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    Ok(())
}

/// Register the coordinator's own protocol handlers.
async fn wire_handlers(
    messenger: &Arc<SwarmMessenger>,
    dispatcher: &Arc<TaskDispatcher>,
    arbiter: &Arc<ResourceArbiter>,
    resolver: &Arc<ConflictResolver>,
    event_bus: &Arc<EventBus>,
    leader_flag: Arc<AtomicBool>,
    swarm_id: &str,
) {
    // followers forward task submissions here
    {
        let dispatcher = dispatcher.clone();
        let leader_flag = leader_flag.clone();
        messenger
            .on_message(
                "task_submit",
                handler_fn(move |envelope: MessageEnvelope| {
                    let dispatcher = dispatcher.clone();
                    let leader_flag = leader_flag.clone();
                    async move {
                        let Some(task) = envelope.payload.get("task").cloned() else {
                            warn!("task_submit without task body");
                            return;
                        };
                        let task: TaskSpec = match serde_json::from_value(task) {
                            Ok(task) => task,
                            Err(err) => {
                                warn!(error = %err, "malformed forwarded task");
                                return;
                            }
                        };
                        if leader_flag.load(Ordering::Acquire) {
                            match dispatcher.dispatch(&task).await {
                                Ok(_) => {}
                                Err(SwarmError::NoEligibleSwarm(_)) => {
                                    let _ = dispatcher.enqueue(task).await;
                                }
                                Err(err) => warn!(error = %err, "forwarded dispatch failed"),
                            }
                        } else {
                            // stale forward: keep the task safe in the queue
                            let _ = dispatcher.enqueue(task).await;
                        }
                    }
                }),
            )
            .await;
    }

    // followers forward allocate/release here; only the leader serves them
    {
        let arbiter = arbiter.clone();
        let messenger_out = messenger.clone();
        let event_bus = event_bus.clone();
        let leader_flag = leader_flag.clone();
        let local_id = swarm_id.to_string();
        messenger
            .on_message(
                "resource_request",
                handler_fn(move |envelope: MessageEnvelope| {
                    let arbiter = arbiter.clone();
                    let messenger = messenger_out.clone();
                    let event_bus = event_bus.clone();
                    let leader_flag = leader_flag.clone();
                    let local_id = local_id.clone();
                    async move {
                        if !leader_flag.load(Ordering::Acquire) {
                            let _ = messenger.respond_error(&envelope, "not the leader").await;
                            return;
                        }
                        let op = envelope
                            .payload
                            .get("op")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let resource_type = envelope
                            .payload
                            .get("resourceType")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let amount = envelope
                            .payload
                            .get("amount")
                            .and_then(serde_json::Value::as_i64)
                            .unwrap_or(0);
                        let requester = envelope.from_swarm.clone();

                        match op.as_str() {
                            "allocate" => {
                                match arbiter.allocate(&resource_type, &requester, amount).await {
                                    Ok(allocation) => {
                                        event_bus.publish(
                                            &local_id,
                                            CoordinatorEvent::ResourceAllocated {
                                                resource_type: resource_type.clone(),
                                                swarm_id: requester,
                                                amount,
                                            },
                                        );
                                        let _ = messenger
                                            .respond(
                                                &envelope,
                                                json!({ "allocation": allocation }),
                                            )
                                            .await;
                                    }
                                    Err(err) => {
                                        let _ = messenger
                                            .respond_error(&envelope, &err.to_string())
                                            .await;
                                    }
                                }
                            }
                            "release" => {
                                match arbiter.release(&resource_type, &requester, amount).await {
                                    Ok(available) => {
                                        event_bus.publish(
                                            &local_id,
                                            CoordinatorEvent::ResourceReleased {
                                                resource_type: resource_type.clone(),
                                                swarm_id: requester,
                                                amount,
                                            },
                                        );
                                        let _ = messenger
                                            .respond(&envelope, json!({ "available": available }))
                                            .await;
                                    }
                                    Err(err) => {
                                        let _ = messenger
                                            .respond_error(&envelope, &err.to_string())
                                            .await;
                                    }
                                }
                            }
                            other => {
                                let _ = messenger
                                    .respond_error(
                                        &envelope,
                                        &format!("unknown resource op {other}"),
                                    )
                                    .await;
                            }
                        }
                    }
                }),
            )
            .await;
    }

    // every swarm votes deterministically on conflict ballots
    {
        let resolver = resolver.clone();
        let messenger_out = messenger.clone();
        let local_id = swarm_id.to_string();
        messenger
            .on_message(
                "conflict_vote_request",
                handler_fn(move |envelope: MessageEnvelope| {
                    let resolver = resolver.clone();
                    let messenger = messenger_out.clone();
                    let local_id = local_id.clone();
                    async move {
                        let Some(conflict_id) = envelope
                            .payload
                            .get("conflictId")
                            .and_then(serde_json::Value::as_str)
                            .and_then(|raw| Uuid::parse_str(raw).ok())
                        else {
                            return;
                        };
                        let claimants: Vec<String> = envelope
                            .payload
                            .get("claimants")
                            .and_then(|value| serde_json::from_value(value.clone()).ok())
                            .unwrap_or_default();
                        let Some(choice) = resolver.local_choice(&claimants).await else {
                            return;
                        };
                        let _ = messenger
                            .send_coordination(json!({
                                "type": "conflict_vote",
                                "conflictId": conflict_id,
                                "voter": local_id,
                                "choice": choice,
                            }))
                            .await;
                    }
                }),
            )
            .await;
    }

    // collected ballots route into any resolution this swarm is running
    {
        let resolver = resolver.clone();
        messenger
            .on_message(
                "conflict_vote",
                handler_fn(move |envelope: MessageEnvelope| {
                    let resolver = resolver.clone();
                    async move {
                        match serde_json::from_value::<ConflictVote>(envelope.payload.clone()) {
                            Ok(vote) => resolver.submit_vote(vote).await,
                            Err(err) => debug!(error = %err, "malformed conflict vote"),
                        }
                    }
                }),
            )
            .await;
    }

    // completion reports from executing swarms
    {
        let event_bus = event_bus.clone();
        let local_id = swarm_id.to_string();
        messenger
            .on_message(
                "task_completed",
                handler_fn(move |envelope: MessageEnvelope| {
                    let event_bus = event_bus.clone();
                    let local_id = local_id.clone();
                    async move {
                        let Some(task_id) = envelope
                            .payload
                            .get("taskId")
                            .and_then(serde_json::Value::as_str)
                            .and_then(|raw| Uuid::parse_str(raw).ok())
                        else {
                            return;
                        };
                        event_bus.publish(
                            &local_id,
                            CoordinatorEvent::TaskCompleted {
                                task_id,
                                swarm_id: envelope.from_swarm,
                            },
                        );
                    }
                }),
            )
            .await;
    }
}

/// Bridges election transitions onto the event bus and manages the
/// leader-only background loops.
async fn election_pump(
    mut election_rx: mpsc::Receiver<ElectionEvent>,
    ctx: LeaderCtx,
    root: CancellationToken,
) {
    let mut leader_token: Option<CancellationToken> = None;
    let mut leader_handles: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let event = tokio::select! {
            () = root.cancelled() => break,
            event = election_rx.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            ElectionEvent::BecameLeader => {
                ctx.event_bus.publish(
                    &ctx.swarm_id,
                    CoordinatorEvent::BecameLeader {
                        swarm_id: ctx.swarm_id.clone(),
                    },
                );
                if leader_token.is_none() {
                    let token = root.child_token();
                    leader_handles = spawn_leader_loops(&ctx, &token);
                    leader_token = Some(token);
                }
            }
            ElectionEvent::BecameFollower { reason } => {
                ctx.event_bus.publish(
                    &ctx.swarm_id,
                    CoordinatorEvent::BecameFollower {
                        swarm_id: ctx.swarm_id.clone(),
                        reason,
                    },
                );
                if let Some(token) = leader_token.take() {
                    token.cancel();
                }
                for handle in leader_handles.drain(..) {
                    let _ = handle.await;
                }
            }
            ElectionEvent::LeaderChanged { previous, current } => {
                ctx.event_bus.publish(
                    &ctx.swarm_id,
                    CoordinatorEvent::LeaderChanged { previous, current },
                );
            }
        }
    }

    if let Some(token) = leader_token {
        token.cancel();
    }
}

fn spawn_leader_loops(ctx: &LeaderCtx, token: &CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(dispatch_loop(ctx.clone(), token.clone())),
        tokio::spawn(health_loop(ctx.clone(), token.clone())),
        tokio::spawn(advisory_loop(ctx.clone(), token.clone())),
    ]
}

/// Leader loop: drain the shared queue every dispatch interval.
async fn dispatch_loop(ctx: LeaderCtx, token: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.dispatch_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(swarm_id = %ctx.swarm_id, "dispatch loop started");
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match ctx.dispatcher.drain(ctx.config.dispatch_batch).await {
            Ok(report) => {
                if report.dispatched + report.requeued + report.dead_lettered > 0 {
                    debug!(
                        dispatched = report.dispatched,
                        requeued = report.requeued,
                        dead_lettered = report.dead_lettered,
                        "drained task queue"
                    );
                }
            }
            Err(err) => {
                warn!(error = %err, "queue drain failed");
                ctx.event_bus.publish(
                    &ctx.swarm_id,
                    CoordinatorEvent::Error {
                        kind: err.kind(),
                        message: err.to_string(),
                    },
                );
            }
        }
    }
    debug!(swarm_id = %ctx.swarm_id, "dispatch loop stopped");
}

/// Leader loop: sweep stale swarms and publish health issues.
async fn health_loop(ctx: LeaderCtx, token: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.health_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(swarm_id = %ctx.swarm_id, "health sweep started");
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match ctx
            .registry
            .sweep_interrupted(ctx.config.interrupt_threshold())
            .await
        {
            Ok(interrupted) => {
                for swarm_id in interrupted {
                    let detail = "heartbeat stale past interrupt threshold".to_string();
                    let _ = ctx
                        .messenger
                        .publish_event(json!({
                            "type": "swarm_health_issue",
                            "swarmId": swarm_id,
                            "detail": detail,
                        }))
                        .await;
                    ctx.event_bus.publish(
                        &ctx.swarm_id,
                        CoordinatorEvent::SwarmHealthIssue { swarm_id, detail },
                    );
                }
            }
            Err(err) => warn!(error = %err, "health sweep failed"),
        }
    }
    debug!(swarm_id = %ctx.swarm_id, "health sweep stopped");
}

/// Leader loop: inspect pools against swarm load and publish advisories.
/// Observational only; the base design never preempts.
async fn advisory_loop(ctx: LeaderCtx, token: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.resource_advisory_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let types = match ctx.arbiter.known_types().await {
            Ok(types) => types,
            Err(err) => {
                debug!(error = %err, "advisory type listing failed");
                continue;
            }
        };
        for resource_type in types {
            let snapshot = match ctx.arbiter.pool_snapshot(&resource_type).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    debug!(resource_type = %resource_type, error = %err, "pool snapshot failed");
                    continue;
                }
            };
            let detail = if snapshot.available == 0 {
                Some("pool exhausted".to_string())
            } else {
                snapshot
                    .allocations
                    .iter()
                    .find(|(_, held)| **held * 2 > snapshot.accounted_total())
                    .map(|(swarm, held)| format!("swarm {swarm} holds {held} of the pool"))
            };
            if let Some(detail) = detail {
                let _ = ctx
                    .messenger
                    .publish_event(json!({
                        "type": "resource_advisory",
                        "resourceType": resource_type,
                        "detail": detail,
                    }))
                    .await;
                ctx.event_bus.publish(
                    &ctx.swarm_id,
                    CoordinatorEvent::ResourceAdvisory {
                        resource_type: resource_type.clone(),
                        detail,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_ack_variants_compare() {
        let ack = SubmitAck::Forwarded {
            leader: "swarm-b".into(),
        };
        assert_eq!(
            ack,
            SubmitAck::Forwarded {
                leader: "swarm-b".into()
            }
        );
        assert_ne!(
            ack,
            SubmitAck::Dispatched {
                target: "swarm-b".into()
            }
        );
    }
}
