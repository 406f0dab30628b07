//! Service layer: the coordination subsystems.

pub mod conflict_resolver;
pub mod coordinator;
pub mod event_bus;
pub mod leader_elector;
pub mod messenger;
pub mod registry;
pub mod resource_arbiter;
pub mod state_store;
pub mod task_dispatcher;

pub use conflict_resolver::{ConflictResolver, ResolverConfig};
pub use coordinator::{Statistics, SubmitAck, SwarmCoordinator};
pub use event_bus::{BusEvent, EventBus};
pub use leader_elector::{ElectionEvent, ElectorConfig, LeaderElector};
pub use messenger::{MessengerConfig, MessengerStatsSnapshot, SwarmMessenger};
pub use registry::{
    HeartbeatConfig, HeartbeatDaemon, HeartbeatHandle, HeartbeatStatus, SwarmRegistry,
};
pub use resource_arbiter::{ArbiterStatsSnapshot, ResourceArbiter};
pub use state_store::{StateStoreConfig, SwarmStateStore};
pub use task_dispatcher::{
    strategy_for, CapabilityMatch, DispatcherConfig, DispatcherStatsSnapshot, DrainReport,
    LeastLoaded, PriorityMatch, RoundRobin, SelectionStrategy, TaskDispatcher,
};
