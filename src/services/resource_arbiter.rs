//! Pooled resource allocation with strict conservation.
//!
//! For every resource type: `available + Σ per-swarm allocations =
//! capacity`, always, post-commit. Allocate and release are Lua scripts so
//! concurrent leaders during a split-brain window cannot double-spend a
//! pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{PoolSnapshot, ResourceAllocation};
use crate::infrastructure::redis::{KeySpace, RedisHandle};

/// Multi-key compare-and-update: check availability, then move the amount.
/// Returns `{status, value}`: status 1 = ok (value = remaining available),
/// -1 = insufficient (value = available), -2 = pool missing.
const ALLOCATE_SCRIPT: &str = r"
local avail = redis.call('GET', KEYS[1])
if not avail then return {-2, 0} end
avail = tonumber(avail)
local amount = tonumber(ARGV[1])
if avail < amount then return {-1, avail} end
local left = redis.call('DECRBY', KEYS[1], amount)
redis.call('INCRBY', KEYS[2], amount)
return {1, left}
";

/// Symmetric release; rejects returning more than is held.
/// Returns `{status, value}`: status 1 = ok (value = new available),
/// -1 = over-release (value = held).
const RELEASE_SCRIPT: &str = r"
local held = tonumber(redis.call('GET', KEYS[2]) or '0')
local amount = tonumber(ARGV[1])
if held < amount then return {-1, held} end
if held == amount then
  redis.call('DEL', KEYS[2])
else
  redis.call('DECRBY', KEYS[2], amount)
end
local avail = redis.call('INCRBY', KEYS[1], amount)
return {1, avail}
";

/// Return a swarm's entire outstanding allocation to the pool.
/// Returns the amount returned (0 when nothing was held).
const DEALLOCATE_SCRIPT: &str = r"
local held = tonumber(redis.call('GET', KEYS[2]) or '0')
if held > 0 then
  redis.call('INCRBY', KEYS[1], held)
  redis.call('DEL', KEYS[2])
end
return held
";

/// Monotonic arbiter counters.
#[derive(Debug, Default)]
pub struct ArbiterStats {
    pub allocations: AtomicU64,
    pub releases: AtomicU64,
    pub denials: AtomicU64,
}

/// Read-only view of [`ArbiterStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterStatsSnapshot {
    pub allocations: u64,
    pub releases: u64,
    pub denials: u64,
}

/// Tracks integer resource pools shared across swarms.
pub struct ResourceArbiter {
    keys: KeySpace,
    redis: RedisHandle,
    allocate_script: Script,
    release_script: Script,
    deallocate_script: Script,
    stats: ArbiterStats,
}

impl ResourceArbiter {
    pub fn new(redis: RedisHandle, keys: KeySpace) -> Self {
        Self {
            keys,
            redis,
            allocate_script: Script::new(ALLOCATE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            deallocate_script: Script::new(DEALLOCATE_SCRIPT),
            stats: ArbiterStats::default(),
        }
    }

    pub fn stats(&self) -> ArbiterStatsSnapshot {
        ArbiterStatsSnapshot {
            allocations: self.stats.allocations.load(Ordering::Relaxed),
            releases: self.stats.releases.load(Ordering::Relaxed),
            denials: self.stats.denials.load(Ordering::Relaxed),
        }
    }

    /// Seed a pool. Idempotent: returns false when the pool already exists,
    /// leaving its state untouched.
    pub async fn create_pool(&self, resource_type: &str, capacity: i64) -> SwarmResult<bool> {
        if capacity <= 0 {
            return Err(SwarmError::InvalidAmount(capacity));
        }
        let available_key = self.keys.resource_available(resource_type);
        let index_key = self.keys.resource_index();
        let created: i64 = self
            .redis
            .with_retry("arbiter.create_pool", |mut con| {
                let available_key = available_key.clone();
                let index_key = index_key.clone();
                let resource_type = resource_type.to_string();
                async move {
                    let created: i64 = redis::cmd("SETNX")
                        .arg(&available_key)
                        .arg(capacity)
                        .query_async(&mut con)
                        .await?;
                    let _: () = redis::cmd("SADD")
                        .arg(&index_key)
                        .arg(&resource_type)
                        .query_async(&mut con)
                        .await?;
                    Ok(created)
                }
            })
            .await?;
        if created == 1 {
            info!(resource_type, capacity, "resource pool created");
        }
        Ok(created == 1)
    }

    /// Atomically take `amount` from the pool for `swarm_id`.
    pub async fn allocate(
        &self,
        resource_type: &str,
        swarm_id: &str,
        amount: i64,
    ) -> SwarmResult<ResourceAllocation> {
        if amount <= 0 {
            return Err(SwarmError::InvalidAmount(amount));
        }
        let available_key = self.keys.resource_available(resource_type);
        let allocation_key = self.keys.resource_allocation(resource_type, swarm_id);

        let outcome: Vec<i64> = self
            .redis
            .with_retry("arbiter.allocate", |mut con| {
                let mut invocation = self.allocate_script.prepare_invoke();
                invocation
                    .key(&available_key)
                    .key(&allocation_key)
                    .arg(amount);
                async move { invocation.invoke_async(&mut con).await }
            })
            .await?;

        match outcome.first().copied() {
            Some(1) => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                debug!(resource_type, swarm_id, amount, "resources allocated");
                Ok(ResourceAllocation::new(resource_type, swarm_id, amount))
            }
            Some(-1) => {
                self.stats.denials.fetch_add(1, Ordering::Relaxed);
                Err(SwarmError::InsufficientResources {
                    resource_type: resource_type.to_string(),
                    requested: amount,
                    available: outcome.get(1).copied().unwrap_or(0),
                })
            }
            Some(-2) => Err(SwarmError::NotFound(format!(
                "resource pool {resource_type}"
            ))),
            _ => Err(SwarmError::Internal("allocate script returned garbage".into())),
        }
    }

    /// Return `amount` to the pool; rejects releasing more than is held.
    /// Returns the pool's new available count.
    pub async fn release(
        &self,
        resource_type: &str,
        swarm_id: &str,
        amount: i64,
    ) -> SwarmResult<i64> {
        if amount <= 0 {
            return Err(SwarmError::InvalidAmount(amount));
        }
        let available_key = self.keys.resource_available(resource_type);
        let allocation_key = self.keys.resource_allocation(resource_type, swarm_id);

        let outcome: Vec<i64> = self
            .redis
            .with_retry("arbiter.release", |mut con| {
                let mut invocation = self.release_script.prepare_invoke();
                invocation
                    .key(&available_key)
                    .key(&allocation_key)
                    .arg(amount);
                async move { invocation.invoke_async(&mut con).await }
            })
            .await?;

        match outcome.first().copied() {
            Some(1) => {
                self.stats.releases.fetch_add(1, Ordering::Relaxed);
                debug!(resource_type, swarm_id, amount, "resources released");
                Ok(outcome.get(1).copied().unwrap_or(0))
            }
            Some(-1) => Err(SwarmError::InvalidAmount(amount)),
            _ => Err(SwarmError::Internal("release script returned garbage".into())),
        }
    }

    /// Return every outstanding allocation held by `swarm_id`, across all
    /// known resource types. Called on deregistration.
    pub async fn deallocate_all(&self, swarm_id: &str) -> SwarmResult<Vec<ResourceAllocation>> {
        let types = self.known_types().await?;
        let mut returned = Vec::new();
        for resource_type in types {
            let available_key = self.keys.resource_available(&resource_type);
            let allocation_key = self.keys.resource_allocation(&resource_type, swarm_id);
            let held: i64 = self
                .redis
                .with_retry("arbiter.deallocate_all", |mut con| {
                    let mut invocation = self.deallocate_script.prepare_invoke();
                    invocation.key(&available_key).key(&allocation_key);
                    async move { invocation.invoke_async(&mut con).await }
                })
                .await?;
            if held > 0 {
                warn!(resource_type = %resource_type, swarm_id, amount = held, "returned orphaned allocation");
                returned.push(ResourceAllocation::new(&resource_type, swarm_id, held));
            }
        }
        Ok(returned)
    }

    /// Outstanding allocation for one `(type, swarm)` pair.
    pub async fn allocation(&self, resource_type: &str, swarm_id: &str) -> SwarmResult<i64> {
        let key = self.keys.resource_allocation(resource_type, swarm_id);
        let held: Option<i64> = self
            .redis
            .with_retry("arbiter.allocation", |mut con| {
                let key = key.clone();
                async move { redis::cmd("GET").arg(&key).query_async(&mut con).await }
            })
            .await?;
        Ok(held.unwrap_or(0))
    }

    /// Point-in-time pool view for advisories and invariant checks.
    pub async fn pool_snapshot(&self, resource_type: &str) -> SwarmResult<PoolSnapshot> {
        let available_key = self.keys.resource_available(resource_type);
        let available: Option<i64> = self
            .redis
            .with_retry("arbiter.pool_available", |mut con| {
                let key = available_key.clone();
                async move { redis::cmd("GET").arg(&key).query_async(&mut con).await }
            })
            .await?;
        let available =
            available.ok_or_else(|| SwarmError::NotFound(format!("resource pool {resource_type}")))?;

        // enumerate allocation keys, then read them on a fresh connection
        let pattern = self.keys.resource_pattern(resource_type);
        let mut allocation_keys = Vec::new();
        {
            let mut con = self.redis.connection();
            let mut iter = con.scan_match::<_, String>(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                if !key.ends_with(":available") {
                    allocation_keys.push(key);
                }
            }
        }

        let mut allocations = BTreeMap::new();
        for key in allocation_keys {
            let swarm_id = key
                .rsplit(':')
                .next()
                .unwrap_or_default()
                .to_string();
            let held: Option<i64> = self
                .redis
                .with_retry("arbiter.pool_allocation", |mut con| {
                    let key = key.clone();
                    async move { redis::cmd("GET").arg(&key).query_async(&mut con).await }
                })
                .await?;
            if let Some(held) = held {
                if held != 0 {
                    allocations.insert(swarm_id, held);
                }
            }
        }

        Ok(PoolSnapshot {
            resource_type: resource_type.to_string(),
            available,
            allocations,
        })
    }

    /// Resource types seeded through [`Self::create_pool`].
    pub async fn known_types(&self) -> SwarmResult<Vec<String>> {
        let index_key = self.keys.resource_index();
        let types: Vec<String> = self
            .redis
            .with_retry("arbiter.known_types", |mut con| {
                let key = index_key.clone();
                async move { redis::cmd("SMEMBERS").arg(&key).query_async(&mut con).await }
            })
            .await?;
        Ok(types)
    }
}
