//! Bounded pool of managed connections
//!
//! Capacity is enforced with a semaphore holding one permit per connection that
//! is checked out or being opened. Idle connections hold no permit; when a new
//! connection is needed while idle ones fill the remaining capacity, the least
//! recently used idle connection is closed to make room.
//!
//! The pool lock guards only the idle/checked-out partition and is never held
//! across a switch call.

use crate::config::{MatchPolicy, PoolConfig};
use crate::connection::{ConnectionId, ManagedConnection, MatchCriteria};
use crate::exception::{XaError, XaResult};
use crate::metrics::{
    record_acquire, record_acquire_timeout, record_connection_closed, record_connection_created,
    record_pool_occupancy,
};
use crate::retry::SwitchInvoker;
use crate::switch::SwitchRegistry;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_created: u64,
    pub total_closed: u64,
    pub total_acquired: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub timeouts: u64,
    pub current_idle: usize,
    pub current_in_use: usize,
}

/// Which connections sit in which half of the pool at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub available: Vec<ConnectionId>,
    pub in_use: Vec<ConnectionId>,
}

/// What `release` did with a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDisposition {
    /// Reset to IDLE and made available
    Pooled,
    /// Closed and dropped
    Discarded,
}

#[derive(Default)]
struct PoolState {
    available: Vec<ManagedConnection>,
    in_use: HashMap<ConnectionId, OwnedSemaphorePermit>,
    opening: usize,
    closed: bool,
    stats: PoolStats,
}

impl PoolState {
    fn total(&self) -> usize {
        self.available.len() + self.in_use.len() + self.opening
    }

    fn take_least_recently_used(&mut self) -> Option<ManagedConnection> {
        let idx = self
            .available
            .iter()
            .enumerate()
            .max_by_key(|(_, conn)| conn.idle_for())
            .map(|(idx, _)| idx)?;
        Some(self.available.swap_remove(idx))
    }

    fn publish(&mut self) {
        self.stats.current_idle = self.available.len();
        self.stats.current_in_use = self.in_use.len();
        record_pool_occupancy(self.available.len(), self.in_use.len());
    }
}

/// Connection pool shared by every resource manager in the registry
pub struct ConnectionPool {
    registry: Arc<SwitchRegistry>,
    config: PoolConfig,
    policy: MatchPolicy,
    invoker: SwitchInvoker,
    permits: Arc<Semaphore>,
    state: Arc<Mutex<PoolState>>,
}

impl ConnectionPool {
    pub fn new(
        registry: Arc<SwitchRegistry>,
        config: PoolConfig,
        policy: MatchPolicy,
        invoker: SwitchInvoker,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            registry,
            config,
            policy,
            invoker,
            permits,
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    /// Check out a connection to `resource` matching `criteria`.
    ///
    /// Waits up to the configured acquire timeout for capacity. Dropping the
    /// returned future while a new connection is being opened leaves that
    /// connection in the available set.
    pub async fn acquire(
        &self,
        resource: &str,
        criteria: &MatchCriteria,
    ) -> XaResult<ManagedConnection> {
        let switch = self.registry.lookup(resource)?;
        let started = Instant::now();

        let permit = match tokio::time::timeout(
            self.config.acquire_timeout(),
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(XaError::ShutDown),
            Err(_) => {
                let waited = started.elapsed();
                self.lock_state().stats.timeouts += 1;
                record_acquire_timeout(resource);
                warn!(
                    "Pool exhausted acquiring a connection to {} after {:?}",
                    resource, waited
                );
                return Err(XaError::PoolExhausted {
                    resource: resource.to_string(),
                    waited,
                });
            }
        };

        let victim = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(XaError::ShutDown);
            }

            if let Some(idx) = state
                .available
                .iter()
                .position(|conn| conn.matches(resource, criteria, self.policy))
            {
                let mut conn = state.available.swap_remove(idx);
                conn.mark_used();
                state.in_use.insert(conn.id(), permit);
                state.stats.total_acquired += 1;
                state.stats.pool_hits += 1;
                state.publish();
                record_acquire(true, started.elapsed());
                debug!("Reusing connection {} to {}", conn.id(), resource);
                return Ok(conn);
            }

            let victim = if state.total() >= self.config.max_size {
                state.take_least_recently_used()
            } else {
                None
            };
            state.opening += 1;
            victim
        };

        let reservation = OpenReservation::new(self.clone(), permit);

        // Eviction and opening run detached so an abandoned acquire cannot strand
        // either connection
        let (tx, rx) = oneshot::channel();
        let pool = self.clone();
        let criteria = criteria.clone();
        tokio::spawn(async move {
            if let Some(victim) = victim {
                debug!(
                    "Closing idle connection {} to {} to make room for {}",
                    victim.id(),
                    victim.resource(),
                    switch.name()
                );
                pool.discard(victim, "capacity").await;
            }
            match ManagedConnection::open(switch, criteria, &pool.invoker).await {
                Ok(conn) => {
                    let conn = reservation.complete(conn);
                    if let Err(Ok(conn)) = tx.send(Ok(conn)) {
                        debug!(
                            "Acquire abandoned, returning new connection {} to the pool",
                            conn.id()
                        );
                        if let Err(e) = pool.release(conn).await {
                            warn!("Failed to pool abandoned connection: {}", e);
                        }
                    }
                }
                Err(e) => {
                    drop(reservation);
                    let _ = tx.send(Err(e));
                }
            }
        });

        let conn = rx
            .await
            .map_err(|_| XaError::internal("connection open task ended without a result"))??;
        record_acquire(false, started.elapsed());
        debug!("Opened connection {} to {} for checkout", conn.id(), resource);
        Ok(conn)
    }

    /// Take back a checked-out connection.
    ///
    /// Clean connections (IDLE, COMMITTED, ROLLED_BACK) are reset and pooled;
    /// anything else, or anything released after shutdown, is closed.
    pub async fn release(&self, mut conn: ManagedConnection) -> XaResult<ReleaseDisposition> {
        let reason = {
            let mut state = self.lock_state();
            let Some(permit) = state.in_use.remove(&conn.id()) else {
                return Err(XaError::protocol(format!(
                    "connection {} is not checked out of this pool",
                    conn.id()
                )));
            };

            let expired = self
                .config
                .max_lifetime()
                .map_or(false, |max| conn.age() >= max);
            let reason = if state.closed {
                Some("shutdown")
            } else if !conn.state().is_reusable() {
                Some("unclean")
            } else if expired {
                Some("expired")
            } else {
                None
            };

            let reason = match reason {
                Some(reason) => reason,
                None => {
                    debug!("Connection {} returned to the pool", conn.id());
                    conn.reset();
                    state.available.push(conn);
                    state.publish();
                    drop(permit);
                    return Ok(ReleaseDisposition::Pooled);
                }
            };
            state.publish();
            drop(permit);
            reason
        };

        debug!(
            "Discarding connection {} in state {} ({})",
            conn.id(),
            conn.state(),
            reason
        );
        self.discard(conn, reason).await;
        Ok(ReleaseDisposition::Discarded)
    }

    /// Close idle connections past the idle timeout or their maximum lifetime.
    ///
    /// Idle-timeout eviction stops at `min_size`; lifetime expiry does not.
    pub async fn evict_idle(&self) -> usize {
        let victims = {
            let mut state = self.lock_state();
            if state.closed {
                return 0;
            }

            let idle_timeout = self.config.idle_timeout();
            let max_lifetime = self.config.max_lifetime();
            let mut total = state.total();
            let mut candidates = std::mem::take(&mut state.available);
            candidates.sort_by_key(|conn| Reverse(conn.idle_for()));

            let mut victims = Vec::new();
            for conn in candidates {
                let expired = max_lifetime.map_or(false, |max| conn.age() >= max);
                let idle = conn.idle_for() >= idle_timeout && total > self.config.min_size;
                if expired || idle {
                    total -= 1;
                    victims.push(conn);
                } else {
                    state.available.push(conn);
                }
            }
            state.publish();
            victims
        };

        let evicted = victims.len();
        for conn in victims {
            self.discard(conn, "idle").await;
        }
        if evicted > 0 {
            debug!("Evicted {} idle connections", evicted);
        }
        evicted
    }

    /// Run `evict_idle` every eviction interval until the pool shuts down
    pub fn start_eviction(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.eviction_interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                if pool.is_closed() {
                    break;
                }
                pool.evict_idle().await;
            }
            debug!("Pool eviction sweep stopped");
        })
    }

    /// Open idle connections to `resource` until the pool holds `min_size`
    pub async fn prefill(&self, resource: &str, criteria: &MatchCriteria) -> XaResult<usize> {
        let switch = self.registry.lookup(resource)?;
        let mut opened = 0;

        loop {
            let permit = {
                let mut state = self.lock_state();
                if state.closed {
                    return Err(XaError::ShutDown);
                }
                if state.total() >= self.config.min_size {
                    break;
                }
                match Arc::clone(&self.permits).try_acquire_owned() {
                    Ok(permit) => {
                        state.opening += 1;
                        permit
                    }
                    Err(_) => break,
                }
            };

            let reservation = OpenReservation::new(self.clone(), permit);
            let conn =
                ManagedConnection::open(Arc::clone(&switch), criteria.clone(), &self.invoker)
                    .await?;
            reservation.park(conn);
            opened += 1;
        }

        if opened > 0 {
            info!("Prefilled pool with {} connections to {}", opened, resource);
        }
        Ok(opened)
    }

    /// Close idle connections and refuse further checkouts.
    ///
    /// Waiters fail with `ShutDown`; connections still checked out are closed
    /// when released.
    pub async fn shutdown(&self) -> usize {
        let idle = {
            let mut state = self.lock_state();
            if state.closed {
                return 0;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.available);
            state.publish();
            idle
        };
        self.permits.close();

        let closed = idle.len();
        for conn in idle {
            self.discard(conn, "shutdown").await;
        }
        info!("Connection pool shut down, closed {} idle connections", closed);
        closed
    }

    async fn discard(&self, conn: ManagedConnection, reason: &'static str) {
        let resource = conn.resource().to_string();
        if let Err(e) = conn.close(&self.invoker).await {
            warn!("Error closing connection to {}: {}", resource, e);
        }
        self.lock_state().stats.total_closed += 1;
        record_connection_closed(&resource, reason);
    }

    pub fn stats(&self) -> PoolStats {
        self.lock_state().stats.clone()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock_state();
        let mut available: Vec<_> = state.available.iter().map(|conn| conn.id()).collect();
        let mut in_use: Vec<_> = state.in_use.keys().copied().collect();
        available.sort();
        in_use.sort();
        PoolSnapshot { available, in_use }
    }

    pub fn available_count(&self) -> usize {
        self.lock_state().available.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.lock_state().in_use.len()
    }

    /// Idle, checked-out and opening connections together
    pub fn total_count(&self) -> usize {
        self.lock_state().total()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn match_policy(&self) -> MatchPolicy {
        self.policy
    }

    pub fn registry(&self) -> &Arc<SwitchRegistry> {
        &self.registry
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for ConnectionPool {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            policy: self.policy,
            invoker: self.invoker.clone(),
            permits: Arc::clone(&self.permits),
            state: Arc::clone(&self.state),
        }
    }
}

/// Capacity held for a connection being opened; given back if the open never finishes
struct OpenReservation {
    pool: ConnectionPool,
    permit: Option<OwnedSemaphorePermit>,
}

impl OpenReservation {
    fn new(pool: ConnectionPool, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            permit: Some(permit),
        }
    }

    /// Move the opened connection into the checked-out set
    fn complete(mut self, mut conn: ManagedConnection) -> ManagedConnection {
        record_connection_created(conn.resource());
        conn.mark_used();
        let mut state = self.pool.lock_state();
        state.opening = state.opening.saturating_sub(1);
        if let Some(permit) = self.permit.take() {
            state.in_use.insert(conn.id(), permit);
        }
        state.stats.total_created += 1;
        state.stats.total_acquired += 1;
        state.stats.pool_misses += 1;
        state.publish();
        conn
    }

    /// Move the opened connection straight into the available set
    fn park(mut self, conn: ManagedConnection) {
        record_connection_created(conn.resource());
        let permit = self.permit.take();
        let mut state = self.pool.lock_state();
        state.opening = state.opening.saturating_sub(1);
        state.available.push(conn);
        state.stats.total_created += 1;
        state.publish();
        drop(permit);
    }
}

impl Drop for OpenReservation {
    fn drop(&mut self) {
        if self.permit.take().is_some() {
            let mut state = self.pool.lock_state();
            state.opening = state.opening.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::connection::BranchState;
    use crate::switch::memory::InMemorySwitch;
    use crate::switch::{EndFlag, StartFlag, SwitchOperation, SwitchStatus};
    use crate::xid::Xid;
    use std::time::Duration;

    fn pool_with(
        config: PoolConfig,
        policy: MatchPolicy,
    ) -> (ConnectionPool, Arc<InMemorySwitch>, SwitchInvoker) {
        let registry = Arc::new(SwitchRegistry::new());
        let rm = Arc::new(InMemorySwitch::new("DB1"));
        registry.register_switch("DB1", rm.clone()).unwrap();
        let invoker = SwitchInvoker::new(RetryConfig::default());
        let pool = ConnectionPool::new(registry, config, policy, invoker.clone());
        (pool, rm, invoker)
    }

    fn small_pool(max_size: usize) -> PoolConfig {
        PoolConfig {
            max_size,
            acquire_timeout_ms: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let (pool, rm, _) = pool_with(small_pool(2), MatchPolicy::Strict);
        let criteria = MatchCriteria::new().with_credential("scott");

        let conn = pool.acquire("DB1", &criteria).await.unwrap();
        let id = conn.id();
        assert_eq!(pool.in_use_count(), 1);
        assert_eq!(
            pool.release(conn).await.unwrap(),
            ReleaseDisposition::Pooled
        );

        let again = pool.acquire("DB1", &criteria).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(rm.open_sessions(), 1);

        let stats = pool.stats();
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.pool_hits, 1);
        assert_eq!(stats.pool_misses, 1);
        assert_eq!(stats.current_in_use, 1);
    }

    #[tokio::test]
    async fn test_unknown_resource_manager() {
        let (pool, _, _) = pool_with(small_pool(1), MatchPolicy::Strict);
        let result = pool.acquire("DB9", &MatchCriteria::default()).await;
        assert!(matches!(
            result,
            Err(XaError::UnknownResourceManager { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_matching_idle_is_replaced_at_capacity() {
        let (pool, rm, _) = pool_with(small_pool(1), MatchPolicy::Strict);
        let scott = MatchCriteria::new().with_credential("scott");
        let tiger = MatchCriteria::new().with_credential("tiger");

        let conn = pool.acquire("DB1", &scott).await.unwrap();
        pool.release(conn).await.unwrap();
        let conn = pool.acquire("DB1", &tiger).await.unwrap();

        assert_eq!(conn.criteria(), &tiger);
        assert_eq!(pool.total_count(), 1);
        assert_eq!(rm.count(SwitchOperation::Close), 1);
        assert_eq!(rm.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_credential_only_policy_ignores_properties() {
        let (pool, _, _) = pool_with(small_pool(2), MatchPolicy::CredentialOnly);
        let stored = MatchCriteria::new()
            .with_credential("scott")
            .with_property("schema", "a");
        let requested = MatchCriteria::new()
            .with_credential("scott")
            .with_property("schema", "b");

        let conn = pool.acquire("DB1", &stored).await.unwrap();
        let id = conn.id();
        pool.release(conn).await.unwrap();
        assert_eq!(pool.acquire("DB1", &requested).await.unwrap().id(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_times_out() {
        let (pool, _, _) = pool_with(small_pool(1), MatchPolicy::Strict);
        let _held = pool.acquire("DB1", &MatchCriteria::default()).await.unwrap();

        let result = pool.acquire("DB1", &MatchCriteria::default()).await;
        match result {
            Err(XaError::PoolExhausted { resource, waited }) => {
                assert_eq!(resource, "DB1");
                assert!(waited >= Duration::from_millis(100));
            }
            other => panic!("expected PoolExhausted, got {:?}", other),
        }
        assert_eq!(pool.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_wakes_on_release() {
        let (pool, _, _) = pool_with(small_pool(1), MatchPolicy::Strict);
        let held = pool.acquire("DB1", &MatchCriteria::default()).await.unwrap();
        let id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("DB1", &MatchCriteria::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.release(held).await.unwrap();

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.id(), id);
    }

    #[tokio::test]
    async fn test_unclean_connection_is_discarded() {
        let (pool, rm, invoker) = pool_with(small_pool(2), MatchPolicy::Strict);
        let mut conn = pool.acquire("DB1", &MatchCriteria::default()).await.unwrap();
        let xid = Xid::generate();
        conn.start(&xid, StartFlag::New, &invoker).await.unwrap();
        conn.end(EndFlag::Success, &invoker).await.unwrap();
        assert_eq!(conn.state(), BranchState::Ended);

        assert_eq!(
            pool.release(conn).await.unwrap(),
            ReleaseDisposition::Discarded
        );
        assert_eq!(pool.total_count(), 0);
        assert_eq!(rm.open_sessions(), 0);
        assert_eq!(pool.stats().total_closed, 1);
    }

    #[tokio::test]
    async fn test_release_of_foreign_connection_is_rejected() {
        let (pool, _, _) = pool_with(small_pool(2), MatchPolicy::Strict);
        let (other, _, _) = pool_with(small_pool(2), MatchPolicy::Strict);
        let conn = other.acquire("DB1", &MatchCriteria::default()).await.unwrap();
        assert!(matches!(
            pool.release(conn).await,
            Err(XaError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_open_failure_frees_capacity() {
        let (pool, rm, _) = pool_with(small_pool(1), MatchPolicy::Strict);
        rm.fail_next(SwitchOperation::Open, SwitchStatus::ResourceUnavailable);

        let result = pool.acquire("DB1", &MatchCriteria::default()).await;
        assert!(matches!(
            result,
            Err(XaError::ConnectionCreateFailed { .. })
        ));
        assert_eq!(pool.total_count(), 0);
        assert!(pool.acquire("DB1", &MatchCriteria::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_eviction_respects_min_size() {
        let config = PoolConfig {
            max_size: 4,
            min_size: 1,
            idle_timeout_secs: 0,
            ..Default::default()
        };
        let (pool, rm, _) = pool_with(config, MatchPolicy::Strict);
        let first = pool.acquire("DB1", &MatchCriteria::default()).await.unwrap();
        let second = pool.acquire("DB1", &MatchCriteria::default()).await.unwrap();
        let third = pool.acquire("DB1", &MatchCriteria::default()).await.unwrap();
        pool.release(first).await.unwrap();
        pool.release(second).await.unwrap();

        // One connection is still checked out, so both idle ones may go
        assert_eq!(pool.evict_idle().await, 2);
        pool.release(third).await.unwrap();
        assert_eq!(pool.evict_idle().await, 0);
        assert_eq!(pool.available_count(), 1);
        assert_eq!(rm.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_prefill_to_min_size() {
        let config = PoolConfig {
            max_size: 4,
            min_size: 3,
            ..Default::default()
        };
        let (pool, rm, _) = pool_with(config, MatchPolicy::Strict);

        assert_eq!(pool.prefill("DB1", &MatchCriteria::default()).await.unwrap(), 3);
        assert_eq!(pool.available_count(), 3);
        assert_eq!(rm.open_sessions(), 3);
        assert_eq!(pool.prefill("DB1", &MatchCriteria::default()).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wakes_waiters_and_discards_late_releases() {
        let (pool, rm, _) = pool_with(small_pool(1), MatchPolicy::Strict);
        let held = pool.acquire("DB1", &MatchCriteria::default()).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("DB1", &MatchCriteria::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown().await;

        assert!(matches!(waiter.await.unwrap(), Err(XaError::ShutDown)));
        assert_eq!(
            pool.release(held).await.unwrap(),
            ReleaseDisposition::Discarded
        );
        assert_eq!(rm.open_sessions(), 0);
        assert!(pool.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_acquire_still_closes_evicted_connection() {
        let registry = Arc::new(SwitchRegistry::new());
        let rm = Arc::new(InMemorySwitch::new("DB1").with_latency(Duration::from_millis(50)));
        registry.register_switch("DB1", rm.clone()).unwrap();
        let pool = ConnectionPool::new(
            registry,
            small_pool(1),
            MatchPolicy::Strict,
            SwitchInvoker::new(RetryConfig::default()),
        );

        let first = MatchCriteria::new().with_credential("a");
        let conn = pool.acquire("DB1", &first).await.unwrap();
        pool.release(conn).await.unwrap();

        // The idle "a" connection must be closed to make room for "b"
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            pool.acquire("DB1", &MatchCriteria::new().with_credential("b")),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rm.count(SwitchOperation::Close), 1);
        assert_eq!(rm.open_sessions(), pool.total_count());
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.available.len(), 1);
        assert!(snapshot.in_use.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_acquire_does_not_leak() {
        let registry = Arc::new(SwitchRegistry::new());
        let rm = Arc::new(InMemorySwitch::new("DB1").with_latency(Duration::from_millis(50)));
        registry.register_switch("DB1", rm.clone()).unwrap();
        let pool = ConnectionPool::new(
            registry,
            small_pool(1),
            MatchPolicy::Strict,
            SwitchInvoker::new(RetryConfig::default()),
        );

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            pool.acquire("DB1", &MatchCriteria::default()),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.available.len(), 1);
        assert!(snapshot.in_use.is_empty());
        assert_eq!(rm.open_sessions(), 1);
    }
}
