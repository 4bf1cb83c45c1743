//! Transactional connection manager
//!
//! Hands out pooled connections, enlists them in transaction branches and
//! routes the coordinator's prepare/commit/rollback to every participant.
//!
//! Locking: the branch table and checkout table are short std mutexes never
//! held across a switch call. Each branch and each checked-out connection has
//! its own async mutex; when both are needed the branch is locked first.

use crate::config::ManagerConfig;
use crate::connection::{BranchState, ConnectionId, ManagedConnection, MatchCriteria};
use crate::exception::{XaError, XaResult};
use crate::factory::{ConnectionFactory, ConnectionHandle};
use crate::metrics::{record_branch_outcome, InvocationStats};
use crate::pool::{ConnectionPool, PoolStats, ReleaseDisposition};
use crate::retry::SwitchInvoker;
use crate::switch::{EndFlag, StartFlag, SwitchOperation, SwitchRegistry, SwitchStatus};
use crate::xid::Xid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ConnectionSlot = Arc<AsyncMutex<Option<ManagedConnection>>>;
type BranchCell = Arc<AsyncMutex<TransactionBranch>>;

/// Coordinator-visible phase of a transaction branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchPhase {
    /// Accepting enlistments
    Active,
    Preparing,
    Prepared,
    Committing,
    RollingBack,
    Completed,
}

/// Vote returned by `prepare_branch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    Rollback,
}

/// Overall result of a commit or rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchOutcome {
    /// Every participant reached the requested state
    Completed,
    /// Some participants reached it, others failed
    Partial,
    /// No participant reached it
    Indeterminate,
}

impl BranchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchOutcome::Completed => "completed",
            BranchOutcome::Partial => "partial",
            BranchOutcome::Indeterminate => "indeterminate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantResult {
    Succeeded,
    /// Not asked, either because an earlier participant failed or nothing was left to do
    Skipped,
    Failed {
        status: Option<SwitchStatus>,
        error: String,
    },
}

/// What happened to one participant during a coordinator call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantOutcome {
    pub connection: ConnectionId,
    pub resource: String,
    pub state: BranchState,
    pub result: ParticipantResult,
}

impl ParticipantOutcome {
    fn new(connection: ConnectionId, resource: &str, state: BranchState, result: ParticipantResult) -> Self {
        Self {
            connection,
            resource: resource.to_string(),
            state,
            result,
        }
    }

    fn failed(connection: ConnectionId, resource: &str, state: BranchState, error: &XaError) -> Self {
        Self::new(
            connection,
            resource,
            state,
            ParticipantResult::Failed {
                status: error.switch_status(),
                error: error.to_string(),
            },
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.result, ParticipantResult::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareReport {
    pub xid: Xid,
    pub vote: Vote,
    pub participants: Vec<ParticipantOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub xid: Xid,
    pub outcome: BranchOutcome,
    pub participants: Vec<ParticipantOutcome>,
    /// Completed through recovery rather than a live branch
    pub recovered: bool,
}

impl CompletionReport {
    pub fn failures(&self) -> impl Iterator<Item = &ParticipantOutcome> {
        self.participants.iter().filter(|p| p.is_failure())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub connection: ConnectionId,
    pub resource: String,
    pub state: BranchState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSnapshot {
    pub xid: Xid,
    pub phase: BranchPhase,
    pub rollback_only: bool,
    pub started_at: DateTime<Utc>,
    pub participants: Vec<ParticipantSnapshot>,
}

/// What `release` did with a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    Pooled,
    Discarded,
    /// Still part of an unfinished branch; returned once the branch completes
    Deferred,
    AlreadyReleased,
}

impl From<ReleaseDisposition> for ReleaseOutcome {
    fn from(disposition: ReleaseDisposition) -> Self {
        match disposition {
            ReleaseDisposition::Pooled => ReleaseOutcome::Pooled,
            ReleaseDisposition::Discarded => ReleaseOutcome::Discarded,
        }
    }
}

#[derive(Debug, Clone)]
struct Participant {
    resource: String,
    /// Last state observed by the manager
    state: BranchState,
}

/// Participants enlisted under one xid
#[derive(Debug)]
pub(crate) struct TransactionBranch {
    xid: Xid,
    participants: BTreeMap<ConnectionId, Participant>,
    phase: BranchPhase,
    rollback_only: bool,
    /// Commit was started without prepare; re-drives must stay one-phase
    one_phase: bool,
    started_at: DateTime<Utc>,
    /// Removed from the branch table; waiters must look the xid up again
    retired: bool,
}

impl TransactionBranch {
    fn new(xid: Xid) -> Self {
        Self {
            xid,
            participants: BTreeMap::new(),
            phase: BranchPhase::Active,
            rollback_only: false,
            one_phase: false,
            started_at: Utc::now(),
            retired: false,
        }
    }

    fn record(&mut self, id: ConnectionId, resource: &str, state: BranchState) {
        self.participants
            .entry(id)
            .and_modify(|p| p.state = state)
            .or_insert_with(|| Participant {
                resource: resource.to_string(),
                state,
            });
    }

    fn ids(&self) -> Vec<ConnectionId> {
        self.participants.keys().copied().collect()
    }

    fn has_live_participant_on(&self, resource: &str) -> bool {
        self.participants
            .values()
            .any(|p| p.resource == resource && !p.state.is_terminal())
    }

    fn has_failed_participant(&self) -> bool {
        self.participants
            .values()
            .any(|p| p.state == BranchState::Error)
    }

    fn all_terminal(&self) -> bool {
        self.participants.values().all(|p| p.state.is_terminal())
    }

    fn skipped(&self, id: ConnectionId) -> ParticipantOutcome {
        let (resource, state) = self
            .participants
            .get(&id)
            .map(|p| (p.resource.as_str(), p.state))
            .unwrap_or(("", BranchState::Error));
        ParticipantOutcome::new(id, resource, state, ParticipantResult::Skipped)
    }
}

struct Checkout {
    slot: ConnectionSlot,
    released: bool,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    End(EndFlag),
    Prepare,
    Commit { one_phase: bool },
    Rollback,
}

/// Connection manager shared by factories and the transaction coordinator
pub struct ConnectionManager {
    registry: Arc<SwitchRegistry>,
    pool: ConnectionPool,
    invoker: SwitchInvoker,
    config: Arc<ManagerConfig>,
    checked_out: Arc<Mutex<HashMap<ConnectionId, Checkout>>>,
    branches: Arc<Mutex<HashMap<Xid, BranchCell>>>,
    recovered: Arc<Mutex<HashMap<Xid, String>>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<SwitchRegistry>, config: ManagerConfig) -> XaResult<Self> {
        config.validate()?;
        let invoker = SwitchInvoker::new(config.retry.clone());
        let pool = ConnectionPool::new(
            Arc::clone(&registry),
            config.pool.clone(),
            config.match_policy,
            invoker.clone(),
        );

        Ok(Self {
            registry,
            pool,
            invoker,
            config: Arc::new(config),
            checked_out: Arc::new(Mutex::new(HashMap::new())),
            branches: Arc::new(Mutex::new(HashMap::new())),
            recovered: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Arc::new(Mutex::new(None)),
        })
    }

    /// Start the idle-eviction sweep
    pub fn start(&self) {
        let mut sweeper = lock(&self.sweeper);
        if sweeper.is_none() {
            *sweeper = Some(self.pool.start_eviction());
            info!(
                "Connection manager started, evicting idle connections every {:?}",
                self.config.pool.eviction_interval()
            );
        }
    }

    /// Stop the sweep and close the pool
    pub async fn shutdown(&self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
        self.pool.shutdown().await;
    }

    pub fn factory<S: Into<String>>(
        &self,
        resource: S,
        criteria: MatchCriteria,
    ) -> XaResult<ConnectionFactory> {
        ConnectionFactory::new(self.clone(), resource, criteria)
    }

    /// Check out a connection and enlist it in `ambient` when given.
    ///
    /// If enlistment fails the connection goes back through the release rule.
    pub async fn allocate(
        &self,
        resource: &str,
        criteria: &MatchCriteria,
        ambient: Option<&Xid>,
    ) -> XaResult<ConnectionHandle> {
        let conn = self.pool.acquire(resource, criteria).await?;
        let id = conn.id();
        lock(&self.checked_out).insert(
            id,
            Checkout {
                slot: Arc::new(AsyncMutex::new(Some(conn))),
                released: false,
            },
        );
        let handle = ConnectionHandle::new(id, resource);

        if let Some(xid) = ambient {
            let guard = CheckoutGuard::new(self.clone(), id);
            let enlisted = self.enlist(&handle, xid).await;
            guard.disarm();
            if let Err(e) = enlisted {
                if let Err(release_error) = self.release(&handle).await {
                    warn!("Failed to release {} after enlist failure: {}", handle, release_error);
                }
                return Err(e);
            }
        }

        debug!("Allocated {}", handle);
        Ok(handle)
    }

    /// Associate the connection with the branch of `xid`
    pub async fn enlist(&self, handle: &ConnectionHandle, xid: &Xid) -> XaResult<()> {
        if xid.is_null() {
            return Err(XaError::InvalidXid("cannot enlist under the null xid".to_string()));
        }
        let slot = self.slot(handle.id())?;

        loop {
            let cell = self.branch_for_enlist(xid);
            let mut branch = cell.lock().await;
            if branch.retired && branch.phase != BranchPhase::Completed {
                continue;
            }

            let result = self.enlist_locked(&mut branch, &slot, handle.id(), xid).await;
            if result.is_err() && branch.participants.is_empty() && !branch.retired {
                branch.retired = true;
                lock(&self.branches).remove(xid);
            }
            return result;
        }
    }

    async fn enlist_locked(
        &self,
        branch: &mut TransactionBranch,
        slot: &ConnectionSlot,
        id: ConnectionId,
        xid: &Xid,
    ) -> XaResult<()> {
        if branch.phase != BranchPhase::Active {
            return Err(XaError::BranchFinishing {
                xid: xid.to_string(),
            });
        }

        let mut guard = slot.lock().await;
        let conn = guard.as_mut().ok_or_else(|| released(id))?;
        let same_xid = conn.enlisted_xid() == Some(xid);

        let result = match conn.state() {
            BranchState::Enlisted if same_xid => return Ok(()),
            BranchState::Suspended if same_xid => {
                match conn.end(EndFlag::Success, &self.invoker).await {
                    Ok(()) => conn.start(xid, StartFlag::Join, &self.invoker).await,
                    Err(e) => Err(e),
                }
            }
            BranchState::Ended if same_xid => {
                conn.start(xid, StartFlag::Join, &self.invoker).await
            }
            _ => {
                let flag = if branch.has_live_participant_on(conn.resource()) {
                    StartFlag::Join
                } else {
                    StartFlag::New
                };
                conn.start(xid, flag, &self.invoker).await
            }
        };

        if result.is_ok() || branch.participants.contains_key(&id) {
            branch.record(id, conn.resource(), conn.state());
        }
        if result.is_ok() {
            debug!("Enlisted {} in branch {}", id, xid);
        }
        result
    }

    /// End the connection's association successfully
    pub async fn delist(&self, handle: &ConnectionHandle) -> XaResult<()> {
        self.end_association(handle, EndFlag::Success).await
    }

    /// End the association with failure; the branch becomes rollback-only
    pub async fn delist_failed(&self, handle: &ConnectionHandle) -> XaResult<()> {
        self.end_association(handle, EndFlag::Fail).await
    }

    pub async fn suspend(&self, handle: &ConnectionHandle) -> XaResult<()> {
        self.end_association(handle, EndFlag::Suspend).await
    }

    pub async fn resume(&self, handle: &ConnectionHandle) -> XaResult<()> {
        let (mut branch, mut guard) = self.lock_enlisted(handle.id()).await?;
        if branch.phase != BranchPhase::Active {
            return Err(XaError::BranchFinishing {
                xid: branch.xid.to_string(),
            });
        }
        let conn = guard.as_mut().ok_or_else(|| released(handle.id()))?;
        let xid = branch.xid.clone();
        let result = conn.start(&xid, StartFlag::Resume, &self.invoker).await;
        branch.record(handle.id(), conn.resource(), conn.state());
        result
    }

    async fn end_association(&self, handle: &ConnectionHandle, flag: EndFlag) -> XaResult<()> {
        let (mut branch, mut guard) = self.lock_enlisted(handle.id()).await?;
        let conn = guard.as_mut().ok_or_else(|| released(handle.id()))?;
        let result = conn.end(flag, &self.invoker).await;
        branch.record(handle.id(), conn.resource(), conn.state());
        if flag == EndFlag::Fail {
            branch.rollback_only = true;
            info!("Branch {} marked rollback-only", branch.xid);
        }
        result
    }

    /// Give a handle back. Safe to call more than once.
    pub async fn release(&self, handle: &ConnectionHandle) -> XaResult<ReleaseOutcome> {
        self.release_id(handle.id()).await
    }

    async fn release_id(&self, id: ConnectionId) -> XaResult<ReleaseOutcome> {
        let slot = match lock(&self.checked_out).get(&id) {
            Some(checkout) if !checkout.released => Arc::clone(&checkout.slot),
            _ => return Ok(ReleaseOutcome::AlreadyReleased),
        };

        let mut guard = slot.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(ReleaseOutcome::AlreadyReleased);
        };

        if conn.state().is_associated() {
            if let Err(e) = conn.end(EndFlag::Success, &self.invoker).await {
                warn!("Ending association of {} on release failed: {}", id, e);
            }
        }

        let state = conn.state();
        if state.is_reusable() || state == BranchState::Error {
            let Some(conn) = guard.take() else {
                return Ok(ReleaseOutcome::AlreadyReleased);
            };
            drop(guard);
            lock(&self.checked_out).remove(&id);
            return Ok(self.pool.release(conn).await?.into());
        }

        if let Some(checkout) = lock(&self.checked_out).get_mut(&id) {
            checkout.released = true;
        }
        debug!(
            "Release of {} deferred until branch {:?} completes",
            id,
            conn.enlisted_xid().map(|xid| xid.to_string())
        );
        Ok(ReleaseOutcome::Deferred)
    }

    /// Ask every participant to prepare. Stops at the first failure and votes ROLLBACK.
    pub async fn prepare_branch(&self, xid: &Xid) -> XaResult<PrepareReport> {
        let cell = self.find_branch(xid).ok_or_else(|| unknown_branch(xid))?;
        let mut branch = cell.lock().await;
        if branch.phase != BranchPhase::Active {
            return Err(XaError::protocol(format!(
                "cannot prepare branch {} in phase {:?}",
                xid, branch.phase
            )));
        }
        branch.phase = BranchPhase::Preparing;
        let ids = branch.ids();
        info!("Preparing branch {} with {} participants", xid, ids.len());

        let mut outcomes = Vec::new();
        let mut failed = branch.rollback_only || branch.has_failed_participant();

        // Every association must be gone before any participant prepares
        if !failed {
            for id in &ids {
                let outcome = self.drive(&mut branch, *id, Action::End(EndFlag::Success)).await;
                if outcome.is_failure() {
                    outcomes.push(outcome);
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            for id in &ids {
                let outcome = self.drive(&mut branch, *id, Action::Prepare).await;
                let is_failure = outcome.is_failure();
                outcomes.push(outcome);
                if is_failure {
                    failed = true;
                    break;
                }
            }
        }
        for id in &ids {
            if !outcomes.iter().any(|o| o.connection == *id) {
                outcomes.push(branch.skipped(*id));
            }
        }
        outcomes.sort_by_key(|o| o.connection);

        let vote = if failed {
            warn!("Branch {} votes ROLLBACK", xid);
            Vote::Rollback
        } else {
            branch.phase = BranchPhase::Prepared;
            info!("Branch {} prepared, votes COMMIT", xid);
            Vote::Commit
        };
        let vote_label = if failed { "rollback" } else { "commit" };
        record_branch_outcome("prepare", vote_label, ids.len());

        Ok(PrepareReport {
            xid: xid.clone(),
            vote,
            participants: outcomes,
        })
    }

    /// Commit every participant.
    ///
    /// Needs a prepared branch, or an active single-participant branch whose
    /// resource manager supports one-phase commit. An xid with no live branch
    /// that was reported by `recover_branches` is completed through the pool.
    pub async fn commit_branch(&self, xid: &Xid) -> XaResult<CompletionReport> {
        let Some(cell) = self.find_branch(xid) else {
            return self.complete_recovered(xid, true).await;
        };
        let mut branch = cell.lock().await;

        let one_phase = match branch.phase {
            BranchPhase::Active => {
                if branch.rollback_only {
                    return Err(XaError::protocol(format!(
                        "branch {} is rollback-only",
                        xid
                    )));
                }
                if !self.one_phase_allowed(&branch)? {
                    return Err(XaError::protocol(format!(
                        "branch {} with {} participants has not been prepared",
                        xid,
                        branch.participants.len()
                    )));
                }
                true
            }
            BranchPhase::Prepared => false,
            BranchPhase::Committing => branch.one_phase,
            phase => {
                return Err(XaError::protocol(format!(
                    "cannot commit branch {} in phase {:?}",
                    xid, phase
                )))
            }
        };
        branch.phase = BranchPhase::Committing;
        branch.one_phase = one_phase;
        let ids = branch.ids();
        info!(
            "Committing branch {} ({} participants, one phase: {})",
            xid,
            ids.len(),
            one_phase
        );

        let mut outcomes = Vec::new();
        for id in &ids {
            if one_phase {
                let end = self.drive(&mut branch, *id, Action::End(EndFlag::Success)).await;
                if end.is_failure() {
                    outcomes.push(end);
                    continue;
                }
            }
            outcomes.push(self.drive(&mut branch, *id, Action::Commit { one_phase }).await);
        }

        Ok(self
            .finish(&mut branch, BranchState::Committed, "commit", outcomes)
            .await)
    }

    /// Roll back every participant, ending active associations with FAIL first
    pub async fn rollback_branch(&self, xid: &Xid) -> XaResult<CompletionReport> {
        let Some(cell) = self.find_branch(xid) else {
            return self.complete_recovered(xid, false).await;
        };
        let mut branch = cell.lock().await;

        match branch.phase {
            BranchPhase::Active
            | BranchPhase::Preparing
            | BranchPhase::Prepared
            | BranchPhase::RollingBack => {}
            // Nothing was prepared, so an unfinished one-phase commit may still be undone
            BranchPhase::Committing if branch.one_phase => {}
            phase => {
                return Err(XaError::protocol(format!(
                    "cannot roll back branch {} in phase {:?}",
                    xid, phase
                )))
            }
        }
        branch.phase = BranchPhase::RollingBack;
        let ids = branch.ids();
        info!("Rolling back branch {} with {} participants", xid, ids.len());

        let mut outcomes = Vec::new();
        let mut ended = Vec::new();
        for id in &ids {
            let end = self.drive(&mut branch, *id, Action::End(EndFlag::Fail)).await;
            if end.is_failure() {
                outcomes.push(end);
            } else {
                ended.push(*id);
            }
        }
        for id in &ended {
            outcomes.push(self.drive(&mut branch, *id, Action::Rollback).await);
        }
        outcomes.sort_by_key(|o| o.connection);

        Ok(self
            .finish(&mut branch, BranchState::RolledBack, "rollback", outcomes)
            .await)
    }

    /// In-doubt branches of `resource` not owned by a live branch of this manager
    pub async fn recover_branches(&self, resource: &str) -> XaResult<Vec<Xid>> {
        let switch = self.registry.lookup(resource)?;
        let mut conn = self.pool.acquire(resource, switch.recovery_criteria()).await?;
        let result = conn.recover(&self.invoker).await;
        self.return_recovery_connection(conn).await;
        let xids = result?;

        let live: HashSet<Xid> = lock(&self.branches).keys().cloned().collect();
        let in_doubt: Vec<Xid> = xids.into_iter().filter(|xid| !live.contains(xid)).collect();
        {
            let mut recovered = lock(&self.recovered);
            for xid in &in_doubt {
                recovered.insert(xid.clone(), resource.to_string());
            }
        }
        info!("{} reports {} in-doubt branches", resource, in_doubt.len());
        Ok(in_doubt)
    }

    /// Let `resource` discard a heuristically completed branch
    pub async fn forget_branch(&self, resource: &str, xid: &Xid) -> XaResult<()> {
        let switch = self.registry.lookup(resource)?;
        let mut conn = self.pool.acquire(resource, switch.recovery_criteria()).await?;
        let result = conn.forget(xid, &self.invoker).await;
        self.return_recovery_connection(conn).await;
        result?;
        lock(&self.recovered).remove(xid);
        info!("{} forgot branch {}", resource, xid);
        Ok(())
    }

    async fn complete_recovered(&self, xid: &Xid, commit: bool) -> XaResult<CompletionReport> {
        let resource = lock(&self.recovered)
            .get(xid)
            .cloned()
            .ok_or_else(|| unknown_branch(xid))?;
        let switch = self.registry.lookup(&resource)?;
        let mut conn = self.pool.acquire(&resource, switch.recovery_criteria()).await?;
        let id = conn.id();
        let result = conn.complete_in_doubt(xid, commit, &self.invoker).await;
        self.return_recovery_connection(conn).await;

        let (target, phase) = if commit {
            (BranchState::Committed, "commit")
        } else {
            (BranchState::RolledBack, "rollback")
        };
        let (participant, outcome) = match result {
            Ok(()) => {
                lock(&self.recovered).remove(xid);
                info!("Completed recovered branch {} on {} ({})", xid, resource, phase);
                (
                    ParticipantOutcome::new(id, &resource, target, ParticipantResult::Succeeded),
                    BranchOutcome::Completed,
                )
            }
            Err(e) => {
                warn!("Completing recovered branch {} on {} failed: {}", xid, resource, e);
                (
                    ParticipantOutcome::failed(id, &resource, BranchState::Prepared, &e),
                    BranchOutcome::Indeterminate,
                )
            }
        };
        record_branch_outcome(phase, outcome.as_str(), 1);

        Ok(CompletionReport {
            xid: xid.clone(),
            outcome,
            participants: vec![participant],
            recovered: true,
        })
    }

    async fn return_recovery_connection(&self, conn: ManagedConnection) {
        if let Err(e) = self.pool.release(conn).await {
            warn!("Failed to return recovery connection: {}", e);
        }
    }

    /// Run one step against one participant and record its new state in the branch
    async fn drive(
        &self,
        branch: &mut TransactionBranch,
        id: ConnectionId,
        action: Action,
    ) -> ParticipantOutcome {
        let Some(participant) = branch.participants.get(&id).cloned() else {
            return branch.skipped(id);
        };
        if participant.state.is_terminal() {
            return branch.skipped(id);
        }
        let Some(slot) = self.any_slot(id) else {
            return branch.skipped(id);
        };

        let xid = branch.xid.clone();
        let mut guard = slot.lock().await;
        let Some(conn) = guard
            .as_mut()
            .filter(|conn| conn.enlisted_xid() == Some(&xid))
        else {
            return branch.skipped(id);
        };

        let state = conn.state();
        let result = match action {
            Action::End(flag) if state.is_associated() => Some(conn.end(flag, &self.invoker).await),
            Action::Prepare if state != BranchState::Prepared => {
                Some(conn.prepare(&self.invoker).await)
            }
            Action::Commit { one_phase } if state != BranchState::Committed => {
                Some(conn.commit(one_phase, &self.invoker).await)
            }
            Action::Rollback if state != BranchState::RolledBack => {
                Some(conn.rollback(&self.invoker).await)
            }
            _ => None,
        };

        let state = conn.state();
        branch.record(id, &participant.resource, state);
        match result {
            Some(Err(e)) => {
                warn!(
                    "Participant {} of branch {} failed {:?}: {}",
                    id, xid, action, e
                );
                ParticipantOutcome::failed(id, &participant.resource, state, &e)
            }
            _ => ParticipantOutcome::new(
                id,
                &participant.resource,
                state,
                ParticipantResult::Succeeded,
            ),
        }
    }

    async fn finish(
        &self,
        branch: &mut TransactionBranch,
        target: BranchState,
        phase: &'static str,
        participants: Vec<ParticipantOutcome>,
    ) -> CompletionReport {
        let total = branch.participants.len();
        let reached = branch
            .participants
            .values()
            .filter(|p| p.state == target)
            .count();
        let outcome = if reached == total {
            BranchOutcome::Completed
        } else if reached > 0 {
            BranchOutcome::Partial
        } else {
            BranchOutcome::Indeterminate
        };

        if branch.all_terminal() {
            branch.phase = BranchPhase::Completed;
            branch.retired = true;
            lock(&self.branches).remove(&branch.xid);
            info!("Branch {} finished {} ({})", branch.xid, phase, outcome.as_str());
        } else {
            warn!(
                "Branch {} left unfinished after {}: {} of {} participants done",
                branch.xid, phase, reached, total
            );
        }

        self.settle_released(&branch.ids()).await;
        record_branch_outcome(phase, outcome.as_str(), total);

        CompletionReport {
            xid: branch.xid.clone(),
            outcome,
            participants,
            recovered: false,
        }
    }

    /// Return connections whose release was deferred and whose branch work is done
    async fn settle_released(&self, ids: &[ConnectionId]) {
        for id in ids {
            let slot = match lock(&self.checked_out).get(id) {
                Some(checkout) if checkout.released => Arc::clone(&checkout.slot),
                _ => continue,
            };
            let conn = {
                let mut guard = slot.lock().await;
                let done = guard
                    .as_ref()
                    .map_or(false, |conn| conn.state().is_terminal());
                if done {
                    guard.take()
                } else {
                    None
                }
            };
            if let Some(conn) = conn {
                lock(&self.checked_out).remove(id);
                match self.pool.release(conn).await {
                    Ok(disposition) => debug!("Deferred release of {} done: {:?}", id, disposition),
                    Err(e) => warn!("Deferred release of {} failed: {}", id, e),
                }
            }
        }
    }

    fn one_phase_allowed(&self, branch: &TransactionBranch) -> XaResult<bool> {
        if branch.participants.len() != 1 {
            return Ok(false);
        }
        match branch.participants.values().next() {
            Some(participant) => Ok(self
                .registry
                .lookup(&participant.resource)?
                .supports_one_phase()),
            None => Ok(false),
        }
    }

    /// Lock the branch a connection is enlisted in, then the connection
    async fn lock_enlisted(
        &self,
        id: ConnectionId,
    ) -> XaResult<(
        OwnedMutexGuard<TransactionBranch>,
        OwnedMutexGuard<Option<ManagedConnection>>,
    )> {
        let slot = self.slot(id)?;
        loop {
            let xid = {
                let guard = slot.lock().await;
                let conn = guard.as_ref().ok_or_else(|| released(id))?;
                if conn.state().is_terminal() || conn.state().is_reusable() {
                    return Err(XaError::protocol(format!(
                        "connection {} is not part of an active branch (state {})",
                        id,
                        conn.state()
                    )));
                }
                conn.enlisted_xid()
                    .cloned()
                    .ok_or_else(|| XaError::protocol(format!("connection {} is not enlisted", id)))?
            };

            let cell = self.find_branch(&xid).ok_or_else(|| unknown_branch(&xid))?;
            let branch = cell.lock_owned().await;
            let guard = Arc::clone(&slot).lock_owned().await;
            match guard.as_ref() {
                None => return Err(released(id)),
                Some(conn) if conn.enlisted_xid() == Some(&xid) && !branch.retired => {
                    return Ok((branch, guard))
                }
                Some(_) => continue,
            }
        }
    }

    fn branch_for_enlist(&self, xid: &Xid) -> BranchCell {
        let mut branches = lock(&self.branches);
        Arc::clone(
            branches
                .entry(xid.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(TransactionBranch::new(xid.clone())))),
        )
    }

    /// Drop branches an abandoned enlistment created but never joined
    fn prune_empty_branches(&self) {
        lock(&self.branches).retain(|_, cell| match cell.try_lock() {
            Ok(mut branch)
                if branch.participants.is_empty() && branch.phase == BranchPhase::Active =>
            {
                branch.retired = true;
                false
            }
            _ => true,
        });
    }

    fn find_branch(&self, xid: &Xid) -> Option<BranchCell> {
        lock(&self.branches).get(xid).cloned()
    }

    fn slot(&self, id: ConnectionId) -> XaResult<ConnectionSlot> {
        match lock(&self.checked_out).get(&id) {
            Some(checkout) if !checkout.released => Ok(Arc::clone(&checkout.slot)),
            _ => Err(released(id)),
        }
    }

    fn any_slot(&self, id: ConnectionId) -> Option<ConnectionSlot> {
        lock(&self.checked_out)
            .get(&id)
            .map(|checkout| Arc::clone(&checkout.slot))
    }

    pub async fn connection_state(&self, handle: &ConnectionHandle) -> XaResult<BranchState> {
        let slot = self.slot(handle.id())?;
        let guard = slot.lock().await;
        guard
            .as_ref()
            .map(|conn| conn.state())
            .ok_or_else(|| released(handle.id()))
    }

    pub async fn enlisted_xid(&self, handle: &ConnectionHandle) -> XaResult<Option<Xid>> {
        let slot = self.slot(handle.id())?;
        let guard = slot.lock().await;
        guard
            .as_ref()
            .map(|conn| conn.enlisted_xid().cloned())
            .ok_or_else(|| released(handle.id()))
    }

    /// Current view of a live branch
    pub async fn branch_status(&self, xid: &Xid) -> Option<BranchSnapshot> {
        let cell = self.find_branch(xid)?;
        let branch = cell.lock().await;
        let mut participants = Vec::with_capacity(branch.participants.len());
        for (id, participant) in &branch.participants {
            let mut state = participant.state;
            if let Some(slot) = self.any_slot(*id) {
                let guard = slot.lock().await;
                if let Some(conn) = guard.as_ref().filter(|c| c.enlisted_xid() == Some(xid)) {
                    state = conn.state();
                }
            }
            participants.push(ParticipantSnapshot {
                connection: *id,
                resource: participant.resource.clone(),
                state,
            });
        }

        Some(BranchSnapshot {
            xid: branch.xid.clone(),
            phase: branch.phase,
            rollback_only: branch.rollback_only,
            started_at: branch.started_at,
            participants,
        })
    }

    pub fn active_branches(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = lock(&self.branches).keys().cloned().collect();
        xids.sort();
        xids
    }

    pub fn recovered_xids(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = lock(&self.recovered).keys().cloned().collect();
        xids.sort();
        xids
    }

    pub fn checked_out_count(&self) -> usize {
        lock(&self.checked_out).len()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn invocation_stats(&self) -> Vec<(String, SwitchOperation, InvocationStats)> {
        self.invoker.stats()
    }

    pub fn registry(&self) -> &Arc<SwitchRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }
}

impl Clone for ConnectionManager {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            pool: self.pool.clone(),
            invoker: self.invoker.clone(),
            config: Arc::clone(&self.config),
            checked_out: Arc::clone(&self.checked_out),
            branches: Arc::clone(&self.branches),
            recovered: Arc::clone(&self.recovered),
            sweeper: Arc::clone(&self.sweeper),
        }
    }
}

/// Releases a checkout if the allocating future is dropped before it returns
struct CheckoutGuard {
    manager: Option<ConnectionManager>,
    id: ConnectionId,
}

impl CheckoutGuard {
    fn new(manager: ConnectionManager, id: ConnectionId) -> Self {
        Self {
            manager: Some(manager),
            id,
        }
    }

    fn disarm(mut self) {
        self.manager = None;
    }
}

impl Drop for CheckoutGuard {
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = manager.release_id(id).await {
                        warn!("Releasing abandoned checkout {} failed: {}", id, e);
                    }
                    manager.prune_empty_branches();
                });
            }
            Err(_) => warn!("No runtime to release abandoned checkout {}", id),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn released(id: ConnectionId) -> XaError {
    XaError::protocol(format!("connection {} has been released", id))
}

fn unknown_branch(xid: &Xid) -> XaError {
    XaError::UnknownBranch {
        xid: xid.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, RetryConfig};
    use crate::switch::memory::InMemorySwitch;

    struct Fixture {
        manager: ConnectionManager,
        db1: Arc<InMemorySwitch>,
        db2: Arc<InMemorySwitch>,
    }

    fn fixture() -> Fixture {
        fixture_with(InMemorySwitch::new("DB1"), InMemorySwitch::new("DB2"))
    }

    fn fixture_with(db1: InMemorySwitch, db2: InMemorySwitch) -> Fixture {
        let db1 = Arc::new(db1);
        let db2 = Arc::new(db2);
        let registry = Arc::new(SwitchRegistry::new());
        registry.register_switch("DB1", db1.clone()).unwrap();
        registry.register_switch("DB2", db2.clone()).unwrap();
        let config = ManagerConfig {
            pool: PoolConfig {
                max_size: 4,
                acquire_timeout_ms: 100,
                ..Default::default()
            },
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff_ms: 1,
                backoff_multiplier: 1.0,
                max_backoff_ms: 1,
            },
            ..Default::default()
        };
        Fixture {
            manager: ConnectionManager::new(registry, config).unwrap(),
            db1,
            db2,
        }
    }

    async fn allocate(manager: &ConnectionManager, rm: &str, xid: &Xid) -> ConnectionHandle {
        manager
            .allocate(rm, &MatchCriteria::default(), Some(xid))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_one_phase_commit_for_single_participant() {
        let f = fixture();
        let xid = Xid::generate();
        let handle = allocate(&f.manager, "DB1", &xid).await;

        let report = f.manager.commit_branch(&xid).await.unwrap();
        assert_eq!(report.outcome, BranchOutcome::Completed);
        assert_eq!(f.db1.count(SwitchOperation::Prepare), 0);
        assert_eq!(f.db1.committed_xids(), vec![xid.clone()]);
        assert!(f.manager.branch_status(&xid).await.is_none());
        assert_eq!(
            f.manager.connection_state(&handle).await.unwrap(),
            BranchState::Committed
        );
    }

    #[tokio::test]
    async fn test_one_phase_refused_without_switch_support() {
        let f = fixture_with(
            InMemorySwitch::new("DB1").without_one_phase(),
            InMemorySwitch::new("DB2"),
        );
        let xid = Xid::generate();
        allocate(&f.manager, "DB1", &xid).await;

        assert!(matches!(
            f.manager.commit_branch(&xid).await,
            Err(XaError::ProtocolViolation(_))
        ));
        assert_eq!(f.manager.prepare_branch(&xid).await.unwrap().vote, Vote::Commit);
        let report = f.manager.commit_branch(&xid).await.unwrap();
        assert_eq!(report.outcome, BranchOutcome::Completed);
    }

    #[tokio::test]
    async fn test_unprepared_multi_participant_commit_is_rejected() {
        let f = fixture();
        let xid = Xid::generate();
        allocate(&f.manager, "DB1", &xid).await;
        allocate(&f.manager, "DB2", &xid).await;

        assert!(matches!(
            f.manager.commit_branch(&xid).await,
            Err(XaError::ProtocolViolation(_))
        ));
        assert!(f.db1.committed_xids().is_empty());
        assert!(f.db2.committed_xids().is_empty());
    }

    #[tokio::test]
    async fn test_enlist_after_prepare_is_branch_finishing() {
        let f = fixture();
        let xid = Xid::generate();
        allocate(&f.manager, "DB1", &xid).await;
        f.manager.prepare_branch(&xid).await.unwrap();

        let late = f
            .manager
            .allocate("DB2", &MatchCriteria::default(), None)
            .await
            .unwrap();
        assert!(matches!(
            f.manager.enlist(&late, &xid).await,
            Err(XaError::BranchFinishing { .. })
        ));
        assert_eq!(
            f.manager.connection_state(&late).await.unwrap(),
            BranchState::Idle
        );
    }

    #[tokio::test]
    async fn test_failed_enlist_leaves_no_branch() {
        let f = fixture();
        let xid = Xid::generate();
        f.db1.fail_next(SwitchOperation::Start, SwitchStatus::Fatal);

        let result = f
            .manager
            .allocate("DB1", &MatchCriteria::default(), Some(&xid))
            .await;
        assert!(result.is_err());
        assert!(f.manager.active_branches().is_empty());
        assert_eq!(f.manager.checked_out_count(), 0);
        // The ERROR connection was closed, not pooled
        assert_eq!(f.manager.pool().available_count(), 0);
        assert_eq!(f.db1.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_same_resource_twice_joins() {
        let f = fixture();
        let xid = Xid::generate();
        allocate(&f.manager, "DB1", &xid).await;
        allocate(&f.manager, "DB1", &xid).await;

        let snapshot = f.manager.branch_status(&xid).await.unwrap();
        assert_eq!(snapshot.participants.len(), 2);
        assert!(f
            .db1
            .calls()
            .iter()
            .any(|call| call.operation == SwitchOperation::Start && call.status.is_ok()));

        assert_eq!(f.manager.prepare_branch(&xid).await.unwrap().vote, Vote::Commit);
        let report = f.manager.commit_branch(&xid).await.unwrap();
        assert_eq!(report.outcome, BranchOutcome::Completed);
    }

    #[tokio::test]
    async fn test_delist_failed_forces_rollback_vote() {
        let f = fixture();
        let xid = Xid::generate();
        let first = allocate(&f.manager, "DB1", &xid).await;
        allocate(&f.manager, "DB2", &xid).await;

        f.manager.delist_failed(&first).await.unwrap();
        let report = f.manager.prepare_branch(&xid).await.unwrap();
        assert_eq!(report.vote, Vote::Rollback);
        assert!(report
            .participants
            .iter()
            .all(|p| p.result == ParticipantResult::Skipped));
        assert_eq!(f.db1.count(SwitchOperation::Prepare), 0);

        let rollback = f.manager.rollback_branch(&xid).await.unwrap();
        assert_eq!(rollback.outcome, BranchOutcome::Completed);
        assert_eq!(f.db1.rolled_back_xids(), vec![xid.clone()]);
        assert_eq!(f.db2.rolled_back_xids(), vec![xid]);
    }

    #[tokio::test]
    async fn test_suspend_resume_and_reenlist() {
        let f = fixture();
        let xid = Xid::generate();
        let handle = allocate(&f.manager, "DB1", &xid).await;

        f.manager.suspend(&handle).await.unwrap();
        assert_eq!(
            f.manager.connection_state(&handle).await.unwrap(),
            BranchState::Suspended
        );
        f.manager.resume(&handle).await.unwrap();
        f.manager.delist(&handle).await.unwrap();
        assert_eq!(
            f.manager.connection_state(&handle).await.unwrap(),
            BranchState::Ended
        );

        // Re-enlisting an ended connection joins the same branch
        f.manager.enlist(&handle, &xid).await.unwrap();
        assert_eq!(
            f.manager.connection_state(&handle).await.unwrap(),
            BranchState::Enlisted
        );
        let joins = f
            .db1
            .calls()
            .into_iter()
            .filter(|call| call.operation == SwitchOperation::Start)
            .count();
        assert_eq!(joins, 3);
    }

    #[tokio::test]
    async fn test_prepare_failure_short_circuits() {
        let f = fixture();
        let xid = Xid::generate();
        allocate(&f.manager, "DB1", &xid).await;
        allocate(&f.manager, "DB2", &xid).await;
        f.db1.fail_next(SwitchOperation::Prepare, SwitchStatus::ProtocolError);

        let report = f.manager.prepare_branch(&xid).await.unwrap();
        assert_eq!(report.vote, Vote::Rollback);
        assert!(report.participants[0].is_failure());
        assert_eq!(report.participants[1].result, ParticipantResult::Skipped);
        assert_eq!(f.db2.count(SwitchOperation::Prepare), 0);
    }

    #[tokio::test]
    async fn test_resource_unavailable_commit_can_be_redriven() {
        let f = fixture();
        let xid = Xid::generate();
        allocate(&f.manager, "DB1", &xid).await;
        allocate(&f.manager, "DB2", &xid).await;
        f.manager.prepare_branch(&xid).await.unwrap();

        f.db2.fail_next(SwitchOperation::Commit, SwitchStatus::ResourceUnavailable);
        let first = f.manager.commit_branch(&xid).await.unwrap();
        assert_eq!(first.outcome, BranchOutcome::Partial);
        let snapshot = f.manager.branch_status(&xid).await.unwrap();
        assert_eq!(snapshot.phase, BranchPhase::Committing);

        let second = f.manager.commit_branch(&xid).await.unwrap();
        assert_eq!(second.outcome, BranchOutcome::Completed);
        assert!(f.manager.branch_status(&xid).await.is_none());
        assert_eq!(f.db1.count(SwitchOperation::Commit), 1);
    }

    #[tokio::test]
    async fn test_resource_unavailable_one_phase_commit_can_be_redriven() {
        let f = fixture();
        let xid = Xid::generate();
        let handle = allocate(&f.manager, "DB1", &xid).await;

        f.db1.fail_next(SwitchOperation::Commit, SwitchStatus::ResourceUnavailable);
        let first = f.manager.commit_branch(&xid).await.unwrap();
        assert_eq!(first.outcome, BranchOutcome::Indeterminate);
        assert_eq!(
            f.manager.connection_state(&handle).await.unwrap(),
            BranchState::Ended
        );

        let second = f.manager.commit_branch(&xid).await.unwrap();
        assert_eq!(second.outcome, BranchOutcome::Completed);
        assert_eq!(f.db1.count(SwitchOperation::Prepare), 0);
        assert_eq!(f.db1.committed_xids(), vec![xid.clone()]);
        assert!(f.manager.active_branches().is_empty());
        assert_eq!(f.manager.release(&handle).await.unwrap(), ReleaseOutcome::Pooled);
    }

    #[tokio::test]
    async fn test_unfinished_one_phase_commit_can_be_rolled_back() {
        let f = fixture();
        let xid = Xid::generate();
        let handle = allocate(&f.manager, "DB1", &xid).await;

        f.db1.fail_next(SwitchOperation::Commit, SwitchStatus::ResourceUnavailable);
        f.manager.commit_branch(&xid).await.unwrap();

        let report = f.manager.rollback_branch(&xid).await.unwrap();
        assert_eq!(report.outcome, BranchOutcome::Completed);
        assert_eq!(f.db1.rolled_back_xids(), vec![xid]);
        assert!(f.db1.committed_xids().is_empty());
        assert!(f.manager.active_branches().is_empty());
        assert_eq!(
            f.manager.connection_state(&handle).await.unwrap(),
            BranchState::RolledBack
        );
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let f = fixture();
        let handle = f
            .manager
            .allocate("DB1", &MatchCriteria::default(), None)
            .await
            .unwrap();

        assert_eq!(f.manager.release(&handle).await.unwrap(), ReleaseOutcome::Pooled);
        assert_eq!(
            f.manager.release(&handle).await.unwrap(),
            ReleaseOutcome::AlreadyReleased
        );
        assert!(f.manager.connection_state(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_branch() {
        let f = fixture();
        let xid = Xid::generate();
        assert!(matches!(
            f.manager.prepare_branch(&xid).await,
            Err(XaError::UnknownBranch { .. })
        ));
        assert!(matches!(
            f.manager.commit_branch(&xid).await,
            Err(XaError::UnknownBranch { .. })
        ));
    }
}
