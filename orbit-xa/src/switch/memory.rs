//! Loopback resource manager implementing the switch in memory
//!
//! Keeps just enough state to enforce the XA call sequence (association, end,
//! prepare, completion) and a durable prepared set that survives "crashes" so
//! recovery can be exercised. Results of individual operations can be scripted.

use crate::connection::{ConnectionId, MatchCriteria};
use crate::switch::{EndFlag, StartFlag, SwitchOperation, SwitchStatus, XaSwitch};
use crate::xid::Xid;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// One recorded invocation of the in-memory switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchCall {
    pub operation: SwitchOperation,
    pub connection: ConnectionId,
    pub xid: Option<Xid>,
    pub status: SwitchStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Association {
    Active,
    Suspended,
}

#[derive(Debug, Default)]
struct BranchRecord {
    prepared: bool,
    rollback_only: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<ConnectionId, MatchCriteria>,
    associations: HashMap<ConnectionId, (Xid, Association)>,
    branches: HashMap<Xid, BranchRecord>,
    prepared: BTreeSet<Xid>,
    heuristic: BTreeSet<Xid>,
    committed: Vec<Xid>,
    rolled_back: Vec<Xid>,
    faults: HashMap<SwitchOperation, VecDeque<SwitchStatus>>,
    calls: Vec<SwitchCall>,
}

impl MemoryState {
    fn take_fault(&mut self, operation: SwitchOperation) -> Option<SwitchStatus> {
        self.faults
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front())
    }

    fn record(
        &mut self,
        operation: SwitchOperation,
        connection: ConnectionId,
        xid: Option<&Xid>,
        status: SwitchStatus,
    ) -> SwitchStatus {
        self.calls.push(SwitchCall {
            operation,
            connection,
            xid: xid.cloned(),
            status,
        });
        status
    }

    fn has_active_association(&self, xid: &Xid) -> bool {
        self.associations
            .values()
            .any(|(associated, state)| associated == xid && *state == Association::Active)
    }
}

/// In-memory resource manager
#[derive(Debug)]
pub struct InMemorySwitch {
    name: String,
    one_phase: bool,
    latency: Option<Duration>,
    state: Mutex<MemoryState>,
}

impl InMemorySwitch {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            one_phase: true,
            latency: None,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Refuse the one-phase commit shortcut
    pub fn without_one_phase(mut self) -> Self {
        self.one_phase = false;
        self
    }

    /// Delay every operation, simulating a remote resource manager
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed branches left prepared by an earlier process
    pub fn with_in_doubt<I: IntoIterator<Item = Xid>>(self, xids: I) -> Self {
        self.lock().prepared.extend(xids);
        self
    }

    /// Seed branches completed heuristically, awaiting `forget`
    pub fn with_heuristic<I: IntoIterator<Item = Xid>>(self, xids: I) -> Self {
        self.lock().heuristic.extend(xids);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make the next call of `operation` answer `status` without side effects
    pub fn fail_next(&self, operation: SwitchOperation, status: SwitchStatus) {
        self.fail_times(operation, status, 1);
    }

    pub fn fail_times(&self, operation: SwitchOperation, status: SwitchStatus, times: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry(operation).or_default();
        queue.extend(std::iter::repeat(status).take(times));
    }

    pub fn calls(&self) -> Vec<SwitchCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls of one operation
    pub fn count(&self, operation: SwitchOperation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn prepared_xids(&self) -> Vec<Xid> {
        self.lock().prepared.iter().cloned().collect()
    }

    pub fn committed_xids(&self) -> Vec<Xid> {
        self.lock().committed.clone()
    }

    pub fn rolled_back_xids(&self) -> Vec<Xid> {
        self.lock().rolled_back.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl XaSwitch for InMemorySwitch {
    async fn open(
        &self,
        connection: ConnectionId,
        _open_info: &str,
        criteria: &MatchCriteria,
    ) -> SwitchStatus {
        self.delay().await;
        let mut state = self.lock();
        let status = match state.take_fault(SwitchOperation::Open) {
            Some(status) => status,
            None => {
                state.sessions.insert(connection, criteria.clone());
                SwitchStatus::Ok
            }
        };
        state.record(SwitchOperation::Open, connection, None, status)
    }

    async fn close(&self, connection: ConnectionId, _close_info: &str) -> SwitchStatus {
        self.delay().await;
        let mut state = self.lock();
        let status = match state.take_fault(SwitchOperation::Close) {
            Some(status) => status,
            None => {
                state.associations.remove(&connection);
                if state.sessions.remove(&connection).is_some() {
                    SwitchStatus::Ok
                } else {
                    SwitchStatus::ProtocolError
                }
            }
        };
        state.record(SwitchOperation::Close, connection, None, status)
    }

    async fn start(&self, connection: ConnectionId, xid: &Xid, flag: StartFlag) -> SwitchStatus {
        self.delay().await;
        let mut state = self.lock();
        let status = match state.take_fault(SwitchOperation::Start) {
            Some(status) => status,
            None if !state.sessions.contains_key(&connection) => SwitchStatus::ProtocolError,
            None => match flag {
                StartFlag::New => {
                    if state.associations.contains_key(&connection)
                        || state.branches.contains_key(xid)
                    {
                        SwitchStatus::ProtocolError
                    } else {
                        state.branches.insert(xid.clone(), BranchRecord::default());
                        state
                            .associations
                            .insert(connection, (xid.clone(), Association::Active));
                        SwitchStatus::Ok
                    }
                }
                StartFlag::Join => {
                    let joinable = state
                        .branches
                        .get(xid)
                        .map(|branch| !branch.prepared)
                        .unwrap_or(false);
                    if joinable && !state.associations.contains_key(&connection) {
                        state
                            .associations
                            .insert(connection, (xid.clone(), Association::Active));
                        SwitchStatus::Ok
                    } else {
                        SwitchStatus::ProtocolError
                    }
                }
                StartFlag::Resume => match state.associations.get_mut(&connection) {
                    Some((associated, assoc)) if associated == xid && *assoc == Association::Suspended => {
                        *assoc = Association::Active;
                        SwitchStatus::Ok
                    }
                    _ => SwitchStatus::ProtocolError,
                },
            },
        };
        state.record(SwitchOperation::Start, connection, Some(xid), status)
    }

    async fn end(&self, connection: ConnectionId, xid: &Xid, flag: EndFlag) -> SwitchStatus {
        self.delay().await;
        let mut state = self.lock();
        let status = match state.take_fault(SwitchOperation::End) {
            Some(status) => status,
            None => match state.associations.get(&connection).cloned() {
                Some((associated, assoc)) if &associated == xid => match (flag, assoc) {
                    (EndFlag::Suspend, Association::Active) => {
                        state
                            .associations
                            .insert(connection, (associated, Association::Suspended));
                        SwitchStatus::Ok
                    }
                    (EndFlag::Suspend, Association::Suspended) => SwitchStatus::ProtocolError,
                    (EndFlag::Success, _) => {
                        state.associations.remove(&connection);
                        SwitchStatus::Ok
                    }
                    (EndFlag::Fail, _) => {
                        state.associations.remove(&connection);
                        if let Some(branch) = state.branches.get_mut(xid) {
                            branch.rollback_only = true;
                        }
                        SwitchStatus::Ok
                    }
                },
                _ => SwitchStatus::ProtocolError,
            },
        };
        state.record(SwitchOperation::End, connection, Some(xid), status)
    }

    async fn prepare(&self, connection: ConnectionId, xid: &Xid) -> SwitchStatus {
        self.delay().await;
        let mut state = self.lock();
        let status = match state.take_fault(SwitchOperation::Prepare) {
            Some(status) => status,
            None if state.has_active_association(xid) => SwitchStatus::ProtocolError,
            None => match state.branches.get(xid).map(|b| (b.prepared, b.rollback_only)) {
                None => SwitchStatus::ProtocolError,
                // Already prepared through another connection of this resource manager
                Some((true, _)) => SwitchStatus::Ok,
                Some((false, true)) => {
                    state.branches.remove(xid);
                    state.rolled_back.push(xid.clone());
                    SwitchStatus::Fatal
                }
                Some((false, false)) => {
                    if let Some(branch) = state.branches.get_mut(xid) {
                        branch.prepared = true;
                    }
                    state.prepared.insert(xid.clone());
                    SwitchStatus::Ok
                }
            },
        };
        state.record(SwitchOperation::Prepare, connection, Some(xid), status)
    }

    async fn commit(&self, connection: ConnectionId, xid: &Xid, one_phase: bool) -> SwitchStatus {
        self.delay().await;
        let mut state = self.lock();
        let status = match state.take_fault(SwitchOperation::Commit) {
            Some(status) => status,
            None => {
                let prepared = state.prepared.contains(xid);
                let ended = state
                    .branches
                    .get(xid)
                    .map(|branch| !branch.prepared && !branch.rollback_only)
                    .unwrap_or(false);
                let allowed = if one_phase {
                    self.one_phase && ended && !state.has_active_association(xid)
                } else {
                    prepared
                };
                if allowed {
                    state.branches.remove(xid);
                    state.prepared.remove(xid);
                    state.committed.push(xid.clone());
                    SwitchStatus::Ok
                } else if state.committed.contains(xid) {
                    // Repeated commit through a second connection of the same branch
                    SwitchStatus::Ok
                } else {
                    SwitchStatus::ProtocolError
                }
            }
        };
        state.record(SwitchOperation::Commit, connection, Some(xid), status)
    }

    async fn rollback(&self, connection: ConnectionId, xid: &Xid) -> SwitchStatus {
        self.delay().await;
        let mut state = self.lock();
        let status = match state.take_fault(SwitchOperation::Rollback) {
            Some(status) => status,
            None => {
                let known = state.branches.remove(xid).is_some();
                let in_doubt = state.prepared.remove(xid);
                if known || in_doubt {
                    state.associations.retain(|_, (associated, _)| associated != xid);
                    state.rolled_back.push(xid.clone());
                    SwitchStatus::Ok
                } else if state.rolled_back.contains(xid) {
                    SwitchStatus::Ok
                } else {
                    SwitchStatus::ProtocolError
                }
            }
        };
        state.record(SwitchOperation::Rollback, connection, Some(xid), status)
    }

    async fn recover(&self, connection: ConnectionId) -> Result<Vec<Xid>, SwitchStatus> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(status) = state.take_fault(SwitchOperation::Recover) {
            state.record(SwitchOperation::Recover, connection, None, status);
            return Err(status);
        }
        let in_doubt: Vec<Xid> = state
            .prepared
            .iter()
            .chain(state.heuristic.iter())
            .cloned()
            .collect();
        debug!("{} reports {} in-doubt branches", self.name, in_doubt.len());
        state.record(SwitchOperation::Recover, connection, None, SwitchStatus::Ok);
        Ok(in_doubt)
    }

    async fn forget(&self, connection: ConnectionId, xid: &Xid) -> SwitchStatus {
        self.delay().await;
        let mut state = self.lock();
        let status = match state.take_fault(SwitchOperation::Forget) {
            Some(status) => status,
            None if state.heuristic.remove(xid) => SwitchStatus::Ok,
            None => SwitchStatus::ProtocolError,
        };
        state.record(SwitchOperation::Forget, connection, Some(xid), status)
    }

    fn supports_one_phase(&self) -> bool {
        self.one_phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_two_phase_sequence() {
        let rm = InMemorySwitch::new("DB1");
        let conn = ConnectionId::next();
        let xid = Xid::generate();

        assert!(rm.open(conn, "", &MatchCriteria::default()).await.is_ok());
        assert!(rm.start(conn, &xid, StartFlag::New).await.is_ok());
        // Prepare while still associated is a protocol error
        assert_eq!(rm.prepare(conn, &xid).await, SwitchStatus::ProtocolError);
        assert!(rm.end(conn, &xid, EndFlag::Success).await.is_ok());
        assert!(rm.prepare(conn, &xid).await.is_ok());
        assert_eq!(rm.prepared_xids(), vec![xid.clone()]);
        assert!(rm.commit(conn, &xid, false).await.is_ok());
        assert_eq!(rm.committed_xids(), vec![xid]);
        assert!(rm.prepared_xids().is_empty());
    }

    #[tokio::test]
    async fn test_suspend_resume_and_join() {
        let rm = InMemorySwitch::new("DB1");
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        let xid = Xid::generate();
        rm.open(first, "", &MatchCriteria::default()).await;
        rm.open(second, "", &MatchCriteria::default()).await;

        assert!(rm.start(first, &xid, StartFlag::New).await.is_ok());
        assert_eq!(
            rm.start(second, &xid, StartFlag::New).await,
            SwitchStatus::ProtocolError
        );
        assert!(rm.start(second, &xid, StartFlag::Join).await.is_ok());
        assert!(rm.end(first, &xid, EndFlag::Suspend).await.is_ok());
        assert!(rm.start(first, &xid, StartFlag::Resume).await.is_ok());
        assert!(rm.end(first, &xid, EndFlag::Success).await.is_ok());
        assert!(rm.end(second, &xid, EndFlag::Success).await.is_ok());
        assert!(rm.commit(first, &xid, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_faults_and_recovery() {
        let in_doubt = Xid::generate();
        let rm = InMemorySwitch::new("DB1").with_in_doubt([in_doubt.clone()]);
        let conn = ConnectionId::next();
        rm.open(conn, "", &MatchCriteria::default()).await;

        rm.fail_next(SwitchOperation::Recover, SwitchStatus::Retry);
        assert_eq!(rm.recover(conn).await, Err(SwitchStatus::Retry));
        assert_eq!(rm.recover(conn).await, Ok(vec![in_doubt.clone()]));

        assert!(rm.rollback(conn, &in_doubt).await.is_ok());
        assert_eq!(rm.rolled_back_xids(), vec![in_doubt]);
        assert_eq!(rm.count(SwitchOperation::Recover), 2);
    }

    #[tokio::test]
    async fn test_one_phase_refused_when_disabled() {
        let rm = InMemorySwitch::new("DB1").without_one_phase();
        let conn = ConnectionId::next();
        let xid = Xid::generate();
        rm.open(conn, "", &MatchCriteria::default()).await;
        rm.start(conn, &xid, StartFlag::New).await;
        rm.end(conn, &xid, EndFlag::Success).await;

        assert!(!rm.supports_one_phase());
        assert_eq!(rm.commit(conn, &xid, true).await, SwitchStatus::ProtocolError);
    }
}
