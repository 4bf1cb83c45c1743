//! Managed connections and their per-branch state machine
//!
//! ```text
//! Idle -> Enlisted <-> Suspended
//!            |             |
//!            +--> Ended <--+
//!                   |  \
//!                   |   +--(one phase)--> Committed
//!                   v
//!               Prepared -> Committed | RolledBack
//! ```
//!
//! Any state moves to `Error` when the resource manager fails unrecoverably.
//! A connection in `Committed` or `RolledBack` may start a new branch.

use crate::config::MatchPolicy;
use crate::exception::{XaError, XaResult};
use crate::retry::SwitchInvoker;
use crate::switch::{EndFlag, StartFlag, SwitchDescriptor, SwitchOperation, SwitchStatus};
use crate::xid::Xid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle of a managed connection, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What an allocation request asks of a connection beyond the resource manager name
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchCriteria {
    /// Credential identity the connection was opened with
    pub credential: Option<String>,
    /// Further connection configuration, compared under `MatchPolicy::Strict`
    pub properties: BTreeMap<String, String>,
}

impl MatchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential<S: Into<String>>(mut self, credential: S) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, requested: &MatchCriteria, policy: MatchPolicy) -> bool {
        match policy {
            MatchPolicy::Strict => self == requested,
            MatchPolicy::CredentialOnly => self.credential == requested.credential,
        }
    }
}

/// Transaction-branch state of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchState {
    Idle,
    Enlisted,
    Suspended,
    Ended,
    Prepared,
    Committed,
    RolledBack,
    Error,
}

impl BranchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BranchState::Committed | BranchState::RolledBack | BranchState::Error
        )
    }

    /// States in which the connection carries no branch work and may go back to the pool
    pub fn is_reusable(self) -> bool {
        matches!(
            self,
            BranchState::Idle | BranchState::Committed | BranchState::RolledBack
        )
    }

    /// States in which the connection is associated with its branch
    pub fn is_associated(self) -> bool {
        matches!(self, BranchState::Enlisted | BranchState::Suspended)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BranchState::Idle => "IDLE",
            BranchState::Enlisted => "ENLISTED",
            BranchState::Suspended => "SUSPENDED",
            BranchState::Ended => "ENDED",
            BranchState::Prepared => "PREPARED",
            BranchState::Committed => "COMMITTED",
            BranchState::RolledBack => "ROLLED_BACK",
            BranchState::Error => "ERROR",
        }
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical connection to a resource manager plus its branch state
pub struct ManagedConnection {
    id: ConnectionId,
    switch: Arc<SwitchDescriptor>,
    criteria: MatchCriteria,
    state: BranchState,
    enlisted_xid: Option<Xid>,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

impl ManagedConnection {
    /// Open a new physical connection through the switch
    pub(crate) async fn open(
        switch: Arc<SwitchDescriptor>,
        criteria: MatchCriteria,
        invoker: &SwitchInvoker,
    ) -> XaResult<Self> {
        let id = ConnectionId::next();
        let ops = Arc::clone(switch.operations());

        let status = invoker
            .invoke(switch.name(), SwitchOperation::Open, || {
                let open = ops.open(id, switch.open_info(), &criteria);
                async move { open.await.into_result() }
            })
            .await;

        if let Err(status) = status {
            warn!("Failed to open connection to {}: {}", switch.name(), status);
            return Err(XaError::ConnectionCreateFailed {
                resource: switch.name().to_string(),
                status,
            });
        }

        debug!("Opened connection {} to {}", id, switch.name());
        let now = Instant::now();
        Ok(Self {
            id,
            switch,
            criteria,
            state: BranchState::Idle,
            enlisted_xid: None,
            created_at: now,
            last_used: now,
            use_count: 0,
        })
    }

    /// Close the physical connection. The connection is gone whatever the outcome.
    pub(crate) async fn close(self, invoker: &SwitchInvoker) -> XaResult<()> {
        let ops = Arc::clone(self.switch.operations());
        let id = self.id;
        let result = invoker
            .invoke(self.switch.name(), SwitchOperation::Close, || {
                let close = ops.close(id, self.switch.close_info());
                async move { close.await.into_result() }
            })
            .await;

        match result {
            Ok(()) => {
                debug!("Closed connection {} to {}", id, self.switch.name());
                Ok(())
            }
            Err(status) => {
                warn!(
                    "Closing connection {} to {} failed: {}",
                    id,
                    self.switch.name(),
                    status
                );
                Err(XaError::switch_failed(
                    SwitchOperation::Close.as_str(),
                    self.switch.name(),
                    status,
                ))
            }
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn resource(&self) -> &str {
        self.switch.name()
    }

    pub fn switch(&self) -> &Arc<SwitchDescriptor> {
        &self.switch
    }

    pub fn criteria(&self) -> &MatchCriteria {
        &self.criteria
    }

    pub fn state(&self) -> BranchState {
        self.state
    }

    pub fn enlisted_xid(&self) -> Option<&Xid> {
        self.enlisted_xid.as_ref()
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn matches(&self, resource: &str, criteria: &MatchCriteria, policy: MatchPolicy) -> bool {
        self.switch.name() == resource && self.criteria.matches(criteria, policy)
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    /// Forget the finished branch before the connection is pooled again
    pub(crate) fn reset(&mut self) {
        self.state = BranchState::Idle;
        self.enlisted_xid = None;
        self.last_used = Instant::now();
    }

    /// Associate the connection with `xid`
    pub(crate) async fn start(
        &mut self,
        xid: &Xid,
        flag: StartFlag,
        invoker: &SwitchInvoker,
    ) -> XaResult<()> {
        if let Some(current) = &self.enlisted_xid {
            if current != xid && !self.state.is_terminal() {
                return Err(XaError::AlreadyEnlisted {
                    connection: self.id.to_string(),
                    current: current.to_string(),
                    requested: xid.to_string(),
                });
            }
        }

        let allowed = match flag {
            StartFlag::New => self.state.is_reusable(),
            StartFlag::Join => {
                self.state.is_reusable()
                    || (self.state == BranchState::Ended && self.enlisted_xid.as_ref() == Some(xid))
            }
            StartFlag::Resume => self.state == BranchState::Suspended,
        };
        if !allowed {
            return Err(self.illegal(SwitchOperation::Start));
        }

        let ops = Arc::clone(self.switch.operations());
        let id = self.id;
        self.invoke_switch(SwitchOperation::Start, invoker, || ops.start(id, xid, flag))
            .await?;

        self.enlisted_xid = Some(xid.clone());
        self.transition(BranchState::Enlisted);
        Ok(())
    }

    /// Dissociate the connection from its branch
    pub(crate) async fn end(&mut self, flag: EndFlag, invoker: &SwitchInvoker) -> XaResult<()> {
        let (allowed, next) = match flag {
            EndFlag::Suspend => (self.state == BranchState::Enlisted, BranchState::Suspended),
            EndFlag::Success | EndFlag::Fail => (self.state.is_associated(), BranchState::Ended),
        };
        if !allowed {
            return Err(self.illegal(SwitchOperation::End));
        }

        let xid = self.branch_xid(SwitchOperation::End)?;
        let ops = Arc::clone(self.switch.operations());
        let id = self.id;
        self.invoke_switch(SwitchOperation::End, invoker, || ops.end(id, &xid, flag))
            .await?;

        self.transition(next);
        Ok(())
    }

    pub(crate) async fn prepare(&mut self, invoker: &SwitchInvoker) -> XaResult<()> {
        if self.state != BranchState::Ended {
            return Err(self.illegal(SwitchOperation::Prepare));
        }

        let xid = self.branch_xid(SwitchOperation::Prepare)?;
        let ops = Arc::clone(self.switch.operations());
        let id = self.id;
        self.invoke_switch(SwitchOperation::Prepare, invoker, || ops.prepare(id, &xid))
            .await?;

        self.transition(BranchState::Prepared);
        Ok(())
    }

    /// Commit the branch; `one_phase` skips prepare and needs an ended branch
    pub(crate) async fn commit(&mut self, one_phase: bool, invoker: &SwitchInvoker) -> XaResult<()> {
        let expected = if one_phase {
            BranchState::Ended
        } else {
            BranchState::Prepared
        };
        if self.state != expected {
            return Err(self.illegal(SwitchOperation::Commit));
        }

        let xid = self.branch_xid(SwitchOperation::Commit)?;
        let ops = Arc::clone(self.switch.operations());
        let id = self.id;
        self.invoke_switch(SwitchOperation::Commit, invoker, || {
            ops.commit(id, &xid, one_phase)
        })
        .await?;

        self.transition(BranchState::Committed);
        Ok(())
    }

    pub(crate) async fn rollback(&mut self, invoker: &SwitchInvoker) -> XaResult<()> {
        if !matches!(self.state, BranchState::Ended | BranchState::Prepared) {
            return Err(self.illegal(SwitchOperation::Rollback));
        }

        let xid = self.branch_xid(SwitchOperation::Rollback)?;
        let ops = Arc::clone(self.switch.operations());
        let id = self.id;
        self.invoke_switch(SwitchOperation::Rollback, invoker, || ops.rollback(id, &xid))
            .await?;

        self.transition(BranchState::RolledBack);
        Ok(())
    }

    /// Ask the resource manager for its in-doubt branches
    pub(crate) async fn recover(&mut self, invoker: &SwitchInvoker) -> XaResult<Vec<Xid>> {
        if !self.state.is_reusable() {
            return Err(self.illegal(SwitchOperation::Recover));
        }

        let ops = Arc::clone(self.switch.operations());
        let id = self.id;
        let result = invoker
            .invoke(self.switch.name(), SwitchOperation::Recover, || ops.recover(id))
            .await;

        result.map_err(|status| self.fail(SwitchOperation::Recover, status))
    }

    /// Complete a branch left in doubt by an earlier process, outside the state machine
    pub(crate) async fn complete_in_doubt(
        &mut self,
        xid: &Xid,
        commit: bool,
        invoker: &SwitchInvoker,
    ) -> XaResult<()> {
        if !self.state.is_reusable() {
            let operation = if commit {
                SwitchOperation::Commit
            } else {
                SwitchOperation::Rollback
            };
            return Err(self.illegal(operation));
        }

        let ops = Arc::clone(self.switch.operations());
        let id = self.id;
        if commit {
            self.invoke_switch(SwitchOperation::Commit, invoker, || {
                ops.commit(id, xid, false)
            })
            .await
        } else {
            self.invoke_switch(SwitchOperation::Rollback, invoker, || ops.rollback(id, xid))
                .await
        }
    }

    /// Let the resource manager discard a heuristically completed branch
    pub(crate) async fn forget(&mut self, xid: &Xid, invoker: &SwitchInvoker) -> XaResult<()> {
        if !self.state.is_reusable() {
            return Err(self.illegal(SwitchOperation::Forget));
        }

        let ops = Arc::clone(self.switch.operations());
        let id = self.id;
        self.invoke_switch(SwitchOperation::Forget, invoker, || ops.forget(id, xid))
            .await
    }

    async fn invoke_switch<F, Fut>(
        &mut self,
        operation: SwitchOperation,
        invoker: &SwitchInvoker,
        mut call: F,
    ) -> XaResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SwitchStatus>,
    {
        let resource = self.switch.name().to_string();
        let result = invoker
            .invoke(&resource, operation, || {
                let pending = call();
                async move { pending.await.into_result() }
            })
            .await;

        result.map_err(|status| self.fail(operation, status))
    }

    /// Record a failed switch call. RESOURCE_UNAVAILABLE leaves the state alone so
    /// the operation can be driven again; everything else poisons the connection.
    fn fail(&mut self, operation: SwitchOperation, status: SwitchStatus) -> XaError {
        if status != SwitchStatus::ResourceUnavailable {
            warn!(
                "Connection {} to {} failed {} with {}, marking ERROR",
                self.id,
                self.switch.name(),
                operation,
                status
            );
            self.state = BranchState::Error;
        } else {
            warn!(
                "Connection {} to {}: {} answered {}",
                self.id,
                self.switch.name(),
                operation,
                status
            );
        }
        XaError::switch_failed(operation.as_str(), self.switch.name(), status)
    }

    fn illegal(&self, operation: SwitchOperation) -> XaError {
        XaError::protocol(format!(
            "{} not allowed on connection {} in state {}",
            operation, self.id, self.state
        ))
    }

    fn branch_xid(&self, operation: SwitchOperation) -> XaResult<Xid> {
        self.enlisted_xid
            .clone()
            .ok_or_else(|| self.illegal(operation))
    }

    fn transition(&mut self, next: BranchState) {
        debug!(
            "Connection {} to {}: {} -> {}",
            self.id,
            self.switch.name(),
            self.state,
            next
        );
        self.state = next;
        self.last_used = Instant::now();
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("resource", &self.switch.name())
            .field("state", &self.state)
            .field("enlisted_xid", &self.enlisted_xid)
            .field("use_count", &self.use_count)
            .finish()
    }
}
