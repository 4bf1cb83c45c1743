//! Resource-manager switches and the registry that names them
//!
//! A switch is the operation table a resource manager exposes for taking part in
//! two-phase commit. Switches are registered once at startup under a unique name
//! and looked up by the pool whenever it opens a connection.

pub mod memory;

use crate::connection::{ConnectionId, MatchCriteria};
use crate::exception::{XaError, XaResult};
use crate::xid::Xid;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Status returned by every switch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchStatus {
    /// Operation succeeded
    Ok,
    /// Operation had no effect and may be reissued
    Retry,
    /// Operation was invoked in an improper context
    ProtocolError,
    /// Resource manager is currently unreachable
    ResourceUnavailable,
    /// Unrecoverable resource manager failure
    Fatal,
}

impl SwitchStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, SwitchStatus::Ok)
    }

    /// Failures that poison the connection and are never retried
    pub fn is_hard_failure(self) -> bool {
        matches!(self, SwitchStatus::ProtocolError | SwitchStatus::Fatal)
    }

    pub fn into_result(self) -> Result<(), SwitchStatus> {
        match self {
            SwitchStatus::Ok => Ok(()),
            other => Err(other),
        }
    }

    /// Map an X/Open XA return code onto the status set.
    ///
    /// Read-only prepares count as success. Heuristic outcomes and rollback codes
    /// are fatal for the branch; they need operator attention through `forget`.
    pub fn from_xa_code(code: i32) -> Self {
        match code {
            codes::XA_OK | codes::XA_RDONLY => SwitchStatus::Ok,
            codes::XA_RETRY | codes::XA_RBTRANSIENT => SwitchStatus::Retry,
            codes::XAER_RMFAIL | codes::XA_RBCOMMFAIL => SwitchStatus::ResourceUnavailable,
            codes::XAER_PROTO
            | codes::XAER_INVAL
            | codes::XAER_NOTA
            | codes::XAER_DUPID
            | codes::XAER_OUTSIDE
            | codes::XAER_ASYNC => SwitchStatus::ProtocolError,
            _ => SwitchStatus::Fatal,
        }
    }
}

impl fmt::Display for SwitchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwitchStatus::Ok => "OK",
            SwitchStatus::Retry => "RETRY",
            SwitchStatus::ProtocolError => "PROTOCOL_ERROR",
            SwitchStatus::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
            SwitchStatus::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

/// X/Open XA return codes, for switches wrapping a native library
pub mod codes {
    pub const XA_RBROLLBACK: i32 = 100;
    pub const XA_RBCOMMFAIL: i32 = 101;
    pub const XA_RBDEADLOCK: i32 = 102;
    pub const XA_RBINTEGRITY: i32 = 103;
    pub const XA_RBOTHER: i32 = 104;
    pub const XA_RBPROTO: i32 = 105;
    pub const XA_RBTIMEOUT: i32 = 106;
    pub const XA_RBTRANSIENT: i32 = 107;
    pub const XA_NOMIGRATE: i32 = 9;
    pub const XA_HEURHAZ: i32 = 8;
    pub const XA_HEURCOM: i32 = 7;
    pub const XA_HEURRB: i32 = 6;
    pub const XA_HEURMIX: i32 = 5;
    pub const XA_RETRY: i32 = 4;
    pub const XA_RDONLY: i32 = 3;
    pub const XA_OK: i32 = 0;
    pub const XAER_ASYNC: i32 = -2;
    pub const XAER_RMERR: i32 = -3;
    pub const XAER_NOTA: i32 = -4;
    pub const XAER_INVAL: i32 = -5;
    pub const XAER_PROTO: i32 = -6;
    pub const XAER_RMFAIL: i32 = -7;
    pub const XAER_DUPID: i32 = -8;
    pub const XAER_OUTSIDE: i32 = -9;
}

/// The operations of a switch, used for logging and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SwitchOperation {
    Open,
    Close,
    Start,
    End,
    Prepare,
    Commit,
    Rollback,
    Recover,
    Forget,
}

impl SwitchOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            SwitchOperation::Open => "open",
            SwitchOperation::Close => "close",
            SwitchOperation::Start => "start",
            SwitchOperation::End => "end",
            SwitchOperation::Prepare => "prepare",
            SwitchOperation::Commit => "commit",
            SwitchOperation::Rollback => "rollback",
            SwitchOperation::Recover => "recover",
            SwitchOperation::Forget => "forget",
        }
    }
}

impl fmt::Display for SwitchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `start` associates a connection with a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartFlag {
    /// Begin a new branch
    New,
    /// Join a branch previously ended by this connection
    Join,
    /// Resume a suspended association
    Resume,
}

/// How `end` dissociates a connection from a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndFlag {
    /// Work completed, branch may be prepared
    Success,
    /// Work failed, branch is rollback-only
    Fail,
    /// Association is suspended and may be resumed
    Suspend,
}

/// Operation table of a resource manager.
///
/// Calls are made by the connection layer one at a time per connection; the
/// returned status drives retry and failure handling.
#[async_trait]
pub trait XaSwitch: Send + Sync {
    async fn open(
        &self,
        connection: ConnectionId,
        open_info: &str,
        criteria: &MatchCriteria,
    ) -> SwitchStatus;

    async fn close(&self, connection: ConnectionId, close_info: &str) -> SwitchStatus;

    async fn start(&self, connection: ConnectionId, xid: &Xid, flag: StartFlag) -> SwitchStatus;

    async fn end(&self, connection: ConnectionId, xid: &Xid, flag: EndFlag) -> SwitchStatus;

    async fn prepare(&self, connection: ConnectionId, xid: &Xid) -> SwitchStatus;

    async fn commit(&self, connection: ConnectionId, xid: &Xid, one_phase: bool) -> SwitchStatus;

    async fn rollback(&self, connection: ConnectionId, xid: &Xid) -> SwitchStatus;

    /// Prepared or heuristically completed branches known to the resource manager
    async fn recover(&self, connection: ConnectionId) -> Result<Vec<Xid>, SwitchStatus>;

    async fn forget(&self, connection: ConnectionId, xid: &Xid) -> SwitchStatus;

    /// Whether commit may be issued directly on an ended, single-participant branch
    fn supports_one_phase(&self) -> bool {
        true
    }
}

/// A registered resource manager: its name, operation table and open/close info
#[derive(Clone)]
pub struct SwitchDescriptor {
    name: String,
    operations: Arc<dyn XaSwitch>,
    open_info: String,
    close_info: String,
    recovery_criteria: MatchCriteria,
}

impl SwitchDescriptor {
    pub fn new<S: Into<String>>(name: S, operations: Arc<dyn XaSwitch>) -> Self {
        Self {
            name: name.into(),
            operations,
            open_info: String::new(),
            close_info: String::new(),
            recovery_criteria: MatchCriteria::default(),
        }
    }

    pub fn with_open_info<S: Into<String>>(mut self, open_info: S) -> Self {
        self.open_info = open_info.into();
        self
    }

    pub fn with_close_info<S: Into<String>>(mut self, close_info: S) -> Self {
        self.close_info = close_info.into();
        self
    }

    /// Criteria for the connection used by recovery scans
    pub fn with_recovery_criteria(mut self, criteria: MatchCriteria) -> Self {
        self.recovery_criteria = criteria;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &Arc<dyn XaSwitch> {
        &self.operations
    }

    pub fn open_info(&self) -> &str {
        &self.open_info
    }

    pub fn close_info(&self) -> &str {
        &self.close_info
    }

    pub fn recovery_criteria(&self) -> &MatchCriteria {
        &self.recovery_criteria
    }

    pub fn supports_one_phase(&self) -> bool {
        self.operations.supports_one_phase()
    }
}

impl fmt::Debug for SwitchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchDescriptor")
            .field("name", &self.name)
            .field("open_info", &self.open_info)
            .field("close_info", &self.close_info)
            .finish()
    }
}

/// Maps resource-manager names to their switches.
///
/// Registration happens at startup and is append-only; lookups are concurrent reads.
#[derive(Debug, Default)]
pub struct SwitchRegistry {
    switches: RwLock<HashMap<String, Arc<SwitchDescriptor>>>,
}

impl SwitchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource manager by name with a bare operation table
    pub fn register_switch<S: Into<String>>(
        &self,
        name: S,
        operations: Arc<dyn XaSwitch>,
    ) -> XaResult<Arc<SwitchDescriptor>> {
        self.register(SwitchDescriptor::new(name, operations))
    }

    /// Register a descriptor, failing if its name is taken
    pub fn register(&self, descriptor: SwitchDescriptor) -> XaResult<Arc<SwitchDescriptor>> {
        let mut switches = self
            .switches
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if switches.contains_key(descriptor.name()) {
            return Err(XaError::DuplicateResourceManager {
                name: descriptor.name().to_string(),
            });
        }

        let descriptor = Arc::new(descriptor);
        switches.insert(descriptor.name().to_string(), Arc::clone(&descriptor));
        info!("Registered resource manager switch: {}", descriptor.name());
        Ok(descriptor)
    }

    pub fn lookup(&self, name: &str) -> XaResult<Arc<SwitchDescriptor>> {
        self.switches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| XaError::UnknownResourceManager {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.switches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .switches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.switches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
