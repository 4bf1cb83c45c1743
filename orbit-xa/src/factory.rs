//! Application-facing connection factory
//!
//! A factory is bound to one resource manager and one set of match criteria;
//! every call is delegated to the connection manager.

use crate::connection::{BranchState, ConnectionId, MatchCriteria};
use crate::exception::{XaError, XaResult};
use crate::manager::{ConnectionManager, ReleaseOutcome};
use crate::xid::Xid;
use std::fmt;

/// Checked-out connection as seen by application code
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    id: ConnectionId,
    resource: String,
}

impl ConnectionHandle {
    pub(crate) fn new<S: Into<String>>(id: ConnectionId, resource: S) -> Self {
        Self {
            id,
            resource: resource.into(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.id)
    }
}

/// Hands out connections to one resource manager
#[derive(Clone)]
pub struct ConnectionFactory {
    manager: ConnectionManager,
    resource: String,
    criteria: MatchCriteria,
}

impl ConnectionFactory {
    pub fn new<S: Into<String>>(
        manager: ConnectionManager,
        resource: S,
        criteria: MatchCriteria,
    ) -> XaResult<Self> {
        let resource = resource.into();
        if !manager.registry().contains(&resource) {
            return Err(XaError::UnknownResourceManager { name: resource });
        }
        Ok(Self {
            manager,
            resource,
            criteria,
        })
    }

    /// Allocate a connection, enlisted in `ambient` when a transaction is active
    pub async fn get_connection(&self, ambient: Option<&Xid>) -> XaResult<ConnectionHandle> {
        self.manager
            .allocate(&self.resource, &self.criteria, ambient)
            .await
    }

    pub async fn close(&self, handle: &ConnectionHandle) -> XaResult<ReleaseOutcome> {
        self.manager.release(handle).await
    }

    pub async fn state_of(&self, handle: &ConnectionHandle) -> XaResult<BranchState> {
        self.manager.connection_state(handle).await
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn criteria(&self) -> &MatchCriteria {
        &self.criteria
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("resource", &self.resource)
            .field("criteria", &self.criteria)
            .finish()
    }
}
