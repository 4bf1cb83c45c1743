//! Pooled XA connection layer
//!
//! A registry of resource-manager switches, a bounded pool of managed
//! connections and a connection manager acting as the participant side of
//! two-phase commit for an external transaction coordinator.

pub mod config;
pub mod connection;
pub mod exception;
pub mod factory;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod switch;
pub mod xid;

pub use config::{ManagerConfig, MatchPolicy, PoolConfig, RetryConfig};
pub use connection::{BranchState, ConnectionId, MatchCriteria};
pub use exception::*;
pub use factory::{ConnectionFactory, ConnectionHandle};
pub use manager::{
    BranchOutcome, BranchPhase, BranchSnapshot, CompletionReport, ConnectionManager,
    ParticipantOutcome, ParticipantResult, ParticipantSnapshot, PrepareReport, ReleaseOutcome,
    Vote,
};
pub use pool::{ConnectionPool, PoolSnapshot, PoolStats, ReleaseDisposition};
pub use switch::memory::InMemorySwitch;
pub use switch::{
    EndFlag, StartFlag, SwitchDescriptor, SwitchOperation, SwitchRegistry, SwitchStatus, XaSwitch,
};
pub use xid::Xid;
