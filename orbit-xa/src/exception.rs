use crate::switch::SwitchStatus;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the XA connection layer
#[derive(Debug, Error)]
pub enum XaError {
    #[error("Unknown resource manager: {name}")]
    UnknownResourceManager { name: String },

    #[error("Resource manager already registered: {name}")]
    DuplicateResourceManager { name: String },

    #[error("Connection pool exhausted for {resource} after waiting {waited:?}")]
    PoolExhausted { resource: String, waited: Duration },

    #[error("Failed to open connection to {resource}: {status}")]
    ConnectionCreateFailed {
        resource: String,
        status: SwitchStatus,
    },

    #[error("Connection {connection} is enlisted in {current}, cannot enlist in {requested}")]
    AlreadyEnlisted {
        connection: String,
        current: String,
        requested: String,
    },

    #[error("Transaction branch {xid} is finishing and accepts no new participants")]
    BranchFinishing { xid: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Switch operation {operation} on {resource} failed: {status}")]
    SwitchOperationFailed {
        operation: String,
        resource: String,
        status: SwitchStatus,
    },

    #[error("Invalid transaction id: {0}")]
    InvalidXid(String),

    #[error("Unknown transaction branch: {xid}")]
    UnknownBranch { xid: String },

    #[error("Connection layer is shut down")]
    ShutDown,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl XaError {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        XaError::ProtocolViolation(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        XaError::Configuration(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        XaError::Internal(msg.into())
    }

    pub fn switch_failed<O, R>(operation: O, resource: R, status: SwitchStatus) -> Self
    where
        O: Into<String>,
        R: Into<String>,
    {
        XaError::SwitchOperationFailed {
            operation: operation.into(),
            resource: resource.into(),
            status,
        }
    }

    /// Status reported by the resource manager, when the error came from a switch call
    pub fn switch_status(&self) -> Option<SwitchStatus> {
        match self {
            XaError::SwitchOperationFailed { status, .. }
            | XaError::ConnectionCreateFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for XaError {
    fn from(error: toml::de::Error) -> Self {
        XaError::Configuration(error.to_string())
    }
}

/// Result type for XA connection layer operations
pub type XaResult<T> = Result<T, XaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = XaError::protocol("commit before prepare");
        assert!(matches!(error, XaError::ProtocolViolation(_)));
        assert_eq!(
            error.to_string(),
            "Protocol violation: commit before prepare"
        );
    }

    #[test]
    fn test_switch_status_extraction() {
        let error = XaError::switch_failed("commit", "DB1", SwitchStatus::Fatal);
        assert_eq!(error.switch_status(), Some(SwitchStatus::Fatal));
        assert!(error.to_string().contains("DB1"));

        let error = XaError::UnknownResourceManager {
            name: "DB9".to_string(),
        };
        assert_eq!(error.switch_status(), None);
    }
}
