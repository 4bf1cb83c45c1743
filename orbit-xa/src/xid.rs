//! XA transaction branch identifiers

use crate::exception::{XaError, XaResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one transaction branch: a global transaction id plus a branch qualifier.
///
/// Equality and hashing are by value over all three parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    global_transaction_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Maximum length of the global transaction id
    pub const MAX_GTRID_SIZE: usize = 64;
    /// Maximum length of the branch qualifier
    pub const MAX_BQUAL_SIZE: usize = 64;
    /// Format id of ids generated by this crate
    pub const DEFAULT_FORMAT_ID: i32 = 42;
    /// Format id marking the null xid
    pub const NULL_FORMAT_ID: i32 = -1;

    pub fn new(
        format_id: i32,
        global_transaction_id: &[u8],
        branch_qualifier: &[u8],
    ) -> XaResult<Self> {
        if global_transaction_id.len() > Self::MAX_GTRID_SIZE {
            return Err(XaError::InvalidXid(format!(
                "global transaction id is {} bytes, maximum is {}",
                global_transaction_id.len(),
                Self::MAX_GTRID_SIZE
            )));
        }
        if branch_qualifier.len() > Self::MAX_BQUAL_SIZE {
            return Err(XaError::InvalidXid(format!(
                "branch qualifier is {} bytes, maximum is {}",
                branch_qualifier.len(),
                Self::MAX_BQUAL_SIZE
            )));
        }
        if format_id != Self::NULL_FORMAT_ID && global_transaction_id.is_empty() {
            return Err(XaError::InvalidXid(
                "global transaction id must not be empty".to_string(),
            ));
        }

        Ok(Self {
            format_id,
            global_transaction_id: global_transaction_id.to_vec(),
            branch_qualifier: branch_qualifier.to_vec(),
        })
    }

    /// Generate a fresh global transaction with its first branch
    pub fn generate() -> Self {
        Self {
            format_id: Self::DEFAULT_FORMAT_ID,
            global_transaction_id: Uuid::new_v4().as_bytes().to_vec(),
            branch_qualifier: Uuid::new_v4().as_bytes().to_vec(),
        }
    }

    /// The null xid, never associated with any branch
    pub fn null() -> Self {
        Self {
            format_id: Self::NULL_FORMAT_ID,
            global_transaction_id: Vec::new(),
            branch_qualifier: Vec::new(),
        }
    }

    /// A new branch of the same global transaction
    pub fn branch(&self) -> Self {
        Self {
            format_id: self.format_id,
            global_transaction_id: self.global_transaction_id.clone(),
            branch_qualifier: Uuid::new_v4().as_bytes().to_vec(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.format_id == Self::NULL_FORMAT_ID
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_transaction_id(&self) -> &[u8] {
        &self.global_transaction_id
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }

    /// True when both ids belong to the same global transaction
    pub fn same_global(&self, other: &Xid) -> bool {
        self.format_id == other.format_id
            && self.global_transaction_id == other.global_transaction_id
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "null-xid");
        }
        write!(f, "{}:", self.format_id)?;
        write_hex(f, &self.global_transaction_id)?;
        write!(f, ":")?;
        write_hex(f, &self.branch_qualifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_equality_is_by_value() {
        let a = Xid::new(1, b"gtrid", b"bqual").unwrap();
        let b = Xid::new(1, b"gtrid", b"bqual").unwrap();
        let c = Xid::new(1, b"gtrid", b"other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.same_global(&c));
    }

    #[test]
    fn test_xid_length_limits() {
        let too_long = vec![0u8; Xid::MAX_GTRID_SIZE + 1];
        assert!(matches!(
            Xid::new(1, &too_long, b"b"),
            Err(XaError::InvalidXid(_))
        ));
        assert!(Xid::new(1, b"g", &too_long).is_err());
        assert!(Xid::new(1, b"", b"b").is_err());
    }

    #[test]
    fn test_generated_branches_share_global_id() {
        let xid = Xid::generate();
        let branch = xid.branch();
        assert!(xid.same_global(&branch));
        assert_ne!(xid, branch);
        assert_eq!(xid.format_id(), Xid::DEFAULT_FORMAT_ID);
    }

    #[test]
    fn test_display() {
        let xid = Xid::new(7, &[0xab, 0x01], &[0xff]).unwrap();
        assert_eq!(xid.to_string(), "7:ab01:ff");
        assert_eq!(Xid::null().to_string(), "null-xid");
        assert!(Xid::null().is_null());
    }
}
