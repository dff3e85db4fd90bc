//! Error types for the Vostok object store
//!
//! All caller-facing failures are expressed through the closed `VosError`
//! set. Internal layers may carry richer context but must fold into one of
//! these variants before crossing an API boundary, so callers can match on
//! a stable enumeration.
//!
//! ## Categories
//!
//! - **Precondition failures** (`NoKey`, `PrecondFail`, `Conflict`,
//!   `Inval*`): reported to the caller, no persistent effect.
//! - **Resource pressure** (`NoSpace`, `Busy`, `Timeout`): may succeed on
//!   retry, possibly after an aggregation pass reclaims space.
//! - **Durable errors** (`Incompat`, `Corrupt`): the pool degrades to
//!   read-only until operator recovery.
//! - **Cancellation** (`Canceled`): the owning distributed transaction
//!   aborted; re-issue is the caller's responsibility.

use thiserror::Error;

/// Result type alias for Vostok operations
pub type Result<T> = std::result::Result<T, VosError>;

/// The closed error set surfaced to callers.
#[derive(Debug, Error)]
pub enum VosError {
    /// Arena is out of space; retry after aggregation reclaims history
    #[error("out of space in pool arena")]
    NoSpace,

    /// Key (dkey, akey, or object) does not exist at the requested epoch
    #[error("no such key")]
    NoKey,

    /// Handle is stale or refers to a destroyed entity
    #[error("invalid handle")]
    NoHandle,

    /// A conditional operation's precondition did not hold
    #[error("precondition failed")]
    PrecondFail,

    /// Two same-epoch mutations targeted overlapping state
    #[error("conflicting update at the same epoch")]
    Conflict,

    /// Caller-provided sink is smaller than the stored value
    #[error("value truncated: need {needed} bytes, sink holds {provided}")]
    Trunc {
        /// Bytes required to hold the full value
        needed: usize,
        /// Bytes the caller provided
        provided: usize,
    },

    /// Malformed argument
    #[error("invalid argument: {0}")]
    InvalArg(String),

    /// Array write record size differs from the size fixed on first write
    #[error("record size mismatch: akey holds {expected}-byte records, got {got}")]
    InvalRecSize {
        /// Record size fixed by the first write
        expected: u32,
        /// Record size of the rejected write
        got: u32,
    },

    /// Value kind (single-value vs array) differs from the first write
    #[error("value kind mismatch for akey")]
    InvalKind,

    /// Object-id type field is outside the closed enumeration
    #[error("invalid object type {0}")]
    InvalType(u32),

    /// Operation issued in a state that does not permit it
    #[error("invalid state: {0}")]
    InvalState(String),

    /// Pool layout version is recognised but not supported
    #[error("incompatible pool layout version {found}")]
    Incompat {
        /// Layout version found in the superblock
        found: u32,
    },

    /// The owning distributed transaction aborted
    #[error("operation canceled")]
    Canceled,

    /// Resource is held by another handle (exclusive open, destroy-while-open)
    #[error("resource busy")]
    Busy,

    /// Persistent state failed an integrity check
    #[error("corruption detected: {0}")]
    Corrupt(String),

    /// A bounded wait expired (e.g. unresolved transaction state)
    #[error("operation timed out")]
    Timeout,
}

impl VosError {
    /// Check whether retrying (possibly after backoff or aggregation) can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VosError::NoSpace | VosError::Busy | VosError::Timeout
        )
    }

    /// Check whether this error degrades the pool to read-only.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VosError::Corrupt(_) | VosError::Incompat { .. })
    }

    /// Check whether this is a precondition failure with no persistent effect.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            VosError::NoKey
                | VosError::PrecondFail
                | VosError::Conflict
                | VosError::InvalArg(_)
                | VosError::InvalRecSize { .. }
                | VosError::InvalKind
                | VosError::InvalType(_)
                | VosError::InvalState(_)
        )
    }
}

// The closed set carries no dedicated I/O variant: a failed read or write on
// the pool file means the durable image can no longer be trusted, which is
// exactly the Corrupt contract (pool degrades to read-only).
impl From<std::io::Error> for VosError {
    fn from(e: std::io::Error) -> Self {
        VosError::Corrupt(format!("pool I/O failure: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(VosError::NoSpace.is_retryable());
        assert!(VosError::Busy.is_retryable());
        assert!(VosError::Timeout.is_retryable());
        assert!(!VosError::NoKey.is_retryable());
        assert!(!VosError::Corrupt("x".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(VosError::Corrupt("crc".into()).is_fatal());
        assert!(VosError::Incompat { found: 1 }.is_fatal());
        assert!(!VosError::Conflict.is_fatal());
        assert!(!VosError::NoSpace.is_fatal());
    }

    #[test]
    fn precondition_classification() {
        assert!(VosError::PrecondFail.is_precondition());
        assert!(VosError::Conflict.is_precondition());
        assert!(VosError::InvalKind.is_precondition());
        assert!(!VosError::NoSpace.is_precondition());
        assert!(!VosError::Canceled.is_precondition());
    }

    #[test]
    fn trunc_display_carries_sizes() {
        let e = VosError::Trunc {
            needed: 128,
            provided: 16,
        };
        let msg = e.to_string();
        assert!(msg.contains("128"));
        assert!(msg.contains("16"));
    }

    #[test]
    fn io_error_folds_to_corrupt() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "torn write");
        let e: VosError = io.into();
        assert!(matches!(e, VosError::Corrupt(_)));
        assert!(e.is_fatal());
    }
}
