//! Categorized errors surfaced by the managers and the enforcement backends.
//!
//! Validation and state errors are returned to the orchestrator event handler
//! as-is. Transient backend errors leave the dirty set untouched so a later
//! flush retries; terminal backend errors are reported per set. Broken
//! invariants (hashed-name collisions, reference underflow) panic instead of
//! returning — they indicate a bug, and the orchestrator restarts the
//! process.

use crate::set::{SetKind, SetType};
use std::time::Duration;
use thiserror::Error;

/// Rejected or impossible set-manager operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SetError {
    /// The member string does not parse as an IPv4 endpoint. IPv6 membership
    /// is unsupported and rejected here at the boundary.
    #[error("'{0}' is not an IPv4 member")]
    NotIpv4(String),

    #[error("list {0} cannot be a member of itself")]
    SelfLoop(String),

    #[error("set {name} is not a {expected} set")]
    KindMismatch { name: String, expected: SetKind },

    #[error("set {name} already exists as {existing}, requested {requested}")]
    TypeConflict {
        name: String,
        existing: SetType,
        requested: SetType,
    },

    #[error("set {0} does not exist")]
    NotFound(String),

    #[error("set {0} is still in use")]
    InUse(String),
}

/// Failures reported by an enforcement backend.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached at all. Retryable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The flush deadline elapsed. Retryable.
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("set {0} cannot be destroyed: in use by a kernel component")]
    SetInUseByKernel(String),

    #[error("set {0} does not exist on the host")]
    DoesNotExist(String),

    #[error("set {0} already exists on the host with a different type")]
    AlreadyExists(String),

    #[error("set {0} does not support the element separator")]
    ElemSeparatorUnsupported(String),

    #[error("set {0} requires a second element")]
    SecondElementMissing(String),

    #[error("set {0}: missing second mandatory argument")]
    MissingSecondMandatoryArgument(String),

    #[error("set {0}: element to be added, deleted, or tested does not exist")]
    ElementDoesNotExist(String),

    /// An exit status the classifier does not recognize.
    #[error("set command failed with exit code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
}

// === impl BackendError ===

impl BackendError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }

    /// Transient failures leave the dirty set intact; everything else is
    /// terminal for the affected set.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Rejected policy-manager operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy {0} already exists")]
    AlreadyExists(String),

    #[error("policy {0} does not exist")]
    NotFound(String),

    #[error(transparent)]
    Sets(#[from] SetError),

    #[error("installing ACL rules: {0}")]
    Acls(#[from] BackendError),
}
