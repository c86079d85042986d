//! The seams between the managers and the host.
//!
//! The set manager never sees backend-specific vocabulary: every variant is
//! driven through [`SetBackend`], and the policy manager installs ACL rules
//! through [`AclBackend`]. Concrete implementations live in the backend
//! crate; tests use recording fakes.

use crate::errors::BackendError;
use crate::policy::NetworkPolicy;
use crate::set::{SetKind, SetType};
use async_trait::async_trait;

/// Everything a backend needs to materialize one set: the human-readable
/// name, the on-host handle, the type (which fixes the on-host set shape),
/// and the full membership to reconcile to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetSnapshot {
    pub name: String,
    pub hashed_name: String,
    pub set_type: SetType,
    pub contents: Vec<String>,
}

impl SetSnapshot {
    pub fn kind(&self) -> SetKind {
        self.set_type.kind()
    }
}

/// A host-side effector for named sets, invoked only during a flush.
#[async_trait]
pub trait SetBackend {
    /// Discovers backend state and destructively resyncs: any set on the
    /// host carrying the managed prefix but unknown to the manager is
    /// destroyed. Called once before the first flush, when the registry is
    /// still empty.
    async fn initialize(&mut self) -> Result<(), BackendError>;

    /// Creates the set if absent, then reconciles host membership to
    /// `set.contents`. Idempotent.
    async fn ensure_set(&mut self, set: &SetSnapshot) -> Result<(), BackendError>;

    /// Destroys the set. Must succeed if the set does not exist.
    async fn destroy_set(&mut self, hashed_name: &str) -> Result<(), BackendError>;

    /// Removes every managed set from the host, returning a clean slate.
    async fn reset(&mut self) -> Result<(), BackendError>;
}

/// Installs and removes the packet-filter rules translated from a policy.
///
/// Rule programming is owned by an external effector; the policy manager only
/// drives this interface, once per policy lifecycle transition.
#[async_trait]
pub trait AclBackend {
    async fn add_policy(&mut self, policy: &NetworkPolicy) -> Result<(), BackendError>;

    async fn remove_policy(&mut self, name: &str) -> Result<(), BackendError>;
}
