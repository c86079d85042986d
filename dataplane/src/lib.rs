//! The network-policy dataplane.
//!
//! Orchestrator event handlers drive this facade: set operations only update
//! the in-memory registry and the dirty-set structure, and policy operations
//! only update the policy store and reference counters. Nothing reaches the
//! host until [`Dataplane::apply`] is called at the end of a controller
//! event, which flushes the accumulated dirty sets in one batch — one
//! backend round per event instead of one per set operation.
//!
//! The enforcement backend and the ACL effector are chosen at construction:
//! [`backend::CommandBackend`] drives the userland set tool, and
//! [`backend::EndpointPolicyBackend`] programs virtualization endpoint
//! policies.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use netpol_dataplane_backend as backend;
pub use netpol_dataplane_core::{
    hashed_name, AclBackend, AclRule, BackendError, Direction, NetworkPolicy, PolicyError,
    PortRange, SetBackend, SetError, SetMatch, SetRef, SetType, Verdict, MANAGED_SET_PREFIX,
};
pub use netpol_dataplane_ipsets::{ApplyError, ReferenceKind, SetManager, SetMetrics};
pub use netpol_dataplane_policies::PolicyManager;

use std::sync::Arc;
use tokio::time;

/// Owns the set manager and the policy manager, presenting the single
/// surface the orchestrator event handlers call into.
pub struct Dataplane<B, A> {
    ipsets: Arc<SetManager<B>>,
    policies: PolicyManager<B, A>,
}

// === impl Dataplane ===

impl<B: SetBackend + Send, A: AclBackend + Send> Dataplane<B, A> {
    pub fn new(backend: B, acls: A, metrics: SetMetrics) -> Self {
        let ipsets = Arc::new(SetManager::new(backend, metrics));
        let policies = PolicyManager::new(ipsets.clone(), acls);
        Self { ipsets, policies }
    }

    /// Prepares the host for enforcement: discovers backend state and
    /// destroys managed sets left over from a previous process. State is
    /// never persisted; the orchestrator replays a full resync afterwards.
    pub async fn initialize(&self) -> Result<(), BackendError> {
        self.ipsets.initialize().await
    }

    /// Removes everything this controller programmed, returning a clean
    /// slate.
    pub async fn reset(&self) -> Result<(), BackendError> {
        self.ipsets.reset().await
    }

    /// Registers a set in the local registry.
    pub async fn create_set(&self, name: &str, set_type: SetType) -> Result<(), SetError> {
        self.ipsets.create_set(name, set_type).await
    }

    /// Deletes a set once nothing references it and it holds no content.
    pub async fn delete_set(&self, name: &str) -> Result<(), SetError> {
        self.ipsets.delete_set(name).await
    }

    /// Like [`Dataplane::delete_set`], restricted to list sets.
    pub async fn delete_list(&self, name: &str) -> Result<(), SetError> {
        self.ipsets.delete_list(name).await
    }

    /// Records an IP (or IP,proto,port endpoint) as owned by `pod_key` in
    /// every named set, creating missing sets on the way.
    pub async fn add_to_sets(
        &self,
        sets: &[SetRef],
        ip: &str,
        pod_key: &str,
    ) -> Result<(), SetError> {
        self.ipsets.add_to_sets(sets, ip, pod_key).await
    }

    /// Removes an endpoint from every named set, iff `pod_key` still owns
    /// it.
    pub async fn remove_from_sets(
        &self,
        names: &[&str],
        ip: &str,
        pod_key: &str,
    ) -> Result<(), SetError> {
        self.ipsets.remove_from_sets(names, ip, pod_key).await
    }

    /// Appends member sets to a list set.
    pub async fn add_to_list(&self, list: &str, members: &[&str]) -> Result<(), SetError> {
        self.ipsets.add_to_list(list, members).await
    }

    /// Drops member sets from a list set.
    pub async fn remove_from_list(&self, list: &str, members: &[&str]) -> Result<(), SetError> {
        self.ipsets.remove_from_list(list, members).await
    }

    /// Flushes every dirty set to the enforcement backend. Call once at the
    /// end of each controller event; may block on the backend up to
    /// `deadline`. Do not hold other locks across this call.
    pub async fn apply(&self, deadline: time::Duration) -> Result<(), ApplyError> {
        self.ipsets.apply(deadline).await
    }

    /// Installs a translated policy and takes its set references.
    pub async fn add_policy(&self, policy: NetworkPolicy) -> Result<(), PolicyError> {
        self.policies.add_policy(policy).await
    }

    /// Replaces a policy's translation, migrating its set references.
    pub async fn update_policy(&self, policy: NetworkPolicy) -> Result<(), PolicyError> {
        self.policies.update_policy(policy).await
    }

    /// Uninstalls a policy and releases its set references.
    pub async fn remove_policy(&self, name: &str) -> Result<(), PolicyError> {
        self.policies.remove_policy(name).await
    }

    pub async fn get_policy(&self, name: &str) -> Option<Arc<NetworkPolicy>> {
        self.policies.get_policy(name).await
    }
}
