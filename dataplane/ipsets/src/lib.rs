//! The set manager: an in-memory authority over named address/port sets.
//!
//! Controllers mutate sets here as orchestrator events arrive; every mutation
//! only updates the registry and a dirty-set structure. Nothing reaches the
//! host until [`SetManager::apply`] flushes the accumulated dirty sets to the
//! enforcement backend in one batch, which lets an event that touches many
//! sets cost a single backend round.
//!
//! A set becomes dirty only while at least one policy references it; sets no
//! policy cares about are tracked in memory but never materialized. When a
//! list set is dirtied, its members are dirtied with it so the backend can
//! observe them in a consistent snapshot (list operations on the host require
//! the member sets to exist first).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;

pub use self::metrics::SetMetrics;
use ahash::AHashMap as HashMap;
use indexmap::IndexSet;
use netpol_dataplane_core::{
    hashed_name, BackendError, IpSet, SetBackend, SetError, SetKind, SetRef, SetSnapshot, SetType,
};
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, warn};

/// Which reference counter a policy holds on a set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    /// The policy selects pods through the set.
    Selector,

    /// The policy matches the set from a rule peer.
    Policy,
}

/// A flush that did not fully converge.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The backend could not be reached or the deadline elapsed. The dirty
    /// set is left intact; the next flush retries everything remaining.
    #[error(transparent)]
    Transient(BackendError),

    /// Per-set terminal failures. The affected sets were dropped from the
    /// dirty set so they cannot block later flushes.
    #[error("failed to flush sets: {0}")]
    Sets(SetFlushErrors),
}

/// The sets a flush could not materialize, each with its backend error.
#[derive(Debug)]
pub struct SetFlushErrors(Vec<(String, BackendError)>);

/// Concurrency-safe registry of sets.
///
/// A single lock protects the registry, the dirty set, and the backend;
/// every public operation holds it for its entire duration. All operations
/// are quick registry updates except [`SetManager::apply`], which blocks on
/// backend I/O and may run for seconds — callers must not hold other locks
/// across it.
pub struct SetManager<B> {
    state: Mutex<State<B>>,
    metrics: SetMetrics,
}

struct State<B> {
    sets: HashMap<String, IpSet>,

    /// hashed name → set name. Hashed names are assumed collision-free; a
    /// collision here is fatal.
    hashes: HashMap<String, String>,

    /// Names whose in-memory state has diverged from the host since the last
    /// successful flush, in first-dirtied order.
    dirty: IndexSet<String>,

    backend: B,
}

// === impl SetManager ===

impl<B> SetManager<B> {
    pub fn new(backend: B, metrics: SetMetrics) -> Self {
        Self {
            state: Mutex::new(State {
                sets: HashMap::new(),
                hashes: HashMap::new(),
                dirty: IndexSet::new(),
                backend,
            }),
            metrics,
        }
    }

    /// Registers `name` with the given type. A no-op if the set already
    /// exists with a matching type. Creation alone is invisible to the
    /// backend; only content makes a set flushable.
    pub async fn create_set(&self, name: &str, set_type: SetType) -> Result<(), SetError> {
        let mut state = self.state.lock().await;
        state.create(name, set_type)?;
        Ok(())
    }

    /// Removes a hash or list set that nothing references and that holds no
    /// content.
    pub async fn delete_set(&self, name: &str) -> Result<(), SetError> {
        let mut state = self.state.lock().await;
        state.delete(name, None)
    }

    /// Like [`SetManager::delete_set`], restricted to list sets.
    pub async fn delete_list(&self, name: &str) -> Result<(), SetError> {
        let mut state = self.state.lock().await;
        state.delete(name, Some(SetKind::List))
    }

    /// Records `ip` as owned by `pod_key` in every named set, creating sets
    /// that do not exist yet. A set that already exists is reused as-is —
    /// only its kind is checked, not its declared origin. Idempotent for an
    /// (ip, pod_key) pair; an IP already owned by another pod has its owner
    /// replaced, since pod events for the same IP may arrive reordered.
    pub async fn add_to_sets(
        &self,
        sets: &[SetRef],
        ip: &str,
        pod_key: &str,
    ) -> Result<(), SetError> {
        validate_member(ip)?;
        let mut state = self.state.lock().await;
        for r in sets {
            if !state.sets.contains_key(&r.name) {
                state.create(&r.name, r.set_type)?;
            }
            let changed = {
                let set = state.hash_set_mut(&r.name)?;
                if let Some(owner) = set.endpoint_owner(ip) {
                    if owner != pod_key {
                        debug!(
                            %ip,
                            set = %r.name,
                            old = %owner,
                            new = %pod_key,
                            "Pod owner changed; replacing"
                        );
                    }
                }
                set.add_endpoint(ip, pod_key)
            };
            if changed {
                state.mark_dirty(&r.name);
            }
        }
        Ok(())
    }

    /// Removes `ip` from every named set, iff `pod_key` still owns it. A
    /// mismatched owner means the delete is stale and is ignored.
    pub async fn remove_from_sets(
        &self,
        names: &[&str],
        ip: &str,
        pod_key: &str,
    ) -> Result<(), SetError> {
        validate_member(ip)?;
        let mut state = self.state.lock().await;
        for &name in names {
            let removed = {
                let set = state.hash_set_mut(name)?;
                match set.endpoint_owner(ip) {
                    Some(owner) if owner != pod_key => {
                        debug!(
                            %ip,
                            set = %name,
                            owner = %owner,
                            stale = %pod_key,
                            "Ignoring stale delete"
                        );
                        false
                    }
                    _ => set.remove_endpoint(ip, pod_key),
                }
            };
            if removed {
                state.mark_dirty(name);
                state.reclaim_if_unused(name);
            }
        }
        Ok(())
    }

    /// Appends each named member set to the list, creating nothing: both the
    /// list and every member must already exist. Self-loops and nested lists
    /// are rejected.
    pub async fn add_to_list(&self, list: &str, members: &[&str]) -> Result<(), SetError> {
        let mut state = self.state.lock().await;
        for &member in members {
            if list == member {
                return Err(SetError::SelfLoop(list.to_string()));
            }

            let member_hashed = {
                let set = state.get(member)?;
                if set.kind() != SetKind::Hash {
                    return Err(SetError::KindMismatch {
                        name: member.to_string(),
                        expected: SetKind::Hash,
                    });
                }
                set.hashed_name().to_string()
            };

            let added = {
                let l = state.list_set_mut(list)?;
                l.add_member(member, &member_hashed)
            };
            if added {
                if let Ok(set) = state.get_mut(member) {
                    set.inc_list_refs();
                }
                state.mark_dirty(list);
            }
        }
        Ok(())
    }

    /// Drops each named member from the list. Members not in the list are
    /// skipped.
    pub async fn remove_from_list(&self, list: &str, members: &[&str]) -> Result<(), SetError> {
        let mut state = self.state.lock().await;
        for &member in members {
            {
                let set = state.get(member)?;
                if set.kind() != SetKind::Hash {
                    return Err(SetError::KindMismatch {
                        name: member.to_string(),
                        expected: SetKind::Hash,
                    });
                }
            }

            let removed = {
                let l = state.list_set_mut(list)?;
                l.remove_member(member)
            };
            if removed {
                // Dirty the list while it still reflects the removal, then
                // release the member's list reference.
                state.mark_dirty(list);
                if let Ok(set) = state.get_mut(member) {
                    set.dec_list_refs();
                }
            }
        }
        Ok(())
    }

    /// Bumps the named reference counter. The policy manager is the only
    /// legitimate caller.
    pub async fn add_reference(
        &self,
        name: &str,
        policy: &str,
        kind: ReferenceKind,
    ) -> Result<(), SetError> {
        let mut state = self.state.lock().await;
        let set = state.get_mut(name)?;
        match kind {
            ReferenceKind::Selector => set.add_selector_reference(policy),
            ReferenceKind::Policy => set.add_policy_reference(policy),
        }
        Ok(())
    }

    /// Drops the named reference counter. Dropping a reference never dirties
    /// the set; it only makes it eligible for deletion.
    pub async fn remove_reference(
        &self,
        name: &str,
        policy: &str,
        kind: ReferenceKind,
    ) -> Result<(), SetError> {
        let mut state = self.state.lock().await;
        let set = state.get_mut(name)?;
        match kind {
            ReferenceKind::Selector => set.remove_selector_reference(policy),
            ReferenceKind::Policy => set.remove_policy_reference(policy),
        }
        Ok(())
    }
}

impl<B: SetBackend + Send> SetManager<B> {
    /// Runs the backend's destructive resync. Called once at startup, before
    /// any controller populates the registry.
    pub async fn initialize(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.backend.initialize().await
    }

    /// Removes all managed state from the host and forgets everything
    /// in-memory.
    pub async fn reset(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.backend.reset().await?;
        state.sets.clear();
        state.hashes.clear();
        state.dirty.clear();
        Ok(())
    }

    /// Flushes the dirty closure to the backend in one batch.
    ///
    /// Hash sets are emitted before list sets so members exist on the host by
    /// the time a list references them; destroys run last for the inverse
    /// reason. Each dirty set is reconciled to its full current membership
    /// rather than replayed as deltas — the event stream is not totally
    /// ordered with respect to actual host state (the process may have
    /// restarted), and backend operations are cheap relative to an event
    /// batch.
    ///
    /// On a transient failure or an elapsed deadline, everything not yet
    /// flushed stays dirty and the next call retries. A terminal failure is
    /// logged, drops the affected set from the dirty set, and is reported in
    /// the aggregated [`ApplyError::Sets`].
    pub async fn apply(&self, deadline: time::Duration) -> Result<(), ApplyError> {
        let mut state = self.state.lock().await;
        debug_assert!(state.lists_are_bipartite());

        let State {
            sets,
            dirty,
            backend,
            ..
        } = &mut *state;

        if dirty.is_empty() {
            return Ok(());
        }

        let mut ensures: Vec<SetSnapshot> = Vec::new();
        let mut list_ensures: Vec<SetSnapshot> = Vec::new();
        let mut destroys: Vec<(String, String)> = Vec::new();
        for name in dirty.iter() {
            match sets.get(name) {
                // The set was deleted after it was last flushed; all that is
                // left is to remove it from the host.
                None => destroys.push((name.clone(), hashed_name(name))),
                Some(set) if set.is_empty() && set.list_refs() == 0 => {
                    destroys.push((name.clone(), set.hashed_name().to_string()))
                }
                Some(set) => match set.kind() {
                    SetKind::Hash => ensures.push(set.snapshot()),
                    SetKind::List => list_ensures.push(set.snapshot()),
                },
            }
        }
        ensures.extend(list_ensures);

        let started = time::Instant::now();
        let mut flushed: Vec<String> = Vec::new();
        let mut failed: Vec<(String, BackendError)> = Vec::new();
        let metrics = &self.metrics;
        let res = time::timeout(deadline, async {
            for snap in &ensures {
                metrics.incr_flush_op();
                match backend.ensure_set(snap).await {
                    Ok(()) => flushed.push(snap.name.clone()),
                    Err(e) if e.is_transient() => return Err(e),
                    Err(error) => {
                        warn!(set = %snap.name, %error, "Failed to materialize set");
                        flushed.push(snap.name.clone());
                        failed.push((snap.name.clone(), error));
                    }
                }
            }
            for (name, hashed) in &destroys {
                metrics.incr_flush_op();
                match backend.destroy_set(hashed).await {
                    Ok(()) => flushed.push(name.clone()),
                    Err(e) if e.is_transient() => return Err(e),
                    Err(error) => {
                        warn!(set = %name, %error, "Failed to destroy set");
                        flushed.push(name.clone());
                        failed.push((name.clone(), error));
                    }
                }
            }
            Ok(())
        })
        .await
        .unwrap_or(Err(BackendError::Timeout(deadline)));

        for name in &flushed {
            dirty.shift_remove(name.as_str());
        }

        if let Err(e) = res {
            return Err(ApplyError::Transient(e));
        }

        // The host has converged for everything flushed; only now are the
        // membership gauges brought up to date.
        self.metrics.record_flush(started.elapsed(), sets, &flushed);

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ApplyError::Sets(SetFlushErrors(failed)))
        }
    }
}

// === impl State ===

impl<B> State<B> {
    fn create(&mut self, name: &str, set_type: SetType) -> Result<(), SetError> {
        if let Some(existing) = self.sets.get(name) {
            if existing.set_type() != set_type {
                return Err(SetError::TypeConflict {
                    name: name.to_string(),
                    existing: existing.set_type(),
                    requested: set_type,
                });
            }
            return Ok(());
        }

        let set = IpSet::new(name, set_type);
        if let Some(other) = self.hashes.get(set.hashed_name()) {
            if other != name {
                panic!(
                    "hashed set name collision: {} and {} both map to {}",
                    other,
                    name,
                    set.hashed_name()
                );
            }
        }
        self.hashes
            .insert(set.hashed_name().to_string(), name.to_string());
        debug!(%name, %set_type, "Created set");
        self.sets.insert(name.to_string(), set);
        Ok(())
    }

    fn delete(&mut self, name: &str, kind: Option<SetKind>) -> Result<(), SetError> {
        let set = self
            .sets
            .get(name)
            .ok_or_else(|| SetError::NotFound(name.to_string()))?;
        if let Some(kind) = kind {
            if set.kind() != kind {
                return Err(SetError::KindMismatch {
                    name: name.to_string(),
                    expected: kind,
                });
            }
        }
        if !set.can_delete() {
            return Err(SetError::InUse(name.to_string()));
        }
        self.hashes.remove(set.hashed_name());
        self.sets.remove(name);
        debug!(%name, "Deleted set");
        Ok(())
    }

    fn get(&self, name: &str) -> Result<&IpSet, SetError> {
        self.sets
            .get(name)
            .ok_or_else(|| SetError::NotFound(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut IpSet, SetError> {
        self.sets
            .get_mut(name)
            .ok_or_else(|| SetError::NotFound(name.to_string()))
    }

    fn hash_set_mut(&mut self, name: &str) -> Result<&mut IpSet, SetError> {
        let set = self.get_mut(name)?;
        if set.kind() != SetKind::Hash {
            return Err(SetError::KindMismatch {
                name: name.to_string(),
                expected: SetKind::Hash,
            });
        }
        Ok(set)
    }

    fn list_set_mut(&mut self, name: &str) -> Result<&mut IpSet, SetError> {
        let set = self.get_mut(name)?;
        if set.kind() != SetKind::List {
            return Err(SetError::KindMismatch {
                name: name.to_string(),
                expected: SetKind::List,
            });
        }
        Ok(set)
    }

    /// Marks a set dirty, iff some policy references it. A dirtied list also
    /// dirties its current members, referenced or not: the host requires the
    /// members to be materialized before the list can name them.
    fn mark_dirty(&mut self, name: &str) {
        let set = match self.sets.get(name) {
            Some(set) => set,
            None => return,
        };
        if !set.is_referenced() {
            return;
        }
        self.dirty.insert(name.to_string());
        if set.kind() == SetKind::List {
            for member in set.member_names() {
                self.dirty.insert(member);
            }
        }
    }

    /// Drops a hash set whose last endpoint was just removed, once nothing
    /// references it. Any earlier dirty entry is kept so the flush can
    /// destroy the host-side set.
    fn reclaim_if_unused(&mut self, name: &str) {
        let can_delete = match self.sets.get(name) {
            Some(set) => set.can_delete(),
            None => false,
        };
        if can_delete {
            if let Err(error) = self.delete(name, None) {
                warn!(%name, %error, "Failed to reclaim empty set");
            }
        }
    }

    /// List sets may only contain hash sets; violations indicate a bug.
    fn lists_are_bipartite(&self) -> bool {
        self.sets
            .values()
            .filter(|s| s.kind() == SetKind::List)
            .flat_map(|s| s.member_names())
            .all(|m| {
                self.sets
                    .get(&m)
                    .map(|s| s.kind() == SetKind::Hash)
                    .unwrap_or(false)
            })
    }
}

// === impl SetFlushErrors ===

impl std::fmt::Display for SetFlushErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, error) in &self.0 {
            if !first {
                write!(f, "; and ")?;
            }
            write!(f, "{}: {}", name, error)?;
            first = false;
        }
        Ok(())
    }
}

impl SetFlushErrors {
    /// The names of the sets that failed, in flush order.
    pub fn sets(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Accepts plain IPv4, IPv4 CIDR, and `ip,proto,port` members. Anything else
/// — IPv6 in particular — is rejected before it can reach the registry.
fn validate_member(member: &str) -> Result<(), SetError> {
    let err = || SetError::NotIpv4(member.to_string());

    let ip = member.split(',').next().unwrap_or_default();
    if ip.is_empty() {
        // Covers both the empty string and an empty IP alongside a port
        // specification.
        return Err(err());
    }

    match ip.split_once('/') {
        None => ip.parse::<Ipv4Addr>().map(|_| ()).map_err(|_| err()),
        Some(_) => ip.parse::<ipnet::Ipv4Net>().map(|_| ()).map_err(|_| err()),
    }
}
