//! Value types for named address/port sets.
//!
//! A [`IpSet`] is either a *hash* set (IP or IP,proto,port endpoints, each
//! owned by a pod key) or a *list* set (members are other hash sets). The set
//! additionally carries the reference counters that describe why it must
//! continue to exist: policies selecting over it, policies matching it as a
//! rule peer, and lists including it.

use ahash::AHashSet as HashSet;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};

/// Marks a set as managed by this controller. Sets on the host whose name
/// carries this prefix but that are unknown to the manager are destroyed
/// during the initial resync.
pub const MANAGED_SET_PREFIX: &str = "netpol-";

/// Hex characters of the name digest kept in a hashed name.
///
/// Kernel set names are limited to 31 characters; the prefix plus this suffix
/// must stay under that limit.
const HASHED_SUFFIX_LEN: usize = 20;

/// Derives the fixed-length on-host name for a set.
///
/// The derivation is a pure function of `name`, so two sets with equal names
/// always share a hashed name and the value may be recomputed for sets that
/// have already been dropped from the registry.
pub fn hashed_name(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}{}", MANAGED_SET_PREFIX, &digest[..HASHED_SUFFIX_LEN])
}

/// The origin of a set, as assigned by policy translation.
///
/// The origin fully determines whether a set holds endpoints or other sets;
/// see [`SetType::kind`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetType {
    Namespace,
    KeyLabelOfNamespace,
    KeyValueLabelOfNamespace,
    KeyLabelOfPod,
    KeyValueLabelOfPod,
    NamedPorts,
    NestedLabelOfPod,
    CidrBlocks,
}

/// How a set's members are shaped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetKind {
    /// Members are IP or IP,proto,port endpoints.
    Hash,
    /// Members are other hash sets.
    List,
}

/// A named set and the reference counters describing its owners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpSet {
    name: String,
    hashed_name: String,
    set_type: SetType,
    members: Members,

    /// Policies that select pods via this set.
    selector_refs: HashSet<String>,

    /// Policies that match this set from rule peers.
    policy_refs: HashSet<String>,

    /// Number of list sets that currently include this set.
    list_refs: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Members {
    /// endpoint → owning pod key; an empty pod key means unowned.
    Endpoints(IndexMap<String, String>),

    /// member set name → member hashed name.
    Sets(IndexMap<String, String>),
}

// === impl SetType ===

impl SetType {
    pub fn kind(self) -> SetKind {
        match self {
            Self::Namespace
            | Self::KeyLabelOfPod
            | Self::KeyValueLabelOfPod
            | Self::NamedPorts
            | Self::CidrBlocks => SetKind::Hash,
            Self::KeyLabelOfNamespace | Self::KeyValueLabelOfNamespace | Self::NestedLabelOfPod => {
                SetKind::List
            }
        }
    }
}

impl std::fmt::Display for SetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Namespace => "namespace",
            Self::KeyLabelOfNamespace => "key-label-of-namespace",
            Self::KeyValueLabelOfNamespace => "key-value-label-of-namespace",
            Self::KeyLabelOfPod => "key-label-of-pod",
            Self::KeyValueLabelOfPod => "key-value-label-of-pod",
            Self::NamedPorts => "named-ports",
            Self::NestedLabelOfPod => "nested-label-of-pod",
            Self::CidrBlocks => "cidr-blocks",
        };
        s.fmt(f)
    }
}

// === impl SetKind ===

impl std::fmt::Display for SetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hash => "hash".fmt(f),
            Self::List => "list".fmt(f),
        }
    }
}

// === impl IpSet ===

impl IpSet {
    pub fn new(name: impl Into<String>, set_type: SetType) -> Self {
        let name = name.into();
        let hashed_name = hashed_name(&name);
        let members = match set_type.kind() {
            SetKind::Hash => Members::Endpoints(IndexMap::new()),
            SetKind::List => Members::Sets(IndexMap::new()),
        };
        Self {
            name,
            hashed_name,
            set_type,
            members,
            selector_refs: HashSet::new(),
            policy_refs: HashSet::new(),
            list_refs: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hashed_name(&self) -> &str {
        &self.hashed_name
    }

    pub fn set_type(&self) -> SetType {
        self.set_type
    }

    pub fn kind(&self) -> SetKind {
        self.set_type.kind()
    }

    /// Records `endpoint` as owned by `pod_key`, returning whether membership
    /// changed.
    ///
    /// An endpoint already present under a different pod key has its owner
    /// replaced without a membership change; pod add/delete events for the
    /// same IP are not totally ordered, so the most recent owner wins.
    pub fn add_endpoint(&mut self, endpoint: &str, pod_key: &str) -> bool {
        match &mut self.members {
            Members::Endpoints(eps) => match eps.get_mut(endpoint) {
                Some(owner) => {
                    if owner != pod_key {
                        *owner = pod_key.to_string();
                    }
                    false
                }
                None => {
                    eps.insert(endpoint.to_string(), pod_key.to_string());
                    true
                }
            },
            Members::Sets(_) => false,
        }
    }

    /// Removes `endpoint` iff `pod_key` still owns it, returning whether
    /// membership changed.
    ///
    /// A mismatched owner means the delete is stale: the endpoint was
    /// re-added for a newer pod before the delete arrived, and the entry is
    /// kept.
    pub fn remove_endpoint(&mut self, endpoint: &str, pod_key: &str) -> bool {
        match &mut self.members {
            Members::Endpoints(eps) => match eps.get(endpoint) {
                Some(owner) if owner == pod_key => {
                    eps.shift_remove(endpoint);
                    true
                }
                _ => false,
            },
            Members::Sets(_) => false,
        }
    }

    pub fn endpoint_owner(&self, endpoint: &str) -> Option<&str> {
        match &self.members {
            Members::Endpoints(eps) => eps.get(endpoint).map(String::as_str),
            Members::Sets(_) => None,
        }
    }

    /// Adds a member set by name, returning whether membership changed.
    pub fn add_member(&mut self, name: &str, member_hashed_name: &str) -> bool {
        match &mut self.members {
            Members::Sets(sets) => sets
                .insert(name.to_string(), member_hashed_name.to_string())
                .is_none(),
            Members::Endpoints(_) => false,
        }
    }

    /// Removes a member set by name, returning whether membership changed.
    pub fn remove_member(&mut self, name: &str) -> bool {
        match &mut self.members {
            Members::Sets(sets) => sets.shift_remove(name).is_some(),
            Members::Endpoints(_) => false,
        }
    }

    pub fn has_member(&self, name: &str) -> bool {
        match &self.members {
            Members::Sets(sets) => sets.contains_key(name),
            Members::Endpoints(_) => false,
        }
    }

    /// Member set names, in insertion order. Empty for hash sets.
    pub fn member_names(&self) -> Vec<String> {
        match &self.members {
            Members::Sets(sets) => sets.keys().cloned().collect(),
            Members::Endpoints(_) => Vec::new(),
        }
    }

    pub fn add_selector_reference(&mut self, policy: &str) {
        self.selector_refs.insert(policy.to_string());
    }

    pub fn remove_selector_reference(&mut self, policy: &str) {
        self.selector_refs.remove(policy);
    }

    pub fn add_policy_reference(&mut self, policy: &str) {
        self.policy_refs.insert(policy.to_string());
    }

    pub fn remove_policy_reference(&mut self, policy: &str) {
        self.policy_refs.remove(policy);
    }

    pub fn inc_list_refs(&mut self) {
        self.list_refs += 1;
    }

    /// Panics on underflow: a negative count means the list membership
    /// protocol was violated and the registry can no longer be trusted.
    pub fn dec_list_refs(&mut self) {
        if self.list_refs == 0 {
            panic!("list reference underflow on set {}", self.name);
        }
        self.list_refs -= 1;
    }

    pub fn list_refs(&self) -> usize {
        self.list_refs
    }

    /// Whether any policy references this set, as a selector or a rule peer.
    ///
    /// Only referenced sets are worth materializing on the host; mutations of
    /// unreferenced sets stay invisible to the enforcement backend.
    pub fn is_referenced(&self) -> bool {
        !self.selector_refs.is_empty() || !self.policy_refs.is_empty()
    }

    /// A set may be deleted only once nothing refers to it and it is empty.
    pub fn can_delete(&self) -> bool {
        self.selector_refs.is_empty()
            && self.policy_refs.is_empty()
            && self.list_refs == 0
            && self.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of endpoints (hash) or members (list).
    pub fn len(&self) -> usize {
        match &self.members {
            Members::Endpoints(eps) => eps.len(),
            Members::Sets(sets) => sets.len(),
        }
    }

    /// The membership the host must observe, in insertion order: endpoints
    /// for hash sets, member hashed names for list sets.
    pub fn contents(&self) -> Vec<String> {
        match &self.members {
            Members::Endpoints(eps) => eps.keys().cloned().collect(),
            Members::Sets(sets) => sets.values().cloned().collect(),
        }
    }

    /// Captures everything the enforcement backend needs to materialize this
    /// set.
    pub fn snapshot(&self) -> crate::backend::SetSnapshot {
        crate::backend::SetSnapshot {
            name: self.name.clone(),
            hashed_name: self.hashed_name.clone(),
            set_type: self.set_type,
            contents: self.contents(),
        }
    }
}
