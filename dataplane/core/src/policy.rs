//! Translated network policies.
//!
//! Policy translation happens upstream; by the time a policy reaches the
//! managers it is already a graph of set references plus the ACL rules to
//! install. The policy manager is the only component that turns these
//! references into set reference counts.

use crate::set::SetType;

/// Names a set together with its origin, so that referencing a policy can
/// create the set on first use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetRef {
    pub name: String,
    pub set_type: SetType,
}

impl SetRef {
    pub fn new(name: impl Into<String>, set_type: SetType) -> Self {
        Self {
            name: name.into(),
            set_type,
        }
    }
}

/// A fully translated policy, keyed by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkPolicy {
    pub name: String,

    /// Sets this policy selects pods through.
    pub pod_selectors: Vec<SetRef>,

    /// Sets referenced from rule peers (sources and destinations).
    pub peers: Vec<SetRef>,

    pub acls: Vec<AclRule>,

    /// Pod keys currently matched by the policy's selectors.
    pub pods: Vec<String>,
}

/// One translated filter rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclRule {
    pub id: String,
    pub comment: String,
    pub direction: Direction,
    pub verdict: Verdict,
    /// Transport protocol, empty for any.
    pub protocol: String,
    pub sources: Vec<SetMatch>,
    pub destinations: Vec<SetMatch>,
    pub src_ports: Vec<PortRange>,
    pub dst_ports: Vec<PortRange>,
}

/// A rule peer: a set reference tagged with whether matching members are
/// included or excluded, and the match-direction keyword understood by the
/// rule effector (e.g. "src" or "dst,dst").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetMatch {
    pub set: SetRef,
    pub included: bool,
    pub match_direction: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub port: u16,
    pub end_port: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            port,
            end_port: port,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
    Both,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Drop,
}
