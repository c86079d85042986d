//! The policy manager: the name-indexed store of translated policies.
//!
//! This is the only component allowed to hold policy references on sets.
//! Adding a policy creates the sets its selector and peer references name and
//! bumps the matching reference counters on the set manager; removing it
//! drops them again. The translated ACL rules ride along and are installed
//! through an external effector.
//!
//! When the policy lock and the set-manager lock are both needed, the policy
//! lock is always taken first.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use ahash::AHashMap as HashMap;
use netpol_dataplane_core::{AclBackend, NetworkPolicy, PolicyError};
use netpol_dataplane_ipsets::{ReferenceKind, SetManager};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Name-indexed policy store. Operations for the same policy name serialize
/// on the internal lock.
pub struct PolicyManager<B, A> {
    state: Mutex<State<A>>,
    sets: Arc<SetManager<B>>,
}

struct State<A> {
    policies: HashMap<String, Arc<NetworkPolicy>>,
    acls: A,
}

// === impl PolicyManager ===

impl<B, A: AclBackend + Send> PolicyManager<B, A> {
    pub fn new(sets: Arc<SetManager<B>>, acls: A) -> Self {
        Self {
            state: Mutex::new(State {
                policies: HashMap::new(),
                acls,
            }),
            sets,
        }
    }

    /// Installs a policy that is not yet present: references its sets,
    /// creating them on first use, and installs its ACL rules.
    pub async fn add_policy(&self, policy: NetworkPolicy) -> Result<(), PolicyError> {
        let mut state = self.state.lock().await;
        if state.policies.contains_key(&policy.name) {
            return Err(PolicyError::AlreadyExists(policy.name));
        }

        self.reference(&policy).await?;
        state.acls.add_policy(&policy).await?;
        info!(policy = %policy.name, "Added policy");
        state.policies.insert(policy.name.clone(), Arc::new(policy));
        Ok(())
    }

    /// Replaces a present policy with its new translation: remove-then-add
    /// semantics. Reference counters are keyed by policy name, so sets shared
    /// between the two revisions come out unchanged.
    pub async fn update_policy(&self, policy: NetworkPolicy) -> Result<(), PolicyError> {
        let mut state = self.state.lock().await;
        let old = state
            .policies
            .get(&policy.name)
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(policy.name.clone()))?;

        self.dereference(&old).await?;
        self.reference(&policy).await?;
        state.acls.remove_policy(&policy.name).await?;
        state.acls.add_policy(&policy).await?;
        info!(policy = %policy.name, "Updated policy");
        state.policies.insert(policy.name.clone(), Arc::new(policy));
        Ok(())
    }

    /// Uninstalls a policy, dropping every reference it holds. The sets
    /// themselves stay in the registry until a controller deletes them.
    pub async fn remove_policy(&self, name: &str) -> Result<(), PolicyError> {
        let mut state = self.state.lock().await;
        let policy = state
            .policies
            .remove(name)
            .ok_or_else(|| PolicyError::NotFound(name.to_string()))?;

        self.dereference(&policy).await?;
        state.acls.remove_policy(name).await?;
        info!(policy = %name, "Removed policy");
        Ok(())
    }

    pub async fn get_policy(&self, name: &str) -> Option<Arc<NetworkPolicy>> {
        self.state.lock().await.policies.get(name).cloned()
    }

    async fn reference(&self, policy: &NetworkPolicy) -> Result<(), PolicyError> {
        for r in &policy.pod_selectors {
            self.sets.create_set(&r.name, r.set_type).await?;
            self.sets
                .add_reference(&r.name, &policy.name, ReferenceKind::Selector)
                .await?;
        }
        for r in &policy.peers {
            self.sets.create_set(&r.name, r.set_type).await?;
            self.sets
                .add_reference(&r.name, &policy.name, ReferenceKind::Policy)
                .await?;
        }
        debug!(policy = %policy.name, "Referenced policy sets");
        Ok(())
    }

    async fn dereference(&self, policy: &NetworkPolicy) -> Result<(), PolicyError> {
        for r in &policy.pod_selectors {
            self.sets
                .remove_reference(&r.name, &policy.name, ReferenceKind::Selector)
                .await?;
        }
        for r in &policy.peers {
            self.sets
                .remove_reference(&r.name, &policy.name, ReferenceKind::Policy)
                .await?;
        }
        debug!(policy = %policy.name, "Dereferenced policy sets");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use netpol_dataplane_core::{
        AclRule, BackendError, Direction, PortRange, SetBackend, SetError, SetMatch, SetRef,
        SetSnapshot, SetType, Verdict,
    };
    use netpol_dataplane_ipsets::SetMetrics;
    use std::sync::Mutex as StdMutex;

    struct NullBackend;

    #[async_trait]
    impl SetBackend for NullBackend {
        async fn initialize(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn ensure_set(&mut self, _: &SetSnapshot) -> Result<(), BackendError> {
            Ok(())
        }

        async fn destroy_set(&mut self, _: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn reset(&mut self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingAcls {
        events: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl AclBackend for RecordingAcls {
        async fn add_policy(&mut self, policy: &NetworkPolicy) -> Result<(), BackendError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("add {}", policy.name));
            Ok(())
        }

        async fn remove_policy(&mut self, name: &str) -> Result<(), BackendError> {
            self.events.lock().unwrap().push(format!("remove {}", name));
            Ok(())
        }
    }

    fn managers() -> (
        Arc<SetManager<NullBackend>>,
        PolicyManager<NullBackend, RecordingAcls>,
        RecordingAcls,
    ) {
        let sets = Arc::new(SetManager::new(NullBackend, SetMetrics::new()));
        let acls = RecordingAcls::default();
        let policies = PolicyManager::new(sets.clone(), acls.clone());
        (sets, policies, acls)
    }

    fn policy(name: &str, selector: &str, peer: &str) -> NetworkPolicy {
        NetworkPolicy {
            name: name.to_string(),
            pod_selectors: vec![SetRef::new(selector, SetType::KeyLabelOfPod)],
            peers: vec![SetRef::new(peer, SetType::Namespace)],
            acls: vec![AclRule {
                id: format!("{}-ingress", name),
                comment: String::new(),
                direction: Direction::Ingress,
                verdict: Verdict::Allow,
                protocol: "tcp".to_string(),
                sources: vec![SetMatch {
                    set: SetRef::new(peer, SetType::Namespace),
                    included: true,
                    match_direction: "src".to_string(),
                }],
                destinations: vec![],
                src_ports: vec![],
                dst_ports: vec![PortRange::single(8080)],
            }],
            pods: vec!["podA".to_string()],
        }
    }

    #[tokio::test]
    async fn add_creates_and_references_sets() {
        let (sets, policies, acls) = managers();

        policies.add_policy(policy("np1", "podsel", "ns-a")).await.unwrap();

        // Both sets exist and are held by the policy's references.
        assert_eq!(
            sets.delete_set("podsel").await,
            Err(SetError::InUse("podsel".to_string()))
        );
        assert_eq!(
            sets.delete_set("ns-a").await,
            Err(SetError::InUse("ns-a".to_string()))
        );
        assert_eq!(acls.events.lock().unwrap().clone(), vec!["add np1"]);
    }

    #[tokio::test]
    async fn add_twice_fails() {
        let (_sets, policies, _acls) = managers();

        policies.add_policy(policy("np1", "podsel", "ns-a")).await.unwrap();
        assert!(matches!(
            policies.add_policy(policy("np1", "podsel", "ns-a")).await,
            Err(PolicyError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn remove_releases_every_reference() {
        let (sets, policies, acls) = managers();

        policies.add_policy(policy("np1", "podsel", "ns-a")).await.unwrap();
        policies.remove_policy("np1").await.unwrap();

        sets.delete_set("podsel").await.unwrap();
        sets.delete_set("ns-a").await.unwrap();
        assert_eq!(
            acls.events.lock().unwrap().clone(),
            vec!["add np1", "remove np1"]
        );
        assert!(policies.get_policy("np1").await.is_none());
    }

    #[tokio::test]
    async fn remove_unknown_policy_fails() {
        let (_sets, policies, _acls) = managers();
        assert!(matches!(
            policies.remove_policy("np1").await,
            Err(PolicyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_moves_references_to_the_new_revision() {
        let (sets, policies, acls) = managers();

        policies.add_policy(policy("np1", "podsel", "ns-a")).await.unwrap();
        policies
            .update_policy(policy("np1", "podsel", "ns-b"))
            .await
            .unwrap();

        // The old peer is free; the shared selector and new peer are held.
        sets.delete_set("ns-a").await.unwrap();
        assert_eq!(
            sets.delete_set("podsel").await,
            Err(SetError::InUse("podsel".to_string()))
        );
        assert_eq!(
            sets.delete_set("ns-b").await,
            Err(SetError::InUse("ns-b".to_string()))
        );
        assert_eq!(
            acls.events.lock().unwrap().clone(),
            vec!["add np1", "remove np1", "add np1"]
        );

        let stored = policies.get_policy("np1").await.unwrap();
        assert_eq!(stored.peers[0].name, "ns-b");
    }

    #[tokio::test]
    async fn update_unknown_policy_fails() {
        let (_sets, policies, _acls) = managers();
        assert!(matches!(
            policies.update_policy(policy("np1", "podsel", "ns-a")).await,
            Err(PolicyError::NotFound(_))
        ));
    }
}
