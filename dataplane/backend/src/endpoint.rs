//! Enforcement via the host's virtualization endpoint-policy API.
//!
//! Instead of kernel sets, this variant materializes every set as a set
//! policy attached to each endpoint of the managed virtual network. The
//! policy is keyed by the set's hashed name, so the same stable handle works
//! across both backends. The network is discovered once by its well-known
//! name; the network id and the endpoint list are cached for the life of the
//! process.

use async_trait::async_trait;
use indexmap::IndexMap;
use netpol_dataplane_core::{BackendError, SetBackend, SetKind, SetSnapshot, MANAGED_SET_PREFIX};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// The managed virtual network, unless overridden via [`NETWORK_NAME_ENV`].
pub const DEFAULT_NETWORK_NAME: &str = "cluster";

pub const NETWORK_NAME_ENV: &str = "NETPOL_NETWORK_NAME";

/// Separator used when members are flattened into a policy value string.
const VALUE_SEPARATOR: &str = ",";

/// How the endpoint-policy API models a set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetPolicyKind {
    #[serde(rename = "IPSET")]
    IpSet,
    #[serde(rename = "NESTEDIPSET")]
    NestedIpSet,
}

/// One set, rendered as an endpoint policy entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetPolicySetting {
    /// The set's hashed name; the stable handle shared with the manager.
    pub id: String,
    pub name: String,
    #[serde(rename = "Type")]
    pub kind: SetPolicyKind,
    /// Members joined by the API's separator.
    pub values: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub policies: Vec<SetPolicySetting>,
}

/// The slice of the host's endpoint-policy API this backend drives.
#[async_trait]
pub trait EndpointApi {
    async fn network_by_name(&mut self, name: &str) -> Result<Option<Network>, BackendError>;

    async fn endpoints(&mut self, network_id: &str) -> Result<Vec<Endpoint>, BackendError>;

    /// Replaces the managed set policies on one endpoint. Policies not
    /// carrying the managed prefix are untouched by the host.
    async fn set_policies(
        &mut self,
        endpoint_id: &str,
        policies: &[SetPolicySetting],
    ) -> Result<(), BackendError>;
}

/// The endpoint-policy enforcement backend.
pub struct EndpointPolicyBackend<A> {
    api: A,
    network_name: String,
    network_id: Option<String>,
    endpoints: Vec<Endpoint>,

    /// The managed policies currently pushed to every endpoint, keyed by
    /// hashed name.
    policies: IndexMap<String, SetPolicySetting>,
}

// === impl SetPolicySetting ===

impl SetPolicySetting {
    fn from_snapshot(set: &SetSnapshot) -> Self {
        let kind = match set.kind() {
            SetKind::Hash => SetPolicyKind::IpSet,
            SetKind::List => SetPolicyKind::NestedIpSet,
        };
        Self {
            id: set.hashed_name.clone(),
            name: set.name.clone(),
            kind,
            values: set.contents.join(VALUE_SEPARATOR),
        }
    }
}

// === impl EndpointPolicyBackend ===

impl<A: EndpointApi + Send> EndpointPolicyBackend<A> {
    pub fn new(api: A) -> Self {
        let network_name =
            std::env::var(NETWORK_NAME_ENV).unwrap_or_else(|_| DEFAULT_NETWORK_NAME.to_string());
        Self::with_network(api, network_name)
    }

    pub fn with_network(api: A, network_name: impl Into<String>) -> Self {
        Self {
            api,
            network_name: network_name.into(),
            network_id: None,
            endpoints: Vec::new(),
            policies: IndexMap::new(),
        }
    }

    fn ensure_initialized(&self) -> Result<(), BackendError> {
        if self.network_id.is_none() {
            return Err(BackendError::unavailable(format!(
                "network {} has not been discovered yet",
                self.network_name
            )));
        }
        Ok(())
    }

    /// Pushes the full managed policy list to every cached endpoint.
    async fn push(&mut self) -> Result<(), BackendError> {
        self.ensure_initialized()?;
        let policies: Vec<SetPolicySetting> = self.policies.values().cloned().collect();
        for ep in &self.endpoints {
            debug!(endpoint = %ep.id, policies = policies.len(), "Updating endpoint set policies");
            self.api.set_policies(&ep.id, &policies).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<A: EndpointApi + Send> SetBackend for EndpointPolicyBackend<A> {
    async fn initialize(&mut self) -> Result<(), BackendError> {
        let network = self
            .api
            .network_by_name(&self.network_name)
            .await?
            .ok_or_else(|| {
                BackendError::unavailable(format!("network {} not found", self.network_name))
            })?;
        info!(network = %self.network_name, id = %network.id, "Discovered managed network");
        self.network_id = Some(network.id.clone());
        self.endpoints = self.api.endpoints(&network.id).await?;

        // Destructive resync: the manager's registry is empty at this point,
        // so every managed policy still on an endpoint is stale.
        for ep in &self.endpoints {
            let stale: Vec<&str> = ep
                .policies
                .iter()
                .filter(|p| p.id.starts_with(MANAGED_SET_PREFIX))
                .map(|p| p.id.as_str())
                .collect();
            if !stale.is_empty() {
                warn!(endpoint = %ep.id, ?stale, "Removing stale managed set policies");
                self.api.set_policies(&ep.id, &[]).await?;
            }
        }
        Ok(())
    }

    async fn ensure_set(&mut self, set: &SetSnapshot) -> Result<(), BackendError> {
        self.policies.insert(
            set.hashed_name.clone(),
            SetPolicySetting::from_snapshot(set),
        );
        self.push().await
    }

    async fn destroy_set(&mut self, hashed_name: &str) -> Result<(), BackendError> {
        if self.policies.shift_remove(hashed_name).is_none() {
            // Already gone; destroys are idempotent.
            return Ok(());
        }
        self.push().await
    }

    async fn reset(&mut self) -> Result<(), BackendError> {
        self.policies.clear();
        self.push().await
    }
}
