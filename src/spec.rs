//! Cluster specification
//!
//! A [`ClusterSpec`] describes the desired cluster: name, node bounds,
//! machine type, region, tags, and Kubernetes version. It is validated at
//! construction and immutable afterwards, so invariant violations (such as
//! `min_nodes > max_nodes`) are configuration errors raised before any remote
//! call is issued.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Action the network-stack service takes when stack creation fails
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[non_exhaustive]
pub enum OnStackFailure {
    /// Delete the partially created stack (default)
    #[default]
    Delete,
    /// Leave the partially created stack in place for debugging
    DoNothing,
    /// Roll the stack back to its previous state
    Rollback,
}

impl OnStackFailure {
    /// The wire value expected by the network-stack service
    pub fn as_param(&self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::DoNothing => "DO_NOTHING",
            Self::Rollback => "ROLLBACK",
        }
    }
}

impl std::str::FromStr for OnStackFailure {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DELETE" => Ok(Self::Delete),
            "DO_NOTHING" => Ok(Self::DoNothing),
            "ROLLBACK" => Ok(Self::Rollback),
            _ => Err(Error::configuration(format!(
                "{s} is not a valid on-stack-failure option, choices are: DELETE | DO_NOTHING | ROLLBACK"
            ))),
        }
    }
}

impl std::fmt::Display for OnStackFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_param())
    }
}

/// Immutable descriptor of the desired cluster
///
/// Construct through [`ClusterSpec::builder`]; `build` validates the node
/// bounds and rejects malformed input with [`Error::Configuration`] before
/// anything is sent to a remote service.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ClusterSpec {
    name: String,
    node_count: u32,
    min_nodes: u32,
    max_nodes: u32,
    machine_type: String,
    region: String,
    tags: BTreeMap<String, String>,
    kubernetes_version: String,
    on_stack_failure: OnStackFailure,
    stack_timeout_minutes: u64,
    keypair_name: String,
    keypair_file: PathBuf,
    kube_config_file: PathBuf,
}

/// Builder for [`ClusterSpec`]
#[derive(Clone, Debug)]
pub struct ClusterSpecBuilder {
    name: String,
    node_count: u32,
    min_nodes: u32,
    max_nodes: u32,
    machine_type: String,
    region: String,
    tags: BTreeMap<String, String>,
    kubernetes_version: String,
    on_stack_failure: OnStackFailure,
    stack_timeout_minutes: u64,
    keypair_name: String,
    keypair_file: PathBuf,
    kube_config_file: PathBuf,
}

impl ClusterSpec {
    /// Start building a spec for the named cluster
    pub fn builder(name: impl Into<String>) -> ClusterSpecBuilder {
        ClusterSpecBuilder {
            name: name.into(),
            node_count: 2,
            min_nodes: 1,
            max_nodes: 3,
            machine_type: crate::DEFAULT_MACHINE_TYPE.to_string(),
            region: crate::DEFAULT_REGION.to_string(),
            tags: BTreeMap::new(),
            kubernetes_version: "1.29".to_string(),
            on_stack_failure: OnStackFailure::default(),
            stack_timeout_minutes: 15,
            keypair_name: "workers-pem".to_string(),
            keypair_file: PathBuf::from("aws-worker-secret.pem"),
            kube_config_file: PathBuf::from("kubeconfig-aws.yaml"),
        }
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Desired worker node count
    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Lower bound on worker node count
    pub fn min_nodes(&self) -> u32 {
        self.min_nodes
    }

    /// Upper bound on worker node count
    pub fn max_nodes(&self) -> u32 {
        self.max_nodes
    }

    /// Machine type for worker instances
    pub fn machine_type(&self) -> &str {
        &self.machine_type
    }

    /// Cloud region the cluster lives in
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Tags applied to remote resources
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Kubernetes version for the control plane
    pub fn kubernetes_version(&self) -> &str {
        &self.kubernetes_version
    }

    /// Action taken when network-stack creation fails
    pub fn on_stack_failure(&self) -> OnStackFailure {
        self.on_stack_failure
    }

    /// Bounded wait for network-stack creation, always at least one minute
    pub fn stack_timeout(&self) -> Duration {
        Duration::from_secs(self.stack_timeout_minutes * 60)
    }

    /// Stack creation timeout in whole minutes
    pub fn stack_timeout_minutes(&self) -> u64 {
        self.stack_timeout_minutes
    }

    /// Name of the SSH key pair for node remote access
    pub fn keypair_name(&self) -> &str {
        &self.keypair_name
    }

    /// Path the private key material is written to
    pub fn keypair_file(&self) -> &Path {
        &self.keypair_file
    }

    /// Path the local cluster-access file is written to
    pub fn kube_config_file(&self) -> &Path {
        &self.kube_config_file
    }

    /// Derived name of the cluster's network stack
    pub fn vpc_name(&self) -> String {
        format!("{}-vpc", self.name)
    }

    /// Derived name of the cluster's worker node group
    pub fn node_group_name(&self) -> String {
        format!("{}-worker-group", self.name)
    }

    /// Check a scaling target against the node bounds
    ///
    /// Enforced locally so an out-of-range request never reaches the remote
    /// node-group service.
    pub fn check_scale_target(&self, target: u32) -> Result<()> {
        if target < self.min_nodes || target > self.max_nodes {
            return Err(Error::configuration(format!(
                "scale target {} is outside node bounds [{}, {}] for cluster {}",
                target, self.min_nodes, self.max_nodes, self.name
            )));
        }
        Ok(())
    }
}

impl ClusterSpecBuilder {
    /// Set the desired worker node count
    pub fn node_count(mut self, count: u32) -> Self {
        self.node_count = count;
        self
    }

    /// Set the lower bound on worker node count
    pub fn min_nodes(mut self, min: u32) -> Self {
        self.min_nodes = min;
        self
    }

    /// Set the upper bound on worker node count
    pub fn max_nodes(mut self, max: u32) -> Self {
        self.max_nodes = max;
        self
    }

    /// Set the machine type for worker instances
    pub fn machine_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = machine_type.into();
        self
    }

    /// Set the cloud region
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Add a tag applied to every remote resource
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Replace the full tag mapping
    pub fn tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the Kubernetes version
    pub fn kubernetes_version(mut self, version: impl Into<String>) -> Self {
        self.kubernetes_version = version.into();
        self
    }

    /// Set the on-stack-failure policy
    pub fn on_stack_failure(mut self, policy: OnStackFailure) -> Self {
        self.on_stack_failure = policy;
        self
    }

    /// Set the stack creation timeout in minutes (clamped to at least 1)
    pub fn stack_timeout_minutes(mut self, minutes: u64) -> Self {
        self.stack_timeout_minutes = minutes.max(1);
        self
    }

    /// Set the SSH key pair name
    pub fn keypair_name(mut self, name: impl Into<String>) -> Self {
        self.keypair_name = name.into();
        self
    }

    /// Set the path the private key material is written to
    pub fn keypair_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.keypair_file = path.into();
        self
    }

    /// Set the path the local cluster-access file is written to
    pub fn kube_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.kube_config_file = path.into();
        self
    }

    /// Validate and produce the immutable spec
    pub fn build(self) -> Result<ClusterSpec> {
        if self.name.is_empty() {
            return Err(Error::configuration("cluster name must not be empty"));
        }
        if self.min_nodes > self.max_nodes {
            return Err(Error::configuration(format!(
                "min_nodes ({}) must not exceed max_nodes ({})",
                self.min_nodes, self.max_nodes
            )));
        }
        if self.node_count < self.min_nodes || self.node_count > self.max_nodes {
            return Err(Error::configuration(format!(
                "node_count ({}) must lie within [{}, {}]",
                self.node_count, self.min_nodes, self.max_nodes
            )));
        }
        if self.machine_type.is_empty() {
            return Err(Error::configuration("machine type must not be empty"));
        }
        if self.kubernetes_version.is_empty() {
            return Err(Error::configuration("kubernetes version must not be empty"));
        }
        if self.tags.keys().any(|k| k.is_empty()) {
            return Err(Error::configuration("tag keys must not be empty"));
        }

        Ok(ClusterSpec {
            name: self.name,
            node_count: self.node_count,
            min_nodes: self.min_nodes,
            max_nodes: self.max_nodes,
            machine_type: self.machine_type,
            region: self.region,
            tags: self.tags,
            kubernetes_version: self.kubernetes_version,
            on_stack_failure: self.on_stack_failure,
            stack_timeout_minutes: self.stack_timeout_minutes,
            keypair_name: self.keypair_name,
            keypair_file: self.keypair_file,
            kube_config_file: self.kube_config_file,
        })
    }
}
