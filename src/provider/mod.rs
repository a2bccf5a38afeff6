//! Remote cloud service abstraction layer
//!
//! Every remote capability the orchestrator consumes is a trait here:
//! network-stack, identity-role, managed-cluster, node-group, and key-pair
//! services. Traits keep the managers testable with mocks and keep the
//! orchestration logic independent of how the calls reach the cloud.
//!
//! Each trait carries a `refresh_session` hook so the transient-error policy
//! (one refresh, one retry) can be applied uniformly by [`crate::retry`].
//!
//! The production implementations live in [`aws`], driving the cloud CLI
//! with JSON output.

mod aws;

pub use aws::AwsCli;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::spec::OnStackFailure;
use crate::Result;

// =============================================================================
// Network stack service
// =============================================================================

/// Status of a network stack as reported by the remote service
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StackStatus {
    /// Creation submitted and in progress
    CreateInProgress,
    /// Stack fully created, outputs available
    CreateComplete,
    /// Creation failed terminally
    CreateFailed,
    /// Failure policy is rolling the stack back
    RollbackInProgress,
    /// Rollback finished; the stack is unusable
    RollbackComplete,
    /// Deletion in progress
    DeleteInProgress,
    /// Stack fully deleted
    DeleteComplete,
    /// Deletion failed
    DeleteFailed,
    /// A status this client does not model
    Unknown,
}

impl StackStatus {
    /// True once creation has terminally failed
    pub fn create_failed(&self) -> bool {
        matches!(
            self,
            Self::CreateFailed | Self::RollbackInProgress | Self::RollbackComplete
        )
    }
}

impl From<&str> for StackStatus {
    fn from(s: &str) -> Self {
        match s {
            "CREATE_IN_PROGRESS" => Self::CreateInProgress,
            "CREATE_COMPLETE" => Self::CreateComplete,
            "CREATE_FAILED" => Self::CreateFailed,
            "ROLLBACK_IN_PROGRESS" => Self::RollbackInProgress,
            "ROLLBACK_COMPLETE" => Self::RollbackComplete,
            "DELETE_IN_PROGRESS" => Self::DeleteInProgress,
            "DELETE_COMPLETE" => Self::DeleteComplete,
            "DELETE_FAILED" => Self::DeleteFailed,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::CreateFailed => "CREATE_FAILED",
            Self::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            Self::RollbackComplete => "ROLLBACK_COMPLETE",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteComplete => "DELETE_COMPLETE",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A network stack as described by the remote service
#[derive(Clone, Debug, PartialEq)]
pub struct StackDescription {
    /// Opaque stack identifier assigned by the service
    pub stack_id: String,
    /// Current lifecycle status
    pub status: StackStatus,
    /// Named output values (security group, VPC id, subnet lists)
    pub outputs: BTreeMap<String, String>,
}

/// Parameters for submitting a stack creation
#[derive(Clone, Debug)]
pub struct CreateStackRequest {
    /// Stack name, derived from the cluster name
    pub name: String,
    /// Location of the infrastructure template
    pub template_url: String,
    /// Bounded creation timeout enforced by the service
    pub timeout: Duration,
    /// Action the service takes if creation fails
    pub on_failure: OnStackFailure,
}

/// Network-stack service: describe/create/delete by name
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StackService: Send + Sync {
    /// Describe a stack by name; `None` when it does not exist
    async fn describe_stack(&self, name: &str) -> Result<Option<StackDescription>>;

    /// Submit stack creation and return the assigned stack identifier
    async fn create_stack(&self, request: &CreateStackRequest) -> Result<String>;

    /// Delete a stack by name
    async fn delete_stack(&self, name: &str) -> Result<()>;

    /// Rebuild whatever session state backs this service
    async fn refresh_session(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Identity role service
// =============================================================================

/// An identity role as described by the remote service
#[derive(Clone, Debug, PartialEq)]
pub struct RoleDescription {
    /// Role name
    pub name: String,
    /// Globally unique role ARN
    pub arn: String,
}

/// Parameters for creating an identity role
#[derive(Clone, Debug)]
pub struct CreateRoleRequest {
    /// Role name
    pub name: String,
    /// Trust policy document naming the service principal allowed to assume
    /// the role
    pub trust_policy: serde_json::Value,
    /// Human-readable description
    pub description: String,
    /// Maximum session duration in seconds
    pub max_session_duration: u32,
}

/// Identity-role service: get/create roles and attach permission policies
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoleService: Send + Sync {
    /// Look up a role by name; `None` when it does not exist
    async fn get_role(&self, name: &str) -> Result<Option<RoleDescription>>;

    /// Create a role with the given trust policy
    async fn create_role(&self, request: &CreateRoleRequest) -> Result<RoleDescription>;

    /// Attach a permission policy to the role
    ///
    /// Attaching an already-attached policy must not fail the flow.
    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<()>;

    /// Rebuild whatever session state backs this service
    async fn refresh_session(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Managed cluster control plane service
// =============================================================================

/// Control plane status as reported by the remote service
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ControlPlaneStatus {
    /// Control plane is being created
    Creating,
    /// Control plane is up; endpoint and certificate are available
    Active,
    /// Control plane is being deleted
    Deleting,
    /// Creation failed terminally; requires operator intervention
    Failed,
    /// Configuration update in progress; the control plane stays usable
    Updating,
    /// Creation accepted but not started
    Pending,
    /// A status this client does not model
    Unknown,
}

impl From<&str> for ControlPlaneStatus {
    fn from(s: &str) -> Self {
        match s {
            "CREATING" => Self::Creating,
            "ACTIVE" => Self::Active,
            "DELETING" => Self::Deleting,
            "FAILED" => Self::Failed,
            "UPDATING" => Self::Updating,
            "PENDING" => Self::Pending,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ControlPlaneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Active => "ACTIVE",
            Self::Deleting => "DELETING",
            Self::Failed => "FAILED",
            Self::Updating => "UPDATING",
            Self::Pending => "PENDING",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A managed control plane as described by the remote service
#[derive(Clone, Debug, PartialEq)]
pub struct ControlPlaneDescription {
    /// Cluster name
    pub name: String,
    /// Current lifecycle status
    pub status: ControlPlaneStatus,
    /// API server endpoint URL, present once active
    pub endpoint: Option<String>,
    /// Base64-encoded certificate authority data, present once active
    pub certificate_authority: Option<String>,
}

/// Parameters for creating a managed control plane
#[derive(Clone, Debug)]
pub struct CreateClusterRequest {
    /// Cluster name
    pub name: String,
    /// Kubernetes version
    pub version: String,
    /// ARN of the admin role the control plane runs as
    pub role_arn: String,
    /// Subnet ids from the cluster's network stack
    pub subnet_ids: Vec<String>,
    /// Security group ids from the cluster's network stack
    pub security_group_ids: Vec<String>,
    /// Tags applied to the cluster
    pub tags: BTreeMap<String, String>,
}

/// Managed-cluster service: describe/create/delete control planes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterService: Send + Sync {
    /// Describe a control plane by cluster name; `None` when it does not exist
    async fn describe_cluster(&self, name: &str) -> Result<Option<ControlPlaneDescription>>;

    /// Submit control plane creation
    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<()>;

    /// Delete a control plane by cluster name
    async fn delete_cluster(&self, name: &str) -> Result<()>;

    /// Rebuild whatever session state backs this service
    async fn refresh_session(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Node group service
// =============================================================================

/// Node group status as reported by the remote service
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum NodeGroupStatus {
    /// Node group is being created
    Creating,
    /// Node group is at its desired size (as far as the service knows)
    Active,
    /// A scaling or version update is in progress
    Updating,
    /// Node group is being deleted
    Deleting,
    /// Creation failed terminally
    CreateFailed,
    /// Deletion failed
    DeleteFailed,
    /// The group is running but unhealthy
    Degraded,
    /// A status this client does not model
    Unknown,
}

impl From<&str> for NodeGroupStatus {
    fn from(s: &str) -> Self {
        match s {
            "CREATING" => Self::Creating,
            "ACTIVE" => Self::Active,
            "UPDATING" => Self::Updating,
            "DELETING" => Self::Deleting,
            "CREATE_FAILED" => Self::CreateFailed,
            "DELETE_FAILED" => Self::DeleteFailed,
            "DEGRADED" => Self::Degraded,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for NodeGroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Active => "ACTIVE",
            Self::Updating => "UPDATING",
            Self::Deleting => "DELETING",
            Self::CreateFailed => "CREATE_FAILED",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::Degraded => "DEGRADED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Scaling configuration for a node group
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ScalingConfig {
    /// Minimum group size
    #[serde(rename = "minSize")]
    pub min_size: u32,
    /// Maximum group size
    #[serde(rename = "maxSize")]
    pub max_size: u32,
    /// Desired group size, the control variable for scaling
    #[serde(rename = "desiredSize")]
    pub desired_size: u32,
}

/// A node group as described by the remote service
#[derive(Clone, Debug, PartialEq)]
pub struct NodeGroupDescription {
    /// Node group name
    pub name: String,
    /// Current lifecycle status
    pub status: NodeGroupStatus,
    /// Current scaling configuration
    pub scaling: ScalingConfig,
}

/// Parameters for creating a node group
#[derive(Clone, Debug)]
pub struct CreateNodeGroupRequest {
    /// Cluster the node group belongs to
    pub cluster_name: String,
    /// Node group name, derived from the cluster name
    pub name: String,
    /// Initial scaling configuration
    pub scaling: ScalingConfig,
    /// Instance types for the worker nodes
    pub instance_types: Vec<String>,
    /// Subnet ids from the cluster's network stack
    pub subnet_ids: Vec<String>,
    /// ARN of the worker instance role
    pub node_role_arn: String,
    /// SSH key pair granting remote access to the nodes
    pub remote_access_key: String,
    /// Security groups allowed to reach the nodes over SSH
    pub source_security_groups: Vec<String>,
    /// Machine image family for the nodes
    pub ami_type: String,
    /// Capacity purchasing model
    pub capacity_type: String,
    /// Tags applied to the node group
    pub tags: BTreeMap<String, String>,
}

/// Status of a long-running node group update
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpdateStatus {
    /// Still running
    InProgress,
    /// Finished successfully
    Successful,
    /// Finished with failure
    Failed,
    /// Cancelled before completion
    Cancelled,
    /// A status this client does not model; treated as terminal
    Unknown,
}

impl UpdateStatus {
    /// True once the update can make no further progress
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl From<&str> for UpdateStatus {
    fn from(s: &str) -> Self {
        match s {
            "InProgress" => Self::InProgress,
            "Successful" => Self::Successful,
            "Failed" => Self::Failed,
            "Cancelled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InProgress => "InProgress",
            Self::Successful => "Successful",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Node-group service: describe/create/update/delete worker capacity
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeGroupService: Send + Sync {
    /// Describe a node group; `None` when it does not exist
    async fn describe_nodegroup(
        &self,
        cluster_name: &str,
        name: &str,
    ) -> Result<Option<NodeGroupDescription>>;

    /// Submit node group creation
    async fn create_nodegroup(
        &self,
        request: &CreateNodeGroupRequest,
    ) -> Result<NodeGroupDescription>;

    /// Submit a scaling-configuration update and return the update identifier
    async fn update_nodegroup_size(
        &self,
        cluster_name: &str,
        name: &str,
        scaling: &ScalingConfig,
    ) -> Result<String>;

    /// Poll the status of a previously submitted update
    async fn describe_update(
        &self,
        cluster_name: &str,
        name: &str,
        update_id: &str,
    ) -> Result<UpdateStatus>;

    /// Delete a node group
    async fn delete_nodegroup(&self, cluster_name: &str, name: &str) -> Result<()>;

    /// Rebuild whatever session state backs this service
    async fn refresh_session(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Key pair service
// =============================================================================

/// An SSH key pair as described by the remote service
#[derive(Clone, Debug, PartialEq)]
pub struct KeyPairDescription {
    /// Key pair name
    pub name: String,
    /// Fingerprint of the public key
    pub fingerprint: Option<String>,
}

/// Freshly created key pair including its private key material
///
/// The material is only returned at creation time; the manager persists it
/// to a local file immediately.
#[derive(Clone, Debug)]
pub struct KeyPairMaterial {
    /// Key pair name
    pub name: String,
    /// PEM-encoded private key
    pub private_key_pem: String,
}

/// Key-pair service: describe-or-create SSH key pairs for node access
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyPairService: Send + Sync {
    /// Look up a key pair by name; `None` when it does not exist
    async fn describe_key_pair(&self, name: &str) -> Result<Option<KeyPairDescription>>;

    /// Create a key pair and return its private key material
    async fn create_key_pair(&self, name: &str) -> Result<KeyPairMaterial>;

    /// Rebuild whatever session state backs this service
    async fn refresh_session(&self) -> Result<()> {
        Ok(())
    }
}
