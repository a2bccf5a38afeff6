//! Kubescaler - managed Kubernetes cluster provisioning and scaling
//!
//! Kubescaler creates, scales, and tears down a managed Kubernetes cluster and
//! its supporting cloud infrastructure (network stack, identity roles, node
//! group) on demand, for experiment automation that needs working clusters and
//! must survive partial failures and long asynchronous provisioning delays.
//!
//! # Architecture
//!
//! The heart of the crate is the [`orchestrator::ClusterOrchestrator`], a
//! sequential state machine that drives dependent resource-creation steps
//! (network stack, roles, control plane, node group, node readiness) forward.
//! Every step is a describe-or-create `ensure` operation, so re-running
//! `create` against a partially-provisioned cluster resumes instead of
//! duplicating work, and teardown deletes the most dependent resources first.
//!
//! # Modules
//!
//! - [`spec`] - Cluster specification, validated before any remote call
//! - [`converge`] - Describe-or-create planning and bounded polling primitives
//! - [`retry`] - Transient-failure recovery (one session refresh + one retry)
//! - [`provider`] - Remote cloud service trait seams and their AWS CLI implementations
//! - [`network`] - Network stack (VPC, subnets, security group) lifecycle
//! - [`role`] - Identity roles for the control plane and worker instances
//! - [`controlplane`] - Managed cluster control plane lifecycle
//! - [`nodegroup`] - Worker node group lifecycle and scaling
//! - [`keypair`] - SSH key pair for node-group remote access
//! - [`access`] - Kubeconfig and in-cluster authorization mapping
//! - [`dataplane`] - Cluster API clients with short-lived bearer tokens
//! - [`readiness`] - Ready-node counting and waiting
//! - [`timing`] - Operation timing records and experiment result snapshots
//! - [`orchestrator`] - The create/scale/delete state machine
//! - [`error`] - Error types for the scaler

#![deny(missing_docs)]

pub mod access;
pub mod controlplane;
pub mod converge;
pub mod dataplane;
pub mod error;
pub mod keypair;
pub mod network;
pub mod nodegroup;
pub mod orchestrator;
pub mod provider;
pub mod readiness;
pub mod retry;
pub mod role;
pub mod spec;
pub mod timing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the default values used throughout kubescaler.
// Centralizing them here ensures consistency between spec defaults, the CLI,
// and test fixtures.

/// Default cloud region for all remote services
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default machine type for worker nodes
pub const DEFAULT_MACHINE_TYPE: &str = "m5.large";

/// Lifetime of the bearer tokens used against the cluster API, in seconds
///
/// Data-plane clients older than this are rebuilt from a fresh token before
/// use rather than failing mid-poll with an expired credential.
pub const TOKEN_LIFETIME_SECS: u64 = 600;

/// Name of the in-cluster authorization ConfigMap that lets the control plane
/// recognize worker-instance identities
pub const AUTH_CONFIG_MAP_NAME: &str = "aws-auth";

/// Field manager name used for server-side apply against the cluster API
pub const FIELD_MANAGER: &str = "kubescaler";
