//! Error types for the kubescaler operations

use thiserror::Error;

/// Main error type for cluster provisioning and scaling operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid input configuration, rejected before any remote call is issued
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transient remote failure (throttling, expired credentials, brief
    /// connectivity loss) that may clear after a session refresh and retry
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// The network stack did not reach its expected state within the bounded
    /// wait plus grace period
    #[error("stack creation error: {0}")]
    StackCreation(String),

    /// The cluster control plane reached a terminal state other than active,
    /// or never became active within the bounded wait
    #[error("cluster activation error: {0}")]
    ClusterActivation(String),

    /// A node group operation failed or the group never reached its expected
    /// state
    #[error("node group error: {0}")]
    NodeGroup(String),

    /// Nodes did not report Ready within the caller-configured deadline
    ///
    /// Distinct from activation failures: nodes can be slow without being
    /// broken.
    #[error("readiness timeout: {0}")]
    ReadinessTimeout(String),

    /// The resource already exists; normalized to success at the boundary of
    /// every `ensure` operation
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The resource is already absent; normalized to success at the boundary
    /// of every `delete` operation
    #[error("already absent: {0}")]
    AlreadyAbsent(String),

    /// Kubernetes API error from the cluster data plane
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error writing access files or result snapshots
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a transient remote error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientRemote(msg.into())
    }

    /// Create a stack creation error with the given message
    pub fn stack_creation(msg: impl Into<String>) -> Self {
        Self::StackCreation(msg.into())
    }

    /// Create a cluster activation error with the given message
    pub fn cluster_activation(msg: impl Into<String>) -> Self {
        Self::ClusterActivation(msg.into())
    }

    /// Create a node group error with the given message
    pub fn node_group(msg: impl Into<String>) -> Self {
        Self::NodeGroup(msg.into())
    }

    /// Create a readiness timeout error with the given message
    pub fn readiness_timeout(msg: impl Into<String>) -> Self {
        Self::ReadinessTimeout(msg.into())
    }

    /// Create an already-exists outcome for the named resource
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists(resource.into())
    }

    /// Create an already-absent outcome for the named resource
    pub fn already_absent(resource: impl Into<String>) -> Self {
        Self::AlreadyAbsent(resource.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True when the failure may clear after one session refresh and retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRemote(_))
    }

    /// True when the remote resource already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// True when the remote resource is already absent
    pub fn is_already_absent(&self) -> bool {
        matches!(self, Self::AlreadyAbsent(_))
    }
}
