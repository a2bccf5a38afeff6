//! The cluster lifecycle state machine
//!
//! [`ClusterOrchestrator`] composes the resource managers into three
//! operations:
//!
//! - `create` drives `ABSENT → NETWORK_READY → ROLES_READY →
//!   CONTROL_PLANE_READY → NODEGROUP_READY → AUTH_CONFIGURED → NODES_READY`.
//!   Every transition is an idempotent ensure, so re-running `create`
//!   against a partially provisioned cluster resumes where it left off.
//! - `scale` moves the node group to a new desired size and waits for the
//!   nodes to follow.
//! - `delete` walks backwards, removing the most dependent resources first:
//!   node group, then control plane, then network stack. A failed step is
//!   logged and the remaining steps still run; identity roles are shared
//!   across clusters and intentionally left in place.
//!
//! Steps execute strictly in order even where they look parallelizable;
//! sequential execution keeps failure attribution simple for an operation
//! that runs for minutes either way.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::access;
use crate::controlplane::{ControlPlane, ControlPlaneManager};
use crate::dataplane::{ClusterDataPlane, DataPlaneConnector, TokenConnector};
use crate::keypair::KeyPairManager;
use crate::network::{NetworkStack, NetworkStackManager};
use crate::nodegroup::NodeGroupManager;
use crate::provider::{
    AwsCli, ClusterService, KeyPairService, NodeGroupService, RoleService, StackService,
};
use crate::readiness::NodeReadinessWaiter;
use crate::role::RoleManager;
use crate::spec::ClusterSpec;
use crate::timing::{ResultSnapshot, TimingRecorder};
use crate::Result;

/// The remote services an orchestrator operates against
pub struct RemoteServices {
    /// Network-stack service
    pub stacks: Arc<dyn StackService>,
    /// Identity-role service
    pub roles: Arc<dyn RoleService>,
    /// Managed-cluster service
    pub clusters: Arc<dyn ClusterService>,
    /// Node-group service
    pub node_groups: Arc<dyn NodeGroupService>,
    /// Key-pair service
    pub key_pairs: Arc<dyn KeyPairService>,
    /// Lazily connects to the cluster data plane once the endpoint is known
    pub connector: Arc<dyn DataPlaneConnector>,
}

impl RemoteServices {
    /// Production services backed by the cloud CLI for the given region
    pub fn aws(region: &str) -> Self {
        let cli = Arc::new(AwsCli::new(region));
        Self {
            stacks: cli.clone(),
            roles: cli.clone(),
            clusters: cli.clone(),
            node_groups: cli.clone(),
            key_pairs: cli,
            connector: Arc::new(TokenConnector::aws(region)),
        }
    }
}

/// Wait cadence for every remote long-running operation
#[derive(Clone, Copy, Debug)]
pub struct OrchestratorConfig {
    /// Poll interval for stack, control plane, and node group status
    pub status_poll_interval: Duration,
    /// Extended wait granted after a creation timeout before giving up
    pub grace_period: Duration,
    /// Bound on the control plane activation wait
    pub activation_deadline: Duration,
    /// Bound on the node group creation wait (overrun proceeds, logged)
    pub nodegroup_create_deadline: Duration,
    /// Poll interval for node-group update status
    pub update_poll_interval: Duration,
    /// Bound on node-group update polling; `None` polls until cancelled
    pub update_deadline: Option<Duration>,
    /// Poll interval for node readiness
    pub readiness_interval: Duration,
    /// Bound on the node readiness wait; `None` waits until cancelled
    pub readiness_deadline: Option<Duration>,
    /// Bound applied uniformly to every teardown wait
    pub delete_deadline: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(180),
            activation_deadline: Duration::from_secs(20 * 60),
            nodegroup_create_deadline: Duration::from_secs(20 * 60),
            update_poll_interval: Duration::from_secs(5),
            update_deadline: Some(Duration::from_secs(30 * 60)),
            readiness_interval: Duration::from_secs(5),
            readiness_deadline: None,
            delete_deadline: Duration::from_secs(20 * 60),
        }
    }
}

/// Lifecycle phase reached during `create`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProvisionPhase {
    /// Nothing provisioned yet
    Absent,
    /// Network stack resolved
    NetworkReady,
    /// Both identity roles resolved
    RolesReady,
    /// Control plane active, endpoint known
    ControlPlaneReady,
    /// Node group resolved
    NodeGroupReady,
    /// Access file written and authorization map applied
    AuthConfigured,
    /// Target count of nodes report Ready
    NodesReady,
}

impl std::fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Absent => "ABSENT",
            Self::NetworkReady => "NETWORK_READY",
            Self::RolesReady => "ROLES_READY",
            Self::ControlPlaneReady => "CONTROL_PLANE_READY",
            Self::NodeGroupReady => "NODEGROUP_READY",
            Self::AuthConfigured => "AUTH_CONFIGURED",
            Self::NodesReady => "NODES_READY",
        };
        f.write_str(s)
    }
}

/// A fully provisioned cluster
#[derive(Clone, Debug)]
pub struct ProvisionedCluster {
    /// The resolved network stack
    pub network: NetworkStack,
    /// The active control plane
    pub control_plane: ControlPlane,
    /// Count of Ready nodes observed when provisioning finished
    pub ready_nodes: u32,
}

/// Outcome of one teardown step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The resource was removed (or was already absent)
    Removed,
    /// The step failed; teardown continued with the remaining steps
    Failed(String),
}

/// Per-step outcomes of a teardown, in execution order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeardownReport {
    /// Node group deletion outcome
    pub node_group: StepOutcome,
    /// Control plane deletion outcome
    pub control_plane: StepOutcome,
    /// Network stack deletion outcome
    pub network_stack: StepOutcome,
}

impl TeardownReport {
    /// True when every step removed its resource
    pub fn fully_removed(&self) -> bool {
        [&self.node_group, &self.control_plane, &self.network_stack]
            .iter()
            .all(|step| **step == StepOutcome::Removed)
    }
}

/// Sequences cluster lifecycle operations over the remote services
pub struct ClusterOrchestrator {
    spec: ClusterSpec,
    config: OrchestratorConfig,
    network: NetworkStackManager<dyn StackService>,
    roles: RoleManager<dyn RoleService>,
    control_planes: ControlPlaneManager<dyn ClusterService>,
    node_groups: NodeGroupManager<dyn NodeGroupService>,
    key_pairs: KeyPairManager<dyn KeyPairService>,
    connector: Arc<dyn DataPlaneConnector>,
    data_plane: Option<Arc<dyn ClusterDataPlane>>,
    recorder: TimingRecorder,
}

impl ClusterOrchestrator {
    /// Create an orchestrator with default wait cadence
    pub fn new(spec: ClusterSpec, services: RemoteServices) -> Self {
        Self::with_config(spec, services, OrchestratorConfig::default())
    }

    /// Create an orchestrator with an explicit wait cadence
    pub fn with_config(
        spec: ClusterSpec,
        services: RemoteServices,
        config: OrchestratorConfig,
    ) -> Self {
        let network = NetworkStackManager::new(services.stacks).with_timing(
            config.status_poll_interval,
            config.grace_period,
            config.delete_deadline,
        );
        let roles = RoleManager::new(services.roles);
        let control_planes = ControlPlaneManager::new(services.clusters).with_timing(
            config.status_poll_interval,
            config.activation_deadline,
            config.grace_period,
            config.delete_deadline,
        );
        let node_groups = NodeGroupManager::new(services.node_groups).with_timing(
            config.status_poll_interval,
            config.nodegroup_create_deadline,
            config.update_poll_interval,
            config.update_deadline,
            config.delete_deadline,
        );
        let key_pairs = KeyPairManager::new(services.key_pairs);

        Self {
            spec,
            config,
            network,
            roles,
            control_planes,
            node_groups,
            key_pairs,
            connector: services.connector,
            data_plane: None,
            recorder: TimingRecorder::new(),
        }
    }

    /// The spec this orchestrator drives toward
    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Times recorded so far
    pub fn recorder(&self) -> &TimingRecorder {
        &self.recorder
    }

    /// Absorb times from a snapshot saved by a previous run
    pub fn resume_from(&mut self, snapshot: &ResultSnapshot) {
        self.recorder.merge_earlier(snapshot.times.clone());
    }

    /// Build the persisted result snapshot
    pub fn snapshot(&self, description: impl Into<String>) -> ResultSnapshot {
        ResultSnapshot::new(&self.spec, &self.recorder, description)
    }

    async fn data_plane(
        &mut self,
        control_plane: &ControlPlane,
    ) -> Result<Arc<dyn ClusterDataPlane>> {
        if let Some(data_plane) = &self.data_plane {
            return Ok(data_plane.clone());
        }
        let data_plane = self.connector.connect(control_plane).await?;
        self.data_plane = Some(data_plane.clone());
        Ok(data_plane)
    }

    fn waiter(
        &self,
        data_plane: Arc<dyn ClusterDataPlane>,
    ) -> NodeReadinessWaiter<dyn ClusterDataPlane> {
        NodeReadinessWaiter::new(data_plane)
            .with_timing(self.config.readiness_interval, self.config.readiness_deadline)
    }

    /// Create the cluster, resuming past any already-provisioned step
    ///
    /// Drives the phases of the state machine in order; no phase is skipped
    /// and each is independently idempotent. Blocks until the desired node
    /// count reports Ready.
    #[instrument(skip(self), fields(cluster = %self.spec.name()))]
    pub async fn create(&mut self) -> Result<ProvisionedCluster> {
        let spec = self.spec.clone();
        info!(cluster = %spec.name(), nodes = spec.node_count(), "creating cluster");

        let started = Instant::now();
        let network = self.network.ensure(&spec).await?;
        self.recorder.record("create_network_stack", started.elapsed());
        info!(phase = %ProvisionPhase::NetworkReady, "phase complete");

        let admin_role = self.roles.ensure_control_plane_role().await?;
        let worker_role = self.roles.ensure_worker_role().await?;
        info!(phase = %ProvisionPhase::RolesReady, "phase complete");

        let started = Instant::now();
        let control_plane = self
            .control_planes
            .ensure(&spec, &network, &admin_role.arn)
            .await?;
        self.recorder.record("create_cluster", started.elapsed());
        info!(phase = %ProvisionPhase::ControlPlaneReady, "phase complete");

        // Rewritten every run so the file always matches the live endpoint
        access::ensure_kube_config(&spec, &control_plane).await?;
        self.key_pairs.ensure(&spec).await?;

        let started = Instant::now();
        self.node_groups
            .ensure(&spec, &network, &worker_role.arn)
            .await?;
        self.recorder.record("create_node_group", started.elapsed());
        info!(phase = %ProvisionPhase::NodeGroupReady, "phase complete");

        // Nodes cannot register until the control plane trusts the worker
        // role, so the auth map goes in before the readiness wait
        let data_plane = self.data_plane(&control_plane).await?;
        data_plane
            .apply_config_map(&access::auth_map(&worker_role.arn)?)
            .await?;
        info!(phase = %ProvisionPhase::AuthConfigured, "phase complete");

        let started = Instant::now();
        let ready_nodes = self
            .waiter(data_plane)
            .wait_for_ready(spec.node_count())
            .await?;
        self.recorder.record("wait_for_nodes", started.elapsed());
        info!(phase = %ProvisionPhase::NodesReady, ready = ready_nodes, "cluster ready");

        Ok(ProvisionedCluster {
            network,
            control_plane,
            ready_nodes,
        })
    }

    /// Scale the node group to `target` nodes and wait for readiness
    ///
    /// The target is bounds-checked locally before any remote call. Records
    /// a `scale_up_<from>_to_<to>` / `scale_down_<from>_to_<to>` timing
    /// entry covering the update and the readiness wait.
    #[instrument(skip(self), fields(cluster = %self.spec.name()))]
    pub async fn scale(&mut self, target: u32) -> Result<u32> {
        let spec = self.spec.clone();
        spec.check_scale_target(target)?;

        let from = self.node_groups.desired_size(&spec).await?;
        info!(from, target, "scaling node group");

        let started = Instant::now();
        if from != target {
            self.node_groups.update(&spec, target).await?;
        } else {
            info!(target, "node group already at target size");
        }

        let control_plane = self.control_planes.describe_active(spec.name()).await?;
        let data_plane = self.data_plane(&control_plane).await?;
        let ready = self.waiter(data_plane).wait_for_ready(target).await?;

        if from != target {
            let label = TimingRecorder::scale_label(from, target);
            self.recorder.record(label, started.elapsed());
        }

        Ok(ready)
    }

    /// Tear the cluster down in reverse creation order
    ///
    /// Node group first, then control plane, then network stack. A failed
    /// step never blocks the remaining steps; per-step outcomes land in the
    /// returned report. Identity roles are account-scoped shared state and
    /// are deliberately not deleted.
    #[instrument(skip(self), fields(cluster = %self.spec.name()))]
    pub async fn delete(&mut self) -> Result<TeardownReport> {
        let spec = self.spec.clone();
        info!(cluster = %spec.name(), "deleting cluster");
        let started = Instant::now();

        let node_group = self.teardown_step("node_group", self.node_groups.delete(&spec)).await;
        let control_plane = self
            .teardown_step("control_plane", self.control_planes.delete(spec.name()))
            .await;
        let network_stack = self.teardown_step("network_stack", self.network.delete(&spec)).await;

        self.recorder.record("delete_cluster", started.elapsed());
        // Any cached data-plane client points at a dead endpoint now
        self.data_plane = None;

        let report = TeardownReport {
            node_group,
            control_plane,
            network_stack,
        };
        if report.fully_removed() {
            info!(cluster = %spec.name(), "cluster deleted");
        } else {
            warn!(cluster = %spec.name(), ?report, "cluster teardown finished with failed steps");
        }
        Ok(report)
    }

    async fn teardown_step(
        &self,
        step: &str,
        operation: impl std::future::Future<Output = Result<()>>,
    ) -> StepOutcome {
        match operation.await {
            Ok(()) => StepOutcome::Removed,
            Err(e) => {
                warn!(step = %step, error = %e, "teardown step failed, continuing");
                StepOutcome::Failed(e.to_string())
            }
        }
    }
}
