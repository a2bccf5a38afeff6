//! Worker node group lifecycle and scaling
//!
//! The node group is the scalable unit of worker capacity, identified by the
//! derived name `<cluster>-worker-group`. Creation waits for the service to
//! report the group active, but a wait-timeout there is non-fatal: the
//! caller's node-readiness wait is the authoritative success signal, and
//! groups regularly report late while their instances are already joining.
//!
//! Scaling submits a new desired size and polls the resulting long-running
//! update to completion. The desired size is bounds-checked locally first so
//! an out-of-range request never reaches the remote service.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::converge::{self, Action, PollOpts, Polled};
use crate::network::NetworkStack;
use crate::provider::{
    CreateNodeGroupRequest, NodeGroupDescription, NodeGroupService, NodeGroupStatus,
    ScalingConfig, UpdateStatus,
};
use crate::retry::with_refresh;
use crate::spec::ClusterSpec;
use crate::{Error, Result};

/// Machine image family used for worker nodes
const AMI_TYPE: &str = "AL2_x86_64";

/// Capacity purchasing model used for worker nodes
const CAPACITY_TYPE: &str = "ON_DEMAND";

/// Ensures the worker node group exists, scales it, and deletes it
pub struct NodeGroupManager<N: NodeGroupService + ?Sized> {
    service: Arc<N>,
    poll_interval: Duration,
    create_deadline: Duration,
    update_poll_interval: Duration,
    update_deadline: Option<Duration>,
    delete_deadline: Duration,
}

impl<N: NodeGroupService + ?Sized> NodeGroupManager<N> {
    /// Create a manager over the given node-group service
    pub fn new(service: Arc<N>) -> Self {
        Self {
            service,
            poll_interval: Duration::from_secs(30),
            create_deadline: Duration::from_secs(20 * 60),
            update_poll_interval: Duration::from_secs(5),
            update_deadline: Some(Duration::from_secs(30 * 60)),
            delete_deadline: Duration::from_secs(20 * 60),
        }
    }

    /// Override the wait cadence (create poll/bound, update poll/bound,
    /// delete bound)
    pub fn with_timing(
        mut self,
        poll_interval: Duration,
        create_deadline: Duration,
        update_poll_interval: Duration,
        update_deadline: Option<Duration>,
        delete_deadline: Duration,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.create_deadline = create_deadline;
        self.update_poll_interval = update_poll_interval;
        self.update_deadline = update_deadline;
        self.delete_deadline = delete_deadline;
        self
    }

    async fn describe(&self, cluster: &str, name: &str) -> Result<Option<NodeGroupDescription>> {
        let service = &*self.service;
        with_refresh(
            "describe_nodegroup",
            || service.refresh_session(),
            move || service.describe_nodegroup(cluster, name),
        )
        .await
    }

    /// Ensure the node group exists at the spec's desired size
    ///
    /// Waits for the group to report active; if that wait times out the
    /// manager logs and proceeds, because node readiness is judged by the
    /// caller's readiness wait, not by the group status.
    #[instrument(skip(self, spec, network), fields(nodegroup = %spec.node_group_name()))]
    pub async fn ensure(
        &self,
        spec: &ClusterSpec,
        network: &NetworkStack,
        node_role_arn: &str,
    ) -> Result<NodeGroupDescription> {
        let cluster = spec.name();
        let name = spec.node_group_name();
        let observed = self.describe(cluster, &name).await?;

        let action = converge::plan(observed.as_ref(), |group| match group.status {
            NodeGroupStatus::CreateFailed => Err(Error::node_group(format!(
                "node group {name} previously failed to create"
            ))),
            NodeGroupStatus::Deleting => Err(Error::node_group(format!(
                "node group {name} is currently DELETING and cannot be reused"
            ))),
            _ => Ok(()),
        })?;

        match action {
            Action::UseExisting => {
                debug!(nodegroup = %name, "node group already present");
            }
            Action::Create => {
                info!(nodegroup = %name, desired = spec.node_count(), "creating node group");
                let mut tags = spec.tags().clone();
                // Autoscaler discovery tags, always present on the group
                tags.insert("k8s.io/cluster-autoscaler/enabled".to_string(), "true".to_string());
                tags.insert(format!("k8s.io/cluster-autoscaler/{cluster}"), "None".to_string());

                let request = CreateNodeGroupRequest {
                    cluster_name: cluster.to_string(),
                    name: name.clone(),
                    scaling: ScalingConfig {
                        min_size: spec.min_nodes(),
                        max_size: spec.max_nodes(),
                        desired_size: spec.node_count(),
                    },
                    instance_types: vec![spec.machine_type().to_string()],
                    subnet_ids: network.subnet_ids(),
                    node_role_arn: node_role_arn.to_string(),
                    remote_access_key: spec.keypair_name().to_string(),
                    source_security_groups: vec![network.security_group.clone()],
                    ami_type: AMI_TYPE.to_string(),
                    capacity_type: CAPACITY_TYPE.to_string(),
                    tags,
                };
                let service = &*self.service;
                let submitted = with_refresh(
                    "create_nodegroup",
                    || service.refresh_session(),
                    || service.create_nodegroup(&request),
                )
                .await;
                match submitted {
                    Ok(group) => {
                        debug!(nodegroup = %name, status = %group.status, "node group creation submitted")
                    }
                    Err(e) if e.is_already_exists() => {
                        debug!(nodegroup = %name, "node group appeared concurrently, converging")
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.await_active(cluster, &name).await
    }

    /// Wait for the group to report active; timeout logs and proceeds
    async fn await_active(&self, cluster: &str, name: &str) -> Result<NodeGroupDescription> {
        let opts = PollOpts::new(self.poll_interval).with_deadline(self.create_deadline);
        let polled = converge::poll_until(opts, "nodegroup_active", || async move {
            match self.describe(cluster, name).await? {
                Some(group) if group.status == NodeGroupStatus::Active => Ok(Some(group)),
                Some(group) if group.status == NodeGroupStatus::CreateFailed => {
                    Err(Error::node_group(format!(
                        "node group {name} failed to create"
                    )))
                }
                Some(_) => Ok(None),
                None => Err(Error::node_group(format!(
                    "node group {name} disappeared while waiting for creation"
                ))),
            }
        })
        .await?;

        match polled {
            Polled::Ready(group) => Ok(group),
            Polled::TimedOut => {
                // The readiness wait downstream is the real success signal
                warn!(
                    nodegroup = %name,
                    "node group not active within the bounded wait, proceeding to readiness check"
                );
                self.describe(cluster, name).await?.ok_or_else(|| {
                    Error::node_group(format!(
                        "node group {name} disappeared while waiting for creation"
                    ))
                })
            }
        }
    }

    /// Scale the node group to the target size and wait for the update
    ///
    /// The target is checked against the spec's node bounds locally, before
    /// any remote request. The update is polled to a terminal status, bounded
    /// by the configured update deadline (dropping the future cancels the
    /// poll at any time).
    #[instrument(skip(self, spec), fields(nodegroup = %spec.node_group_name()))]
    pub async fn update(&self, spec: &ClusterSpec, target: u32) -> Result<()> {
        spec.check_scale_target(target)?;

        let cluster = spec.name();
        let name = spec.node_group_name();
        let scaling = ScalingConfig {
            min_size: spec.min_nodes(),
            max_size: spec.max_nodes(),
            desired_size: target,
        };

        info!(nodegroup = %name, target, "submitting scaling update");
        let service = &*self.service;
        let update_id = with_refresh(
            "update_nodegroup_size",
            || service.refresh_session(),
            || service.update_nodegroup_size(cluster, &name, &scaling),
        )
        .await?;

        let group_name = name.as_str();
        let update_ref = update_id.as_str();
        let opts =
            PollOpts::new(self.update_poll_interval).with_optional_deadline(self.update_deadline);
        let polled = converge::poll_until(opts, "nodegroup_update", || async move {
            let status = self
                .service
                .describe_update(cluster, group_name, update_ref)
                .await?;
            if status.is_terminal() {
                Ok(Some(status))
            } else {
                debug!(nodegroup = %group_name, update = %update_ref, status = %status, "update in progress");
                Ok(None)
            }
        })
        .await?;

        match polled {
            Polled::Ready(UpdateStatus::Successful) => {
                info!(nodegroup = %name, target, "scaling update finished");
                Ok(())
            }
            Polled::Ready(status) => Err(Error::node_group(format!(
                "scaling update {update_id} for {name} ended {status}"
            ))),
            Polled::TimedOut => Err(Error::node_group(format!(
                "scaling update {update_id} for {name} still in progress after the configured deadline"
            ))),
        }
    }

    /// Current desired size as reported by the remote service
    pub async fn desired_size(&self, spec: &ClusterSpec) -> Result<u32> {
        let group = self
            .describe(spec.name(), &spec.node_group_name())
            .await?
            .ok_or_else(|| {
                Error::node_group(format!(
                    "node group {} does not exist",
                    spec.node_group_name()
                ))
            })?;
        Ok(group.scaling.desired_size)
    }

    /// Delete the node group and wait for full removal
    ///
    /// "Not found" is success. The wait is bounded; an overrun surfaces as
    /// an error for the caller to log on the teardown path.
    #[instrument(skip(self, spec), fields(nodegroup = %spec.node_group_name()))]
    pub async fn delete(&self, spec: &ClusterSpec) -> Result<()> {
        let cluster = spec.name();
        let name = spec.node_group_name();
        info!(nodegroup = %name, "deleting node group");

        let service = &*self.service;
        let deleted = with_refresh(
            "delete_nodegroup",
            || service.refresh_session(),
            || service.delete_nodegroup(cluster, &name),
        )
        .await;
        match deleted {
            Ok(()) => {}
            Err(e) if e.is_already_absent() => {
                info!(nodegroup = %name, "node group already absent");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let group_name = name.as_str();
        let opts = PollOpts::new(self.poll_interval).with_deadline(self.delete_deadline);
        let polled = converge::poll_until(opts, "nodegroup_deleted", || async move {
            match self.describe(cluster, group_name).await? {
                None => Ok(Some(())),
                Some(_) => Ok(None),
            }
        })
        .await?;

        match polled {
            Polled::Ready(()) => {
                info!(nodegroup = %name, "node group deleted");
                Ok(())
            }
            Polled::TimedOut => Err(Error::node_group(format!(
                "node group {name} still deleting after {}s",
                self.delete_deadline.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockNodeGroupService;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec() -> ClusterSpec {
        ClusterSpec::builder("t1")
            .node_count(2)
            .min_nodes(1)
            .max_nodes(4)
            .build()
            .unwrap()
    }

    fn network() -> NetworkStack {
        NetworkStack {
            name: "t1-vpc".to_string(),
            stack_id: "arn:stack/t1-vpc/abc".to_string(),
            vpc_id: "vpc-123".to_string(),
            security_group: "sg-1".to_string(),
            public_subnets: vec!["subnet-pub-a".to_string()],
            private_subnets: vec!["subnet-priv-a".to_string()],
        }
    }

    fn description(status: NodeGroupStatus, desired: u32) -> NodeGroupDescription {
        NodeGroupDescription {
            name: "t1-worker-group".to_string(),
            status,
            scaling: ScalingConfig {
                min_size: 1,
                max_size: 4,
                desired_size: desired,
            },
        }
    }

    fn fast_manager(service: MockNodeGroupService) -> NodeGroupManager<MockNodeGroupService> {
        NodeGroupManager::new(Arc::new(service)).with_timing(
            Duration::from_millis(1),
            Duration::from_millis(50),
            Duration::from_millis(1),
            Some(Duration::from_millis(50)),
            Duration::from_millis(50),
        )
    }

    /// Story: An existing active group is reused with zero create calls
    #[tokio::test]
    async fn ensure_is_idempotent_for_active_group() {
        let mut service = MockNodeGroupService::new();
        service
            .expect_describe_nodegroup()
            .returning(|_, _| Ok(Some(description(NodeGroupStatus::Active, 2))));
        service.expect_create_nodegroup().times(0);

        let manager = fast_manager(service);
        let group = manager
            .ensure(&spec(), &network(), "arn:role/worker")
            .await
            .unwrap();
        assert_eq!(group.scaling.desired_size, 2);
    }

    /// Story: A missing group is created with scaling, access, and tags
    #[tokio::test]
    async fn ensure_creates_group_with_expected_request() {
        let describes = AtomicU32::new(0);
        let mut service = MockNodeGroupService::new();
        service.expect_describe_nodegroup().returning(move |_, _| {
            match describes.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(None),
                1 => Ok(Some(description(NodeGroupStatus::Creating, 2))),
                _ => Ok(Some(description(NodeGroupStatus::Active, 2))),
            }
        });
        service
            .expect_create_nodegroup()
            .withf(|req| {
                req.cluster_name == "t1"
                    && req.name == "t1-worker-group"
                    && req.scaling.desired_size == 2
                    && req.scaling.min_size == 1
                    && req.scaling.max_size == 4
                    && req.instance_types == vec!["m5.large"]
                    && req.node_role_arn == "arn:role/worker"
                    && req.remote_access_key == "workers-pem"
                    && req.tags["k8s.io/cluster-autoscaler/enabled"] == "true"
                    && req.tags.contains_key("k8s.io/cluster-autoscaler/t1")
            })
            .times(1)
            .returning(|_| Ok(description(NodeGroupStatus::Creating, 2)));

        let manager = fast_manager(service);
        let group = manager
            .ensure(&spec(), &network(), "arn:role/worker")
            .await
            .unwrap();
        assert_eq!(group.status, NodeGroupStatus::Active);
    }

    /// Story: A wait-timeout on creation logs and proceeds
    ///
    /// The subsequent readiness wait is the authoritative success signal, so
    /// a group still reporting CREATING at the deadline is returned as-is.
    #[tokio::test]
    async fn ensure_proceeds_when_activation_wait_times_out() {
        let mut service = MockNodeGroupService::new();
        service
            .expect_describe_nodegroup()
            .returning(|_, _| Ok(Some(description(NodeGroupStatus::Creating, 2))));
        service.expect_create_nodegroup().times(0);

        let service = Arc::new(service);
        let manager = NodeGroupManager::new(service).with_timing(
            Duration::from_millis(1),
            Duration::ZERO,
            Duration::from_millis(1),
            Some(Duration::from_millis(50)),
            Duration::from_millis(50),
        );

        let group = manager
            .ensure(&spec(), &network(), "arn:role/worker")
            .await
            .expect("timeout must not fail creation");
        assert_eq!(group.status, NodeGroupStatus::Creating);
    }

    /// Story: Scaling out of bounds is rejected with zero remote calls
    #[tokio::test]
    async fn update_rejects_out_of_bounds_target_locally() {
        let mut service = MockNodeGroupService::new();
        service.expect_update_nodegroup_size().times(0);
        service.expect_describe_update().times(0);

        let manager = fast_manager(service);

        let err = manager.update(&spec(), 5).await.expect_err("above max");
        assert!(matches!(err, Error::Configuration(_)));

        let err = manager.update(&spec(), 0).await.expect_err("below min");
        assert!(matches!(err, Error::Configuration(_)));
    }

    /// Story: Scaling submits the update and polls it to success
    #[tokio::test]
    async fn update_polls_to_terminal_status() {
        let polls = AtomicU32::new(0);
        let mut service = MockNodeGroupService::new();
        service
            .expect_update_nodegroup_size()
            .withf(|cluster, name, scaling| {
                cluster == "t1" && name == "t1-worker-group" && scaling.desired_size == 4
            })
            .times(1)
            .returning(|_, _, _| Ok("update-123".to_string()));
        service
            .expect_describe_update()
            .withf(|_, _, id| id == "update-123")
            .returning(move |_, _, _| {
                if polls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(UpdateStatus::InProgress)
                } else {
                    Ok(UpdateStatus::Successful)
                }
            });

        let manager = fast_manager(service);
        assert!(manager.update(&spec(), 4).await.is_ok());
    }

    /// Story: A failed update is a node group error
    #[tokio::test]
    async fn update_failure_is_surfaced() {
        let mut service = MockNodeGroupService::new();
        service
            .expect_update_nodegroup_size()
            .returning(|_, _, _| Ok("update-123".to_string()));
        service
            .expect_describe_update()
            .returning(|_, _, _| Ok(UpdateStatus::Failed));

        let manager = fast_manager(service);
        let err = manager.update(&spec(), 4).await.expect_err("failed update");
        assert!(matches!(err, Error::NodeGroup(_)));
        assert!(err.to_string().contains("Failed"));
    }

    /// Story: Deleting an absent group is success
    #[tokio::test]
    async fn delete_of_absent_group_is_success() {
        let mut service = MockNodeGroupService::new();
        service
            .expect_delete_nodegroup()
            .times(1)
            .returning(|_, _| Err(Error::already_absent("nodegroup t1-worker-group")));

        let manager = fast_manager(service);
        assert!(manager.delete(&spec()).await.is_ok());
    }

    /// Story: Delete waits until the group is fully removed
    #[tokio::test]
    async fn delete_waits_for_removal() {
        let describes = AtomicU32::new(0);
        let mut service = MockNodeGroupService::new();
        service
            .expect_delete_nodegroup()
            .times(1)
            .returning(|_, _| Ok(()));
        service.expect_describe_nodegroup().returning(move |_, _| {
            match describes.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(Some(description(NodeGroupStatus::Deleting, 2))),
                _ => Ok(None),
            }
        });

        let manager = fast_manager(service);
        assert!(manager.delete(&spec()).await.is_ok());
    }

    /// Story: The reported desired size is read back from the service
    #[tokio::test]
    async fn desired_size_reads_remote_state() {
        let mut service = MockNodeGroupService::new();
        service
            .expect_describe_nodegroup()
            .returning(|_, _| Ok(Some(description(NodeGroupStatus::Active, 3))));

        let manager = fast_manager(service);
        assert_eq!(manager.desired_size(&spec()).await.unwrap(), 3);
    }
}
