//! Managed cluster control plane lifecycle
//!
//! The control plane is created referencing the cluster's network stack and
//! admin role, then observed until the remote service reports it active.
//! Any terminal status other than active is fatal and never retried: a
//! failed control plane almost always needs operator intervention (quota,
//! capacity, or configuration), and retrying would only mask that.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::converge::{self, Action, PollOpts, Polled};
use crate::network::NetworkStack;
use crate::provider::{
    ClusterService, ControlPlaneDescription, ControlPlaneStatus, CreateClusterRequest,
};
use crate::retry::with_refresh;
use crate::spec::ClusterSpec;
use crate::{Error, Result};

/// A control plane that has reached the active state
#[derive(Clone, Debug, PartialEq)]
pub struct ControlPlane {
    /// Cluster name
    pub name: String,
    /// API server endpoint URL
    pub endpoint: String,
    /// Base64-encoded certificate authority data
    pub certificate_authority: String,
}

impl ControlPlane {
    fn from_description(description: ControlPlaneDescription) -> Result<Self> {
        let name = description.name;
        let endpoint = description.endpoint.ok_or_else(|| {
            Error::cluster_activation(format!("cluster {name} is active but reported no endpoint"))
        })?;
        let certificate_authority = description.certificate_authority.ok_or_else(|| {
            Error::cluster_activation(format!(
                "cluster {name} is active but reported no certificate authority"
            ))
        })?;
        Ok(Self {
            name,
            endpoint,
            certificate_authority,
        })
    }
}

/// Ensures the managed control plane exists and is active
pub struct ControlPlaneManager<C: ClusterService + ?Sized> {
    service: Arc<C>,
    poll_interval: Duration,
    activation_deadline: Duration,
    grace_period: Duration,
    delete_deadline: Duration,
}

impl<C: ClusterService + ?Sized> ControlPlaneManager<C> {
    /// Create a manager over the given managed-cluster service
    pub fn new(service: Arc<C>) -> Self {
        Self {
            service,
            poll_interval: Duration::from_secs(30),
            activation_deadline: Duration::from_secs(20 * 60),
            grace_period: Duration::from_secs(180),
            delete_deadline: Duration::from_secs(20 * 60),
        }
    }

    /// Override the wait cadence (poll interval, activation bound, grace
    /// period, delete bound)
    pub fn with_timing(
        mut self,
        poll_interval: Duration,
        activation_deadline: Duration,
        grace_period: Duration,
        delete_deadline: Duration,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.activation_deadline = activation_deadline;
        self.grace_period = grace_period;
        self.delete_deadline = delete_deadline;
        self
    }

    async fn describe(&self, name: &str) -> Result<Option<ControlPlaneDescription>> {
        let service = &*self.service;
        with_refresh(
            "describe_cluster",
            || service.refresh_session(),
            move || service.describe_cluster(name),
        )
        .await
    }

    /// Ensure the control plane exists and is active
    ///
    /// Blocks until the remote service reports the cluster active, bounded
    /// by the activation deadline plus one grace re-query. Returns the
    /// endpoint and certificate needed to reach the cluster API.
    #[instrument(skip(self, spec, network), fields(cluster = %spec.name()))]
    pub async fn ensure(
        &self,
        spec: &ClusterSpec,
        network: &NetworkStack,
        role_arn: &str,
    ) -> Result<ControlPlane> {
        let name = spec.name();
        let observed = self.describe(name).await?;

        let action = converge::plan(observed.as_ref(), |cp| match cp.status {
            ControlPlaneStatus::Failed => Err(Error::cluster_activation(format!(
                "cluster {name} is FAILED, expected ACTIVE; operator intervention required"
            ))),
            ControlPlaneStatus::Deleting => Err(Error::cluster_activation(format!(
                "cluster {name} is currently DELETING and cannot be reused"
            ))),
            _ => Ok(()),
        })?;

        match action {
            Action::UseExisting => {
                debug!(cluster = %name, "control plane already present");
            }
            Action::Create => {
                info!(cluster = %name, "creating control plane");
                let request = CreateClusterRequest {
                    name: name.to_string(),
                    version: spec.kubernetes_version().to_string(),
                    role_arn: role_arn.to_string(),
                    subnet_ids: network.subnet_ids(),
                    security_group_ids: vec![network.security_group.clone()],
                    tags: spec.tags().clone(),
                };
                let service = &*self.service;
                let submitted = with_refresh(
                    "create_cluster",
                    || service.refresh_session(),
                    || service.create_cluster(&request),
                )
                .await;
                match submitted {
                    Ok(()) => info!(cluster = %name, "control plane creation started, waiting"),
                    Err(e) if e.is_already_exists() => {
                        debug!(cluster = %name, "control plane appeared concurrently, converging")
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let description = self.await_active(name).await?;
        ControlPlane::from_description(description)
    }

    /// Wait for the control plane to become active, with one grace re-query
    async fn await_active(&self, name: &str) -> Result<ControlPlaneDescription> {
        let opts = PollOpts::new(self.poll_interval).with_deadline(self.activation_deadline);
        let polled = converge::poll_until(opts, "cluster_active", || async move {
            match self.describe(name).await? {
                Some(cp) if cp.status == ControlPlaneStatus::Active => Ok(Some(cp)),
                Some(cp) if cp.status == ControlPlaneStatus::Failed => {
                    Err(Error::cluster_activation(format!(
                        "cluster {name} is FAILED, expected ACTIVE; operator intervention required"
                    )))
                }
                Some(_) => Ok(None),
                None => Err(Error::cluster_activation(format!(
                    "cluster {name} disappeared while waiting for activation"
                ))),
            }
        })
        .await?;

        if let Polled::Ready(description) = polled {
            return Ok(description);
        }

        warn!(
            cluster = %name,
            grace_secs = self.grace_period.as_secs(),
            "activation exceeded its deadline, allowing a grace period"
        );
        tokio::time::sleep(self.grace_period).await;

        match self.describe(name).await? {
            Some(cp) if cp.status == ControlPlaneStatus::Active => Ok(cp),
            Some(cp) => Err(Error::cluster_activation(format!(
                "cluster {name} not active after deadline plus grace period (last status: {})",
                cp.status
            ))),
            None => Err(Error::cluster_activation(format!(
                "cluster {name} disappeared while waiting for activation"
            ))),
        }
    }

    /// Describe the control plane, requiring it to be active
    ///
    /// Used by operations against an existing cluster (scaling) that need
    /// the endpoint and certificate without driving creation.
    pub async fn describe_active(&self, name: &str) -> Result<ControlPlane> {
        match self.describe(name).await? {
            Some(cp) if cp.status == ControlPlaneStatus::Active => {
                ControlPlane::from_description(cp)
            }
            Some(cp) => Err(Error::cluster_activation(format!(
                "cluster {name} is {}, expected ACTIVE",
                cp.status
            ))),
            None => Err(Error::cluster_activation(format!(
                "cluster {name} does not exist"
            ))),
        }
    }

    /// Delete the control plane and wait for it to be gone
    ///
    /// "Already absent" is success. The wait is bounded; an overrun surfaces
    /// as an error for the caller to log on the teardown path.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        info!(cluster = %name, "deleting control plane");

        let service = &*self.service;
        let deleted = with_refresh(
            "delete_cluster",
            || service.refresh_session(),
            || service.delete_cluster(name),
        )
        .await;
        match deleted {
            Ok(()) => {}
            Err(e) if e.is_already_absent() => {
                info!(cluster = %name, "control plane already absent");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let opts = PollOpts::new(self.poll_interval).with_deadline(self.delete_deadline);
        let polled = converge::poll_until(opts, "cluster_deleted", || async move {
            match self.describe(name).await? {
                None => Ok(Some(())),
                Some(_) => Ok(None),
            }
        })
        .await?;

        match polled {
            Polled::Ready(()) => {
                info!(cluster = %name, "control plane deleted");
                Ok(())
            }
            Polled::TimedOut => Err(Error::cluster_activation(format!(
                "cluster {name} still deleting after {}s",
                self.delete_deadline.as_secs()
            ))),
        }
    }
}
