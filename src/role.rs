//! Identity roles for the control plane and worker instances
//!
//! Two roles back a cluster: an admin role the managed control plane runs
//! as, and an instance role the worker nodes assume to register. Roles are
//! account-scoped shared state, reused across clusters and concurrently
//! ensured by multiple orchestrators, so `ensure` tolerates "already exists"
//! races without any client-side lock and teardown never deletes them.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, instrument};

use crate::provider::{CreateRoleRequest, RoleDescription, RoleService};
use crate::retry::with_refresh;
use crate::Result;

/// Default name of the control-plane admin role
pub const CONTROL_PLANE_ROLE_NAME: &str = "EKSServiceAdmin";

/// Default name of the worker instance role
pub const WORKER_ROLE_NAME: &str = "AmazonEKSNodeRole";

/// Service principal for the managed-cluster control plane
const CONTROL_PLANE_PRINCIPAL: &str = "eks.amazonaws.com";

/// Service principal for worker compute instances
const WORKER_PRINCIPAL: &str = "ec2.amazonaws.com";

/// Permission policies attached to the control-plane admin role, in order
const CONTROL_PLANE_POLICIES: &[&str] = &[
    "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy",
    "arn:aws:iam::aws:policy/AmazonEKSServicePolicy",
];

/// Permission policies attached to the worker instance role, in order
const WORKER_POLICIES: &[&str] = &[
    "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
    "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy",
];

/// Maximum session duration granted to either role, in seconds
const MAX_SESSION_DURATION_SECS: u32 = 36000;

/// Trust policy document allowing the given service principal to assume the role
fn trust_policy(principal: &str) -> serde_json::Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Action": ["sts:AssumeRole"],
                "Effect": "Allow",
                "Principal": {"Service": principal},
            }
        ],
    })
}

/// Ensures the identity roles the cluster depends on exist
pub struct RoleManager<R: RoleService + ?Sized> {
    service: Arc<R>,
}

impl<R: RoleService + ?Sized> RoleManager<R> {
    /// Create a manager over the given identity-role service
    pub fn new(service: Arc<R>) -> Self {
        Self { service }
    }

    /// Ensure the control-plane admin role exists
    pub async fn ensure_control_plane_role(&self) -> Result<RoleDescription> {
        self.ensure(
            CONTROL_PLANE_ROLE_NAME,
            CONTROL_PLANE_PRINCIPAL,
            CONTROL_PLANE_POLICIES,
        )
        .await
    }

    /// Ensure the worker instance role exists
    pub async fn ensure_worker_role(&self) -> Result<RoleDescription> {
        self.ensure(WORKER_ROLE_NAME, WORKER_PRINCIPAL, WORKER_POLICIES)
            .await
    }

    /// Ensure a role with the given trust principal and attached policies
    ///
    /// Role creation is synchronous on the remote side, so there is no
    /// waiter. Policy attachment runs after creation and is idempotent: an
    /// already-attached policy never fails the flow.
    #[instrument(skip(self, policies))]
    pub async fn ensure(
        &self,
        role_name: &str,
        trust_principal: &str,
        policies: &[&str],
    ) -> Result<RoleDescription> {
        let service = &*self.service;
        let observed = with_refresh(
            "get_role",
            || service.refresh_session(),
            || service.get_role(role_name),
        )
        .await?;

        if let Some(role) = observed {
            debug!(role = %role_name, arn = %role.arn, "role already present");
            return Ok(role);
        }

        info!(role = %role_name, principal = %trust_principal, "creating role");
        let request = CreateRoleRequest {
            name: role_name.to_string(),
            trust_policy: trust_policy(trust_principal),
            description: "Role providing access to managed cluster resources".to_string(),
            max_session_duration: MAX_SESSION_DURATION_SECS,
        };

        let role = match service.create_role(&request).await {
            Ok(role) => role,
            // Another orchestrator created it between our get and create
            Err(e) if e.is_already_exists() => {
                debug!(role = %role_name, "role appeared concurrently, converging");
                service.get_role(role_name).await?.ok_or(e)?
            }
            Err(e) => return Err(e),
        };

        for policy_arn in policies {
            match service.attach_role_policy(role_name, policy_arn).await {
                Ok(()) => debug!(role = %role_name, policy = %policy_arn, "policy attached"),
                Err(e) if e.is_already_exists() => {
                    debug!(role = %role_name, policy = %policy_arn, "policy already attached")
                }
                Err(e) => return Err(e),
            }
        }

        Ok(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockRoleService;
    use crate::Error;

    fn admin_role() -> RoleDescription {
        RoleDescription {
            name: CONTROL_PLANE_ROLE_NAME.to_string(),
            arn: "arn:aws:iam::123456789012:role/EKSServiceAdmin".to_string(),
        }
    }

    /// Story: An existing role is reused with zero create calls
    #[tokio::test]
    async fn ensure_is_idempotent_for_existing_role() {
        let mut service = MockRoleService::new();
        service
            .expect_get_role()
            .returning(|_| Ok(Some(admin_role())));
        service.expect_create_role().times(0);
        service.expect_attach_role_policy().times(0);

        let manager = RoleManager::new(Arc::new(service));
        let role = manager.ensure_control_plane_role().await.unwrap();
        assert_eq!(role.arn, "arn:aws:iam::123456789012:role/EKSServiceAdmin");
    }

    /// Story: A missing role is created with its trust policy and policies
    #[tokio::test]
    async fn ensure_creates_role_and_attaches_policies() {
        let mut service = MockRoleService::new();
        service.expect_get_role().returning(|_| Ok(None));
        service
            .expect_create_role()
            .withf(|req| {
                req.name == CONTROL_PLANE_ROLE_NAME
                    && req.trust_policy["Statement"][0]["Principal"]["Service"]
                        == "eks.amazonaws.com"
                    && req.max_session_duration == 36000
            })
            .times(1)
            .returning(|_| Ok(admin_role()));
        service
            .expect_attach_role_policy()
            .withf(|_, arn| arn.contains("AmazonEKS"))
            .times(2)
            .returning(|_, _| Ok(()));

        let manager = RoleManager::new(Arc::new(service));
        assert!(manager.ensure_control_plane_role().await.is_ok());
    }

    /// Story: The worker role trusts the compute principal and gets three policies
    #[tokio::test]
    async fn worker_role_uses_instance_principal() {
        let mut service = MockRoleService::new();
        service.expect_get_role().returning(|_| Ok(None));
        service
            .expect_create_role()
            .withf(|req| {
                req.trust_policy["Statement"][0]["Principal"]["Service"] == "ec2.amazonaws.com"
            })
            .times(1)
            .returning(|_| {
                Ok(RoleDescription {
                    name: WORKER_ROLE_NAME.to_string(),
                    arn: "arn:aws:iam::123456789012:role/AmazonEKSNodeRole".to_string(),
                })
            });
        service
            .expect_attach_role_policy()
            .times(3)
            .returning(|_, _| Ok(()));

        let manager = RoleManager::new(Arc::new(service));
        assert!(manager.ensure_worker_role().await.is_ok());
    }

    /// Story: Losing a creation race to another orchestrator is success
    ///
    /// Roles are account-scoped shared state; two orchestrators may ensure
    /// the same role concurrently and neither holds a lock.
    #[tokio::test]
    async fn ensure_tolerates_creation_race() {
        let mut service = MockRoleService::new();
        let mut seq = mockall::Sequence::new();
        service
            .expect_get_role()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        service
            .expect_create_role()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::already_exists("role EKSServiceAdmin")));
        service
            .expect_get_role()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(admin_role())));
        service
            .expect_attach_role_policy()
            .times(2)
            .returning(|_, _| Ok(()));

        let manager = RoleManager::new(Arc::new(service));
        let role = manager.ensure_control_plane_role().await.unwrap();
        assert_eq!(role.name, CONTROL_PLANE_ROLE_NAME);
    }

    /// Story: Attaching an already-attached policy does not fail the flow
    #[tokio::test]
    async fn attach_already_attached_policy_is_success() {
        let mut service = MockRoleService::new();
        service.expect_get_role().returning(|_| Ok(None));
        service
            .expect_create_role()
            .returning(|_| Ok(admin_role()));
        service
            .expect_attach_role_policy()
            .times(2)
            .returning(|_, _| Err(Error::already_exists("policy attached")));

        let manager = RoleManager::new(Arc::new(service));
        assert!(manager.ensure_control_plane_role().await.is_ok());
    }
}
