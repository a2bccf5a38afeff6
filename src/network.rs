//! Network stack lifecycle
//!
//! A cluster runs inside a network stack (VPC, subnets, security group)
//! created from a fixed infrastructure template and identified by the derived
//! name `<cluster>-vpc`. The manager converges on the stack: describe it if
//! present, create it otherwise, then wait for the remote service to finish.
//!
//! Stack creation regularly overruns its nominal timeout for reasons that
//! resolve on their own, so a timeout here is not an immediate failure: the
//! manager logs a warning, waits one fixed grace period, and re-queries once
//! before giving up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::converge::{self, Action, PollOpts, Polled};
use crate::provider::{CreateStackRequest, StackDescription, StackService, StackStatus};
use crate::retry::with_refresh;
use crate::spec::ClusterSpec;
use crate::{Error, Result};

/// Infrastructure template the stack is created from
pub const STACK_TEMPLATE_URL: &str =
    "https://s3.us-west-2.amazonaws.com/amazon-eks/cloudformation/2020-10-29/amazon-eks-vpc-private-subnets.yaml";

/// Output key holding the security group id
const OUTPUT_SECURITY_GROUPS: &str = "SecurityGroups";
/// Output key holding the VPC id
const OUTPUT_VPC: &str = "VPC";
/// Output key holding the comma-separated public subnet ids
const OUTPUT_SUBNETS_PUBLIC: &str = "SubnetsPublic";
/// Output key holding the comma-separated private subnet ids
const OUTPUT_SUBNETS_PRIVATE: &str = "SubnetsPrivate";

/// A resolved network stack with its output values unwrapped
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkStack {
    /// Stack name (`<cluster>-vpc`)
    pub name: String,
    /// Opaque stack identifier assigned by the service
    pub stack_id: String,
    /// VPC id
    pub vpc_id: String,
    /// Security group protecting the cluster
    pub security_group: String,
    /// Public subnet ids
    pub public_subnets: Vec<String>,
    /// Private subnet ids
    pub private_subnets: Vec<String>,
}

impl NetworkStack {
    /// All subnet ids, private first, the order dependents consume them in
    pub fn subnet_ids(&self) -> Vec<String> {
        let mut ids = self.private_subnets.clone();
        ids.extend(self.public_subnets.iter().cloned());
        ids
    }

    fn from_description(name: &str, description: &StackDescription) -> Result<Self> {
        let output = |key: &str| {
            description.outputs.get(key).cloned().ok_or_else(|| {
                Error::stack_creation(format!(
                    "stack {name} is missing required output {key}"
                ))
            })
        };
        let split = |value: String| -> Vec<String> {
            value
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        Ok(Self {
            name: name.to_string(),
            stack_id: description.stack_id.clone(),
            vpc_id: output(OUTPUT_VPC)?,
            security_group: output(OUTPUT_SECURITY_GROUPS)?,
            public_subnets: split(output(OUTPUT_SUBNETS_PUBLIC)?),
            private_subnets: split(output(OUTPUT_SUBNETS_PRIVATE)?),
        })
    }
}

/// Ensures the cluster's network stack exists and is fully created
pub struct NetworkStackManager<S: StackService + ?Sized> {
    service: Arc<S>,
    template_url: String,
    poll_interval: Duration,
    grace_period: Duration,
    delete_deadline: Duration,
}

impl<S: StackService + ?Sized> NetworkStackManager<S> {
    /// Create a manager over the given network-stack service
    pub fn new(service: Arc<S>) -> Self {
        Self {
            service,
            template_url: STACK_TEMPLATE_URL.to_string(),
            poll_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(180),
            delete_deadline: Duration::from_secs(20 * 60),
        }
    }

    /// Override the infrastructure template
    pub fn with_template_url(mut self, url: impl Into<String>) -> Self {
        self.template_url = url.into();
        self
    }

    /// Override the wait cadence (poll interval, grace period, delete bound)
    pub fn with_timing(
        mut self,
        poll_interval: Duration,
        grace_period: Duration,
        delete_deadline: Duration,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.grace_period = grace_period;
        self.delete_deadline = delete_deadline;
        self
    }

    async fn describe(&self, name: &str) -> Result<Option<StackDescription>> {
        let service = &*self.service;
        with_refresh(
            "describe_stack",
            || service.refresh_session(),
            move || service.describe_stack(name),
        )
        .await
    }

    /// Ensure the stack for this cluster exists, creating it if absent
    ///
    /// Blocks until the stack is fully created (bounded by the spec's stack
    /// timeout plus one grace re-query) and returns its unwrapped outputs.
    /// "Already exists" is converged on, never an error.
    #[instrument(skip(self, spec), fields(stack = %spec.vpc_name()))]
    pub async fn ensure(&self, spec: &ClusterSpec) -> Result<NetworkStack> {
        let name = spec.vpc_name();
        let observed = self.describe(&name).await?;

        let action = converge::plan(observed.as_ref(), |stack| {
            if stack.status.create_failed() {
                Err(Error::stack_creation(format!(
                    "stack {name} previously failed to create (status {})",
                    stack.status
                )))
            } else {
                Ok(())
            }
        })?;

        match action {
            Action::UseExisting => {
                debug!(stack = %name, "network stack already present");
            }
            Action::Create => {
                info!(stack = %name, "creating network stack");
                let request = CreateStackRequest {
                    name: name.clone(),
                    template_url: self.template_url.clone(),
                    timeout: spec.stack_timeout(),
                    on_failure: spec.on_stack_failure(),
                };
                let service = &*self.service;
                let submitted = with_refresh(
                    "create_stack",
                    || service.refresh_session(),
                    || service.create_stack(&request),
                )
                .await;
                match submitted {
                    Ok(stack_id) => debug!(stack = %name, %stack_id, "stack creation submitted"),
                    // Lost a creation race with another orchestrator: converge
                    Err(e) if e.is_already_exists() => {
                        debug!(stack = %name, "stack appeared concurrently, converging")
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let description = self.await_created(&name, spec.stack_timeout()).await?;
        NetworkStack::from_description(&name, &description)
    }

    /// Wait for the stack to finish creating, with one grace re-query
    async fn await_created(&self, name: &str, timeout: Duration) -> Result<StackDescription> {
        let polled = self.poll_create_status(name, Some(timeout)).await?;
        if let Polled::Ready(description) = polled {
            return Ok(description);
        }

        // The underlying service often runs long without anything being
        // wrong; failing here would discard otherwise-successful
        // provisioning. One extended wait, then a final answer.
        warn!(
            stack = %name,
            grace_secs = self.grace_period.as_secs(),
            "stack creation exceeded its timeout, allowing a grace period"
        );
        tokio::time::sleep(self.grace_period).await;

        match self.describe(name).await? {
            Some(description) if description.status == StackStatus::CreateComplete => {
                Ok(description)
            }
            Some(description) => Err(Error::stack_creation(format!(
                "stack {name} not resolvable after timeout plus grace period (last status: {})",
                description.status
            ))),
            None => Err(Error::stack_creation(format!(
                "stack {name} disappeared while waiting for creation"
            ))),
        }
    }

    async fn poll_create_status(
        &self,
        name: &str,
        deadline: Option<Duration>,
    ) -> Result<Polled<StackDescription>> {
        let opts = PollOpts::new(self.poll_interval).with_optional_deadline(deadline);
        converge::poll_until(opts, "stack_create_complete", || async move {
            match self.describe(name).await? {
                Some(description) if description.status == StackStatus::CreateComplete => {
                    Ok(Some(description))
                }
                Some(description) if description.status.create_failed() => {
                    Err(Error::stack_creation(format!(
                        "stack {name} failed to create (status {})",
                        description.status
                    )))
                }
                Some(_) | None => Ok(None),
            }
        })
        .await
    }

    /// Delete the cluster's stack and wait for it to be gone
    ///
    /// "Already absent" is success. The wait is bounded; an overrun surfaces
    /// as an error for the caller to log on the teardown path.
    #[instrument(skip(self, spec), fields(stack = %spec.vpc_name()))]
    pub async fn delete(&self, spec: &ClusterSpec) -> Result<()> {
        let name = spec.vpc_name();
        info!(stack = %name, "deleting network stack");

        let service = &*self.service;
        let deleted = with_refresh(
            "delete_stack",
            || service.refresh_session(),
            || service.delete_stack(&name),
        )
        .await;
        match deleted {
            Ok(()) => {}
            Err(e) if e.is_already_absent() => {
                info!(stack = %name, "network stack already absent");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let stack = name.as_str();
        let opts = PollOpts::new(self.poll_interval).with_deadline(self.delete_deadline);
        let polled = converge::poll_until(opts, "stack_delete_complete", || async move {
            match self.describe(stack).await? {
                None => Ok(Some(())),
                Some(description) if description.status == StackStatus::DeleteComplete => {
                    Ok(Some(()))
                }
                Some(description) if description.status == StackStatus::DeleteFailed => {
                    Err(Error::stack_creation(format!(
                        "stack {stack} failed to delete"
                    )))
                }
                Some(_) => Ok(None),
            }
        })
        .await?;

        match polled {
            Polled::Ready(()) => {
                info!(stack = %name, "network stack deleted");
                Ok(())
            }
            Polled::TimedOut => Err(Error::stack_creation(format!(
                "stack {name} still deleting after {}s",
                self.delete_deadline.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockStackService;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec() -> ClusterSpec {
        ClusterSpec::builder("t1")
            .node_count(2)
            .min_nodes(1)
            .max_nodes(4)
            .stack_timeout_minutes(1)
            .build()
            .unwrap()
    }

    fn fast_manager(service: MockStackService) -> NetworkStackManager<MockStackService> {
        NetworkStackManager::new(Arc::new(service)).with_timing(
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_millis(50),
        )
    }

    fn complete_description() -> StackDescription {
        let mut outputs = BTreeMap::new();
        outputs.insert("VPC".to_string(), "vpc-123".to_string());
        outputs.insert("SecurityGroups".to_string(), "sg-1".to_string());
        outputs.insert(
            "SubnetsPublic".to_string(),
            "subnet-pub-a,subnet-pub-b".to_string(),
        );
        outputs.insert("SubnetsPrivate".to_string(), "subnet-priv-a".to_string());
        StackDescription {
            stack_id: "arn:stack/t1-vpc/abc".to_string(),
            status: StackStatus::CreateComplete,
            outputs,
        }
    }

    fn in_progress_description() -> StackDescription {
        StackDescription {
            stack_id: "arn:stack/t1-vpc/abc".to_string(),
            status: StackStatus::CreateInProgress,
            outputs: BTreeMap::new(),
        }
    }

    /// Story: Ensuring an already-created stack performs zero create calls
    #[tokio::test]
    async fn ensure_is_idempotent_for_existing_stack() {
        let mut service = MockStackService::new();
        service
            .expect_describe_stack()
            .returning(|_| Ok(Some(complete_description())));
        service.expect_create_stack().times(0);

        let manager = fast_manager(service);
        let stack = manager.ensure(&spec()).await.unwrap();

        assert_eq!(stack.name, "t1-vpc");
        assert_eq!(stack.vpc_id, "vpc-123");
        assert_eq!(stack.security_group, "sg-1");
        // Private subnets come first for dependents
        assert_eq!(
            stack.subnet_ids(),
            vec!["subnet-priv-a", "subnet-pub-a", "subnet-pub-b"]
        );
    }

    /// Story: Absent stack is created and waited to completion
    #[tokio::test]
    async fn ensure_creates_and_waits_for_completion() {
        let describes = AtomicU32::new(0);
        let mut service = MockStackService::new();
        service.expect_describe_stack().returning(move |_| {
            // First describe: absent. Then in progress, then complete.
            match describes.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(None),
                1 => Ok(Some(in_progress_description())),
                _ => Ok(Some(complete_description())),
            }
        });
        service
            .expect_create_stack()
            .withf(|req| {
                req.name == "t1-vpc"
                    && req.timeout == Duration::from_secs(60)
                    && req.template_url.contains("vpc")
            })
            .times(1)
            .returning(|_| Ok("arn:stack/t1-vpc/abc".to_string()));

        let manager = fast_manager(service);
        let stack = manager.ensure(&spec()).await.unwrap();
        assert_eq!(stack.vpc_id, "vpc-123");
    }

    /// Story: A creation race against another orchestrator converges
    #[tokio::test]
    async fn ensure_tolerates_already_exists_race() {
        let describes = AtomicU32::new(0);
        let mut service = MockStackService::new();
        service.expect_describe_stack().returning(move |_| {
            match describes.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(None),
                _ => Ok(Some(complete_description())),
            }
        });
        service
            .expect_create_stack()
            .times(1)
            .returning(|_| Err(Error::already_exists("stack t1-vpc")));

        let manager = fast_manager(service);
        assert!(manager.ensure(&spec()).await.is_ok());
    }

    /// Story: A stuck stack resolves during the grace period
    ///
    /// The bounded wait elapses with the stack still in progress; the grace
    /// re-query finds it complete and provisioning continues. A zero
    /// deadline forces the timeout after exactly one poll, so the second
    /// describe is the grace re-query.
    #[tokio::test]
    async fn await_created_recovers_during_grace_period() {
        let describes = AtomicU32::new(0);
        let mut service = MockStackService::new();
        service.expect_describe_stack().returning(move |_| {
            match describes.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(Some(in_progress_description())),
                _ => Ok(Some(complete_description())),
            }
        });
        service.expect_create_stack().times(0);

        let manager = fast_manager(service);
        let description = manager
            .await_created("t1-vpc", Duration::ZERO)
            .await
            .expect("grace re-query should resolve the stack");
        assert_eq!(description.status, StackStatus::CreateComplete);
    }

    /// Story: Still unresolved after the grace period is fatal
    #[tokio::test]
    async fn await_created_fails_after_grace_period() {
        let mut service = MockStackService::new();
        service
            .expect_describe_stack()
            .returning(|_| Ok(Some(in_progress_description())));

        let manager = fast_manager(service);
        let err = manager
            .await_created("t1-vpc", Duration::ZERO)
            .await
            .expect_err("unresolved stack must fail");
        assert!(matches!(err, Error::StackCreation(_)));
        assert!(err.to_string().contains("CREATE_IN_PROGRESS"));
    }

    /// Story: Terminal creation failure surfaces immediately
    #[tokio::test]
    async fn ensure_surfaces_failed_stack() {
        let mut service = MockStackService::new();
        service.expect_describe_stack().returning(|_| {
            Ok(Some(StackDescription {
                stack_id: "arn:stack/t1-vpc/abc".to_string(),
                status: StackStatus::RollbackComplete,
                outputs: BTreeMap::new(),
            }))
        });
        service.expect_create_stack().times(0);

        let manager = fast_manager(service);
        let err = manager.ensure(&spec()).await.expect_err("failed stack");
        assert!(matches!(err, Error::StackCreation(_)));
    }

    /// Story: Missing outputs are a stack error, not a panic
    #[tokio::test]
    async fn ensure_rejects_stack_missing_outputs() {
        let mut service = MockStackService::new();
        service.expect_describe_stack().returning(|_| {
            Ok(Some(StackDescription {
                stack_id: "arn:stack/t1-vpc/abc".to_string(),
                status: StackStatus::CreateComplete,
                outputs: BTreeMap::new(),
            }))
        });

        let manager = fast_manager(service);
        let err = manager.ensure(&spec()).await.expect_err("missing outputs");
        assert!(err.to_string().contains("missing required output"));
    }

    /// Story: Deleting an absent stack is success
    #[tokio::test]
    async fn delete_of_absent_stack_is_success() {
        let mut service = MockStackService::new();
        service
            .expect_delete_stack()
            .times(1)
            .returning(|_| Err(Error::already_absent("stack t1-vpc")));

        let manager = fast_manager(service);
        assert!(manager.delete(&spec()).await.is_ok());
    }

    /// Story: Delete waits until the stack is gone
    #[tokio::test]
    async fn delete_waits_for_removal() {
        let describes = AtomicU32::new(0);
        let mut service = MockStackService::new();
        service.expect_delete_stack().times(1).returning(|_| Ok(()));
        service.expect_describe_stack().returning(move |_| {
            match describes.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(Some(StackDescription {
                    stack_id: "arn:stack/t1-vpc/abc".to_string(),
                    status: StackStatus::DeleteInProgress,
                    outputs: BTreeMap::new(),
                })),
                _ => Ok(None),
            }
        });

        let manager = fast_manager(service);
        assert!(manager.delete(&spec()).await.is_ok());
    }

    /// Story: Transient describe failure is refreshed and retried once
    #[tokio::test]
    async fn describe_refreshes_session_on_transient_failure() {
        let attempts = AtomicU32::new(0);
        let mut service = MockStackService::new();
        service.expect_describe_stack().returning(move |_| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::transient("Throttling"))
            } else {
                Ok(Some(complete_description()))
            }
        });
        service.expect_refresh_session().times(1).returning(|| Ok(()));
        service.expect_create_stack().times(0);

        let manager = fast_manager(service);
        assert!(manager.ensure(&spec()).await.is_ok());
    }
}
