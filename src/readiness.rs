//! Node readiness waiting
//!
//! The node-group service reporting a group active says nothing about the
//! nodes actually joining the cluster; the authoritative signal is the
//! cluster's own node list. The waiter polls that list, counting nodes whose
//! Ready condition is True, until the count reaches the target.
//!
//! By default the wait has no deadline: nodes can be slow without being
//! broken, and a false failure costs more than a long wait. Callers that
//! want a bound supply one, and an overrun then surfaces as
//! [`Error::ReadinessTimeout`] rather than an activation failure. Dropping
//! the future cancels the wait at any point.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use crate::converge::{self, PollOpts, Polled};
use crate::dataplane::ClusterDataPlane;
use crate::{Error, Result};

/// Waits for a target count of Ready nodes
pub struct NodeReadinessWaiter<D: ClusterDataPlane + ?Sized> {
    data_plane: Arc<D>,
    interval: Duration,
    deadline: Option<Duration>,
}

impl<D: ClusterDataPlane + ?Sized> NodeReadinessWaiter<D> {
    /// Create a waiter polling the given data plane every five seconds
    pub fn new(data_plane: Arc<D>) -> Self {
        Self {
            data_plane,
            interval: Duration::from_secs(5),
            deadline: None,
        }
    }

    /// Override the poll interval and optional deadline
    pub fn with_timing(mut self, interval: Duration, deadline: Option<Duration>) -> Self {
        self.interval = interval;
        self.deadline = deadline;
        self
    }

    /// Current count of Ready nodes, without waiting
    pub async fn current_ready(&self) -> Result<u32> {
        self.data_plane.ready_node_count().await
    }

    /// Block until at least `target` nodes report Ready
    ///
    /// Returns the observed ready count, which may exceed the target. An
    /// already-satisfied target returns after a single poll.
    #[instrument(skip(self))]
    pub async fn wait_for_ready(&self, target: u32) -> Result<u32> {
        let data_plane = &*self.data_plane;
        let opts = PollOpts::new(self.interval).with_optional_deadline(self.deadline);

        let polled = converge::poll_until(opts, "nodes_ready", || async move {
            let ready = data_plane.ready_node_count().await?;
            info!(ready, target, "waiting for nodes to be ready");
            Ok((ready >= target).then_some(ready))
        })
        .await?;

        match polled {
            Polled::Ready(count) => {
                info!(ready = count, target, "nodes ready");
                Ok(count)
            }
            Polled::TimedOut => {
                let last = self.data_plane.ready_node_count().await.unwrap_or(0);
                Err(Error::readiness_timeout(format!(
                    "{last} of {target} nodes Ready after the configured deadline"
                )))
            }
        }
    }
}
