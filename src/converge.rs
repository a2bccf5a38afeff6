//! Convergence primitives shared by every resource manager
//!
//! Two small building blocks cover the whole lifecycle:
//!
//! - [`plan`] decides between reusing an observed resource and creating a
//!   fresh one (the describe-or-create pattern), as a pure function that is
//!   testable without any remote service.
//! - [`poll_until`] is the single polling primitive behind every waiter,
//!   parameterized by interval, predicate, and an optional deadline. Dropping
//!   the returned future cancels the wait cooperatively, so callers own
//!   cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Result;

/// Decision produced by [`plan`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// The observed resource satisfies the desired state; converge on it
    UseExisting,
    /// No resource was observed; submit a create request
    Create,
}

/// Decide whether an observed resource can be reused or a new one is needed
///
/// `healthy` judges an observed resource: `Ok(())` means it is usable (or
/// will become usable by waiting), an error means it is present but broken
/// and the caller must surface that rather than silently recreating.
pub fn plan<O, F>(observed: Option<&O>, healthy: F) -> Result<Action>
where
    F: FnOnce(&O) -> Result<()>,
{
    match observed {
        None => Ok(Action::Create),
        Some(resource) => {
            healthy(resource)?;
            Ok(Action::UseExisting)
        }
    }
}

/// Outcome of a bounded poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polled<T> {
    /// The predicate was satisfied with this value
    Ready(T),
    /// The deadline elapsed before the predicate was satisfied
    TimedOut,
}

impl<T> Polled<T> {
    /// The ready value, if the poll completed
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::TimedOut => None,
        }
    }
}

/// How often to check, and for how long
#[derive(Clone, Copy, Debug)]
pub struct PollOpts {
    /// Sleep between checks
    pub interval: Duration,
    /// Give up after this long; `None` polls until cancelled by the caller
    pub deadline: Option<Duration>,
}

impl PollOpts {
    /// Poll at the given interval with no deadline
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Bound the poll by a deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Bound the poll by an optional deadline
    pub fn with_optional_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Poll `check` until it yields a value, the deadline elapses, or it fails
///
/// The first check runs immediately, so an already-satisfied predicate
/// returns without sleeping. `check` returning `Ok(None)` means "not yet";
/// an error is propagated as-is and ends the poll.
pub async fn poll_until<T, F, Fut>(
    opts: PollOpts,
    operation: &str,
    mut check: F,
) -> Result<Polled<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    loop {
        if let Some(value) = check().await? {
            return Ok(Polled::Ready(value));
        }

        if let Some(deadline) = opts.deadline {
            if started.elapsed() >= deadline {
                warn!(
                    operation = %operation,
                    waited_secs = started.elapsed().as_secs(),
                    "gave up waiting"
                );
                return Ok(Polled::TimedOut);
            }
        }

        debug!(operation = %operation, "not ready, sleeping");
        tokio::time::sleep(opts.interval).await;
    }
}
