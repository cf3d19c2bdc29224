// Fixed-interval polling used for batch jobs, ingestion and export operations
// No backoff: the latency being waited on belongs to the external service.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Default number of batch job status checks
pub const DEFAULT_JOB_POLL_ATTEMPTS: u32 = 30;

/// Default gap between batch job status checks (2 minutes)
pub const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_secs(120);

/// How many checks to make and how long to sleep before each one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Upper bound of wall-clock time spent sleeping
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_POLL_ATTEMPTS, DEFAULT_JOB_POLL_INTERVAL)
    }
}

/// Result of a single check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<T> {
    Ready(T),
    Pending,
    Failed(String),
}

/// Final outcome of a polling loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome<T> {
    Ready { value: T, attempts: u32 },
    Failed { reason: String, attempts: u32 },
    TimedOut { attempts: u32 },
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. }
            | PollOutcome::Failed { attempts, .. }
            | PollOutcome::TimedOut { attempts } => *attempts,
        }
    }
}

/// Sleep, check, repeat until the check settles or attempts run out.
///
/// A check error counts as `Pending`; the attempt budget still bounds the loop.
pub async fn poll_until<T, E, F, Fut>(policy: PollPolicy, target: &str, mut check: F) -> PollOutcome<T>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Check<T>, E>>,
{
    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;
        crate::telemetry::record_poll_attempt(target);

        match check().await {
            Ok(Check::Ready(value)) => {
                info!(poll_target = target, attempt = attempt, "Poll target is ready");
                return PollOutcome::Ready {
                    value,
                    attempts: attempt,
                };
            }
            Ok(Check::Failed(reason)) => {
                info!(poll_target = target, attempt = attempt, reason = %reason, "Poll target failed");
                return PollOutcome::Failed {
                    reason,
                    attempts: attempt,
                };
            }
            Ok(Check::Pending) => {
                debug!(poll_target = target, attempt = attempt, "Still in processing");
            }
            Err(e) => {
                debug!(poll_target = target, attempt = attempt, error = %e, "Status check failed, will retry");
            }
        }
    }

    info!(
        poll_target = target,
        attempts = policy.max_attempts,
        "Poll attempts exhausted"
    );
    PollOutcome::TimedOut {
        attempts: policy.max_attempts,
    }
}
