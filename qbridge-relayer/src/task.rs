//! One submission task per pending digest.
//!
//! The task owns its retry state (attempt count, next retry time, last error)
//! and stops early when the coordinator's shutdown signal fires.

use std::sync::Arc;
use std::time::Duration;

use qbridge_core::{digest_hex, Digest};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::submitters::{SubmissionReceipt, SubmissionRequest, Submitter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Confirmed(SubmissionReceipt),
    /// The destination had already consumed the digest.
    AlreadyDelivered,
    Exhausted { attempts: u32, last_error: String },
    Cancelled,
}

impl TaskOutcome {
    /// Whether the message is known to be on the destination.
    pub fn is_delivered(&self) -> bool {
        matches!(self, TaskOutcome::Confirmed(_) | TaskOutcome::AlreadyDelivered)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskState {
    pub attempts: u32,
    pub next_retry_at: Option<Instant>,
    pub last_error: Option<String>,
}

pub struct SubmissionTask {
    request: SubmissionRequest,
    submitter: Arc<dyn Submitter>,
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
    state: TaskState,
}

impl SubmissionTask {
    pub fn new(
        request: SubmissionRequest,
        submitter: Arc<dyn Submitter>,
        policy: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            request,
            submitter,
            policy,
            shutdown,
            state: TaskState::default(),
        }
    }

    pub fn digest(&self) -> Digest {
        self.request.digest()
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Jitter, then submit until confirmed, exhausted or cancelled.
    pub async fn run(mut self) -> (TaskOutcome, TaskState) {
        let outcome = self.drive().await;
        (outcome, self.state)
    }

    async fn drive(&mut self) -> TaskOutcome {
        let digest = self.digest();
        let jitter = self.policy.jitter();
        debug!(digest = %digest_hex(&digest), ?jitter, "pre-submission jitter");
        if !self.wait(jitter).await {
            return TaskOutcome::Cancelled;
        }

        loop {
            self.state.attempts += 1;
            self.state.next_retry_at = None;

            let err = match self.submitter.submit(&self.request).await {
                Ok(receipt) => {
                    info!(
                        digest = %digest_hex(&digest),
                        attempts = self.state.attempts,
                        "submission confirmed"
                    );
                    return TaskOutcome::Confirmed(receipt);
                }
                Err(err) if err.is_delivered() => {
                    info!(digest = %digest_hex(&digest), "already delivered");
                    return TaskOutcome::AlreadyDelivered;
                }
                Err(err) => err,
            };

            warn!(
                digest = %digest_hex(&digest),
                attempt = self.state.attempts,
                error = %err,
                "submission failed"
            );
            self.state.last_error = Some(err.to_string());

            if self.policy.is_exhausted(self.state.attempts) {
                return TaskOutcome::Exhausted {
                    attempts: self.state.attempts,
                    last_error: err.to_string(),
                };
            }

            let delay = self.policy.delay_for(self.state.attempts);
            self.state.next_retry_at = Some(Instant::now() + delay);
            if !self.wait(delay).await {
                return TaskOutcome::Cancelled;
            }
        }
    }

    /// Sleep for `delay`. False if shutdown was signalled first.
    async fn wait(&mut self, delay: Duration) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone, nobody can cancel us any more
                        (&mut sleep).await;
                        return true;
                    }
                    if *self.shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SubmissionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionTask")
            .field("digest", &digest_hex(&self.digest()))
            .field("destination", &self.submitter.destination())
            .field("state", &self.state)
            .finish()
    }
}
