//! Restart triggering with bounded retries.

use std::sync::Arc;

use tagsync_reconcile::{BackoffPolicy, RestartDirective};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::workloads::{PatchError, TemplateMutation, WorkloadApi};

/// Errors from triggering a restart.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// Every attempt failed transiently. The next cycle will try again.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The API rejected the patch outright.
    #[error("{0}")]
    Permanent(String),
}

impl TriggerError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Issues rolling restarts by patching the pod template.
pub struct RestartTrigger {
    api: Arc<dyn WorkloadApi>,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl RestartTrigger {
    pub fn new(api: Arc<dyn WorkloadApi>, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            api,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Trigger the restart described by a directive.
    ///
    /// The patch sets a pod-template annotation derived from the reference
    /// and new digest. Re-applying it after a lost response or a conflict
    /// writes the same value and does not restart the workload a second time.
    pub async fn trigger(&self, directive: &RestartDirective) -> Result<(), TriggerError> {
        let (key, value) = directive.restart_marker();
        let mutation = TemplateMutation {
            annotations: [(key, value)].into_iter().collect(),
        };

        let mut attempt = 0;
        loop {
            match self.api.patch_workload(&directive.workload, &mutation).await {
                Ok(()) => {
                    info!(
                        workload = %directive.workload,
                        reference = %directive.reference,
                        old_digest = %directive.old_digest,
                        new_digest = %directive.new_digest,
                        attempts = attempt + 1,
                        "Triggered rolling restart"
                    );
                    return Ok(());
                }
                Err(PatchError::Permanent(message)) => {
                    return Err(TriggerError::Permanent(message));
                }
                Err(PatchError::Transient(message)) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(TriggerError::RetriesExhausted {
                            attempts: attempt,
                            last: message,
                        });
                    }

                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        workload = %directive.workload,
                        reference = %directive.reference,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Restart patch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    debug!(workload = %directive.workload, attempt, "Retrying restart patch");
                }
            }
        }
    }
}
