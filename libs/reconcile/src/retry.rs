//! Retry bookkeeping: backoff for transient failures and a skip list for
//! permanent ones.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;

use crate::image_ref::ImageReference;
use crate::workload::{WorkloadKey, WorkloadRecord};

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: crate::DEFAULT_RETRY_BACKOFF_BASE,
            max: crate::DEFAULT_RETRY_BACKOFF_MAX,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(31) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let final_delay = if jitter > 0.0 {
            let spread = delay * jitter;
            delay + rand::rng().random_range(-spread..=spread)
        } else {
            delay
        };

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

/// (workload, reference) pairs whose restart failed permanently.
///
/// A pair stays skipped for the rest of the run, or until its workload drops
/// out of the index; when it comes back it is tried again.
#[derive(Debug, Clone, Default)]
pub struct SkipList {
    pairs: BTreeSet<(WorkloadKey, ImageReference)>,
}

impl SkipList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a pair as permanently failed.
    pub fn insert(&mut self, workload: WorkloadKey, reference: ImageReference) -> bool {
        self.pairs.insert((workload, reference))
    }

    pub fn contains(&self, workload: &WorkloadKey, reference: &ImageReference) -> bool {
        self.pairs.contains(&(workload.clone(), reference.clone()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Forget pairs whose workload is absent from the current index.
    ///
    /// Returns the number of pairs released.
    pub fn retain_present(&mut self, workloads: &[WorkloadRecord]) -> usize {
        let present: BTreeSet<WorkloadKey> = workloads.iter().map(WorkloadRecord::key).collect();
        let before = self.pairs.len();
        self.pairs.retain(|(workload, _)| present.contains(workload));
        before - self.pairs.len()
    }
}
