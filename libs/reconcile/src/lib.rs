//! Digest tracking and change detection primitives.
//!
//! This library holds the pure parts of the tag-following reconciliation
//! engine. Nothing here performs I/O; the controller service drives these
//! types from its loop. Key concepts:
//!
//! - **Image reference**: registry host, repository and an explicit tag.
//! - **Digest cache**: the last digest each reference is known to run, the
//!   only state that survives from one cycle to the next.
//! - **Classification**: first observation, unchanged, or changed.
//! - **Restart directive**: one per affected workload for a changed tag.
//!
//! # Invariants
//!
//! - First observation of a reference never produces a restart.
//! - The cache advances only after the restart for the new digest succeeded.
//! - Restart markers are deterministic, so re-applying a directive is a no-op.

use std::time::Duration;

pub mod cache;
pub mod detect;
pub mod image_ref;
pub mod retry;
pub mod workload;

pub use cache::{CacheEntry, DigestCache, ObservedDigest};
pub use detect::{classify, Classification};
pub use image_ref::{ImageReference, ReferenceError};
pub use retry::{BackoffPolicy, SkipList};
pub use workload::{
    restart_marker_key, ContainerImage, RestartDirective, WorkloadKey, WorkloadRecord,
    RESTART_MARKER_PREFIX,
};

/// Default interval between reconciliation cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default cap on concurrent registry lookups.
pub const DEFAULT_MAX_CONCURRENT_RESOLVES: usize = 4;

/// Default number of attempts per restart trigger.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default backoff unit between trigger attempts.
pub const DEFAULT_RETRY_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Default ceiling for a single backoff delay.
pub const DEFAULT_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Default timeout for a single registry manifest lookup.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single orchestration API call.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);
