//! One reconciliation cycle.
//!
//! A cycle:
//! - Lists managed workloads and collects the distinct image references
//! - Resolves each reference once, on a bounded pool of tasks
//! - Classifies every resolved digest against the digest cache
//! - Issues one restart directive per workload using a changed reference
//! - Advances the cache only for references whose restarts all succeeded
//!
//! The cache and the skip list are owned here and written only in the
//! sequential aggregation phase after resolution has finished.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;
use tagsync_reconcile::{
    classify, Classification, DigestCache, ImageReference, ObservedDigest, RestartDirective,
    SkipList, WorkloadKey,
};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{self, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::config::ReconcilerConfig;
use crate::registry::{DigestResolver, ResolveError};
use crate::trigger::{RestartTrigger, TriggerError};
use crate::workloads::{DeploymentIndex, IndexError, WorkloadApi, WorkloadScope};

/// Reasons a whole cycle did not complete.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Workloads could not be listed; nothing was decided.
    #[error("failed to index workloads: {0}")]
    Index(#[from] IndexError),

    /// Shutdown was requested before any restart was decided.
    #[error("cycle cancelled during {0}")]
    Cancelled(&'static str),
}

/// Statistics for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub workloads: usize,
    pub references: usize,
    pub resolve_failures: usize,
    pub first_observations: usize,
    pub unchanged: usize,
    pub changed: usize,
    pub restarts_succeeded: usize,
    pub restarts_failed: usize,
    pub restarts_skipped: usize,
    pub cache_advanced: usize,
    pub cache_pruned: usize,

    /// Directives issued this cycle, in trigger order per workload.
    pub directives: Vec<RestartDirective>,
}

/// A changed reference waiting for its restarts to land.
struct PendingChange {
    new_digest: String,
    blocked: bool,
    failed: bool,
}

/// Drives reconciliation cycles and owns the cross-cycle state.
pub struct Reconciler {
    index: DeploymentIndex,
    resolver: Arc<dyn DigestResolver>,
    trigger: RestartTrigger,
    config: ReconcilerConfig,
    cache: DigestCache,
    skips: SkipList,
    cycle: u64,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        api: Arc<dyn WorkloadApi>,
        resolver: Arc<dyn DigestResolver>,
        scope: WorkloadScope,
        config: ReconcilerConfig,
    ) -> Self {
        let trigger = RestartTrigger::new(
            Arc::clone(&api),
            config.max_retry_attempts,
            config.backoff.clone(),
        );

        Self {
            index: DeploymentIndex::new(api, scope, config.registry_hosts.clone()),
            resolver,
            trigger,
            config,
            cache: DigestCache::new(),
            skips: SkipList::new(),
            cycle: 0,
        }
    }

    /// The digest cache as of the last completed cycle.
    pub fn cache(&self) -> &DigestCache {
        &self.cache
    }

    /// (workload, reference) pairs currently skipped after permanent failures.
    pub fn skipped(&self) -> &SkipList {
        &self.skips
    }

    /// Number of cycles started so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one reconciliation cycle.
    ///
    /// Shutdown is honoured up to the point restarts are decided. Once the
    /// trigger phase starts it runs to completion so the cache matches what
    /// was actually applied to the cluster.
    #[instrument(skip(self, shutdown), fields(cycle = self.cycle + 1))]
    pub async fn reconcile_once(
        &mut self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, ReconcileError> {
        self.cycle += 1;
        let cycle = self.cycle;
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };

        let workloads = self.index.list().await?;
        report.workloads = workloads.len();

        let released = self.skips.retain_present(&workloads);
        if released > 0 {
            debug!(released, "Released skipped pairs for workloads no longer indexed");
        }

        let references: BTreeSet<ImageReference> = workloads
            .iter()
            .flat_map(|w| w.containers.iter().map(|c| c.reference.clone()))
            .collect();
        report.references = references.len();

        if *shutdown.borrow() {
            return Err(ReconcileError::Cancelled("indexing"));
        }

        let mut shutdown_rx = shutdown.clone();
        let resolved = tokio::select! {
            resolved = self.resolve_all(&references, cycle) => resolved,
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                return Err(ReconcileError::Cancelled("resolution"));
            }
        };

        // Aggregation: the only place the cache is written.
        let mut pending: BTreeMap<ImageReference, PendingChange> = BTreeMap::new();
        let mut directives = Vec::new();

        for (reference, result) in resolved {
            let observed = match result {
                Ok(observed) => observed,
                Err(e) => {
                    warn!(
                        reference = %reference,
                        error = %e,
                        "Failed to resolve digest, will retry next cycle"
                    );
                    report.resolve_failures += 1;
                    continue;
                }
            };

            match classify(&reference, &observed.digest, &self.cache) {
                Classification::FirstObservation => {
                    debug!(
                        reference = %reference,
                        digest = %observed.digest,
                        "First observation, recording baseline"
                    );
                    self.cache.seed(&observed);
                    report.first_observations += 1;
                }
                Classification::Unchanged => {
                    self.cache.touch(&reference, cycle);
                    report.unchanged += 1;
                }
                Classification::Changed { old, new } => {
                    report.changed += 1;

                    let mut blocked = false;
                    let mut issued = 0;
                    for workload in workloads.iter().filter(|w| w.uses(&reference)) {
                        if self.skips.contains(&workload.key(), &reference) {
                            debug!(
                                workload = %workload.key(),
                                reference = %reference,
                                "Skipping workload after permanent failure"
                            );
                            blocked = true;
                            report.restarts_skipped += 1;
                            continue;
                        }
                        directives.push(RestartDirective::for_workload(
                            workload, &reference, &old, &new,
                        ));
                        issued += 1;
                    }

                    if issued > 0 {
                        info!(
                            reference = %reference,
                            old_digest = %old,
                            new_digest = %new,
                            workloads = issued,
                            "Tag points to a new digest"
                        );
                    } else {
                        debug!(
                            reference = %reference,
                            old_digest = %old,
                            new_digest = %new,
                            "Tag points to a new digest, every workload using it is skipped"
                        );
                    }

                    pending.insert(
                        reference,
                        PendingChange {
                            new_digest: new,
                            blocked,
                            failed: false,
                        },
                    );
                }
            }
        }

        let outcomes = self.trigger_all(&directives).await;
        for (directive, outcome) in outcomes {
            match outcome {
                Ok(()) => report.restarts_succeeded += 1,
                Err(e) => {
                    report.restarts_failed += 1;
                    if let Some(change) = pending.get_mut(&directive.reference) {
                        change.failed = true;
                    }

                    if e.is_permanent() {
                        warn!(
                            workload = %directive.workload,
                            reference = %directive.reference,
                            error = %e,
                            "Restart rejected, skipping workload until it is re-indexed"
                        );
                        self.skips
                            .insert(directive.workload.clone(), directive.reference.clone());
                    } else {
                        warn!(
                            workload = %directive.workload,
                            reference = %directive.reference,
                            error = %e,
                            "Restart failed, will retry next cycle"
                        );
                    }
                }
            }
        }

        for (reference, change) in pending {
            if change.blocked || change.failed {
                debug!(
                    reference = %reference,
                    "Leaving cache entry stale until all restarts succeed"
                );
                continue;
            }
            if self.cache.advance(&reference, &change.new_digest, cycle) {
                report.cache_advanced += 1;
            }
        }

        report.cache_pruned = self.cache.retain_referenced(&references);
        report.directives = directives;

        info!(
            workloads = report.workloads,
            references = report.references,
            resolve_failures = report.resolve_failures,
            changed = report.changed,
            restarts_succeeded = report.restarts_succeeded,
            restarts_failed = report.restarts_failed,
            restarts_skipped = report.restarts_skipped,
            "Reconciliation cycle complete"
        );

        Ok(report)
    }

    /// Resolve every reference, at most `max_concurrent_resolves` at a time.
    ///
    /// A lookup task that panics counts as an unreachable registry for its
    /// reference.
    async fn resolve_all(
        &self,
        references: &BTreeSet<ImageReference>,
        cycle: u64,
    ) -> Vec<(ImageReference, Result<ObservedDigest, ResolveError>)> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_resolves.max(1)));
        let timeout = self.config.resolve_timeout;
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<task::Id, ImageReference> = HashMap::new();

        for reference in references {
            let resolver = Arc::clone(&self.resolver);
            let semaphore = Arc::clone(&semaphore);
            let task_reference = reference.clone();

            let handle = tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                resolver
                    .resolve(&task_reference, timeout)
                    .await
                    .map(|digest| ObservedDigest {
                        reference: task_reference,
                        digest,
                        observed_at_cycle: cycle,
                    })
            });
            in_flight.insert(handle.id(), reference.clone());
        }

        let mut results = Vec::with_capacity(references.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    if let Some(reference) = in_flight.remove(&id) {
                        results.push((reference, result));
                    }
                }
                Err(e) => {
                    let Some(reference) = in_flight.remove(&e.id()) else {
                        warn!(error = %e, "Resolver task failed");
                        continue;
                    };
                    warn!(reference = %reference, error = %e, "Resolver task failed");
                    let failure = ResolveError::RegistryUnreachable {
                        reference: reference.to_string(),
                        message: format!("resolver task failed: {e}"),
                    };
                    results.push((reference, Err(failure)));
                }
            }
        }

        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Trigger all directives. Workloads run concurrently; directives for the
    /// same workload run one after another.
    async fn trigger_all(
        &self,
        directives: &[RestartDirective],
    ) -> Vec<(RestartDirective, Result<(), TriggerError>)> {
        let mut by_workload: BTreeMap<WorkloadKey, Vec<&RestartDirective>> = BTreeMap::new();
        for directive in directives {
            by_workload
                .entry(directive.workload.clone())
                .or_default()
                .push(directive);
        }

        let trigger = &self.trigger;
        let groups = by_workload.into_values().map(|group| async move {
            let mut outcomes = Vec::with_capacity(group.len());
            for directive in group {
                let outcome = trigger.trigger(directive).await;
                outcomes.push((directive.clone(), outcome));
            }
            outcomes
        });

        join_all(groups).await.into_iter().flatten().collect()
    }
}

/// Resolve once shutdown has been requested (or its sender is gone).
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
