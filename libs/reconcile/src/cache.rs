//! Cross-cycle digest cache.
//!
//! The cache is the only state carried from one reconciliation cycle to the
//! next. It is owned by the loop driver and mutated only in the sequential
//! aggregation phase of a cycle.
//!
//! # Invariants
//!
//! - An entry is created on first observation, without a restart.
//! - `last_known_digest` only moves forward after a restart trigger for the
//!   new digest has been accepted.
//! - A missing entry means "never observed".

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::image_ref::ImageReference;

/// A digest freshly resolved for a reference during one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedDigest {
    pub reference: ImageReference,

    /// Opaque content identifier, compared but never parsed.
    pub digest: String,

    pub observed_at_cycle: u64,
}

/// Cached state for one tracked reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub reference: ImageReference,

    /// Digest the running workloads are known to be on.
    pub last_known_digest: String,

    /// Cycle in which the reference was first seen.
    pub first_observed_cycle: u64,

    /// Most recent cycle that resolved the reference.
    pub last_observed_cycle: u64,

    /// Cycle of the last successful restart trigger, if any.
    pub last_trigger_cycle: Option<u64>,

    /// Wall-clock time of the last digest change.
    pub updated_at: DateTime<Utc>,
}

/// Per-reference record of the last digest observed.
#[derive(Debug, Clone, Default)]
pub struct DigestCache {
    entries: BTreeMap<ImageReference, CacheEntry>,
}

impl DigestCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the entry for a reference.
    pub fn get(&self, reference: &ImageReference) -> Option<&CacheEntry> {
        self.entries.get(reference)
    }

    /// The digest last confirmed for a reference.
    pub fn last_known_digest(&self, reference: &ImageReference) -> Option<&str> {
        self.entries
            .get(reference)
            .map(|e| e.last_known_digest.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Record a first observation.
    ///
    /// Returns false and leaves the cache untouched if the reference is
    /// already tracked.
    pub fn seed(&mut self, observed: &ObservedDigest) -> bool {
        if self.entries.contains_key(&observed.reference) {
            return false;
        }

        self.entries.insert(
            observed.reference.clone(),
            CacheEntry {
                reference: observed.reference.clone(),
                last_known_digest: observed.digest.clone(),
                first_observed_cycle: observed.observed_at_cycle,
                last_observed_cycle: observed.observed_at_cycle,
                last_trigger_cycle: None,
                updated_at: Utc::now(),
            },
        );
        true
    }

    /// Note that a reference was resolved in a cycle without changing its digest.
    pub fn touch(&mut self, reference: &ImageReference, cycle: u64) {
        if let Some(entry) = self.entries.get_mut(reference) {
            entry.last_observed_cycle = entry.last_observed_cycle.max(cycle);
        }
    }

    /// Advance a reference to a new digest after its restarts were accepted.
    ///
    /// Returns false if the reference was never seeded.
    pub fn advance(&mut self, reference: &ImageReference, new_digest: &str, cycle: u64) -> bool {
        let Some(entry) = self.entries.get_mut(reference) else {
            return false;
        };

        if entry.last_known_digest != new_digest {
            entry.last_known_digest = new_digest.to_string();
            entry.updated_at = Utc::now();
        }
        entry.last_observed_cycle = entry.last_observed_cycle.max(cycle);
        entry.last_trigger_cycle = Some(cycle);
        true
    }

    /// Drop entries for references no indexed workload uses any more.
    ///
    /// Returns the number of entries removed.
    pub fn retain_referenced(&mut self, referenced: &BTreeSet<ImageReference>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|reference, _| referenced.contains(reference));
        before - self.entries.len()
    }
}
