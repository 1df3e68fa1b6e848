//! Change detection.

use crate::cache::DigestCache;
use crate::image_ref::ImageReference;

/// Outcome of comparing a resolved digest against the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Never seen before. Seed the cache, do not restart anything.
    FirstObservation,

    /// Digest matches the last known digest.
    Unchanged,

    /// The tag now points somewhere else.
    Changed { old: String, new: String },
}

impl Classification {
    /// Returns true if workloads using the reference need a restart.
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

/// Classify a freshly resolved digest. Pure; the caller applies the outcome.
pub fn classify(
    reference: &ImageReference,
    resolved_digest: &str,
    cache: &DigestCache,
) -> Classification {
    match cache.last_known_digest(reference) {
        None => Classification::FirstObservation,
        Some(known) if known == resolved_digest => Classification::Unchanged,
        Some(known) => Classification::Changed {
            old: known.to_string(),
            new: resolved_digest.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObservedDigest;
    use proptest::prelude::*;

    fn reference() -> ImageReference {
        "reg.io/app:stable".parse().unwrap()
    }

    /// Apply outcomes the way the loop does when every trigger succeeds.
    fn run_sequence(digests: &[String]) -> (usize, DigestCache) {
        let mut cache = DigestCache::new();
        let mut restarts = 0;

        for (cycle, digest) in digests.iter().enumerate() {
            let cycle = cycle as u64 + 1;
            match classify(&reference(), digest, &cache) {
                Classification::FirstObservation => {
                    cache.seed(&ObservedDigest {
                        reference: reference(),
                        digest: digest.clone(),
                        observed_at_cycle: cycle,
                    });
                }
                Classification::Unchanged => cache.touch(&reference(), cycle),
                Classification::Changed { new, .. } => {
                    restarts += 1;
                    cache.advance(&reference(), &new, cycle);
                }
            }
        }

        (restarts, cache)
    }

    #[test]
    fn test_stable_scenario() {
        let mut cache = DigestCache::new();
        assert_eq!(
            classify(&reference(), "sha256:d1", &cache),
            Classification::FirstObservation
        );

        cache.seed(&ObservedDigest {
            reference: reference(),
            digest: "sha256:d1".to_string(),
            observed_at_cycle: 1,
        });
        assert_eq!(
            classify(&reference(), "sha256:d1", &cache),
            Classification::Unchanged
        );
        assert_eq!(
            classify(&reference(), "sha256:d2", &cache),
            Classification::Changed {
                old: "sha256:d1".to_string(),
                new: "sha256:d2".to_string(),
            }
        );
    }

    #[test]
    fn test_unadvanced_change_is_reported_again() {
        let mut cache = DigestCache::new();
        cache.seed(&ObservedDigest {
            reference: reference(),
            digest: "sha256:d1".to_string(),
            observed_at_cycle: 1,
        });

        let first = classify(&reference(), "sha256:d2", &cache);
        let second = classify(&reference(), "sha256:d2", &cache);
        assert!(first.is_changed());
        assert_eq!(first, second);
    }

    proptest! {
        #[test]
        fn prop_restart_once_per_digest_transition(
            digests in prop::collection::vec("sha256:[a-c]", 1..40)
        ) {
            let expected = digests.windows(2).filter(|w| w[0] != w[1]).count();
            let (restarts, cache) = run_sequence(&digests);

            prop_assert_eq!(restarts, expected);
            prop_assert_eq!(
                cache.last_known_digest(&reference()),
                digests.last().map(String::as_str)
            );
        }

        #[test]
        fn prop_first_observation_never_restarts(digest in "sha256:[0-9a-f]{8}") {
            let (restarts, _) = run_sequence(&[digest]);
            prop_assert_eq!(restarts, 0);
        }
    }
}
