//! Workload records and restart directives.

use std::collections::BTreeSet;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::image_ref::ImageReference;

/// Annotation prefix used for pod-template restart markers.
pub const RESTART_MARKER_PREFIX: &str = "tagsync.io/digest-";

/// Identity of a workload within the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A container and the image it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    pub container_name: String,
    pub reference: ImageReference,
}

/// One managed workload as seen by the current cycle.
///
/// Built fresh by the index every cycle and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRecord {
    pub namespace: String,
    pub name: String,

    /// Trackable containers, in pod-template order.
    pub containers: Vec<ContainerImage>,
}

impl WorkloadRecord {
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(&self.namespace, &self.name)
    }

    /// Distinct references used by this workload.
    pub fn references(&self) -> BTreeSet<&ImageReference> {
        self.containers.iter().map(|c| &c.reference).collect()
    }

    /// Names of the containers running the given reference.
    pub fn containers_using(&self, reference: &ImageReference) -> Vec<String> {
        self.containers
            .iter()
            .filter(|c| &c.reference == reference)
            .map(|c| c.container_name.clone())
            .collect()
    }

    pub fn uses(&self, reference: &ImageReference) -> bool {
        self.containers.iter().any(|c| &c.reference == reference)
    }
}

/// Instruction to restart one workload because one of its tags moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartDirective {
    pub workload: WorkloadKey,

    /// Containers in the workload that run `reference`.
    pub containers: Vec<String>,

    pub reference: ImageReference,
    pub old_digest: String,
    pub new_digest: String,
}

impl RestartDirective {
    /// Build the directive for a workload affected by a digest change.
    pub fn for_workload(
        workload: &WorkloadRecord,
        reference: &ImageReference,
        old_digest: &str,
        new_digest: &str,
    ) -> Self {
        Self {
            workload: workload.key(),
            containers: workload.containers_using(reference),
            reference: reference.clone(),
            old_digest: old_digest.to_string(),
            new_digest: new_digest.to_string(),
        }
    }

    /// Pod-template annotation that forces the restart.
    ///
    /// The key depends only on the reference and the value only on the new
    /// digest, so applying the same directive twice leaves the template hash
    /// unchanged the second time.
    pub fn restart_marker(&self) -> (String, String) {
        (restart_marker_key(&self.reference), self.new_digest.clone())
    }
}

/// Annotation key tracking the digest a workload was last restarted for.
pub fn restart_marker_key(reference: &ImageReference) -> String {
    let hash = Sha256::digest(reference.to_string().as_bytes());
    format!("{}{}", RESTART_MARKER_PREFIX, hex::encode(&hash[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> WorkloadRecord {
        WorkloadRecord {
            namespace: "default".to_string(),
            name: "web".to_string(),
            containers: vec![
                ContainerImage {
                    container_name: "app".to_string(),
                    reference: "reg.io/app:stable".parse().unwrap(),
                },
                ContainerImage {
                    container_name: "sidecar".to_string(),
                    reference: "reg.io/proxy:v1".parse().unwrap(),
                },
                ContainerImage {
                    container_name: "app-debug".to_string(),
                    reference: "reg.io/app:stable".parse().unwrap(),
                },
            ],
        }
    }

    #[test]
    fn test_record_references() {
        let record = record();
        assert_eq!(record.references().len(), 2);
        assert_eq!(record.key().to_string(), "default/web");

        let app = "reg.io/app:stable".parse().unwrap();
        assert!(record.uses(&app));
        assert_eq!(record.containers_using(&app), vec!["app", "app-debug"]);
    }

    #[test]
    fn test_restart_marker_is_deterministic() {
        let record = record();
        let app: ImageReference = "reg.io/app:stable".parse().unwrap();
        let proxy: ImageReference = "reg.io/proxy:v1".parse().unwrap();

        let a = RestartDirective::for_workload(&record, &app, "sha256:d1", "sha256:d2");
        let b = RestartDirective::for_workload(&record, &app, "sha256:d1", "sha256:d2");
        assert_eq!(a.restart_marker(), b.restart_marker());

        let (key, value) = a.restart_marker();
        assert!(key.starts_with(RESTART_MARKER_PREFIX));
        // prefix name segment must stay within the 63 character annotation limit
        assert!(key.len() - "tagsync.io/".len() <= 63);
        assert_eq!(value, "sha256:d2");

        assert_ne!(restart_marker_key(&app), restart_marker_key(&proxy));
    }
}
