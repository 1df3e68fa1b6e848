//! Workload discovery and mutation against the cluster API.
//!
//! Workloads are Kubernetes Deployments. By default the controller lists
//! them, which needs `list` and `patch` on `deployments`. When the scope
//! names its workloads explicitly each one is fetched by name, and `get` plus
//! `patch` is all the controller needs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use tagsync_reconcile::{ContainerImage, ImageReference, WorkloadKey, WorkloadRecord};
use thiserror::Error;
use tracing::{debug, warn};

/// Field manager recorded on patches.
pub const FIELD_MANAGER: &str = "tagsync-controller";

/// Errors from enumerating workloads.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("cluster API unreachable: {0}")]
    ApiUnreachable(String),
}

/// Errors from mutating a workload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// Timeouts, conflicts, rate limiting and server errors. Worth retrying.
    #[error("transient API error: {0}")]
    Transient(String),

    /// Not found, forbidden, invalid. Retrying will not help.
    #[error("permanent API error: {0}")]
    Permanent(String),
}

impl PatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Which workloads the controller manages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadScope {
    /// Restrict to one namespace; `None` means all namespaces.
    pub namespace: Option<String>,

    /// Label selector in the usual `k=v,k2!=v2` syntax. Ignored when
    /// `workloads` is set.
    pub label_selector: Option<String>,

    /// Workloads fetched by name instead of listed.
    pub workloads: Vec<WorkloadKey>,
}

/// A container as reported by the API, before reference normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContainer {
    pub name: String,
    pub image: String,
}

/// A workload as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWorkload {
    pub namespace: String,
    pub name: String,
    pub containers: Vec<RawContainer>,
}

/// Mutation applied to a workload's pod template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateMutation {
    /// Annotations merged into `spec.template.metadata.annotations`.
    pub annotations: BTreeMap<String, String>,
}

impl TemplateMutation {
    /// JSON merge patch body for the mutation.
    pub fn to_merge_patch(&self) -> serde_json::Value {
        serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": self.annotations
                    }
                }
            }
        })
    }
}

/// Cluster operations the controller depends on.
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// List workloads in scope.
    async fn list_workloads(
        &self,
        scope: &WorkloadScope,
    ) -> Result<Vec<RawWorkload>, IndexError>;

    /// Apply a pod template mutation to one workload.
    async fn patch_workload(
        &self,
        workload: &WorkloadKey,
        mutation: &TemplateMutation,
    ) -> Result<(), PatchError>;
}

/// Deployment access through the Kubernetes API.
pub struct KubeWorkloadApi {
    client: Client,
    timeout: Duration,
}

impl KubeWorkloadApi {
    /// Create a new API wrapper; every call is bounded by `timeout`.
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn deployments(&self, namespace: Option<&str>) -> Api<Deployment> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Fetch named workloads one by one. Missing ones are left out.
    async fn get_named(&self, keys: &[WorkloadKey]) -> Result<Vec<RawWorkload>, IndexError> {
        let mut workloads = Vec::with_capacity(keys.len());

        for key in keys {
            let api = self.deployments(Some(&key.namespace));
            let deployment = tokio::time::timeout(self.timeout, api.get_opt(&key.name))
                .await
                .map_err(|_| {
                    IndexError::ApiUnreachable(format!("get timed out after {:?}", self.timeout))
                })?
                .map_err(|e| IndexError::ApiUnreachable(e.to_string()))?;

            match deployment.and_then(raw_workload) {
                Some(workload) => workloads.push(workload),
                None => debug!(workload = %key, "Configured workload not found"),
            }
        }

        Ok(workloads)
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn list_workloads(
        &self,
        scope: &WorkloadScope,
    ) -> Result<Vec<RawWorkload>, IndexError> {
        if !scope.workloads.is_empty() {
            return self.get_named(&scope.workloads).await;
        }

        let api = self.deployments(scope.namespace.as_deref());
        let mut params = ListParams::default();
        if let Some(selector) = &scope.label_selector {
            params = params.labels(selector);
        }

        let list = tokio::time::timeout(self.timeout, api.list(&params))
            .await
            .map_err(|_| {
                IndexError::ApiUnreachable(format!("list timed out after {:?}", self.timeout))
            })?
            .map_err(|e| IndexError::ApiUnreachable(e.to_string()))?;

        Ok(list.items.into_iter().filter_map(raw_workload).collect())
    }

    async fn patch_workload(
        &self,
        workload: &WorkloadKey,
        mutation: &TemplateMutation,
    ) -> Result<(), PatchError> {
        let api = self.deployments(Some(&workload.namespace));
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        let patch = mutation.to_merge_patch();

        tokio::time::timeout(
            self.timeout,
            api.patch(&workload.name, &params, &Patch::Merge(&patch)),
        )
        .await
        .map_err(|_| PatchError::Transient(format!("patch timed out after {:?}", self.timeout)))?
        .map_err(classify_kube_error)?;

        Ok(())
    }
}

fn raw_workload(deployment: Deployment) -> Option<RawWorkload> {
    let name = deployment.metadata.name?;
    let namespace = deployment.metadata.namespace.unwrap_or_default();
    let containers = deployment
        .spec
        .and_then(|spec| spec.template.spec)
        .map(|pod| {
            pod.containers
                .into_iter()
                .filter_map(|c| {
                    c.image.map(|image| RawContainer {
                        name: c.name,
                        image,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(RawWorkload {
        namespace,
        name,
        containers,
    })
}

/// Sort API failures into retryable and terminal ones.
pub fn classify_kube_error(err: kube::Error) -> PatchError {
    match &err {
        kube::Error::Api(response) => match response.code {
            408 | 409 | 429 | 500..=599 => PatchError::Transient(err.to_string()),
            _ => PatchError::Permanent(err.to_string()),
        },
        _ => PatchError::Transient(err.to_string()),
    }
}

/// Enumerates managed workloads and their trackable image references.
pub struct DeploymentIndex {
    api: Arc<dyn WorkloadApi>,
    scope: WorkloadScope,
    registry_hosts: Vec<String>,
}

impl DeploymentIndex {
    /// `registry_hosts` lists single-label hosts accepted as registries.
    pub fn new(
        api: Arc<dyn WorkloadApi>,
        scope: WorkloadScope,
        registry_hosts: Vec<String>,
    ) -> Self {
        Self {
            api,
            scope,
            registry_hosts,
        }
    }

    /// List workloads in scope.
    ///
    /// Containers whose image cannot be tracked are dropped with a warning;
    /// the rest of the workload is still returned.
    pub async fn list(&self) -> Result<Vec<WorkloadRecord>, IndexError> {
        let raw = self.api.list_workloads(&self.scope).await?;
        debug!(workload_count = raw.len(), "Listed workloads");

        Ok(raw
            .into_iter()
            .map(|w| to_record(w, &self.registry_hosts))
            .collect())
    }
}

fn to_record(raw: RawWorkload, registry_hosts: &[String]) -> WorkloadRecord {
    let containers = raw
        .containers
        .into_iter()
        .filter_map(|c| {
            match ImageReference::normalize_with_hosts(&c.image, registry_hosts) {
                Ok(reference) => Some(ContainerImage {
                    container_name: c.name,
                    reference,
                }),
                Err(e) => {
                    warn!(
                        namespace = %raw.namespace,
                        workload = %raw.name,
                        container = %c.name,
                        image = %c.image,
                        error = %e,
                        "Skipping untrackable image reference"
                    );
                    None
                }
            }
        })
        .collect();

    WorkloadRecord {
        namespace: raw.namespace,
        name: raw.name,
        containers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use rstest::rstest;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    #[rstest]
    #[case(408, true)]
    #[case(409, true)]
    #[case(429, true)]
    #[case(503, true)]
    #[case(403, false)]
    #[case(404, false)]
    #[case(422, false)]
    fn test_classify_kube_error(#[case] code: u16, #[case] transient: bool) {
        assert_eq!(classify_kube_error(api_error(code)).is_transient(), transient);
    }

    #[test]
    fn test_merge_patch_body() {
        let mut mutation = TemplateMutation::default();
        mutation
            .annotations
            .insert("tagsync.io/digest-abc".to_string(), "sha256:d2".to_string());

        assert_eq!(
            mutation.to_merge_patch(),
            serde_json::json!({
                "spec": {"template": {"metadata": {"annotations": {
                    "tagsync.io/digest-abc": "sha256:d2"
                }}}}
            })
        );
    }

    #[test]
    fn test_to_record_drops_untrackable_containers() {
        let raw = RawWorkload {
            namespace: "default".to_string(),
            name: "web".to_string(),
            containers: vec![
                RawContainer {
                    name: "app".to_string(),
                    image: "reg.io/app:stable".to_string(),
                },
                RawContainer {
                    name: "legacy".to_string(),
                    image: "nginx".to_string(),
                },
                RawContainer {
                    name: "pinned".to_string(),
                    image: "reg.io/proxy@sha256:abc".to_string(),
                },
                RawContainer {
                    name: "local".to_string(),
                    image: "reg/app:stable".to_string(),
                },
            ],
        };

        let record = to_record(raw.clone(), &[]);
        assert_eq!(record.key(), WorkloadKey::new("default", "web"));
        assert_eq!(record.containers.len(), 1);
        assert_eq!(record.containers[0].container_name, "app");

        let record = to_record(raw, &["reg".to_string()]);
        let names: Vec<&str> = record
            .containers
            .iter()
            .map(|c| c.container_name.as_str())
            .collect();
        assert_eq!(names, vec!["app", "local"]);
    }

    #[test]
    fn test_raw_workload_from_deployment() {
        let deployment: Deployment = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "web", "namespace": "apps"},
            "spec": {
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"containers": [
                        {"name": "app", "image": "reg.io/app:stable"},
                        {"name": "no-image"}
                    ]}
                }
            }
        }))
        .unwrap();

        let raw = raw_workload(deployment).unwrap();
        assert_eq!(raw.namespace, "apps");
        assert_eq!(raw.name, "web");
        assert_eq!(
            raw.containers,
            vec![RawContainer {
                name: "app".to_string(),
                image: "reg.io/app:stable".to_string(),
            }]
        );
    }
}
