//! tagsync controller library
//!
//! Keeps Kubernetes Deployments on the image their tags currently point to.
//! When a tag such as `registry/app:stable` is moved to a new digest, every
//! Deployment running that tag gets a rolling restart.
//!
//! ## Architecture
//!
//! ```text
//! ControllerWorker (tick / shutdown)
//! └── Reconciler (one cycle, owns the digest cache)
//!     ├── DeploymentIndex   (list workloads, extract image references)
//!     ├── DigestResolver    (bounded parallel manifest lookups)
//!     └── RestartTrigger    (idempotent pod-template patch, bounded retry)
//! ```
//!
//! ## Modules
//!
//! - `config`: Environment configuration
//! - `registry`: OCI registry digest resolution
//! - `workloads`: Deployment listing and patching
//! - `trigger`: Restart triggering with backoff
//! - `reconciler`: One reconciliation cycle
//! - `worker`: The periodic control loop

pub mod config;
pub mod reconciler;
pub mod registry;
pub mod trigger;
pub mod worker;
pub mod workloads;

pub use config::{Config, ReconcilerConfig};
pub use reconciler::{CycleReport, ReconcileError, Reconciler};
pub use registry::{DigestResolver, RegistryConfig, RegistryResolver, ResolveError};
pub use trigger::{RestartTrigger, TriggerError};
pub use worker::{ControllerWorker, LoopState};
pub use workloads::{
    DeploymentIndex, IndexError, KubeWorkloadApi, PatchError, RawContainer, RawWorkload,
    TemplateMutation, WorkloadApi, WorkloadScope,
};
