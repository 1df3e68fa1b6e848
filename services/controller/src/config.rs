//! Configuration for the controller.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tagsync_reconcile::{
    BackoffPolicy, WorkloadKey, DEFAULT_API_TIMEOUT, DEFAULT_MAX_CONCURRENT_RESOLVES,
    DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_POLL_INTERVAL, DEFAULT_RESOLVE_TIMEOUT,
    DEFAULT_RETRY_BACKOFF_BASE, DEFAULT_RETRY_BACKOFF_MAX,
};

use crate::workloads::WorkloadScope;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval between reconciliation cycles.
    pub poll_interval: Duration,

    /// Maximum number of registry lookups in flight.
    pub max_concurrent_resolves: usize,

    /// Attempts per restart trigger before deferring to the next cycle.
    pub max_retry_attempts: u32,

    /// Backoff unit between trigger attempts.
    pub retry_backoff_base: Duration,

    /// Upper bound on a single backoff delay.
    pub retry_backoff_max: Duration,

    /// Timeout for one manifest lookup.
    pub resolve_timeout: Duration,

    /// Timeout for one cluster API call.
    pub api_timeout: Duration,

    /// Namespace to watch. `None` watches all namespaces.
    pub namespace: Option<String>,

    /// Label selector restricting managed workloads.
    pub label_selector: Option<String>,

    /// Explicit workloads to manage. When set, each one is fetched by name
    /// and the controller needs only `get` and `patch` on Deployments.
    pub workloads: Vec<WorkloadKey>,

    /// Single-label hosts (such as `reg`) accepted as registries.
    pub registry_hosts: Vec<String>,

    /// Bearer token presented to registries.
    pub registry_token: Option<String>,

    /// Registry hosts reached over plain HTTP.
    pub insecure_registries: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let poll_interval = parse_or(
            &non_empty,
            "TAGSYNC_POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL.as_secs(),
        )
        .map(Duration::from_secs)?;

        let max_concurrent_resolves = parse_or(
            &non_empty,
            "TAGSYNC_MAX_CONCURRENT_RESOLVES",
            DEFAULT_MAX_CONCURRENT_RESOLVES,
        )?;

        let max_retry_attempts =
            parse_or(&non_empty, "TAGSYNC_MAX_RETRY_ATTEMPTS", DEFAULT_MAX_RETRY_ATTEMPTS)?;

        let retry_backoff_base = parse_or(
            &non_empty,
            "TAGSYNC_RETRY_BACKOFF_BASE_MS",
            DEFAULT_RETRY_BACKOFF_BASE.as_millis() as u64,
        )
        .map(Duration::from_millis)?;

        let retry_backoff_max = parse_or(
            &non_empty,
            "TAGSYNC_RETRY_BACKOFF_MAX_MS",
            DEFAULT_RETRY_BACKOFF_MAX.as_millis() as u64,
        )
        .map(Duration::from_millis)?;

        let resolve_timeout = parse_or(
            &non_empty,
            "TAGSYNC_RESOLVE_TIMEOUT_SECS",
            DEFAULT_RESOLVE_TIMEOUT.as_secs(),
        )
        .map(Duration::from_secs)?;

        let api_timeout = parse_or(
            &non_empty,
            "TAGSYNC_API_TIMEOUT_SECS",
            DEFAULT_API_TIMEOUT.as_secs(),
        )
        .map(Duration::from_secs)?;

        if poll_interval.is_zero() {
            bail!("TAGSYNC_POLL_INTERVAL_SECS must be greater than zero");
        }
        if max_concurrent_resolves == 0 {
            bail!("TAGSYNC_MAX_CONCURRENT_RESOLVES must be greater than zero");
        }
        if max_retry_attempts == 0 {
            bail!("TAGSYNC_MAX_RETRY_ATTEMPTS must be greater than zero");
        }

        let namespace = non_empty("TAGSYNC_NAMESPACE");
        let workloads = split_list(non_empty("TAGSYNC_WORKLOADS"))
            .iter()
            .map(|entry| parse_workload(entry, namespace.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        let lowercase = |hosts: Vec<String>| -> Vec<String> {
            hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect()
        };
        let insecure_registries = lowercase(split_list(non_empty("TAGSYNC_INSECURE_REGISTRIES")));
        let registry_hosts = lowercase(split_list(non_empty("TAGSYNC_REGISTRY_HOSTS")));

        Ok(Self {
            poll_interval,
            max_concurrent_resolves,
            max_retry_attempts,
            retry_backoff_base,
            retry_backoff_max,
            resolve_timeout,
            api_timeout,
            namespace,
            label_selector: non_empty("TAGSYNC_LABEL_SELECTOR"),
            workloads,
            registry_hosts,
            registry_token: non_empty("TAGSYNC_REGISTRY_TOKEN"),
            insecure_registries,
            log_level: non_empty("TAGSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Which workloads the controller manages.
    pub fn scope(&self) -> WorkloadScope {
        WorkloadScope {
            namespace: self.namespace.clone(),
            label_selector: self.label_selector.clone(),
            workloads: self.workloads.clone(),
        }
    }

    /// Settings for the reconciliation engine.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: self.poll_interval,
            max_concurrent_resolves: self.max_concurrent_resolves,
            max_retry_attempts: self.max_retry_attempts,
            backoff: BackoffPolicy {
                base: self.retry_backoff_base,
                max: self.retry_backoff_max,
                ..BackoffPolicy::default()
            },
            resolve_timeout: self.resolve_timeout,
            registry_hosts: self.registry_hosts.clone(),
        }
    }
}

/// Split a comma-separated value, dropping empty items.
fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse `namespace/name`, or a bare name in the configured namespace.
fn parse_workload(entry: &str, namespace: Option<&str>) -> Result<WorkloadKey> {
    match entry.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(WorkloadKey::new(ns, name))
        }
        Some(_) => bail!("invalid entry in TAGSYNC_WORKLOADS: {entry:?}"),
        None => Ok(WorkloadKey::new(namespace.unwrap_or("default"), entry)),
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

/// Reconciliation engine configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between cycles.
    pub poll_interval: Duration,

    /// Cap on concurrent digest resolutions.
    pub max_concurrent_resolves: usize,

    /// Attempts per restart trigger.
    pub max_retry_attempts: u32,

    /// Delay between trigger attempts.
    pub backoff: BackoffPolicy,

    /// Timeout handed to the resolver for each lookup.
    pub resolve_timeout: Duration,

    /// Single-label hosts accepted when normalizing image references.
    pub registry_hosts: Vec<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_concurrent_resolves: DEFAULT_MAX_CONCURRENT_RESOLVES,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            registry_hosts: Vec::new(),
        }
    }
}
