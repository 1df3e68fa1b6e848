//! Image reference parsing and normalization.
//!
//! Only references that spell out both a registry host and a tag can be
//! tracked. Implicit defaults (`alpine` meaning `docker.io/library/alpine:latest`)
//! are rejected, as are digest-pinned references which can never change.
//!
//! A first path component is taken as a registry host when it contains a `.`
//! or `:`, is `localhost`, or is one of the caller's known registry hosts.
//! Single-label hosts such as `reg` in `reg/app:stable` are otherwise
//! indistinguishable from Docker Hub namespaces, so they must be configured.
//!
//! Examples:
//! - `ghcr.io/org/repo:v1` -> (ghcr.io, org/repo, v1)
//! - `localhost:5000/myapp:test` -> (localhost:5000, myapp, test)
//! - `docker.io/nginx:1.27` -> (docker.io, library/nginx, 1.27)

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Canonical host name for Docker Hub references.
pub const DOCKER_HUB_HOST: &str = "docker.io";

/// Host that actually serves the Docker Hub registry API.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Aliases that all refer to Docker Hub.
const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Longest tag accepted by the distribution spec.
const MAX_TAG_LEN: usize = 128;

/// Reasons a raw image string cannot be tracked.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// The reference string is empty.
    #[error("image reference cannot be empty")]
    Empty,

    /// The first path component does not name a registry host.
    #[error("image reference '{0}' has no explicit registry host")]
    MissingRegistry(String),

    /// No tag was given.
    #[error("image reference '{0}' has no explicit tag")]
    MissingTag(String),

    /// The reference is pinned to a digest and cannot move.
    #[error("image reference '{0}' is pinned to a digest")]
    DigestPinned(String),

    /// The repository path is not valid.
    #[error("invalid repository in '{reference}': {reason}")]
    InvalidRepository {
        reference: String,
        reason: &'static str,
    },

    /// The tag is not valid.
    #[error("invalid tag '{tag}' in '{reference}'")]
    InvalidTag { reference: String, tag: String },
}

/// A normalized, trackable image reference.
///
/// Equality, ordering and hashing are structural: two references are the same
/// tracking unit iff host, repository and tag all match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageReference {
    registry_host: String,
    repository: String,
    tag: String,
}

impl ImageReference {
    /// Parse and normalize a raw image string.
    pub fn normalize(raw: &str) -> Result<Self, ReferenceError> {
        Self::normalize_with_hosts::<&str>(raw, &[])
    }

    /// Parse and normalize a raw image string, also accepting the given
    /// single-label registry hosts.
    pub fn normalize_with_hosts<S: AsRef<str>>(
        raw: &str,
        known_hosts: &[S],
    ) -> Result<Self, ReferenceError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ReferenceError::Empty);
        }

        if raw.contains('@') {
            return Err(ReferenceError::DigestPinned(raw.to_string()));
        }

        let Some((host, remainder)) = raw.split_once('/') else {
            return Err(ReferenceError::MissingRegistry(raw.to_string()));
        };
        let known = known_hosts
            .iter()
            .any(|h| h.as_ref().eq_ignore_ascii_case(host));
        if !known && !looks_like_host(host) {
            return Err(ReferenceError::MissingRegistry(raw.to_string()));
        }

        // Ports only ever appear in the host, so any colon left is the tag separator.
        let Some((repository, tag)) = remainder.rsplit_once(':') else {
            return Err(ReferenceError::MissingTag(raw.to_string()));
        };

        validate_repository(raw, repository)?;
        validate_tag(raw, tag)?;

        let host = host.to_ascii_lowercase();
        let (registry_host, repository) = if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
            let repository = if repository.contains('/') {
                repository.to_string()
            } else {
                format!("library/{repository}")
            };
            (DOCKER_HUB_HOST.to_string(), repository)
        } else {
            (host, repository.to_string())
        };

        Ok(Self {
            registry_host,
            repository,
            tag: tag.to_string(),
        })
    }

    /// Registry host, including the port if one was given.
    pub fn registry_host(&self) -> &str {
        &self.registry_host
    }

    /// Host that serves the registry API for this reference.
    pub fn api_host(&self) -> &str {
        if self.registry_host == DOCKER_HUB_HOST {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry_host
        }
    }

    /// Repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The mutable tag being tracked.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry_host, self.repository, self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s)
    }
}

fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_repository(raw: &str, repository: &str) -> Result<(), ReferenceError> {
    let invalid = |reason| ReferenceError::InvalidRepository {
        reference: raw.to_string(),
        reason,
    };

    if repository.is_empty() {
        return Err(invalid("repository is empty"));
    }

    for component in repository.split('/') {
        let mut chars = component.chars();
        match chars.next() {
            None => return Err(invalid("empty path component")),
            Some(c) if !(c.is_ascii_lowercase() || c.is_ascii_digit()) => {
                return Err(invalid("path component must start with a lowercase letter or digit"))
            }
            Some(_) => {}
        }
        if !chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
        }) {
            return Err(invalid("path component contains invalid characters"));
        }
    }

    Ok(())
}

fn validate_tag(raw: &str, tag: &str) -> Result<(), ReferenceError> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if tag.is_empty() {
        return Err(ReferenceError::MissingTag(raw.to_string()));
    }
    if !valid {
        return Err(ReferenceError::InvalidTag {
            reference: raw.to_string(),
            tag: tag.to_string(),
        });
    }
    Ok(())
}
