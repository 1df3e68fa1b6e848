//! Registry client for resolving tags to digests.
//!
//! Implements the manifest lookup part of the OCI Distribution Specification:
//! a `HEAD /v2/<repository>/manifests/<tag>` whose `Docker-Content-Digest`
//! header names the digest the tag currently points to. Registries that omit
//! the header are asked again with `GET`, and the digest is computed from the
//! manifest body.
//!
//! Anonymous pulls from registries such as Docker Hub go through the bearer
//! token challenge: a `401` carrying `WWW-Authenticate: Bearer realm=...`
//! is answered by fetching a token from the realm and retrying once.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tagsync_reconcile::ImageReference;
use thiserror::Error;
use tracing::debug;

/// Media types accepted for manifest lookups.
///
/// Index types come first so multi-platform tags resolve to the same digest
/// the kubelet pulls.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "docker-content-digest";

/// Errors from resolving a tag.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Network failure, timeout or unexpected registry response.
    #[error("registry unreachable for {reference}: {message}")]
    RegistryUnreachable { reference: String, message: String },

    /// The registry does not know the tag.
    #[error("tag not found: {0}")]
    TagNotFound(String),

    /// The registry refused our credentials (or lack of them).
    #[error("authentication failed for {reference}: {message}")]
    AuthFailure { reference: String, message: String },
}

impl ResolveError {
    fn unreachable(reference: &ImageReference, message: impl ToString) -> Self {
        Self::RegistryUnreachable {
            reference: reference.to_string(),
            message: message.to_string(),
        }
    }

    fn auth(reference: &ImageReference, message: impl ToString) -> Self {
        Self::AuthFailure {
            reference: reference.to_string(),
            message: message.to_string(),
        }
    }
}

/// Resolves the digest an image tag currently points to.
///
/// Implementations must not mutate any shared state; the loop calls them
/// concurrently and may call them redundantly.
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve(
        &self,
        reference: &ImageReference,
        timeout: Duration,
    ) -> Result<String, ResolveError>;
}

/// Configuration for the registry resolver.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Bearer token sent with every manifest request.
    pub auth_token: Option<String>,

    /// Hosts that are spoken to over plain HTTP.
    pub insecure_registries: Vec<String>,
}

/// OCI Distribution manifest lookup client.
pub struct RegistryResolver {
    config: RegistryConfig,
    client: Client,
}

impl RegistryResolver {
    /// Create a new resolver.
    pub fn new(config: RegistryConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("tagsync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { config, client })
    }

    /// Manifest URL for a reference.
    pub fn manifest_url(&self, reference: &ImageReference) -> String {
        let host = reference.api_host();
        let insecure = self
            .config
            .insecure_registries
            .iter()
            .any(|h| h == host || h == reference.registry_host());
        let scheme = if insecure { "http" } else { "https" };

        format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme,
            host,
            reference.repository(),
            reference.tag()
        )
    }

    async fn lookup(&self, reference: &ImageReference) -> Result<String, ResolveError> {
        let url = self.manifest_url(reference);
        let mut token = self.config.auth_token.clone();
        let mut challenged = false;

        loop {
            debug!(url = %url, "Looking up manifest digest");
            let response = self
                .send(Method::HEAD, &url, token.as_deref(), reference)
                .await?;

            match response.status() {
                StatusCode::OK => {
                    if let Some(digest) = header_digest(&response) {
                        return Ok(digest);
                    }
                    debug!(url = %url, "No digest header, fetching manifest body");
                    return self.digest_from_body(&url, token.as_deref(), reference).await;
                }
                StatusCode::METHOD_NOT_ALLOWED => {
                    return self.digest_from_body(&url, token.as_deref(), reference).await;
                }
                StatusCode::UNAUTHORIZED if !challenged => {
                    challenged = true;
                    let Some(challenge) = response
                        .headers()
                        .get(header::WWW_AUTHENTICATE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(BearerChallenge::parse)
                    else {
                        return Err(ResolveError::auth(reference, "registry requires credentials"));
                    };
                    token = Some(self.fetch_token(&challenge, reference).await?);
                }
                status => return Err(status_error(status, reference)),
            }
        }
    }

    async fn digest_from_body(
        &self,
        url: &str,
        token: Option<&str>,
        reference: &ImageReference,
    ) -> Result<String, ResolveError> {
        let response = self.send(Method::GET, url, token, reference).await?;

        match response.status() {
            StatusCode::OK => {
                if let Some(digest) = header_digest(&response) {
                    return Ok(digest);
                }
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| ResolveError::unreachable(reference, e))?;
                Ok(format!("sha256:{}", hex::encode(Sha256::digest(&body))))
            }
            status => Err(status_error(status, reference)),
        }
    }

    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        reference: &ImageReference,
    ) -> Result<String, ResolveError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository()));

        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        debug!(realm = %challenge.realm, "Fetching registry token");
        let mut request = self.client.get(&challenge.realm).query(&query);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::unreachable(reference, e))?;

        if !response.status().is_success() {
            return Err(ResolveError::auth(
                reference,
                format!("token endpoint returned {}", response.status()),
            ));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ResolveError::auth(reference, e))?;

        body.token
            .or(body.access_token)
            .ok_or_else(|| ResolveError::auth(reference, "token endpoint returned no token"))
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        token: Option<&str>,
        reference: &ImageReference,
    ) -> Result<Response, ResolveError> {
        let mut request = self
            .client
            .request(method, url)
            .header(header::ACCEPT, MANIFEST_ACCEPT);

        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        request
            .send()
            .await
            .map_err(|e| ResolveError::unreachable(reference, e))
    }
}

#[async_trait]
impl DigestResolver for RegistryResolver {
    async fn resolve(
        &self,
        reference: &ImageReference,
        timeout: Duration,
    ) -> Result<String, ResolveError> {
        tokio::time::timeout(timeout, self.lookup(reference))
            .await
            .map_err(|_| {
                ResolveError::unreachable(reference, format!("lookup timed out after {timeout:?}"))
            })?
    }
}

fn header_digest(response: &Response) -> Option<String> {
    response
        .headers()
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn status_error(status: StatusCode, reference: &ImageReference) -> ResolveError {
    match status {
        StatusCode::NOT_FOUND => ResolveError::TagNotFound(reference.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ResolveError::auth(reference, format!("registry returned {status}"))
        }
        status => ResolveError::unreachable(reference, format!("unexpected status {status}")),
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Parameters of a `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(value: &str) -> Option<Self> {
        let (scheme, params) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        for (key, val) in split_auth_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(val),
                "service" => service = Some(val),
                "scope" => scope = Some(val),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Split `k="v",k2=v2` pairs, honouring commas inside quotes.
fn split_auth_params(params: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut key = String::new();
    let mut val = String::new();
    let mut in_value = false;
    let mut in_quotes = false;

    for c in params.chars() {
        match c {
            '"' if in_value => in_quotes = !in_quotes,
            '=' if !in_value => in_value = true,
            ',' if !in_quotes => {
                if in_value {
                    pairs.push((key.trim().to_string(), val.clone()));
                }
                key.clear();
                val.clear();
                in_value = false;
            }
            c if in_value => val.push(c),
            c => key.push(c),
        }
    }
    if in_value {
        pairs.push((key.trim().to_string(), val));
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_url() {
        let resolver = RegistryResolver::new(RegistryConfig {
            auth_token: None,
            insecure_registries: vec!["172.17.0.1:5000".to_string()],
        })
        .unwrap();

        let hub: ImageReference = "docker.io/nginx:1.27".parse().unwrap();
        assert_eq!(
            resolver.manifest_url(&hub),
            "https://registry-1.docker.io/v2/library/nginx/manifests/1.27"
        );

        let local: ImageReference = "172.17.0.1:5000/http-status-code-server:stable"
            .parse()
            .unwrap();
        assert_eq!(
            resolver.manifest_url(&local),
            "http://172.17.0.1:5000/v2/http-status-code-server/manifests/stable"
        );
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = BearerChallenge::parse(concat!(
            r#"Bearer realm="https://auth.docker.io/token","#,
            r#"service="registry.docker.io","#,
            r#"scope="repository:library/nginx:pull,push""#,
        ))
        .unwrap();

        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/nginx:pull,push")
        );
    }

    #[test]
    fn test_parse_challenge_rejects_other_schemes() {
        assert!(BearerChallenge::parse(r#"Basic realm="registry""#).is_none());
        assert!(BearerChallenge::parse(r#"Bearer service="registry""#).is_none());
    }
}
