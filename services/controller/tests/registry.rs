//! Registry resolver tests against a mock OCI Distribution endpoint.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tagsync_controller::{DigestResolver, RegistryConfig, RegistryResolver, ResolveError};
use tagsync_reconcile::ImageReference;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MANIFEST_PATH: &str = "/v2/app/manifests/stable";
const TIMEOUT: Duration = Duration::from_secs(2);

struct Fixture {
    server: MockServer,
    resolver: RegistryResolver,
    reference: ImageReference,
}

async fn fixture(auth_token: Option<&str>) -> Fixture {
    let server = MockServer::start().await;
    let host = server.address().to_string();
    let resolver = RegistryResolver::new(RegistryConfig {
        auth_token: auth_token.map(str::to_string),
        insecure_registries: vec![host.clone()],
    })
    .unwrap();
    let reference = format!("{host}/app:stable").parse().unwrap();

    Fixture {
        server,
        resolver,
        reference,
    }
}

#[tokio::test]
async fn test_digest_from_head_header() {
    let f = fixture(None).await;
    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .respond_with(
            ResponseTemplate::new(200).insert_header("docker-content-digest", "sha256:d1"),
        )
        .expect(1)
        .mount(&f.server)
        .await;

    let digest = f.resolver.resolve(&f.reference, TIMEOUT).await.unwrap();
    assert_eq!(digest, "sha256:d1");
}

#[tokio::test]
async fn test_digest_computed_from_manifest_body() {
    let f = fixture(None).await;
    let manifest =
        br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json"}"#;

    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path(MANIFEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest.to_vec()))
        .expect(1)
        .mount(&f.server)
        .await;

    let digest = f.resolver.resolve(&f.reference, TIMEOUT).await.unwrap();
    let expected = format!("sha256:{}", hex::encode(Sha256::digest(manifest)));
    assert_eq!(digest, expected);
}

#[tokio::test]
async fn test_head_not_allowed_falls_back_to_get() {
    let f = fixture(None).await;
    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .respond_with(ResponseTemplate::new(405))
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path(MANIFEST_PATH))
        .respond_with(
            ResponseTemplate::new(200).insert_header("docker-content-digest", "sha256:d2"),
        )
        .mount(&f.server)
        .await;

    let digest = f.resolver.resolve(&f.reference, TIMEOUT).await.unwrap();
    assert_eq!(digest, "sha256:d2");
}

#[tokio::test]
async fn test_unknown_tag() {
    let f = fixture(None).await;
    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&f.server)
        .await;

    let err = f.resolver.resolve(&f.reference, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ResolveError::TagNotFound(_)));
}

#[tokio::test]
async fn test_bearer_challenge_is_answered() {
    let f = fixture(None).await;
    let realm = format!("{}/token", f.server.uri());

    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .and(header("authorization", "Bearer pull-token"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("docker-content-digest", "sha256:d1"),
        )
        .with_priority(1)
        .expect(1)
        .mount(&f.server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "www-authenticate",
            format!(r#"Bearer realm="{realm}",service="test-registry""#).as_str(),
        ))
        .expect(1)
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("scope", "repository:app:pull"))
        .and(query_param("service", "test-registry"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "token": "pull-token"
        })))
        .expect(1)
        .mount(&f.server)
        .await;

    let digest = f.resolver.resolve(&f.reference, TIMEOUT).await.unwrap();
    assert_eq!(digest, "sha256:d1");
}

#[tokio::test]
async fn test_configured_token_is_sent() {
    let f = fixture(Some("static-token")).await;
    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .and(header("authorization", "Bearer static-token"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("docker-content-digest", "sha256:d1"),
        )
        .expect(1)
        .mount(&f.server)
        .await;

    let digest = f.resolver.resolve(&f.reference, TIMEOUT).await.unwrap();
    assert_eq!(digest, "sha256:d1");
}

#[tokio::test]
async fn test_rejected_credentials() {
    let f = fixture(None).await;
    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .respond_with(ResponseTemplate::new(403))
        .mount(&f.server)
        .await;

    let err = f.resolver.resolve(&f.reference, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ResolveError::AuthFailure { .. }));
}

#[tokio::test]
async fn test_challenge_without_bearer_is_auth_failure() {
    let f = fixture(None).await;
    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("www-authenticate", r#"Basic realm="registry""#),
        )
        .mount(&f.server)
        .await;

    let err = f.resolver.resolve(&f.reference, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ResolveError::AuthFailure { .. }));
}

#[tokio::test]
async fn test_server_error_is_unreachable() {
    let f = fixture(None).await;
    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&f.server)
        .await;

    let err = f.resolver.resolve(&f.reference, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ResolveError::RegistryUnreachable { .. }));
}

#[tokio::test]
async fn test_slow_registry_times_out() {
    let f = fixture(None).await;
    Mock::given(method("HEAD"))
        .and(path(MANIFEST_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("docker-content-digest", "sha256:d1")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&f.server)
        .await;

    let err = f
        .resolver
        .resolve(&f.reference, Duration::from_millis(200))
        .await
        .unwrap_err();
    match err {
        ResolveError::RegistryUnreachable { message, .. } => {
            assert!(message.contains("timed out"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}
