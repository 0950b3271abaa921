// Registry download behaviour against a mock HTTP registry

use std::sync::Arc;

use semver::Version;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use devflow_core::{PackageRegistry, VersionSpec};
use devflow_runtime::{RegistryCache, RegistryClient};

async fn mock_registry(expected_downloads: u64) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/pkg-s/lib/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "versions": ["1.2.0", "1.2.7", "2.0.0"]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/pkg-s/lib/1.2.7/package"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(std::time::Duration::from_millis(150))
                .set_body_bytes(b"package-bytes".to_vec()),
        )
        .expect(expected_downloads)
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn resolve_version_picks_highest_in_range() {
    let server = mock_registry(0).await;
    let client = RegistryClient::new(server.uri()).unwrap();

    let spec = VersionSpec::Caret(Version::parse("1.2.0").unwrap());
    let version = client
        .resolve_version(PackageRegistry::PkgS, "lib", &spec)
        .await
        .unwrap();
    assert_eq!(version.to_string(), "1.2.7");
}

#[tokio::test]
async fn unknown_package_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg-s/ghost/index.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = RegistryClient::new(server.uri()).unwrap();
    let err = client
        .resolve_version(
            PackageRegistry::PkgS,
            "ghost",
            &VersionSpec::AtLeast(Version::parse("1.0.0").unwrap()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, devflow_core::ErrorKind::NotFound);
}

#[tokio::test]
async fn concurrent_ensures_share_one_download() {
    let server = mock_registry(1).await;
    let client = RegistryClient::new(server.uri()).unwrap();
    let cache_root = tempfile::TempDir::new().unwrap();
    let cache = Arc::new(RegistryCache::new(cache_root.path()));

    let version = Version::parse("1.2.7").unwrap();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let client = client.clone();
        let version = version.clone();
        handles.push(tokio::spawn(async move {
            cache
                .ensure(
                    PackageRegistry::PkgS,
                    "lib",
                    &version,
                    &client,
                    &CancellationToken::new(),
                )
                .await
        }));
    }

    for handle in handles {
        let dir = handle.await.unwrap().unwrap();
        assert!(dir.join("package").is_file());
    }
    // MockServer verifies expect(1) on drop: exactly one download happened
}

#[tokio::test]
async fn download_retries_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg-s/flaky/1.0.0/package"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pkg-s/flaky/1.0.0/package"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .mount(&server)
        .await;

    let client = RegistryClient::new(server.uri()).unwrap();
    let dest_dir = tempfile::TempDir::new().unwrap();
    let dest = dest_dir.path().join("package");
    client
        .download(
            PackageRegistry::PkgS,
            "flaky",
            &Version::parse("1.0.0").unwrap(),
            &dest,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(dest).unwrap(), b"ok");
}

#[tokio::test]
async fn cache_miss_downloads_then_serves_from_cache() {
    let server = mock_registry(1).await;
    let client = RegistryClient::new(server.uri()).unwrap();
    let cache_root = tempfile::TempDir::new().unwrap();
    let cache = RegistryCache::new(cache_root.path());
    let version = Version::parse("1.2.7").unwrap();

    // Miss: downloads
    cache
        .ensure(PackageRegistry::PkgS, "lib", &version, &client, &CancellationToken::new())
        .await
        .unwrap();
    // Hit: no second request (expect(1) would trip otherwise)
    let dir = cache
        .ensure(PackageRegistry::PkgS, "lib", &version, &client, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(std::fs::read(dir.join("package")).unwrap(), b"package-bytes");

    let spec = VersionSpec::Caret(Version::parse("1.2.0").unwrap());
    assert_eq!(
        cache
            .best_cached(PackageRegistry::PkgS, "lib", &spec)
            .unwrap()
            .to_string(),
        "1.2.7"
    );
}
