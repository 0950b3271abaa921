// Content-addressed package cache with single-flight downloads
//
// Layout: <root>/<registry>/<name>/<version>/package
// Concurrent ensure() calls for the same (registry, name, version) share one
// download: a keyed async mutex serialises them and the winner populates the
// cache before the rest re-check it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use devflow_core::{DomainError, PackageRegistry, Result, VersionSpec};

use super::registry::RegistryClient;

pub const PACKAGE_FILE_NAME: &str = "package";

pub struct RegistryCache {
    root: PathBuf,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RegistryCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, registry: PackageRegistry, name: &str, version: &Version) -> PathBuf {
        self.root
            .join(registry.as_str())
            .join(name)
            .join(version.to_string())
    }

    /// Versions currently present in the cache for a package
    pub fn cached_versions(&self, registry: PackageRegistry, name: &str) -> Vec<Version> {
        let package_root = self.root.join(registry.as_str()).join(name);
        let Ok(entries) = std::fs::read_dir(&package_root) else {
            return Vec::new();
        };
        let mut versions: Vec<Version> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| Version::parse(&e.file_name().to_string_lossy()).ok())
            .collect();
        versions.sort();
        versions
    }

    /// Highest cached version satisfying the spec
    pub fn best_cached(
        &self,
        registry: PackageRegistry,
        name: &str,
        spec: &VersionSpec,
    ) -> Option<Version> {
        self.cached_versions(registry, name)
            .into_iter()
            .rev()
            .find(|v| spec.matches(v))
    }

    /// Guarantee the given package version is cached, downloading on a miss.
    /// Returns the cached package directory.
    pub async fn ensure(
        &self,
        registry: PackageRegistry,
        name: &str,
        version: &Version,
        client: &RegistryClient,
        cancellation: &CancellationToken,
    ) -> Result<PathBuf> {
        let dir = self.package_dir(registry, name, version);
        if dir.join(PACKAGE_FILE_NAME).is_file() {
            return Ok(dir);
        }

        let key = format!("{}/{}/{}", registry.as_str(), name, version);
        let key_lock = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(key.clone()).or_default().clone()
        };
        let _guard = key_lock.lock().await;

        // A concurrent caller may have populated the cache while we waited
        if dir.join(PACKAGE_FILE_NAME).is_file() {
            return Ok(dir);
        }

        tracing::info!(package = name, version = %version, registry = %registry, "downloading package");
        let staging = self
            .root
            .join(registry.as_str())
            .join(name)
            .join(format!(".tmp-{version}"));
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| DomainError::failure("Cache.Io", e.to_string()))?;

        let download = client
            .download(
                registry,
                name,
                version,
                &staging.join(PACKAGE_FILE_NAME),
                cancellation,
            )
            .await;

        if let Err(e) = download {
            // Leave no partial entries behind
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        tokio::fs::rename(&staging, &dir)
            .await
            .map_err(|e| DomainError::failure("Cache.Io", e.to_string()))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn seed(cache_root: &Path, registry: &str, name: &str, version: &str) {
        let dir = cache_root.join(registry).join(name).join(version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PACKAGE_FILE_NAME), b"payload").unwrap();
    }

    #[test]
    fn best_cached_picks_highest_satisfying_version() {
        let root = TempDir::new().unwrap();
        seed(root.path(), "pkg-s", "lib", "1.2.0");
        seed(root.path(), "pkg-s", "lib", "1.2.7");
        seed(root.path(), "pkg-s", "lib", "2.0.0");

        let cache = RegistryCache::new(root.path());
        let spec = VersionSpec::Caret(Version::parse("1.2.0").unwrap());
        let best = cache.best_cached(PackageRegistry::PkgS, "lib", &spec).unwrap();
        assert_eq!(best.to_string(), "1.2.7");
    }

    #[test]
    fn best_cached_is_none_when_nothing_matches() {
        let root = TempDir::new().unwrap();
        seed(root.path(), "pkg-s", "lib", "2.0.0");

        let cache = RegistryCache::new(root.path());
        let spec = VersionSpec::Caret(Version::parse("1.2.0").unwrap());
        assert!(cache.best_cached(PackageRegistry::PkgS, "lib", &spec).is_none());
    }

    #[test]
    fn cached_versions_ignores_stray_entries() {
        let root = TempDir::new().unwrap();
        seed(root.path(), "pkg-p", "toolkit", "0.1.0");
        let stray = root.path().join("pkg-p/toolkit/.tmp-0.2.0");
        fs::create_dir_all(stray).unwrap();

        let cache = RegistryCache::new(root.path());
        let versions = cache.cached_versions(PackageRegistry::PkgP, "toolkit");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].to_string(), "0.1.0");
    }

    #[tokio::test]
    async fn ensure_returns_existing_entry_without_a_client_call() {
        let root = TempDir::new().unwrap();
        seed(root.path(), "pkg-s", "lib", "1.0.0");

        let cache = RegistryCache::new(root.path());
        // Unroutable base URL: any actual download attempt would fail loudly
        let client = RegistryClient::new("http://127.0.0.1:1").unwrap();
        let dir = cache
            .ensure(
                PackageRegistry::PkgS,
                "lib",
                &Version::parse("1.0.0").unwrap(),
                &client,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(dir.join(PACKAGE_FILE_NAME).is_file());
    }
}
