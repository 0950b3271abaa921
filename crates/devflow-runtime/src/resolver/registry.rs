// Package registry HTTP client
//
// Layout served by the registry:
//   GET {base}/{registry}/{name}/index.json        -> {"versions": ["1.2.7", ...]}
//   GET {base}/{registry}/{name}/{version}/package -> payload bytes
//
// Downloads retry with exponential backoff and honour cancellation.

use std::path::Path;
use std::time::Duration;

use semver::Version;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use devflow_core::{DomainError, PackageRegistry, Result, VersionSpec};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct PackageIndex {
    versions: Vec<String>,
}

/// HTTP client for the package registries
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| DomainError::failure("Registry.Client", e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Registry base URL from DEVFLOW_REGISTRY_URL, with a hosted default
    pub fn from_env() -> Result<Self> {
        let base = std::env::var("DEVFLOW_REGISTRY_URL")
            .unwrap_or_else(|_| "https://registry.devflow.dev".to_string());
        Self::new(base)
    }

    /// All published versions of a package
    pub async fn list_versions(
        &self,
        registry: PackageRegistry,
        name: &str,
    ) -> Result<Vec<Version>> {
        let url = format!("{}/{}/{}/index.json", self.base_url, registry.as_str(), name);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DomainError::failure("Registry.Index", e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DomainError::not_found(
                "Registry.PackageNotFound",
                format!("package {name} not in {registry}"),
            ));
        }
        if !response.status().is_success() {
            return Err(DomainError::failure(
                "Registry.Index",
                format!("index request for {name} returned {}", response.status()),
            ));
        }

        let index: PackageIndex = response
            .json()
            .await
            .map_err(|e| DomainError::failure("Registry.Index", e.to_string()))?;

        let mut versions = Vec::new();
        for raw in index.versions {
            match Version::parse(&raw) {
                Ok(v) => versions.push(v),
                Err(_) => tracing::warn!(package = name, version = raw, "ignoring unparseable version"),
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Highest published version matching the spec
    pub async fn resolve_version(
        &self,
        registry: PackageRegistry,
        name: &str,
        spec: &VersionSpec,
    ) -> Result<Version> {
        let versions = self.list_versions(registry, name).await?;
        versions
            .into_iter()
            .rev()
            .find(|v| spec.matches(v))
            .ok_or_else(|| {
                DomainError::not_found(
                    "Registry.NoCandidate",
                    format!("no version of {name} satisfies {spec}"),
                )
            })
    }

    /// Download one package payload to `dest`, retrying transient failures
    pub async fn download(
        &self,
        registry: PackageRegistry,
        name: &str,
        version: &Version,
        dest: &Path,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let url = format!(
            "{}/{}/{}/{}/package",
            self.base_url,
            registry.as_str(),
            name,
            version
        );

        let mut last_error = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            if cancellation.is_cancelled() {
                return Err(DomainError::failure(
                    "Plugin.Cancelled",
                    "download cancelled",
                ));
            }

            let result = tokio::select! {
                r = self.try_download(&url, dest) => r,
                _ = cancellation.cancelled() => {
                    return Err(DomainError::failure("Plugin.Cancelled", "download cancelled"));
                }
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        package = name,
                        version = %version,
                        attempt,
                        error = %e,
                        "package download failed"
                    );
                    last_error = Some(e);
                    if attempt < DOWNLOAD_ATTEMPTS {
                        let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DomainError::failure("Registry.Download", "download failed with no error detail")
        }))
    }

    async fn try_download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| DomainError::failure("Registry.Download", e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DomainError::not_found(
                "Registry.PackageNotFound",
                format!("{url} not found"),
            ));
        }
        if !response.status().is_success() {
            return Err(DomainError::failure(
                "Registry.Download",
                format!("{url} returned {}", response.status()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DomainError::failure("Registry.Download", e.to_string()))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| DomainError::failure("Registry.Download", e.to_string()))?;
        Ok(())
    }
}
