// Plugin discovery
//
// Walks the configured root directories for plugin.json manifests, validates
// them, confirms the entry point exists and fingerprints the source. A corrupt
// plugin is logged and skipped so one bad directory never stalls a sweep.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use devflow_core::{DomainError, PluginManifest, Result, MANIFEST_FILE_NAME};

/// A manifest found on disk, ready for registration
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub manifest: PluginManifest,
    pub plugin_dir: PathBuf,
    pub entry_point_path: PathBuf,
    pub source_hash: String,
}

/// Scans directory trees for plugins
#[derive(Debug, Clone)]
pub struct PluginDiscovery {
    roots: Vec<PathBuf>,
}

impl PluginDiscovery {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Find every valid plugin under the roots; invalid candidates are
    /// logged at warn and skipped.
    pub fn scan(&self) -> Vec<DiscoveredPlugin> {
        let mut found = Vec::new();
        for root in &self.roots {
            if !root.exists() {
                tracing::warn!(root = %root.display(), "plugin directory does not exist, skipping");
                continue;
            }
            for entry in WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file() && entry.file_name() == MANIFEST_FILE_NAME {
                    let plugin_dir = match entry.path().parent() {
                        Some(dir) => dir.to_path_buf(),
                        None => continue,
                    };
                    match Self::inspect(&plugin_dir) {
                        Ok(plugin) => found.push(plugin),
                        Err(e) => {
                            tracing::warn!(
                                plugin_dir = %plugin_dir.display(),
                                error = %e,
                                "skipping invalid plugin"
                            );
                        }
                    }
                }
            }
        }
        found
    }

    /// Validate a single plugin directory
    pub fn inspect(plugin_dir: &Path) -> Result<DiscoveredPlugin> {
        let manifest_path = plugin_dir.join(MANIFEST_FILE_NAME);
        let manifest_bytes = std::fs::read(&manifest_path).map_err(|e| {
            DomainError::failure(
                "Discovery.Io",
                format!("cannot read {}: {e}", manifest_path.display()),
            )
        })?;
        let manifest = PluginManifest::from_bytes(&manifest_bytes)?;

        let entry_point_path = plugin_dir.join(&manifest.entry_point);
        if !entry_point_path.is_file() {
            return Err(DomainError::not_found(
                "Discovery.EntryPoint",
                format!("entry point {} does not exist", entry_point_path.display()),
            ));
        }
        let entry_bytes = std::fs::read(&entry_point_path).map_err(|e| {
            DomainError::failure(
                "Discovery.Io",
                format!("cannot read {}: {e}", entry_point_path.display()),
            )
        })?;

        Ok(DiscoveredPlugin {
            manifest,
            plugin_dir: plugin_dir.to_path_buf(),
            entry_point_path,
            source_hash: source_hash(&manifest_bytes, &entry_bytes),
        })
    }

    /// True when the manifest or entry point changed after `last_scan`
    pub fn is_modified(plugin_dir: &Path, last_scan: DateTime<Utc>) -> Result<bool> {
        let manifest_path = plugin_dir.join(MANIFEST_FILE_NAME);
        let manifest_mtime = file_mtime(&manifest_path)?;
        if manifest_mtime > last_scan {
            return Ok(true);
        }

        let manifest_bytes = std::fs::read(&manifest_path)
            .map_err(|e| DomainError::failure("Discovery.Io", e.to_string()))?;
        let manifest = PluginManifest::from_bytes(&manifest_bytes)?;
        let entry_mtime = file_mtime(&plugin_dir.join(&manifest.entry_point))?;
        Ok(entry_mtime > last_scan)
    }
}

/// SHA-256 over the manifest bytes followed by the entry-point bytes
pub fn source_hash(manifest_bytes: &[u8], entry_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(manifest_bytes);
    hasher.update(entry_bytes);
    hex::encode(hasher.finalize())
}

fn file_mtime(path: &Path) -> Result<DateTime<Utc>> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| {
            DomainError::failure(
                "Discovery.Io",
                format!("cannot stat {}: {e}", path.display()),
            )
        })?;
    Ok(system_time_to_utc(modified))
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::ErrorKind;
    use std::fs;
    use tempfile::TempDir;

    fn write_plugin(root: &Path, dir: &str, name: &str, entry: &str) -> PathBuf {
        let plugin_dir = root.join(dir);
        fs::create_dir_all(&plugin_dir).unwrap();
        fs::write(
            plugin_dir.join("plugin.json"),
            format!(
                r#"{{"name": "{name}", "version": "1.0.0", "description": "d",
                     "language": "S", "entryPoint": "{entry}"}}"#
            ),
        )
        .unwrap();
        fs::write(plugin_dir.join(entry), "echo hi\n").unwrap();
        plugin_dir
    }

    #[test]
    fn scan_finds_nested_plugins_and_skips_corrupt_ones() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "s/hello", "hello", "main.sh");
        write_plugin(root.path(), "s/nested/deep", "deep", "run.sh");

        // Corrupt: manifest is not JSON
        let bad = root.path().join("s/broken");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("plugin.json"), "{ not json").unwrap();

        let discovery = PluginDiscovery::new(vec![root.path().to_path_buf()]);
        let mut names: Vec<String> = discovery
            .scan()
            .into_iter()
            .map(|p| p.manifest.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["deep", "hello"]);
    }

    #[test]
    fn missing_entry_point_is_not_found() {
        let root = TempDir::new().unwrap();
        let dir = write_plugin(root.path(), "p", "ghost", "main.sh");
        fs::remove_file(dir.join("main.sh")).unwrap();

        let err = PluginDiscovery::inspect(&dir).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn source_hash_is_stable_and_content_sensitive() {
        let root = TempDir::new().unwrap();
        let dir = write_plugin(root.path(), "p", "hashme", "main.sh");

        let first = PluginDiscovery::inspect(&dir).unwrap().source_hash;
        let again = PluginDiscovery::inspect(&dir).unwrap().source_hash;
        assert_eq!(first, again);

        fs::write(dir.join("main.sh"), "echo changed\n").unwrap();
        let changed = PluginDiscovery::inspect(&dir).unwrap().source_hash;
        assert_ne!(first, changed);
    }

    #[test]
    fn is_modified_compares_mtimes() {
        let root = TempDir::new().unwrap();
        let dir = write_plugin(root.path(), "p", "fresh", "main.sh");

        let before = Utc::now() - chrono::Duration::hours(1);
        assert!(PluginDiscovery::is_modified(&dir, before).unwrap());

        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(!PluginDiscovery::is_modified(&dir, future).unwrap());
    }

    #[test]
    fn nonexistent_root_yields_empty_scan() {
        let discovery = PluginDiscovery::new(vec![PathBuf::from("/definitely/not/here")]);
        assert!(discovery.scan().is_empty());
    }
}
