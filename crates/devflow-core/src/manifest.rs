// Plugin manifest (plugin.json) parsing and validation

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dependency::PluginDependency;
use crate::error::{DomainError, Result};
use crate::plugin::{PluginLanguage, PluginMetadata};

/// File name every plugin directory must contain
pub const MANIFEST_FILE_NAME: &str = "plugin.json";

/// Raw manifest as authored by the plugin developer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub language: PluginLanguage,
    pub entry_point: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub configuration: Map<String, Value>,
}

impl PluginManifest {
    /// Parse manifest bytes; serde enforces the required fields and the
    /// language enum, the rest of the checks live in [`validate`](Self::validate).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let manifest: PluginManifest = serde_json::from_slice(bytes).map_err(|e| {
            DomainError::validation("Manifest.Parse", format!("invalid plugin.json: {e}"))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation(
                "Manifest.Name",
                "manifest name must not be empty",
            ));
        }
        semver::Version::parse(&self.version).map_err(|e| {
            DomainError::validation(
                "Manifest.Version",
                format!("invalid version {:?}: {e}", self.version),
            )
        })?;
        let entry = std::path::Path::new(&self.entry_point);
        if self.entry_point.is_empty() || entry.is_absolute() {
            return Err(DomainError::validation(
                "Manifest.EntryPoint",
                "entryPoint must be a relative path",
            ));
        }
        if entry
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(DomainError::validation(
                "Manifest.EntryPoint",
                "entryPoint must stay inside the plugin directory",
            ));
        }
        // Dependency strings must parse even if resolution happens later
        for spec in &self.dependencies {
            PluginDependency::parse(spec)?;
        }
        Ok(())
    }

    pub fn metadata(&self) -> Result<PluginMetadata> {
        PluginMetadata::new(
            self.name.clone(),
            &self.version,
            self.description.clone(),
            self.language,
        )
    }

    pub fn parsed_dependencies(&self) -> Result<Vec<PluginDependency>> {
        self.dependencies.iter().map(|s| PluginDependency::parse(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json(entry: &str) -> String {
        format!(
            r#"{{
                "name": "hello",
                "version": "1.0.0",
                "description": "greets",
                "language": "S",
                "entryPoint": "{entry}",
                "capabilities": ["greeting"],
                "dependencies": ["pkg-s:lib^1.2.0"],
                "configuration": {{"greeting": "Hello"}}
            }}"#
        )
    }

    #[test]
    fn parses_a_complete_manifest() {
        let manifest = PluginManifest::from_bytes(manifest_json("main.js").as_bytes()).unwrap();
        assert_eq!(manifest.name, "hello");
        assert_eq!(manifest.language, PluginLanguage::Script);
        assert_eq!(manifest.parsed_dependencies().unwrap().len(), 1);
        assert_eq!(manifest.metadata().unwrap().version.to_string(), "1.0.0");
    }

    #[test]
    fn rejects_missing_required_fields() {
        let err = PluginManifest::from_bytes(br#"{"name": "x"}"#).unwrap_err();
        assert_eq!(err.code, "Manifest.Parse");
    }

    #[test]
    fn rejects_unknown_language() {
        let raw = manifest_json("main.js").replace("\"S\"", "\"Q\"");
        assert!(PluginManifest::from_bytes(raw.as_bytes()).is_err());
    }

    #[test]
    fn rejects_escaping_entry_point() {
        let err = PluginManifest::from_bytes(manifest_json("../../etc/passwd").as_bytes())
            .unwrap_err();
        assert_eq!(err.code, "Manifest.EntryPoint");

        let abs = manifest_json("/etc/passwd");
        assert!(PluginManifest::from_bytes(abs.as_bytes()).is_err());
    }

    #[test]
    fn rejects_bad_dependency_strings() {
        let raw = manifest_json("main.js").replace("pkg-s:lib^1.2.0", "pkg-s:lib");
        assert!(PluginManifest::from_bytes(raw.as_bytes()).is_err());
    }
}
