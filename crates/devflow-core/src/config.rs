// Server configuration
//
// Loaded from a JSON file (path in DEVFLOW_CONFIG, default devflow.json in the
// working directory); DATABASE_URL overrides the connection string. Unknown
// fields are ignored so configs can carry operator annotations.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DomainError, Result};

pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_MEMORY_MB: u64 = 256;
pub const DEFAULT_SCAN_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_HTTP_PORT: u16 = 8090;
pub const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DevFlowConfig {
    pub connection_string: String,
    pub plugins: PluginsConfig,
    pub mcp_server: McpServerConfig,
}

impl Default for DevFlowConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            plugins: PluginsConfig::default(),
            mcp_server: McpServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PluginsConfig {
    pub plugin_directories: Vec<PathBuf>,
    pub enable_hot_reload: bool,
    pub execution_timeout_ms: u64,
    pub max_memory_mb: u64,
    pub scan_interval_seconds: u64,
    pub registry_cache_path: Option<PathBuf>,
    pub max_concurrent_executions: usize,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            plugin_directories: Vec::new(),
            enable_hot_reload: false,
            execution_timeout_ms: DEFAULT_EXECUTION_TIMEOUT_MS,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            scan_interval_seconds: DEFAULT_SCAN_INTERVAL_SECONDS,
            registry_cache_path: None,
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT_EXECUTIONS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct McpServerConfig {
    pub http_port: u16,
    pub enable_http: bool,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            enable_http: true,
        }
    }
}

impl DevFlowConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            DomainError::validation(
                "Config.Read",
                format!("cannot read config {}: {e}", path.display()),
            )
        })?;
        let mut config: DevFlowConfig = serde_json::from_slice(&bytes).map_err(|e| {
            DomainError::validation(
                "Config.Parse",
                format!("invalid config {}: {e}", path.display()),
            )
        })?;
        config.apply_env();
        Ok(config)
    }

    /// Load from DEVFLOW_CONFIG / ./devflow.json, falling back to defaults
    /// plus environment overrides when no file exists.
    pub fn load() -> Result<Self> {
        let path = std::env::var("DEVFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("devflow.json"));
        if path.exists() {
            Self::from_file(&path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.connection_string = url;
        }
    }

    /// Dependency cache root, defaulting next to the working directory
    pub fn registry_cache_path(&self) -> PathBuf {
        self.plugins
            .registry_cache_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(".devflow/registry-cache"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DevFlowConfig::default();
        assert_eq!(config.plugins.execution_timeout_ms, 30_000);
        assert_eq!(config.plugins.max_memory_mb, 256);
        assert_eq!(config.plugins.scan_interval_seconds, 30);
        assert_eq!(config.mcp_server.http_port, 8090);
        assert!(config.mcp_server.enable_http);
        assert!(!config.plugins.enable_hot_reload);
    }

    #[test]
    fn parses_pascal_case_keys() {
        let raw = r#"{
            "ConnectionString": "postgres://localhost/devflow",
            "Plugins": {
                "PluginDirectories": ["plugins"],
                "EnableHotReload": true,
                "ExecutionTimeoutMs": 5000
            },
            "McpServer": { "HttpPort": 9100, "EnableHttp": false }
        }"#;
        let config: DevFlowConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.connection_string, "postgres://localhost/devflow");
        assert_eq!(config.plugins.plugin_directories, vec![PathBuf::from("plugins")]);
        assert!(config.plugins.enable_hot_reload);
        assert_eq!(config.plugins.execution_timeout_ms, 5000);
        // Untouched options keep their defaults
        assert_eq!(config.plugins.max_memory_mb, 256);
        assert_eq!(config.mcp_server.http_port, 9100);
        assert!(!config.mcp_server.enable_http);
    }
}
