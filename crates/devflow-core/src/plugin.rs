// Plugin aggregate root
//
// Owns metadata, capabilities, dependencies and configuration; guards the
// Registered -> Available -> Error/Disabled status machine and enqueues the
// domain events listed in the transitions below.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dependency::{PackageRegistry, PluginDependency};
use crate::error::{DomainError, Result};
use crate::events::{DomainEvent, EventQueue};
use crate::ids::PluginId;

/// Source language of a plugin
///
/// Wire form (manifest and database) is the single-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginLanguage {
    /// Managed in-process modules
    #[serde(rename = "M")]
    Managed,
    /// Scripted runtime (external interpreter, npm-style packages)
    #[serde(rename = "S")]
    Script,
    /// Standalone interpreted language (external interpreter, pip-style packages)
    #[serde(rename = "P")]
    Portable,
}

impl PluginLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginLanguage::Managed => "M",
            PluginLanguage::Script => "S",
            PluginLanguage::Portable => "P",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "M" => Ok(PluginLanguage::Managed),
            "S" => Ok(PluginLanguage::Script),
            "P" => Ok(PluginLanguage::Portable),
            other => Err(DomainError::validation(
                "Plugin.Language",
                format!("unknown plugin language {other:?}"),
            )),
        }
    }

    /// Package registry family serving this language
    pub fn registry(&self) -> PackageRegistry {
        match self {
            PluginLanguage::Managed => PackageRegistry::PkgM,
            PluginLanguage::Script => PackageRegistry::PkgS,
            PluginLanguage::Portable => PackageRegistry::PkgP,
        }
    }
}

impl std::fmt::Display for PluginLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Plugin lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Registered,
    Available,
    Error,
    Disabled,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Registered => "registered",
            PluginStatus::Available => "available",
            PluginStatus::Error => "error",
            PluginStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "registered" => Ok(PluginStatus::Registered),
            "available" => Ok(PluginStatus::Available),
            "error" => Ok(PluginStatus::Error),
            "disabled" => Ok(PluginStatus::Disabled),
            other => Err(DomainError::validation(
                "Plugin.Status",
                format!("unknown plugin status {other:?}"),
            )),
        }
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validated identity of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: Version,
    pub description: String,
    pub language: PluginLanguage,
}

impl PluginMetadata {
    pub fn new(
        name: impl Into<String>,
        version: &str,
        description: impl Into<String>,
        language: PluginLanguage,
    ) -> Result<Self> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(DomainError::validation(
                "Plugin.Name",
                "plugin name must not be empty",
            ));
        }
        let version = Version::parse(version).map_err(|e| {
            DomainError::validation("Plugin.Version", format!("invalid version {version:?}: {e}"))
        })?;
        Ok(Self {
            name,
            version,
            description: description.into(),
            language,
        })
    }
}

/// Plugin aggregate
#[derive(Debug, Clone)]
pub struct Plugin {
    id: PluginId,
    metadata: PluginMetadata,
    entry_point: String,
    plugin_path: String,
    capabilities: Vec<String>,
    dependencies: Vec<PluginDependency>,
    configuration: Map<String, Value>,
    status: PluginStatus,
    registered_at: DateTime<Utc>,
    last_validated_at: Option<DateTime<Utc>>,
    last_executed_at: Option<DateTime<Utc>>,
    execution_count: i64,
    error_message: Option<String>,
    source_hash: Option<String>,
    row_version: i64,
    events: EventQueue,
}

impl Plugin {
    /// Register a new plugin from validated manifest data
    ///
    /// Emits `plugin.registered`.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        metadata: PluginMetadata,
        entry_point: impl Into<String>,
        plugin_path: impl Into<String>,
        capabilities: Vec<String>,
        dependencies: Vec<PluginDependency>,
        configuration: Map<String, Value>,
        source_hash: Option<String>,
    ) -> Result<Self> {
        let entry_point = entry_point.into();
        Self::validate_entry_point(&entry_point)?;
        Self::validate_unique_dependencies(&dependencies)?;

        let mut capabilities = capabilities;
        let mut seen = std::collections::HashSet::new();
        capabilities.retain(|c| seen.insert(c.clone()));

        let mut plugin = Self {
            id: PluginId::new(),
            metadata,
            entry_point,
            plugin_path: plugin_path.into(),
            capabilities,
            dependencies,
            configuration,
            status: PluginStatus::Registered,
            registered_at: Utc::now(),
            last_validated_at: None,
            last_executed_at: None,
            execution_count: 0,
            error_message: None,
            source_hash,
            row_version: 0,
            events: EventQueue::new(),
        };
        plugin.events.push(DomainEvent::PluginRegistered {
            plugin_id: plugin.id,
            name: plugin.metadata.name.clone(),
            version: plugin.metadata.version.to_string(),
            language: plugin.metadata.language.as_str().to_string(),
            occurred_at: Utc::now(),
        });
        Ok(plugin)
    }

    /// Restore a persisted plugin without emitting events
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        id: PluginId,
        metadata: PluginMetadata,
        entry_point: String,
        plugin_path: String,
        capabilities: Vec<String>,
        dependencies: Vec<PluginDependency>,
        configuration: Map<String, Value>,
        status: PluginStatus,
        registered_at: DateTime<Utc>,
        last_validated_at: Option<DateTime<Utc>>,
        last_executed_at: Option<DateTime<Utc>>,
        execution_count: i64,
        error_message: Option<String>,
        source_hash: Option<String>,
        row_version: i64,
    ) -> Self {
        Self {
            id,
            metadata,
            entry_point,
            plugin_path,
            capabilities,
            dependencies,
            configuration,
            status,
            registered_at,
            last_validated_at,
            last_executed_at,
            execution_count,
            error_message,
            source_hash,
            row_version,
            events: EventQueue::new(),
        }
    }

    fn validate_entry_point(entry_point: &str) -> Result<()> {
        let path = std::path::Path::new(entry_point);
        if entry_point.is_empty() || path.is_absolute() {
            return Err(DomainError::validation(
                "Plugin.EntryPoint",
                "entry point must be a relative path",
            ));
        }
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(DomainError::validation(
                "Plugin.EntryPoint",
                "entry point must stay inside the plugin directory",
            ));
        }
        Ok(())
    }

    fn validate_unique_dependencies(dependencies: &[PluginDependency]) -> Result<()> {
        for (i, dep) in dependencies.iter().enumerate() {
            if dependencies[..i].iter().any(|d| d.identity() == dep.identity()) {
                return Err(DomainError::conflict(
                    "Plugin.DuplicateDependency",
                    format!(
                        "duplicate dependency ({}, {})",
                        dep.name,
                        dep.kind.discriminant()
                    ),
                ));
            }
        }
        Ok(())
    }

    // ---- accessors ----

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &Version {
        &self.metadata.version
    }

    pub fn language(&self) -> PluginLanguage {
        self.metadata.language
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn plugin_path(&self) -> &str {
        &self.plugin_path
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn dependencies(&self) -> &[PluginDependency] {
        &self.dependencies
    }

    pub fn configuration(&self) -> &Map<String, Value> {
        &self.configuration
    }

    pub fn status(&self) -> PluginStatus {
        self.status
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn last_validated_at(&self) -> Option<DateTime<Utc>> {
        self.last_validated_at
    }

    pub fn last_executed_at(&self) -> Option<DateTime<Utc>> {
        self.last_executed_at
    }

    pub fn execution_count(&self) -> i64 {
        self.execution_count
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn source_hash(&self) -> Option<&str> {
        self.source_hash.as_deref()
    }

    /// Optimistic concurrency token, managed by the storage layer
    pub fn row_version(&self) -> i64 {
        self.row_version
    }

    pub fn set_row_version(&mut self, version: i64) {
        self.row_version = version;
    }

    // ---- transitions ----

    /// Record the outcome of a validation pass
    ///
    /// Success: Registered | Available | Error -> Available.
    /// Failure: Registered | Available | Error -> Error with message.
    /// Disabled plugins must be enabled before re-validation.
    pub fn mark_validated(&mut self, outcome: std::result::Result<(), String>) -> Result<()> {
        if self.status == PluginStatus::Disabled {
            return Err(DomainError::validation(
                "Plugin.Disabled",
                format!("plugin '{}' is disabled", self.metadata.name),
            ));
        }
        let (success, message) = match outcome {
            Ok(()) => {
                self.status = PluginStatus::Available;
                self.last_validated_at = Some(Utc::now());
                self.error_message = None;
                (true, None)
            }
            Err(msg) => {
                self.status = PluginStatus::Error;
                self.last_validated_at = Some(Utc::now());
                self.error_message = Some(msg.clone());
                (false, Some(msg))
            }
        };
        self.events.push(DomainEvent::PluginValidated {
            plugin_id: self.id,
            success,
            message,
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    /// Mark a conflicting plugin (e.g. tool-slug collision) as errored
    pub fn mark_conflict(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.status = PluginStatus::Error;
        self.error_message = Some(message.clone());
        self.events.push(DomainEvent::PluginValidated {
            plugin_id: self.id,
            success: false,
            message: Some(message),
            occurred_at: Utc::now(),
        });
    }

    /// Count a completed execution; only Available plugins execute
    pub fn record_execution(&mut self) -> Result<()> {
        if self.status != PluginStatus::Available {
            return Err(DomainError::validation(
                "Plugin.NotAvailable",
                format!(
                    "plugin '{}' is {} and cannot record executions",
                    self.metadata.name, self.status
                ),
            ));
        }
        self.execution_count += 1;
        self.last_executed_at = Some(Utc::now());
        self.events.push(DomainEvent::PluginExecuted {
            plugin_id: self.id,
            execution_count: self.execution_count,
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    /// Replace the configuration map
    pub fn update_configuration(&mut self, configuration: Map<String, Value>) {
        self.configuration = configuration;
        self.events.push(DomainEvent::PluginConfigurationUpdated {
            plugin_id: self.id,
            occurred_at: Utc::now(),
        });
    }

    /// Disable from any status; a no-op (still success) when already disabled
    pub fn disable(&mut self, reason: Option<String>) {
        if self.status == PluginStatus::Disabled {
            return;
        }
        self.status = PluginStatus::Disabled;
        self.events.push(DomainEvent::PluginDisabled {
            plugin_id: self.id,
            reason,
            occurred_at: Utc::now(),
        });
    }

    /// Re-enable a disabled plugin; it returns to Registered pending re-validation
    pub fn enable(&mut self) -> Result<()> {
        if self.status != PluginStatus::Disabled {
            return Err(DomainError::validation(
                "Plugin.NotDisabled",
                format!("plugin '{}' is not disabled", self.metadata.name),
            ));
        }
        self.status = PluginStatus::Registered;
        self.error_message = None;
        self.events.push(DomainEvent::PluginEnabled {
            plugin_id: self.id,
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    /// Add a dependency; duplicates by (name, type) are a Conflict
    pub fn add_dependency(&mut self, dependency: PluginDependency) -> Result<()> {
        if self
            .dependencies
            .iter()
            .any(|d| d.identity() == dependency.identity())
        {
            return Err(DomainError::conflict(
                "Plugin.DuplicateDependency",
                format!(
                    "duplicate dependency ({}, {})",
                    dependency.name,
                    dependency.kind.discriminant()
                ),
            ));
        }
        self.events.push(DomainEvent::PluginDependencyAdded {
            plugin_id: self.id,
            dependency: dependency.name.clone(),
            dependency_type: dependency.kind.discriminant().to_string(),
            occurred_at: Utc::now(),
        });
        self.dependencies.push(dependency);
        Ok(())
    }

    pub fn remove_dependency(&mut self, name: &str, kind_discriminant: &str) -> Result<()> {
        let position = self
            .dependencies
            .iter()
            .position(|d| d.identity() == (name, kind_discriminant))
            .ok_or_else(|| {
                DomainError::not_found(
                    "Plugin.DependencyNotFound",
                    format!("dependency ({name}, {kind_discriminant}) not declared"),
                )
            })?;
        self.dependencies.remove(position);
        self.events.push(DomainEvent::PluginDependencyRemoved {
            plugin_id: self.id,
            dependency: name.to_string(),
            dependency_type: kind_discriminant.to_string(),
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    pub fn replace_dependencies(&mut self, dependencies: Vec<PluginDependency>) -> Result<()> {
        Self::validate_unique_dependencies(&dependencies)?;
        self.dependencies = dependencies;
        self.events.push(DomainEvent::PluginDependenciesReplaced {
            plugin_id: self.id,
            dependency_count: self.dependencies.len(),
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    /// Absorb a rescanned manifest for the same (name, version)
    ///
    /// Keeps the id stable so workflow steps remain bound to this record;
    /// resets status to Registered pending re-validation.
    pub fn refresh_from_source(
        &mut self,
        entry_point: String,
        plugin_path: String,
        capabilities: Vec<String>,
        dependencies: Vec<PluginDependency>,
        configuration: Map<String, Value>,
        source_hash: Option<String>,
    ) -> Result<()> {
        Self::validate_entry_point(&entry_point)?;
        self.replace_dependencies(dependencies)?;
        self.entry_point = entry_point;
        self.plugin_path = plugin_path;
        self.capabilities = capabilities;
        self.update_configuration(configuration);
        self.source_hash = source_hash;
        if self.status != PluginStatus::Disabled {
            self.status = PluginStatus::Registered;
            self.error_message = None;
        }
        Ok(())
    }

    // ---- events ----

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        self.events.take()
    }

    pub fn clear_domain_events(&mut self) {
        self.events.clear();
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }
}
