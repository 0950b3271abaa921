// Database models (internal, mapped to and from domain aggregates)

use chrono::{DateTime, Utc};
use semver::Version;
use serde_json::{Map, Value};
use sqlx::FromRow;
use uuid::Uuid;

use devflow_core::{
    DomainError, Plugin, PluginDependency, PluginLanguage, PluginMetadata, PluginStatus,
    Result, StepStatus, Workflow, WorkflowStatus, WorkflowStep,
};

// ============================================
// Plugin rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct PluginRow {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub description: String,
    pub language: String,
    pub entry_point: String,
    pub plugin_path: String,
    pub capabilities: sqlx::types::JsonValue,
    pub dependencies: sqlx::types::JsonValue,
    pub configuration: sqlx::types::JsonValue,
    pub status: String,
    pub registered_at: DateTime<Utc>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub execution_count: i64,
    pub error_message: Option<String>,
    pub source_hash: Option<String>,
    pub row_version: i64,
}

impl PluginRow {
    pub fn from_aggregate(plugin: &Plugin) -> Self {
        Self {
            id: plugin.id().as_uuid(),
            name: plugin.name().to_string(),
            version: plugin.version().to_string(),
            description: plugin.metadata().description.clone(),
            language: plugin.language().as_str().to_string(),
            entry_point: plugin.entry_point().to_string(),
            plugin_path: plugin.plugin_path().to_string(),
            capabilities: Value::from(plugin.capabilities().to_vec()),
            dependencies: serde_json::to_value(plugin.dependencies()).unwrap_or(Value::Null),
            configuration: Value::Object(plugin.configuration().clone()),
            status: plugin.status().as_str().to_string(),
            registered_at: plugin.registered_at(),
            last_validated_at: plugin.last_validated_at(),
            last_executed_at: plugin.last_executed_at(),
            execution_count: plugin.execution_count(),
            error_message: plugin.error_message().map(String::from),
            source_hash: plugin.source_hash().map(String::from),
            row_version: plugin.row_version(),
        }
    }

    pub fn into_aggregate(self) -> Result<Plugin> {
        let language = PluginLanguage::parse(&self.language)?;
        let version = Version::parse(&self.version).map_err(|e| {
            DomainError::unexpected(format!("corrupt plugin version {:?}: {e}", self.version))
        })?;
        let metadata = PluginMetadata {
            name: self.name,
            version,
            description: self.description,
            language,
        };
        let capabilities: Vec<String> =
            serde_json::from_value(self.capabilities).unwrap_or_default();
        let dependencies: Vec<PluginDependency> = serde_json::from_value(self.dependencies)
            .map_err(|e| DomainError::unexpected(format!("corrupt plugin dependencies: {e}")))?;
        let configuration: Map<String, Value> = match self.configuration {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let status = PluginStatus::parse(&self.status)?;

        Ok(Plugin::rehydrate(
            self.id.into(),
            metadata,
            self.entry_point,
            self.plugin_path,
            capabilities,
            dependencies,
            configuration,
            status,
            self.registered_at,
            self.last_validated_at,
            self.last_executed_at,
            self.execution_count,
            self.error_message,
            self.source_hash,
            self.row_version,
        ))
    }
}

// ============================================
// Workflow rows
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub row_version: i64,
}

impl WorkflowRow {
    pub fn from_aggregate(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id().as_uuid(),
            name: workflow.name().to_string(),
            description: workflow.description().to_string(),
            status: workflow.status().as_str().to_string(),
            created_at: workflow.created_at(),
            updated_at: workflow.updated_at(),
            started_at: workflow.started_at(),
            completed_at: workflow.completed_at(),
            error_message: workflow.error_message().map(String::from),
            row_version: workflow.row_version(),
        }
    }

    pub fn into_aggregate(self, steps: Vec<WorkflowStepRow>) -> Result<Workflow> {
        let status = WorkflowStatus::parse(&self.status)?;
        let steps = steps
            .into_iter()
            .map(WorkflowStepRow::into_step)
            .collect::<Result<Vec<_>>>()?;
        Ok(Workflow::rehydrate(
            self.id.into(),
            self.name,
            self.description,
            status,
            self.created_at,
            self.updated_at,
            self.started_at,
            self.completed_at,
            self.error_message,
            steps,
            self.row_version,
        ))
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowStepRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub plugin_id: Uuid,
    pub step_order: i32,
    pub position: i32,
    pub configuration: sqlx::types::JsonValue,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output: Option<String>,
}

impl WorkflowStepRow {
    pub fn from_step(workflow_id: Uuid, position: i32, step: &WorkflowStep) -> Self {
        Self {
            id: step.id().as_uuid(),
            workflow_id,
            name: step.name().to_string(),
            plugin_id: step.plugin_id().as_uuid(),
            step_order: step.order(),
            position,
            configuration: Value::Object(step.configuration().clone()),
            status: step.status().as_str().to_string(),
            created_at: step.created_at(),
            started_at: step.started_at(),
            completed_at: step.completed_at(),
            error_message: step.error_message().map(String::from),
            output: step.output().map(String::from),
        }
    }

    pub fn into_step(self) -> Result<WorkflowStep> {
        let status = StepStatus::parse(&self.status)?;
        let configuration = match self.configuration {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(WorkflowStep::rehydrate(
            self.id.into(),
            self.name,
            self.plugin_id.into(),
            self.step_order,
            configuration,
            status,
            self.created_at,
            self.started_at,
            self.completed_at,
            self.error_message,
            self.output,
        ))
    }
}

// ============================================
// Read models
// ============================================

/// Workflow listing row with its step count joined in
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowSummaryRow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: String,
    pub step_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::{PackageRegistry, VersionSpec};

    fn sample_plugin() -> Plugin {
        let metadata =
            PluginMetadata::new("hello", "1.2.3", "greets", PluginLanguage::Script).unwrap();
        let mut plugin = Plugin::register(
            metadata,
            "main.js",
            "/plugins/hello",
            vec!["greeting".into()],
            vec![PluginDependency::package(
                PackageRegistry::PkgS,
                "lib",
                VersionSpec::Caret(Version::parse("1.2.0").unwrap()),
            )],
            Map::new(),
            Some("cafe01".into()),
        )
        .unwrap();
        plugin.mark_validated(Ok(())).unwrap();
        plugin.clear_domain_events();
        plugin
    }

    #[test]
    fn plugin_row_round_trip_preserves_fields() {
        let plugin = sample_plugin();
        let row = PluginRow::from_aggregate(&plugin);
        let restored = row.into_aggregate().unwrap();

        assert_eq!(restored.id(), plugin.id());
        assert_eq!(restored.name(), "hello");
        assert_eq!(restored.version().to_string(), "1.2.3");
        assert_eq!(restored.language(), PluginLanguage::Script);
        assert_eq!(restored.status(), PluginStatus::Available);
        assert_eq!(restored.source_hash(), Some("cafe01"));
        let identities: Vec<_> = restored.dependencies().iter().map(|d| d.identity()).collect();
        assert_eq!(identities, vec![("lib", "package")]);
        // Events are never persisted
        assert!(!restored.has_pending_events());
    }

    #[test]
    fn workflow_row_round_trip_preserves_steps_in_position_order() {
        let mut workflow = Workflow::create("Build-Test", "two steps").unwrap();
        let first = workflow
            .add_step("compile", devflow_core::PluginId::new(), 1, Map::new())
            .unwrap();
        let second = workflow
            .add_step("verify", devflow_core::PluginId::new(), 1, Map::new())
            .unwrap();
        workflow.clear_domain_events();

        let wf_id = workflow.id().as_uuid();
        let step_rows: Vec<WorkflowStepRow> = workflow
            .steps()
            .iter()
            .enumerate()
            .map(|(i, s)| WorkflowStepRow::from_step(wf_id, i as i32, s))
            .collect();
        let row = WorkflowRow::from_aggregate(&workflow);
        let restored = row.into_aggregate(step_rows).unwrap();

        let ordered: Vec<_> = restored.steps_in_order().iter().map(|s| s.id()).collect();
        assert_eq!(ordered, vec![first, second]);
        assert_eq!(restored.status(), WorkflowStatus::Draft);
    }
}
