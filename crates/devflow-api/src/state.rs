// Shared server state and wire DTO helpers

use std::sync::Arc;

use serde_json::{json, Value};

use devflow_core::{Plugin, Workflow, WorkflowStep};
use devflow_runtime::{PluginDiscovery, RuntimeDispatcher};
use devflow_worker::WorkflowRunner;

/// Everything the dispatcher and handlers share
#[derive(Clone)]
pub struct McpState {
    pub plugin_store: Arc<dyn devflow_core::PluginStore>,
    pub workflow_store: Arc<dyn devflow_core::WorkflowStore>,
    pub runner: Arc<dyn WorkflowRunner>,
    pub runtime: Arc<RuntimeDispatcher>,
    pub discovery: PluginDiscovery,
    pub server_name: String,
    pub server_version: String,
}

/// Public JSON shape of a plugin
pub fn plugin_json(plugin: &Plugin) -> Value {
    json!({
        "id": plugin.id().to_string(),
        "name": plugin.name(),
        "version": plugin.version().to_string(),
        "description": plugin.metadata().description,
        "language": plugin.language().as_str(),
        "status": plugin.status().as_str(),
        "capabilities": plugin.capabilities(),
        "entryPoint": plugin.entry_point(),
        "executionCount": plugin.execution_count(),
        "registeredAt": plugin.registered_at(),
        "lastValidatedAt": plugin.last_validated_at(),
        "lastExecutedAt": plugin.last_executed_at(),
        "errorMessage": plugin.error_message(),
        "sourceHash": plugin.source_hash(),
    })
}

/// Public JSON shape of a workflow with its steps in execution order
pub fn workflow_json(workflow: &Workflow) -> Value {
    json!({
        "id": workflow.id().to_string(),
        "name": workflow.name(),
        "description": workflow.description(),
        "status": workflow.status().as_str(),
        "createdAt": workflow.created_at(),
        "updatedAt": workflow.updated_at(),
        "startedAt": workflow.started_at(),
        "completedAt": workflow.completed_at(),
        "errorMessage": workflow.error_message(),
        "steps": workflow
            .steps_in_order()
            .iter()
            .map(|s| step_json(s))
            .collect::<Vec<_>>(),
    })
}

pub fn step_json(step: &WorkflowStep) -> Value {
    json!({
        "id": step.id().to_string(),
        "name": step.name(),
        "pluginId": step.plugin_id().to_string(),
        "order": step.order(),
        "status": step.status().as_str(),
        "configuration": Value::Object(step.configuration().clone()),
        "createdAt": step.created_at(),
        "startedAt": step.started_at(),
        "completedAt": step.completed_at(),
        "errorMessage": step.error_message(),
        "output": step.output(),
        "executionDurationMs": step.execution_duration_ms(),
    })
}
