// Dynamic tool registry and tool-call routing
//
// The registry is the union of the fixed management tools and one generated
// execute_plugin_<slug> tool per Available plugin. It is recomputed on every
// tools/list and tools/call, so plugin changes surface without restarts.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tracing::warn;

use devflow_core::{
    DomainError, PageRequest, Plugin, PluginFilter, PluginId, PluginLanguage, PluginStatus,
    Result, Workflow, WorkflowId, WorkflowStatus,
};
use devflow_runtime::ExecuteRequest;
use devflow_worker::WorkflowRunInput;

use crate::protocol::{Tool, ToolCallResult};
use crate::state::{plugin_json, step_json, workflow_json, McpState};
use crate::sweep;

pub const EXECUTE_TOOL_PREFIX: &str = "execute_plugin_";

/// Lowercase the plugin name and drop every non-alphanumeric character
pub fn slugify(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// The fixed management tools
fn fixed_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "list_plugins".into(),
            description: "List registered plugins, optionally filtered by status, language or name".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "status": {"type": "string", "enum": ["registered", "available", "error", "disabled"]},
                    "language": {"type": "string", "enum": ["M", "S", "P"]},
                    "nameContains": {"type": "string"}
                },
                "additionalProperties": false
            }),
        },
        Tool {
            name: "get_plugin_capabilities".into(),
            description: "Advisory capability strings declared by a plugin".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pluginId": {"type": "string", "description": "Plugin id"}
                },
                "required": ["pluginId"],
                "additionalProperties": false
            }),
        },
        Tool {
            name: "validate_plugin".into(),
            description: "Re-validate a plugin: entry point, toolchain and dependency resolvability".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pluginId": {"type": "string", "description": "Plugin id"}
                },
                "required": ["pluginId"],
                "additionalProperties": false
            }),
        },
        Tool {
            name: "discover_plugins".into(),
            description: "Rescan the configured plugin directories".into(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        },
        Tool {
            name: "create_workflow".into(),
            description: "Create a draft workflow".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "minLength": 3, "maxLength": 100},
                    "description": {"type": "string", "maxLength": 1000}
                },
                "required": ["name"],
                "additionalProperties": false
            }),
        },
        Tool {
            name: "add_workflow_step".into(),
            description: "Append a plugin execution step to a draft workflow".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "workflowId": {"type": "string"},
                    "name": {"type": "string", "maxLength": 200},
                    "pluginId": {"type": "string"},
                    "order": {"type": "integer", "minimum": 0},
                    "configuration": {"type": "object"}
                },
                "required": ["workflowId", "name", "pluginId", "order"],
                "additionalProperties": false
            }),
        },
        Tool {
            name: "start_workflow".into(),
            description: "Start executing a draft workflow".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "workflowId": {"type": "string"}
                },
                "required": ["workflowId"],
                "additionalProperties": false
            }),
        },
        Tool {
            name: "get_workflow".into(),
            description: "Fetch a workflow with its steps".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "workflowId": {"type": "string"}
                },
                "required": ["workflowId"],
                "additionalProperties": false
            }),
        },
        Tool {
            name: "list_workflows".into(),
            description: "Page through workflows, optionally filtered by status or search text".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page": {"type": "integer", "minimum": 1},
                    "pageSize": {"type": "integer", "minimum": 1, "maximum": 100},
                    "status": {"type": "string", "enum": ["draft", "running", "paused", "completed", "failed", "cancelled"]},
                    "search": {"type": "string"}
                },
                "additionalProperties": false
            }),
        },
    ]
}

/// Input schema for a generated execute tool, derived from the plugin's
/// configuration defaults.
fn generated_schema(plugin: &Plugin) -> Value {
    let mut properties = Map::new();
    for (key, default) in plugin.configuration() {
        let json_type = match default {
            Value::String(_) => "string",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Null => "string",
        };
        properties.insert(
            key.clone(),
            json!({"type": json_type, "default": default}),
        );
    }
    properties.insert(
        "inputData".into(),
        json!({"description": "Input value handed to the plugin; any JSON type"}),
    );
    properties.insert(
        "executionParameters".into(),
        json!({"type": "object", "description": "Per-invocation parameters"}),
    );
    json!({
        "type": "object",
        "properties": Value::Object(properties),
        "additionalProperties": true
    })
}

/// The full registry plus the slug -> plugin binding for dispatch.
/// A slug collision marks the later plugin as Error and keeps the first.
pub async fn build_registry(state: &McpState) -> Result<(Vec<Tool>, HashMap<String, PluginId>)> {
    let mut tools = fixed_tools();
    let mut bindings: HashMap<String, PluginId> = HashMap::new();

    let available = state
        .plugin_store
        .list(PluginFilter {
            status: Some(PluginStatus::Available),
            ..Default::default()
        })
        .await?;

    for plugin in available {
        let tool_name = format!("{EXECUTE_TOOL_PREFIX}{}", slugify(plugin.name()));
        if bindings.contains_key(&tool_name) {
            warn!(
                plugin = %plugin.name(),
                tool = %tool_name,
                "tool slug collision; marking plugin as errored"
            );
            let mut loser = plugin;
            loser.mark_conflict(format!("tool name {tool_name} already taken"));
            if let Err(e) = state.plugin_store.update(&mut loser).await {
                warn!(plugin = %loser.name(), error = %e, "could not persist slug conflict");
            }
            continue;
        }
        tools.push(Tool {
            name: tool_name.clone(),
            description: format!(
                "Execute plugin '{}' v{} ({})",
                plugin.name(),
                plugin.version(),
                plugin.metadata().description
            ),
            input_schema: generated_schema(&plugin),
        });
        bindings.insert(tool_name, plugin.id());
    }

    Ok((tools, bindings))
}

/// Dispatch one tools/call invocation
pub async fn call_tool(state: &McpState, name: &str, arguments: Value) -> Result<Value> {
    let result = match name {
        "list_plugins" => list_plugins(state, arguments).await?,
        "get_plugin_capabilities" => get_plugin_capabilities(state, arguments).await?,
        "validate_plugin" => validate_plugin(state, arguments).await?,
        "discover_plugins" => discover_plugins(state).await?,
        "create_workflow" => create_workflow(state, arguments).await?,
        "add_workflow_step" => add_workflow_step(state, arguments).await?,
        "start_workflow" => start_workflow(state, arguments).await?,
        "get_workflow" => get_workflow(state, arguments).await?,
        "list_workflows" => list_workflows(state, arguments).await?,
        other if other.starts_with(EXECUTE_TOOL_PREFIX) => {
            return execute_plugin_tool(state, other, arguments).await;
        }
        other => {
            return Err(DomainError::validation(
                "Tool.Unknown",
                format!("unknown tool {other:?}"),
            ));
        }
    };
    Ok(serde_json::to_value(ToolCallResult::json(&result))
        .unwrap_or(Value::Null))
}

// ---- argument helpers ----

fn arg_str(arguments: &Value, key: &str) -> Result<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| {
            DomainError::validation("Tool.Arguments", format!("missing string argument {key:?}"))
        })
}

fn arg_opt_str(arguments: &Value, key: &str) -> Option<String> {
    arguments.get(key).and_then(Value::as_str).map(String::from)
}

fn arg_object(arguments: &Value, key: &str) -> Map<String, Value> {
    arguments
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn parse_plugin_id(arguments: &Value) -> Result<PluginId> {
    PluginId::parse(&arg_str(arguments, "pluginId")?)
}

fn parse_workflow_id(arguments: &Value) -> Result<WorkflowId> {
    WorkflowId::parse(&arg_str(arguments, "workflowId")?)
}

async fn load_workflow(state: &McpState, id: WorkflowId) -> Result<Workflow> {
    state.workflow_store.get(id).await?.ok_or_else(|| {
        DomainError::not_found("Workflow.NotFound", format!("workflow {id} not found"))
    })
}

async fn load_plugin(state: &McpState, id: PluginId) -> Result<Plugin> {
    state.plugin_store.get(id).await?.ok_or_else(|| {
        DomainError::not_found("Plugin.NotFound", format!("plugin {id} not found"))
    })
}

// ---- fixed tools ----

async fn list_plugins(state: &McpState, arguments: Value) -> Result<Value> {
    let status = arg_opt_str(&arguments, "status")
        .map(|s| PluginStatus::parse(&s))
        .transpose()?;
    let language = arg_opt_str(&arguments, "language")
        .map(|l| PluginLanguage::parse(&l))
        .transpose()?;
    let plugins = state
        .plugin_store
        .list(PluginFilter {
            status,
            language,
            name_contains: arg_opt_str(&arguments, "nameContains"),
        })
        .await?;
    Ok(json!({
        "plugins": plugins.iter().map(plugin_json).collect::<Vec<_>>(),
        "total": plugins.len(),
    }))
}

async fn get_plugin_capabilities(state: &McpState, arguments: Value) -> Result<Value> {
    let plugin = load_plugin(state, parse_plugin_id(&arguments)?).await?;
    Ok(json!({
        "pluginId": plugin.id().to_string(),
        "name": plugin.name(),
        "capabilities": plugin.capabilities(),
    }))
}

async fn validate_plugin(state: &McpState, arguments: Value) -> Result<Value> {
    let mut plugin = load_plugin(state, parse_plugin_id(&arguments)?).await?;
    let valid = sweep::validate_and_persist(state, &mut plugin).await?;
    Ok(json!({
        "pluginId": plugin.id().to_string(),
        "valid": valid,
        "status": plugin.status().as_str(),
        "errorMessage": plugin.error_message(),
    }))
}

async fn discover_plugins(state: &McpState) -> Result<Value> {
    let outcome = sweep::run_sweep(state, None).await?;
    Ok(outcome.to_json())
}

async fn create_workflow(state: &McpState, arguments: Value) -> Result<Value> {
    let name = arg_str(&arguments, "name")?;
    let description = arg_opt_str(&arguments, "description").unwrap_or_default();

    if state
        .workflow_store
        .exists_with_name(name.trim(), None)
        .await?
    {
        return Err(DomainError::conflict(
            "Workflow.DuplicateName",
            format!("a workflow named {name:?} already exists"),
        ));
    }

    let mut workflow = Workflow::create(name, description)?;
    state.workflow_store.insert(&mut workflow).await?;
    Ok(workflow_json(&workflow))
}

async fn add_workflow_step(state: &McpState, arguments: Value) -> Result<Value> {
    let workflow_id = parse_workflow_id(&arguments)?;
    let name = arg_str(&arguments, "name")?;
    let plugin_id = parse_plugin_id(&arguments)?;
    let order = arguments
        .get("order")
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            DomainError::validation("Tool.Arguments", "missing integer argument \"order\"")
        })?;
    let order = i32::try_from(order)
        .map_err(|_| DomainError::validation("WorkflowStep.Order", "order out of range"))?;
    let configuration = arg_object(&arguments, "configuration");

    // The plugin must exist; availability is enforced at execution time
    load_plugin(state, plugin_id).await?;

    let mut workflow = load_workflow(state, workflow_id).await?;
    let step_id = workflow.add_step(name, plugin_id, order, configuration)?;
    state.workflow_store.update(&mut workflow).await?;

    let step = workflow.step(step_id).ok_or_else(|| {
        DomainError::unexpected("step vanished immediately after insertion")
    })?;
    Ok(step_json(step))
}

async fn start_workflow(state: &McpState, arguments: Value) -> Result<Value> {
    let workflow_id = parse_workflow_id(&arguments)?;
    let workflow = load_workflow(state, workflow_id).await?;

    // Surface precondition failures synchronously; the engine performs the
    // actual Draft -> Running transition when the run task begins.
    if workflow.status() != WorkflowStatus::Draft {
        return Err(DomainError::validation(
            "Workflow.NotDraft",
            format!("workflow is {}", workflow.status()),
        ));
    }
    if workflow.steps().is_empty() {
        return Err(DomainError::validation(
            "Workflow.NoSteps",
            "workflow has no steps to execute",
        ));
    }

    state
        .runner
        .start_workflow(WorkflowRunInput { workflow_id })
        .await?;
    Ok(json!({
        "workflowId": workflow_id.to_string(),
        "scheduled": true,
    }))
}

async fn get_workflow(state: &McpState, arguments: Value) -> Result<Value> {
    let workflow = load_workflow(state, parse_workflow_id(&arguments)?).await?;
    Ok(workflow_json(&workflow))
}

async fn list_workflows(state: &McpState, arguments: Value) -> Result<Value> {
    let page = PageRequest {
        page: arguments.get("page").and_then(Value::as_u64).unwrap_or(1) as u32,
        page_size: arguments
            .get("pageSize")
            .and_then(Value::as_u64)
            .unwrap_or(20) as u32,
    };
    let status = arg_opt_str(&arguments, "status")
        .map(|s| WorkflowStatus::parse(&s))
        .transpose()?;
    let search = arg_opt_str(&arguments, "search");

    let result = state
        .workflow_store
        .list(page, status, search.as_deref())
        .await?;
    Ok(serde_json::to_value(&result).unwrap_or(Value::Null))
}

// ---- generated execute tools ----

async fn execute_plugin_tool(state: &McpState, tool_name: &str, arguments: Value) -> Result<Value> {
    let (_, bindings) = build_registry(state).await?;
    let plugin_id = bindings.get(tool_name).copied().ok_or_else(|| {
        DomainError::validation("Tool.Unknown", format!("unknown tool {tool_name:?}"))
    })?;
    let plugin = load_plugin(state, plugin_id).await?;

    // Arguments other than the reserved keys override configuration defaults
    let mut configuration = plugin.configuration().clone();
    if let Some(args) = arguments.as_object() {
        for (key, value) in args {
            if key != "inputData" && key != "executionParameters" {
                configuration.insert(key.clone(), value.clone());
            }
        }
    }

    let request = ExecuteRequest {
        configuration,
        input_data: arguments.get("inputData").cloned().filter(|v| !v.is_null()),
        execution_parameters: arg_object(&arguments, "executionParameters"),
        deadline_ms: None,
    };

    let result = state
        .runtime
        .execute(&plugin, request, tokio_util::sync::CancellationToken::new())
        .await?;

    // The execution counter advances on success
    if result.envelope.success {
        match state.plugin_store.get(plugin_id).await {
            Ok(Some(mut fresh)) => {
                if let Err(e) = fresh.record_execution() {
                    warn!(plugin_id = %plugin_id, error = %e, "could not record execution");
                } else if let Err(e) = state.plugin_store.update(&mut fresh).await {
                    warn!(plugin_id = %plugin_id, error = %e, "could not persist execution count");
                }
            }
            _ => warn!(plugin_id = %plugin_id, "plugin vanished before execution was recorded"),
        }
    }

    let envelope = serde_json::to_value(&result.envelope)
        .map_err(|e| DomainError::unexpected(e.to_string()))?;
    let call_result = if result.envelope.success {
        ToolCallResult::json(&envelope)
    } else {
        ToolCallResult::error_json(&envelope)
    };
    Ok(serde_json::to_value(call_result).unwrap_or(Value::Null))
}
