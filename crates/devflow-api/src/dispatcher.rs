// JSON-RPC dispatcher and MCP method handlers
//
// Parses the request body (single or batch), routes over the closed method
// set, and maps domain error kinds onto JSON-RPC codes:
// Validation -> -32602, everything else -> -32603, unknown method -> -32601.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use devflow_core::{DomainError, ErrorKind};

use crate::protocol::{
    error_codes, InitializeResult, JsonRpcRequest, JsonRpcResponse, PromptsCapability,
    PromptsListResult, ResourcesCapability, ResourcesListResult, ServerCapabilities, ServerInfo,
    ToolCallParams, ToolsCapability, ToolsListResult, JSONRPC_VERSION, PROTOCOL_VERSION,
};
use crate::state::McpState;
use crate::tools;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Routes parsed JSON-RPC requests to handlers
#[derive(Clone)]
pub struct McpDispatcher {
    state: Arc<McpState>,
}

impl McpDispatcher {
    pub fn new(state: Arc<McpState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<McpState> {
        &self.state
    }

    /// Handle one request body; None means nothing to send back
    /// (an all-notification batch).
    pub async fn handle_body(&self, body: &str) -> Option<Value> {
        let parsed: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                return Some(response_value(JsonRpcResponse::error(
                    None,
                    error_codes::PARSE_ERROR,
                    format!("parse error: {e}"),
                )));
            }
        };

        match parsed {
            Value::Array(entries) => {
                if entries.is_empty() {
                    return Some(response_value(JsonRpcResponse::error(
                        None,
                        error_codes::PARSE_ERROR,
                        "empty batch".into(),
                    )));
                }
                // Sub-requests are independent; order is preserved
                let mut responses = Vec::new();
                for entry in entries {
                    if let Some(response) = self.handle_value(entry).await {
                        responses.push(response_value(response));
                    }
                }
                if responses.is_empty() {
                    None
                } else {
                    Some(Value::Array(responses))
                }
            }
            Value::Object(_) => self.handle_value(parsed).await.map(response_value),
            _ => Some(response_value(JsonRpcResponse::error(
                None,
                error_codes::PARSE_ERROR,
                "request root must be an object or array".into(),
            ))),
        }
    }

    /// Handle one request element; None for notifications
    async fn handle_value(&self, value: Value) -> Option<JsonRpcResponse> {
        let id = value.get("id").cloned();

        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    id,
                    error_codes::INVALID_REQUEST,
                    format!("invalid request: {e}"),
                ));
            }
        };
        if request.jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::error(
                request.id,
                error_codes::INVALID_REQUEST,
                format!("unsupported jsonrpc version {:?}", request.jsonrpc),
            ));
        }

        // Notifications are processed but never answered
        if request.id.is_none() {
            debug!(method = %request.method, "notification received");
            return None;
        }

        let id = request.id.clone();
        let outcome = tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.route(&request.method, request.params),
        )
        .await;

        Some(match outcome {
            Ok(Ok(result)) => JsonRpcResponse::success(id, result),
            Ok(Err(routing)) => match routing {
                RoutingError::MethodNotFound(method) => JsonRpcResponse::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("method not found: {method}"),
                ),
                RoutingError::Domain(e) => {
                    let code = map_error_kind(e.kind);
                    JsonRpcResponse::error(id, code, e.to_string())
                }
            },
            Err(_) => JsonRpcResponse::error(
                id,
                error_codes::INTERNAL_ERROR,
                "request timed out".into(),
            ),
        })
    }

    async fn route(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, RoutingError> {
        match method {
            "initialize" => Ok(self.initialize()),
            "tools/list" => self.tools_list().await.map_err(RoutingError::Domain),
            "tools/call" => self.tools_call(params).await.map_err(RoutingError::Domain),
            "resources/list" => Ok(resources_list()),
            "resources/read" => resources_read(params).map_err(RoutingError::Domain),
            "prompts/list" => Ok(prompts_list()),
            "prompts/get" => prompts_get(params).map_err(RoutingError::Domain),
            other => Err(RoutingError::MethodNotFound(other.to_string())),
        }
    }

    fn initialize(&self) -> Value {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                resources: Some(ResourcesCapability::default()),
                prompts: Some(PromptsCapability::default()),
            },
            server_info: ServerInfo {
                name: self.state.server_name.clone(),
                version: self.state.server_version.clone(),
            },
        };
        serde_json::to_value(result).unwrap_or(Value::Null)
    }

    async fn tools_list(&self) -> devflow_core::Result<Value> {
        let (tools, _) = tools::build_registry(&self.state).await?;
        serde_json::to_value(ToolsListResult { tools })
            .map_err(|e| DomainError::unexpected(e.to_string()))
    }

    async fn tools_call(&self, params: Option<Value>) -> devflow_core::Result<Value> {
        let params: ToolCallParams = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| {
                DomainError::validation("Rpc.Params", format!("invalid tools/call params: {e}"))
            })?
            .ok_or_else(|| DomainError::validation("Rpc.Params", "missing tools/call params"))?;

        tools::call_tool(&self.state, &params.name, params.arguments).await
    }
}

enum RoutingError {
    MethodNotFound(String),
    Domain(DomainError),
}

fn map_error_kind(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Validation => error_codes::INVALID_PARAMS,
        _ => error_codes::INTERNAL_ERROR,
    }
}

fn response_value(response: JsonRpcResponse) -> Value {
    serde_json::to_value(response).unwrap_or(Value::Null)
}

// Static artefact collections; empty today but part of the surface
fn resources_list() -> Value {
    serde_json::to_value(ResourcesListResult { resources: vec![] }).unwrap_or(Value::Null)
}

fn resources_read(params: Option<Value>) -> devflow_core::Result<Value> {
    let uri = params
        .as_ref()
        .and_then(|p| p.get("uri"))
        .and_then(Value::as_str)
        .ok_or_else(|| DomainError::validation("Rpc.Params", "missing resource uri"))?;
    Err(DomainError::not_found(
        "Resource.NotFound",
        format!("unknown resource {uri:?}"),
    ))
}

fn prompts_list() -> Value {
    serde_json::to_value(PromptsListResult { prompts: vec![] }).unwrap_or(Value::Null)
}

fn prompts_get(params: Option<Value>) -> devflow_core::Result<Value> {
    let name = params
        .as_ref()
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| DomainError::validation("Rpc.Params", "missing prompt name"))?;
    Err(DomainError::not_found(
        "Prompt.NotFound",
        format!("unknown prompt {name:?}"),
    ))
}
