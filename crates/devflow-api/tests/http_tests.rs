// HTTP transport tests: endpoint shape, required headers, health

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::util::ServiceExt;

use devflow_api::{http, McpDispatcher, McpState};
use devflow_core::memory::{MemoryPluginStore, MemoryWorkflowStore};
use devflow_core::{PluginStore, WorkflowStore};
use devflow_runtime::{
    DependencyResolver, InterpreterRuntime, PluginDiscovery, RegistryCache, RegistryClient,
    RuntimeDispatcher, RuntimeManager,
};
use devflow_worker::{InMemoryRunner, WorkflowRunner};

async fn test_router() -> (axum::Router, Vec<tempfile::TempDir>) {
    let plugin_store = Arc::new(MemoryPluginStore::new());
    let workflow_store = Arc::new(MemoryWorkflowStore::new());
    let cache_root = tempfile::TempDir::new().unwrap();
    let workdir_root = tempfile::TempDir::new().unwrap();

    let resolver = Arc::new(DependencyResolver::new(
        Arc::new(RegistryCache::new(cache_root.path())),
        RegistryClient::new("http://127.0.0.1:1").unwrap(),
        plugin_store.clone() as Arc<dyn PluginStore>,
    ));
    let managers: Vec<Arc<dyn RuntimeManager>> =
        vec![Arc::new(InterpreterRuntime::script(Some("/bin/sh".into())))];
    let runtime = Arc::new(RuntimeDispatcher::new(
        managers,
        resolver,
        2,
        Duration::from_secs(5),
        None,
        workdir_root.path().to_path_buf(),
    ));
    let runner = Arc::new(InMemoryRunner::new(
        workflow_store.clone() as Arc<dyn WorkflowStore>,
        plugin_store.clone() as Arc<dyn PluginStore>,
        runtime.clone(),
    )) as Arc<dyn WorkflowRunner>;

    let state = Arc::new(McpState {
        plugin_store,
        workflow_store,
        runner,
        runtime,
        discovery: PluginDiscovery::new(vec![]),
        server_name: "devflow".into(),
        server_version: "0.3.0".into(),
    });

    (
        http::router(McpDispatcher::new(state), None),
        vec![cache_root, workdir_root],
    )
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn mcp_endpoint_answers_with_protocol_headers() {
    let (router, _dirs) = test_router().await;

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"jsonrpc": "2.0", "id": 7, "method": "initialize"}"#,
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("X-MCP-Server").unwrap(),
        "devflow/0.3.0"
    );
    assert_eq!(
        response.headers().get("X-Protocol-Version").unwrap(),
        "2024-11-05"
    );

    let json = body_json(response).await;
    assert_eq!(json["id"], 7);
    assert_eq!(json["result"]["protocolVersion"], "2024-11-05");
}

#[tokio::test]
async fn malformed_body_is_a_parse_error_not_a_transport_error() {
    let (router, _dirs) = test_router().await;

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from("this is not json"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32700);
}

#[tokio::test]
async fn health_reports_ok() {
    let (router, _dirs) = test_router().await;

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("X-Protocol-Version").unwrap(),
        "2024-11-05"
    );
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn notification_only_body_yields_no_content() {
    let (router, _dirs) = test_router().await;

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"jsonrpc": "2.0", "method": "notifications/initialized"}"#,
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
