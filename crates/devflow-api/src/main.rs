// DevFlow server binary
//
// Exit codes: 0 normal, 1 fatal startup error, 2 configuration error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devflow_api::{http, sweep, McpDispatcher, McpState};
use devflow_core::{DevFlowConfig, PluginStore, WorkflowStore};
use devflow_runtime::{
    DependencyResolver, InterpreterRuntime, ManagedRuntime, ModuleRegistry, PluginDiscovery,
    RegistryCache, RegistryClient, RuntimeDispatcher, RuntimeManager,
};
use devflow_storage::{migrations, Database, InProcessEventBus, PgPluginStore, PgWorkflowStore};
use devflow_worker::{InMemoryRunner, WorkflowRunner};

const SERVER_NAME: &str = "devflow";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devflow_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("devflow-api starting...");

    let config = match DevFlowConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };
    if config.connection_string.is_empty() {
        tracing::error!("no connection string configured (ConnectionString or DATABASE_URL)");
        std::process::exit(2);
    }

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run(config: DevFlowConfig) -> Result<()> {
    // Database
    let db = Database::from_url(&config.connection_string)
        .await
        .context("Failed to connect to database")?;
    migrations::run(db.pool())
        .await
        .context("Failed to apply migrations")?;
    tracing::info!("Connected to database");

    // Stores and event bus
    let bus = Arc::new(InProcessEventBus::new());
    devflow_storage::event_bus::spawn_event_logger(&bus);
    let plugin_store: Arc<dyn PluginStore> =
        Arc::new(PgPluginStore::new(db.clone(), bus.clone()));
    let workflow_store: Arc<dyn WorkflowStore> =
        Arc::new(PgWorkflowStore::new(db.clone(), bus.clone()));

    // Plugin runtime
    let cache = Arc::new(RegistryCache::new(config.registry_cache_path()));
    let client = RegistryClient::from_env().context("Failed to build registry client")?;
    let resolver = Arc::new(DependencyResolver::new(
        cache,
        client,
        plugin_store.clone(),
    ));

    let script_interpreter = std::env::var("DEVFLOW_SCRIPT_INTERPRETER")
        .ok()
        .map(PathBuf::from);
    let portable_interpreter = std::env::var("DEVFLOW_PORTABLE_INTERPRETER")
        .ok()
        .map(PathBuf::from);
    let managers: Vec<Arc<dyn RuntimeManager>> = vec![
        Arc::new(ManagedRuntime::new(Arc::new(ModuleRegistry::with_builtins()))),
        Arc::new(InterpreterRuntime::script(script_interpreter)),
        Arc::new(InterpreterRuntime::portable(portable_interpreter)),
    ];
    let runtime = Arc::new(RuntimeDispatcher::new(
        managers,
        resolver,
        config.plugins.max_concurrent_executions,
        Duration::from_millis(config.plugins.execution_timeout_ms),
        Some(config.plugins.max_memory_mb * 1024 * 1024),
        std::env::temp_dir().join("devflow-executions"),
    ));
    runtime
        .initialize_all()
        .await
        .map_err(|e| anyhow::anyhow!("runtime initialization failed: {e}"))?;

    // Workflow runner
    let runner: Arc<dyn WorkflowRunner> = Arc::new(InMemoryRunner::new(
        workflow_store.clone(),
        plugin_store.clone(),
        runtime.clone(),
    ));

    let state = Arc::new(McpState {
        plugin_store,
        workflow_store,
        runner: runner.clone(),
        runtime: runtime.clone(),
        discovery: PluginDiscovery::new(config.plugins.plugin_directories.clone()),
        server_name: SERVER_NAME.to_string(),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
    });

    // Startup discovery sweep
    match sweep::run_sweep(&state, None).await {
        Ok(outcome) => tracing::info!(
            discovered = outcome.discovered,
            registered = outcome.registered,
            "startup plugin sweep complete"
        ),
        Err(e) => tracing::warn!(error = %e, "startup plugin sweep failed"),
    }

    // Optional hot-reload loop
    if config.plugins.enable_hot_reload {
        let state = state.clone();
        let interval = Duration::from_secs(config.plugins.scan_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut last_sweep = chrono::Utc::now();
            loop {
                tokio::time::sleep(interval).await;
                let sweep_started = chrono::Utc::now();
                if let Err(e) = sweep::run_sweep(&state, Some(last_sweep)).await {
                    tracing::warn!(error = %e, "hot-reload sweep failed");
                }
                last_sweep = sweep_started;
            }
        });
        tracing::info!(
            interval_s = config.plugins.scan_interval_seconds,
            "hot reload enabled"
        );
    }

    let dispatcher = McpDispatcher::new(state);

    if !config.mcp_server.enable_http {
        tracing::warn!("HTTP transport disabled by configuration; nothing to serve");
        return Ok(());
    }

    // HTTP transport
    let app = http::router(dispatcher, Some(db));
    let addr = format!("0.0.0.0:{}", config.mcp_server.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Drain in-flight workflow runs, then tear the runtimes down
    tracing::info!("shutting down");
    if let Err(e) = runner.shutdown().await {
        tracing::warn!(error = %e, "runner shutdown failed");
    }
    runtime.dispose_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
