// Execute a throwaway script plugin through the runtime dispatcher.
//
// Run with: cargo run -p devflow-runtime --example run_script_plugin

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use devflow_core::memory::MemoryPluginStore;
use devflow_core::{Plugin, PluginLanguage, PluginMetadata};
use devflow_runtime::{
    DependencyResolver, ExecuteRequest, InterpreterRuntime, RegistryCache, RegistryClient,
    RuntimeDispatcher,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // A plugin directory with a shell entry point standing in for a script runtime
    let plugin_dir = tempfile::TempDir::new()?;
    std::fs::write(
        plugin_dir.path().join("main.sh"),
        "cat > /dev/null\necho '{\"success\": true, \"message\": \"hello from a script plugin\"}'\n",
    )?;

    let metadata =
        PluginMetadata::new("demo", "0.1.0", "example plugin", PluginLanguage::Script)?;
    let mut plugin = Plugin::register(
        metadata,
        "main.sh",
        plugin_dir.path().to_string_lossy().to_string(),
        vec![],
        vec![],
        Map::new(),
        None,
    )?;
    plugin.mark_validated(Ok(()))?;
    plugin.clear_domain_events();

    let cache_root = tempfile::TempDir::new()?;
    let workdir_root = tempfile::TempDir::new()?;
    let resolver = Arc::new(DependencyResolver::new(
        Arc::new(RegistryCache::new(cache_root.path())),
        RegistryClient::from_env()?,
        Arc::new(MemoryPluginStore::new()),
    ));
    let dispatcher = RuntimeDispatcher::new(
        vec![Arc::new(InterpreterRuntime::script(Some("/bin/sh".into())))],
        resolver,
        4,
        Duration::from_secs(10),
        None,
        workdir_root.path().to_path_buf(),
    );
    dispatcher.initialize_all().await?;

    let result = dispatcher
        .execute(
            &plugin,
            ExecuteRequest {
                input_data: Some(Value::String("demo input".into())),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await?;

    println!("success: {}", result.envelope.success);
    println!("message: {}", result.envelope.message.unwrap_or_default());
    println!("took: {:?}", result.duration);

    dispatcher.dispose_all().await;
    Ok(())
}
