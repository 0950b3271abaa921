// End-to-end dispatcher execution through the full contract:
// workdir -> dependency resolution -> language strategy -> envelope

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use devflow_core::memory::MemoryPluginStore;
use devflow_core::{Plugin, PluginDependency, PluginLanguage, PluginMetadata};
use devflow_runtime::{
    DependencyResolver, ExecuteRequest, InterpreterRuntime, ManagedRuntime, ModuleRegistry,
    RegistryCache, RegistryClient, RuntimeDispatcher,
};

fn sh_plugin(dir: &Path, name: &str, script: &str, deps: Vec<PluginDependency>) -> Plugin {
    std::fs::write(dir.join("main.sh"), script).unwrap();
    let metadata = PluginMetadata::new(name, "1.0.0", "test", PluginLanguage::Script).unwrap();
    let mut plugin = Plugin::register(
        metadata,
        "main.sh",
        dir.to_string_lossy().to_string(),
        vec![],
        deps,
        Map::new(),
        None,
    )
    .unwrap();
    plugin.mark_validated(Ok(())).unwrap();
    plugin.clear_domain_events();
    plugin
}

async fn dispatcher(cache_root: &Path, workdir_root: &Path) -> RuntimeDispatcher {
    let store = Arc::new(MemoryPluginStore::new());
    let resolver = Arc::new(DependencyResolver::new(
        Arc::new(RegistryCache::new(cache_root)),
        RegistryClient::new("http://127.0.0.1:1").unwrap(),
        store,
    ));
    RuntimeDispatcher::new(
        vec![
            Arc::new(InterpreterRuntime::script(Some("/bin/sh".into()))),
            Arc::new(ManagedRuntime::new(Arc::new(ModuleRegistry::with_builtins()))),
        ],
        resolver,
        4,
        Duration::from_secs(10),
        None,
        workdir_root.to_path_buf(),
    )
}

#[tokio::test]
async fn executes_a_script_plugin_end_to_end() {
    let plugin_dir = TempDir::new().unwrap();
    let cache_root = TempDir::new().unwrap();
    let workdir_root = TempDir::new().unwrap();

    let plugin = sh_plugin(
        plugin_dir.path(),
        "runner",
        "cat > /dev/null\necho '{\"success\": true, \"message\": \"ran\"}'\n",
        vec![],
    );

    let dispatcher = dispatcher(cache_root.path(), workdir_root.path()).await;
    dispatcher.initialize_all().await.unwrap();

    let result = dispatcher
        .execute(&plugin, ExecuteRequest::default(), CancellationToken::new())
        .await
        .unwrap();
    assert!(result.envelope.success);
    assert_eq!(result.envelope.message.as_deref(), Some("ran"));

    // Execution-scoped working directories are cleaned up afterwards
    let leftovers: Vec<_> = std::fs::read_dir(workdir_root.path())
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .flat_map(|e| std::fs::read_dir(e.path()).into_iter().flatten().flatten())
                .collect()
        })
        .unwrap_or_default();
    assert!(leftovers.is_empty());

    dispatcher.dispose_all().await;
}

#[tokio::test]
async fn dependency_failure_aborts_before_launch() {
    let plugin_dir = TempDir::new().unwrap();
    let cache_root = TempDir::new().unwrap();
    let workdir_root = TempDir::new().unwrap();

    let plugin = sh_plugin(
        plugin_dir.path(),
        "needy",
        "echo '{\"success\": true}'\n",
        vec![PluginDependency::file_ref("does-not-exist.sh")],
    );

    let dispatcher = dispatcher(cache_root.path(), workdir_root.path()).await;
    let err = dispatcher
        .execute(&plugin, ExecuteRequest::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, "Dependency.Resolution");
}

#[tokio::test]
async fn validate_reports_dependency_reasons() {
    let plugin_dir = TempDir::new().unwrap();
    let cache_root = TempDir::new().unwrap();
    let workdir_root = TempDir::new().unwrap();

    let good = sh_plugin(plugin_dir.path(), "good", "true\n", vec![]);
    let dispatcher = dispatcher(cache_root.path(), workdir_root.path()).await;

    let (ok, reasons) = dispatcher.validate(&good).await.unwrap();
    assert!(ok, "unexpected reasons: {reasons:?}");

    let bad_dir = TempDir::new().unwrap();
    let bad = sh_plugin(
        bad_dir.path(),
        "bad",
        "true\n",
        vec![PluginDependency::file_ref("../escape.sh")],
    );
    let (ok, reasons) = dispatcher.validate(&bad).await.unwrap();
    assert!(!ok);
    assert_eq!(reasons.len(), 1);
}

#[tokio::test]
async fn managed_plugin_routes_to_the_managed_runtime() {
    let plugin_dir = TempDir::new().unwrap();
    let cache_root = TempDir::new().unwrap();
    let workdir_root = TempDir::new().unwrap();

    std::fs::write(plugin_dir.path().join("hello.m"), "greet\n").unwrap();
    let metadata = PluginMetadata::new("hello", "1.0.0", "", PluginLanguage::Managed).unwrap();
    let mut plugin = Plugin::register(
        metadata,
        "hello.m",
        plugin_dir.path().to_string_lossy().to_string(),
        vec![],
        vec![],
        Map::new(),
        None,
    )
    .unwrap();
    plugin.mark_validated(Ok(())).unwrap();
    plugin.clear_domain_events();

    let dispatcher = dispatcher(cache_root.path(), workdir_root.path()).await;
    let mut params = Map::new();
    params.insert("greeting".into(), Value::String("Hi".into()));
    let result = dispatcher
        .execute(
            &plugin,
            ExecuteRequest {
                input_data: Some(Value::String("World".into())),
                execution_parameters: params,
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.envelope.success);
    assert!(result.envelope.message.as_deref().unwrap().contains("Hi, World!"));
}
