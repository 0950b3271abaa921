// Workflow engine behaviour against in-memory stores and a /bin/sh runtime

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use tempfile::TempDir;

use devflow_core::memory::{MemoryPluginStore, MemoryWorkflowStore};
use devflow_core::{
    Plugin, PluginId, PluginLanguage, PluginMetadata, PluginStore, StepStatus, Workflow,
    WorkflowId, WorkflowStatus, WorkflowStore,
};
use devflow_runtime::{
    DependencyResolver, InterpreterRuntime, RegistryCache, RegistryClient, RuntimeDispatcher,
};
use devflow_worker::{InMemoryRunner, WorkflowRunInput, WorkflowRunner};

struct World {
    plugin_store: Arc<MemoryPluginStore>,
    workflow_store: Arc<MemoryWorkflowStore>,
    runner: InMemoryRunner,
    _dirs: Vec<TempDir>,
}

impl World {
    async fn new() -> Self {
        let plugin_store = Arc::new(MemoryPluginStore::new());
        let workflow_store = Arc::new(MemoryWorkflowStore::new());

        let cache_root = TempDir::new().unwrap();
        let workdir_root = TempDir::new().unwrap();
        let resolver = Arc::new(DependencyResolver::new(
            Arc::new(RegistryCache::new(cache_root.path())),
            RegistryClient::new("http://127.0.0.1:1").unwrap(),
            plugin_store.clone() as Arc<dyn PluginStore>,
        ));
        let dispatcher = Arc::new(RuntimeDispatcher::new(
            vec![Arc::new(InterpreterRuntime::script(Some("/bin/sh".into())))],
            resolver,
            8,
            Duration::from_secs(10),
            None,
            workdir_root.path().to_path_buf(),
        ));

        let runner = InMemoryRunner::new(
            workflow_store.clone() as Arc<dyn WorkflowStore>,
            plugin_store.clone() as Arc<dyn PluginStore>,
            dispatcher,
        )
        .with_shutdown_grace(Duration::from_secs(2));

        Self {
            plugin_store,
            workflow_store,
            runner,
            _dirs: vec![cache_root, workdir_root],
        }
    }

    async fn add_sh_plugin(&mut self, name: &str, script: &str) -> PluginId {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.sh"), script).unwrap();
        let metadata = PluginMetadata::new(name, "1.0.0", "test", PluginLanguage::Script).unwrap();
        let mut plugin = Plugin::register(
            metadata,
            "main.sh",
            dir.path().to_string_lossy().to_string(),
            vec![],
            vec![],
            Map::new(),
            None,
        )
        .unwrap();
        plugin.mark_validated(Ok(())).unwrap();
        self.plugin_store.insert(&mut plugin).await.unwrap();
        let id = plugin.id();
        self._dirs.push(dir);
        id
    }

    async fn add_workflow(&self, steps: Vec<(&str, PluginId)>) -> WorkflowId {
        let mut workflow = Workflow::create("Build-Test", "engine test").unwrap();
        for (i, (name, plugin_id)) in steps.into_iter().enumerate() {
            workflow
                .add_step(name, plugin_id, i as i32, Map::new())
                .unwrap();
        }
        self.workflow_store.insert(&mut workflow).await.unwrap();
        workflow.id()
    }

    async fn wait_for_terminal(&self, id: WorkflowId, within: Duration) -> Workflow {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let workflow = self.workflow_store.get(id).await.unwrap().unwrap();
            if workflow.status().is_terminal() {
                return workflow;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "workflow did not settle; status {}",
                workflow.status()
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn reload(&self, id: WorkflowId) -> Workflow {
        self.workflow_store.get(id).await.unwrap().unwrap()
    }
}

const PRODUCER: &str =
    "cat > /dev/null\necho '{\"success\": true, \"data\": \"seed-output\", \"message\": \"produced\"}'\n";

// Succeeds only when its stdin context carries the producer's output
const CONSUMER: &str = "if grep -q 'seed-output'; then echo '{\"success\": true, \"message\": \"consumed\"}'; else echo '{\"success\": false, \"error\": \"missing input\"}'; fi\n";

const FAILER: &str =
    "cat > /dev/null\necho '{\"success\": false, \"error\": \"deliberate failure\"}'\n";

const SLEEPER: &str = "sleep 10\n";

#[tokio::test]
async fn happy_path_chains_step_output_into_next_input() {
    let mut world = World::new().await;
    let producer = world.add_sh_plugin("producer", PRODUCER).await;
    let consumer = world.add_sh_plugin("consumer", CONSUMER).await;
    let workflow_id = world
        .add_workflow(vec![("produce", producer), ("consume", consumer)])
        .await;

    world
        .runner
        .start_workflow(WorkflowRunInput { workflow_id })
        .await
        .unwrap();
    let finished = world.wait_for_terminal(workflow_id, Duration::from_secs(15)).await;

    assert_eq!(finished.status(), WorkflowStatus::Completed);
    assert!(finished.started_at().is_some());
    assert!(finished.completed_at().is_some());
    let steps = finished.steps_in_order();
    assert!(steps.iter().all(|s| s.status() == StepStatus::Completed));
    assert_eq!(steps[0].output(), Some("seed-output"));
    assert!(steps.iter().all(|s| s.execution_duration_ms().is_some()));
}

#[tokio::test]
async fn plugin_failure_fails_step_and_workflow_and_leaves_rest_pending() {
    let mut world = World::new().await;
    let failer = world.add_sh_plugin("failer", FAILER).await;
    let never = world.add_sh_plugin("never", PRODUCER).await;
    let workflow_id = world
        .add_workflow(vec![("explode", failer), ("after", never)])
        .await;

    world
        .runner
        .start_workflow(WorkflowRunInput { workflow_id })
        .await
        .unwrap();
    let finished = world.wait_for_terminal(workflow_id, Duration::from_secs(15)).await;

    assert_eq!(finished.status(), WorkflowStatus::Failed);
    assert!(finished.error_message().unwrap().contains("deliberate failure"));
    let steps = finished.steps_in_order();
    assert_eq!(steps[0].status(), StepStatus::Failed);
    assert_eq!(steps[1].status(), StepStatus::Pending);
}

#[tokio::test]
async fn missing_plugin_fails_the_workflow_with_cause() {
    let world = World::new().await;
    let ghost = PluginId::new();
    let workflow_id = world.add_workflow(vec![("ghost-step", ghost)]).await;

    world
        .runner
        .start_workflow(WorkflowRunInput { workflow_id })
        .await
        .unwrap();
    let finished = world.wait_for_terminal(workflow_id, Duration::from_secs(10)).await;

    assert_eq!(finished.status(), WorkflowStatus::Failed);
    assert!(finished.error_message().unwrap().contains("no longer exists"));
}

#[tokio::test]
async fn unavailable_plugin_fails_the_step() {
    let mut world = World::new().await;
    let plugin_id = world.add_sh_plugin("sometimes", PRODUCER).await;
    let mut plugin = world.plugin_store.get(plugin_id).await.unwrap().unwrap();
    plugin.disable(Some("maintenance".into()));
    world.plugin_store.update(&mut plugin).await.unwrap();

    let workflow_id = world.add_workflow(vec![("blocked", plugin_id)]).await;
    world
        .runner
        .start_workflow(WorkflowRunInput { workflow_id })
        .await
        .unwrap();
    let finished = world.wait_for_terminal(workflow_id, Duration::from_secs(10)).await;

    assert_eq!(finished.status(), WorkflowStatus::Failed);
    assert!(finished.error_message().unwrap().contains("disabled"));
}

#[tokio::test]
async fn cancellation_settles_quickly_and_abandons_the_step() {
    let mut world = World::new().await;
    let sleeper = world.add_sh_plugin("sleeper", SLEEPER).await;
    let workflow_id = world.add_workflow(vec![("nap", sleeper)]).await;

    world
        .runner
        .start_workflow(WorkflowRunInput { workflow_id })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancelled_at = std::time::Instant::now();
    world.runner.cancel_workflow(workflow_id).await.unwrap();
    let finished = world
        .wait_for_terminal(workflow_id, Duration::from_millis(2_500))
        .await;

    assert_eq!(finished.status(), WorkflowStatus::Cancelled);
    assert!(cancelled_at.elapsed() <= Duration::from_millis(2_500));
    let steps = finished.steps_in_order();
    assert_eq!(steps[0].status(), StepStatus::Failed);
    assert_eq!(steps[0].error_message(), Some("cancelled"));

    // The runner forgets the run once it settles
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!world.runner.is_running(workflow_id).await);
}

#[tokio::test]
async fn pause_holds_the_next_step_until_resume() {
    let mut world = World::new().await;
    let slow = world
        .add_sh_plugin(
            "slowish",
            "cat > /dev/null\nsleep 1\necho '{\"success\": true, \"message\": \"done\"}'\n",
        )
        .await;
    let after = world.add_sh_plugin("after", PRODUCER).await;
    let workflow_id = world
        .add_workflow(vec![("slow", slow), ("second", after)])
        .await;

    world
        .runner
        .start_workflow(WorkflowRunInput { workflow_id })
        .await
        .unwrap();

    // Pause while the first step is still running
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut workflow = world.reload(workflow_id).await;
    workflow.pause().unwrap();
    world.workflow_store.update(&mut workflow).await.unwrap();

    // First step finishes, but the second must not start while paused
    tokio::time::sleep(Duration::from_millis(1_800)).await;
    let paused = world.reload(workflow_id).await;
    assert_eq!(paused.status(), WorkflowStatus::Paused);
    let steps = paused.steps_in_order();
    assert_eq!(steps[0].status(), StepStatus::Completed);
    assert_eq!(steps[1].status(), StepStatus::Pending);

    let mut workflow = world.reload(workflow_id).await;
    workflow.resume().unwrap();
    world.workflow_store.update(&mut workflow).await.unwrap();

    let finished = world.wait_for_terminal(workflow_id, Duration::from_secs(15)).await;
    assert_eq!(finished.status(), WorkflowStatus::Completed);
}

#[tokio::test]
async fn execution_count_advances_once_per_successful_step() {
    let mut world = World::new().await;
    let producer = world.add_sh_plugin("counted", PRODUCER).await;
    let workflow_id = world.add_workflow(vec![("only", producer)]).await;

    world
        .runner
        .start_workflow(WorkflowRunInput { workflow_id })
        .await
        .unwrap();
    world.wait_for_terminal(workflow_id, Duration::from_secs(15)).await;

    let plugin = world.plugin_store.get(producer).await.unwrap().unwrap();
    assert_eq!(plugin.execution_count(), 1);
    assert!(plugin.last_executed_at().is_some());
}

#[tokio::test]
async fn shutdown_cancels_running_workflows() {
    let mut world = World::new().await;
    let sleeper = world.add_sh_plugin("sleeper", SLEEPER).await;
    let workflow_id = world.add_workflow(vec![("nap", sleeper)]).await;

    world
        .runner
        .start_workflow(WorkflowRunInput { workflow_id })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(world.runner.active_count().await, 1);

    world.runner.shutdown().await.unwrap();
    assert_eq!(world.runner.active_count().await, 0);
}
