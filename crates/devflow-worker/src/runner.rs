// Workflow runners
//
// The default runner executes each workflow run as a tokio task tracked in an
// in-memory registry; cancellation goes through a per-run token. Fast but not
// durable across process restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use devflow_core::{PluginStore, Result, WorkflowId, WorkflowStore};
use devflow_runtime::RuntimeDispatcher;

use crate::workflow::WorkflowRunWorkflow;

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Input for starting a workflow run
#[derive(Debug, Clone, Copy)]
pub struct WorkflowRunInput {
    pub workflow_id: WorkflowId,
}

/// Port the API layer drives workflow execution through
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn start_workflow(&self, input: WorkflowRunInput) -> Result<()>;

    async fn cancel_workflow(&self, workflow_id: WorkflowId) -> Result<()>;

    async fn is_running(&self, workflow_id: WorkflowId) -> bool;

    async fn active_count(&self) -> usize;

    /// Cancel everything and wait out the grace period
    async fn shutdown(&self) -> Result<()>;
}

/// In-memory workflow runner using tokio tasks
pub struct InMemoryRunner {
    workflow_store: Arc<dyn WorkflowStore>,
    plugin_store: Arc<dyn PluginStore>,
    dispatcher: Arc<RuntimeDispatcher>,
    active_runs: Arc<RwLock<HashMap<WorkflowId, JoinHandle<()>>>>,
    cancel_tokens: Arc<Mutex<HashMap<WorkflowId, CancellationToken>>>,
    shutdown_grace: Duration,
}

impl InMemoryRunner {
    pub fn new(
        workflow_store: Arc<dyn WorkflowStore>,
        plugin_store: Arc<dyn PluginStore>,
        dispatcher: Arc<RuntimeDispatcher>,
    ) -> Self {
        Self {
            workflow_store,
            plugin_store,
            dispatcher,
            active_runs: Arc::new(RwLock::new(HashMap::new())),
            cancel_tokens: Arc::new(Mutex::new(HashMap::new())),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[async_trait]
impl WorkflowRunner for InMemoryRunner {
    async fn start_workflow(&self, input: WorkflowRunInput) -> Result<()> {
        let workflow_id = input.workflow_id;
        info!(workflow_id = %workflow_id, "starting workflow run task");

        let cancellation = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .await
            .insert(workflow_id, cancellation.clone());

        let run = WorkflowRunWorkflow::new(
            workflow_id,
            self.workflow_store.clone(),
            self.plugin_store.clone(),
            self.dispatcher.clone(),
            cancellation,
        );

        let active_runs = self.active_runs.clone();
        let cancel_tokens = self.cancel_tokens.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run.execute().await {
                run.handle_error(&e).await;
            }
            active_runs.write().await.remove(&workflow_id);
            cancel_tokens.lock().await.remove(&workflow_id);
        });

        self.active_runs.write().await.insert(workflow_id, handle);
        Ok(())
    }

    async fn cancel_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        info!(workflow_id = %workflow_id, "cancelling workflow run");
        if let Some(token) = self.cancel_tokens.lock().await.get(&workflow_id) {
            token.cancel();
        }
        Ok(())
    }

    async fn is_running(&self, workflow_id: WorkflowId) -> bool {
        self.active_runs.read().await.contains_key(&workflow_id)
    }

    async fn active_count(&self) -> usize {
        self.active_runs.read().await.len()
    }

    async fn shutdown(&self) -> Result<()> {
        info!("shutting down workflow runner");

        for token in self.cancel_tokens.lock().await.values() {
            token.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        loop {
            if self.active_runs.read().await.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Grace period over: abort whatever is left
        let mut runs = self.active_runs.write().await;
        for (workflow_id, handle) in runs.drain() {
            warn!(workflow_id = %workflow_id, "aborting workflow run on shutdown");
            handle.abort();
        }
        Ok(())
    }
}
