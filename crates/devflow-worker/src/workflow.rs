// Workflow run execution
//
// Sequences the steps of one workflow: loads the referenced plugin per step,
// executes it through the runtime dispatcher, marshals the previous step's
// output into the next step's input, and propagates failures onto both the
// step and the workflow. Pause is honoured between steps only.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use devflow_core::{
    DomainError, ErrorKind, Plugin, PluginEnvelope, PluginStatus, PluginStore, Result, Workflow,
    WorkflowId, WorkflowStatus, WorkflowStepId, WorkflowStore,
};
use devflow_runtime::{ExecuteRequest, RuntimeDispatcher, CODE_CANCELLED};

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(250);
const CONFLICT_RETRIES: usize = 3;

/// Executes a single workflow run to a terminal status
pub struct WorkflowRunWorkflow {
    workflow_id: WorkflowId,
    workflow_store: Arc<dyn WorkflowStore>,
    plugin_store: Arc<dyn PluginStore>,
    dispatcher: Arc<RuntimeDispatcher>,
    cancellation: CancellationToken,
}

impl WorkflowRunWorkflow {
    pub fn new(
        workflow_id: WorkflowId,
        workflow_store: Arc<dyn WorkflowStore>,
        plugin_store: Arc<dyn PluginStore>,
        dispatcher: Arc<RuntimeDispatcher>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            workflow_id,
            workflow_store,
            plugin_store,
            dispatcher,
            cancellation,
        }
    }

    /// Run the workflow to completion, failure or cancellation
    pub async fn execute(&self) -> Result<()> {
        info!(workflow_id = %self.workflow_id, "starting workflow run");

        let workflow = self.mutate(|wf| wf.start()).await?;
        let step_ids: Vec<WorkflowStepId> = workflow
            .steps_in_order()
            .iter()
            .map(|s| s.id())
            .collect();

        let mut previous_output: Option<String> = None;

        for step_id in step_ids {
            // Pause boundary: never enter a step while the workflow is paused
            let workflow = match self.wait_while_paused().await? {
                Some(workflow) => workflow,
                None => {
                    // Cancelled while paused
                    self.settle_cancelled(step_id).await?;
                    return Ok(());
                }
            };

            if self.cancellation.is_cancelled() {
                self.settle_cancelled(step_id).await?;
                return Ok(());
            }

            let step = workflow.step(step_id).ok_or_else(|| {
                DomainError::not_found("Workflow.StepNotFound", format!("step {step_id}"))
            })?;
            if step.status() == devflow_core::StepStatus::Skipped {
                continue;
            }

            let plugin_id = step.plugin_id();
            let configuration = step.configuration().clone();
            let step_name = step.name().to_string();

            self.mutate(|wf| wf.begin_step(step_id)).await?;

            // Resolve the stored plugin record for this step
            let plugin = match self.plugin_store.get(plugin_id).await? {
                Some(plugin) if plugin.status() == PluginStatus::Available => plugin,
                Some(plugin) => {
                    let cause = format!(
                        "plugin {} is {} and cannot execute",
                        plugin.name(),
                        plugin.status()
                    );
                    self.settle_failed(step_id, &step_name, &cause).await?;
                    return Ok(());
                }
                None => {
                    let cause = format!("plugin {plugin_id} no longer exists");
                    self.settle_failed(step_id, &step_name, &cause).await?;
                    return Ok(());
                }
            };

            let request = ExecuteRequest {
                configuration,
                input_data: previous_output.clone().map(Value::String),
                execution_parameters: serde_json::Map::new(),
                deadline_ms: None,
            };

            let outcome = self
                .dispatcher
                .execute(&plugin, request, self.cancellation.child_token())
                .await;

            match outcome {
                Ok(result) if result.envelope.success => {
                    let output = envelope_output(&result.envelope);
                    self.record_plugin_execution(&plugin).await;
                    self.mutate(|wf| wf.complete_step(step_id, output.clone()))
                        .await?;
                    info!(
                        workflow_id = %self.workflow_id,
                        step = %step_name,
                        duration_ms = result.duration.as_millis() as u64,
                        "step completed"
                    );
                    previous_output = output;
                }
                Ok(result) => {
                    let cause = result
                        .envelope
                        .error
                        .clone()
                        .or(result.envelope.message.clone())
                        .unwrap_or_else(|| "plugin reported failure".to_string());
                    self.settle_failed(step_id, &step_name, &cause).await?;
                    return Ok(());
                }
                Err(e) if e.code == CODE_CANCELLED || self.cancellation.is_cancelled() => {
                    self.settle_cancelled(step_id).await?;
                    return Ok(());
                }
                Err(e) => {
                    self.settle_failed(step_id, &step_name, &e.message).await?;
                    return Ok(());
                }
            }
        }

        self.mutate(|wf| wf.complete()).await?;
        info!(workflow_id = %self.workflow_id, "workflow completed");
        Ok(())
    }

    /// Mark the workflow failed after an unrecoverable engine error
    pub async fn handle_error(&self, error: &DomainError) {
        error!(workflow_id = %self.workflow_id, error = %error, "workflow run failed");
        let message = error.message.clone();
        if let Err(e) = self.mutate(|wf| wf.fail(message.clone())).await {
            warn!(workflow_id = %self.workflow_id, error = %e, "could not record workflow failure");
        }
    }

    /// Block between steps while the workflow is paused.
    /// Returns the current aggregate, or None when cancellation won.
    async fn wait_while_paused(&self) -> Result<Option<Workflow>> {
        loop {
            let workflow = self.load().await?;
            match workflow.status() {
                WorkflowStatus::Paused => {
                    tokio::select! {
                        _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
                        _ = self.cancellation.cancelled() => return Ok(None),
                    }
                }
                WorkflowStatus::Cancelled => return Ok(None),
                _ => return Ok(Some(workflow)),
            }
        }
    }

    async fn settle_failed(&self, step_id: WorkflowStepId, step_name: &str, cause: &str) -> Result<()> {
        warn!(
            workflow_id = %self.workflow_id,
            step = %step_name,
            cause,
            "workflow step failed"
        );
        let cause_owned = cause.to_string();
        let message = format!("step '{step_name}' failed: {cause}");
        self.mutate(move |wf| {
            wf.fail_step(step_id, cause_owned.clone())?;
            wf.fail(message.clone())
        })
        .await?;
        Ok(())
    }

    async fn settle_cancelled(&self, step_id: WorkflowStepId) -> Result<()> {
        info!(workflow_id = %self.workflow_id, "workflow cancelled");
        self.mutate(move |wf| {
            // The in-flight (or never-started) step is abandoned
            if let Some(step) = wf.step(step_id) {
                if matches!(
                    step.status(),
                    devflow_core::StepStatus::Pending | devflow_core::StepStatus::Running
                ) {
                    wf.fail_step(step_id, "cancelled")?;
                }
            }
            if wf.status() != WorkflowStatus::Cancelled {
                wf.cancel()?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Advance the plugin's execution counter; a persistence hiccup here must
    /// not fail the workflow.
    async fn record_plugin_execution(&self, plugin: &Plugin) {
        let refreshed = match self.plugin_store.get(plugin.id()).await {
            Ok(Some(p)) => Some(p),
            _ => None,
        };
        let Some(mut plugin) = refreshed else {
            warn!(plugin_id = %plugin.id(), "plugin vanished before execution was recorded");
            return;
        };
        if let Err(e) = plugin.record_execution() {
            warn!(plugin_id = %plugin.id(), error = %e, "could not record execution");
            return;
        }
        if let Err(e) = self.plugin_store.update(&mut plugin).await {
            warn!(plugin_id = %plugin.id(), error = %e, "could not persist execution count");
        }
    }

    async fn load(&self) -> Result<Workflow> {
        self.workflow_store
            .get(self.workflow_id)
            .await?
            .ok_or_else(|| {
                DomainError::not_found(
                    "Workflow.NotFound",
                    format!("workflow {}", self.workflow_id),
                )
            })
    }

    /// Load-mutate-store with a bounded retry on optimistic conflicts, so
    /// concurrent pause/cancel writes from the API never wedge the engine.
    async fn mutate<F>(&self, mut apply: F) -> Result<Workflow>
    where
        F: FnMut(&mut Workflow) -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            let mut workflow = self.load().await?;
            apply(&mut workflow)?;
            match self.workflow_store.update(&mut workflow).await {
                Ok(()) => return Ok(workflow),
                Err(e) if e.kind == ErrorKind::Conflict && attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// The string a step stores as its output and feeds into the next step
fn envelope_output(envelope: &PluginEnvelope) -> Option<String> {
    match &envelope.data {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
        None => envelope.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_output_prefers_data_over_message() {
        let mut envelope = PluginEnvelope::success("msg");
        assert_eq!(envelope_output(&envelope).as_deref(), Some("msg"));

        envelope.data = Some(Value::String("payload".into()));
        assert_eq!(envelope_output(&envelope).as_deref(), Some("payload"));

        envelope.data = Some(serde_json::json!({"k": 1}));
        assert_eq!(envelope_output(&envelope).as_deref(), Some("{\"k\":1}"));
    }
}
