// Runtime managers
//
// One manager per plugin language behind a composite dispatcher. The
// dispatcher owns the shared execution contract: working directory, dependency
// resolution, the global concurrency cap and the deadline defaults; each
// manager owns only its language strategy.

pub mod interpreter;
pub mod managed;
pub mod subprocess;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use devflow_core::{
    DomainError, Plugin, PluginEnvelope, PluginLanguage, Result,
};

use crate::resolver::{DependencyContext, DependencyResolver};

/// Error codes shared by all runtimes
pub const CODE_TIMEOUT: &str = "Plugin.Timeout";
pub const CODE_MEMORY_LIMIT: &str = "Plugin.MemoryLimit";
pub const CODE_CANCELLED: &str = "Plugin.Cancelled";
pub const CODE_ENVELOPE: &str = "Plugin.Envelope";

/// Default cap on captured stdout/stderr bytes
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 1024 * 1024;

/// Everything a single plugin execution needs
#[derive(Debug, Clone)]
pub struct ExecutionInput {
    pub configuration: Map<String, Value>,
    pub input_data: Option<Value>,
    pub working_directory: PathBuf,
    pub execution_parameters: Map<String, Value>,
    pub deadline: Duration,
    pub memory_cap_bytes: Option<u64>,
    pub output_cap_bytes: usize,
    pub cancellation: CancellationToken,
}

impl ExecutionInput {
    /// JSON context handed to the plugin (stdin for subprocess runtimes)
    pub fn context_json(&self) -> Value {
        serde_json::json!({
            "configuration": Value::Object(self.configuration.clone()),
            "inputData": self.input_data.clone().unwrap_or(Value::Null),
            "workingDirectory": self.working_directory.to_string_lossy(),
            "executionParameters": Value::Object(self.execution_parameters.clone()),
        })
    }
}

/// Structured outcome of one plugin execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub envelope: PluginEnvelope,
    pub exit_code: Option<i32>,
    pub output_truncated: bool,
    pub duration: Duration,
}

/// Language strategy behind the dispatcher
#[async_trait]
pub trait RuntimeManager: Send + Sync {
    fn language(&self) -> PluginLanguage;

    /// Idempotent manager-global setup
    async fn initialize(&self) -> Result<()>;

    /// Idempotent teardown; terminates anything still running
    async fn dispose(&self) -> Result<()>;

    /// Could this plugin plausibly execute right now?
    async fn validate(&self, plugin: &Plugin) -> Result<bool>;

    async fn execute(
        &self,
        plugin: &Plugin,
        input: ExecutionInput,
        dependencies: &DependencyContext,
    ) -> Result<ExecutionResult>;
}

/// Caller-facing request; dispatcher fills in the execution mechanics
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub configuration: Map<String, Value>,
    pub input_data: Option<Value>,
    pub execution_parameters: Map<String, Value>,
    pub deadline_ms: Option<u64>,
}

/// Composite dispatcher over the per-language managers
pub struct RuntimeDispatcher {
    managers: HashMap<PluginLanguage, Arc<dyn RuntimeManager>>,
    resolver: Arc<DependencyResolver>,
    semaphore: Arc<Semaphore>,
    default_deadline: Duration,
    memory_cap_bytes: Option<u64>,
    output_cap_bytes: usize,
    workdir_root: PathBuf,
}

impl RuntimeDispatcher {
    pub fn new(
        managers: Vec<Arc<dyn RuntimeManager>>,
        resolver: Arc<DependencyResolver>,
        max_concurrent: usize,
        default_deadline: Duration,
        memory_cap_bytes: Option<u64>,
        workdir_root: PathBuf,
    ) -> Self {
        let managers = managers
            .into_iter()
            .map(|m| (m.language(), m))
            .collect();
        Self {
            managers,
            resolver,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            default_deadline,
            memory_cap_bytes,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
            workdir_root,
        }
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    fn manager(&self, language: PluginLanguage) -> Result<&Arc<dyn RuntimeManager>> {
        self.managers.get(&language).ok_or_else(|| {
            DomainError::failure(
                "Runtime.NoManager",
                format!("no runtime manager for language {language}"),
            )
        })
    }

    pub async fn initialize_all(&self) -> Result<()> {
        for manager in self.managers.values() {
            manager.initialize().await?;
        }
        Ok(())
    }

    pub async fn dispose_all(&self) {
        for manager in self.managers.values() {
            if let Err(e) = manager.dispose().await {
                tracing::warn!(language = %manager.language(), error = %e, "runtime dispose failed");
            }
        }
    }

    /// Validation verdict plus the reasons it failed, for surfacing to clients
    pub async fn validate(&self, plugin: &Plugin) -> Result<(bool, Vec<String>)> {
        let mut reasons = Vec::new();

        let manager = match self.manager(plugin.language()) {
            Ok(m) => Some(m),
            Err(e) => {
                reasons.push(e.message.clone());
                None
            }
        };
        if let Some(manager) = manager {
            if !manager.validate(plugin).await? {
                reasons.push(format!(
                    "runtime for language {} rejected the plugin",
                    plugin.language()
                ));
            }
        }

        for issue in self.resolver.validate_dependencies(plugin).await {
            reasons.push(issue.to_string());
        }

        Ok((reasons.is_empty(), reasons))
    }

    /// Full execution contract for one plugin invocation
    pub async fn execute(
        &self,
        plugin: &Plugin,
        request: ExecuteRequest,
        cancellation: CancellationToken,
    ) -> Result<ExecutionResult> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DomainError::failure("Runtime.ShuttingDown", "executor is shut down"))?;

        let manager = self.manager(plugin.language())?;

        // Scoped working directory for this execution
        let working_directory = self
            .workdir_root
            .join(plugin.id().to_string())
            .join(uuid::Uuid::now_v7().to_string());
        tokio::fs::create_dir_all(&working_directory)
            .await
            .map_err(|e| DomainError::failure("Runtime.Workdir", e.to_string()))?;

        let dependencies = self.resolver.resolve(plugin, &cancellation).await;
        if !dependencies.is_ok() {
            let _ = tokio::fs::remove_dir_all(&working_directory).await;
            return Err(dependencies.into_error());
        }

        let deadline = request
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_deadline);

        let input = ExecutionInput {
            configuration: request.configuration,
            input_data: request.input_data,
            working_directory: working_directory.clone(),
            execution_parameters: request.execution_parameters,
            deadline,
            memory_cap_bytes: self.memory_cap_bytes,
            output_cap_bytes: self.output_cap_bytes,
            cancellation,
        };

        let result = manager.execute(plugin, input, &dependencies).await;
        let _ = tokio::fs::remove_dir_all(&working_directory).await;
        result
    }
}
