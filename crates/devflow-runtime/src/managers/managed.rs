// Managed (M) runtime: in-process module host
//
// An M plugin's entry-point file names an entry symbol. The manager resolves
// that symbol against its module registry of natively compiled handlers and
// invokes it in-process with a typed context, under the same deadline and
// cancellation rules as the subprocess runtimes. Each invocation gets a fresh
// context, which plays the role of an unloadable load context.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use devflow_core::{DomainError, Plugin, PluginEnvelope, PluginLanguage, Result};

use crate::resolver::DependencyContext;

use super::{
    ExecutionInput, ExecutionResult, RuntimeManager, CODE_CANCELLED, CODE_TIMEOUT,
};

/// Typed context handed to a managed module
#[derive(Debug, Clone)]
pub struct ManagedContext {
    pub configuration: Map<String, Value>,
    pub input_data: Option<Value>,
    pub working_directory: PathBuf,
    pub execution_parameters: Map<String, Value>,
    /// Package payload directories resolved for this plugin
    pub assemblies: Vec<PathBuf>,
    pub cancellation: CancellationToken,
}

/// A natively compiled plugin entry handler
#[async_trait]
pub trait ManagedModule: Send + Sync {
    /// Entry symbol this module answers to
    fn symbol(&self) -> &str;

    async fn invoke(&self, context: ManagedContext) -> Result<PluginEnvelope>;
}

/// Registry of entry symbols the host can execute
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn ManagedModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the host's built-in modules
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::GreetModule));
        registry.register(Arc::new(builtin::EchoModule));
        registry.register(Arc::new(builtin::FailingModule));
        registry
    }

    pub fn register(&mut self, module: Arc<dyn ManagedModule>) {
        self.modules.insert(module.symbol().to_string(), module);
    }

    pub fn resolve(&self, symbol: &str) -> Option<Arc<dyn ManagedModule>> {
        self.modules.get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }
}

/// In-process runtime manager for M plugins
pub struct ManagedRuntime {
    registry: Arc<ModuleRegistry>,
    initialized: AtomicBool,
}

impl ManagedRuntime {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            registry,
            initialized: AtomicBool::new(false),
        }
    }

    /// Entry symbol named by the plugin's entry-point file: the first
    /// non-empty, non-comment line.
    fn entry_symbol(plugin: &Plugin) -> Result<String> {
        let entry_path = Path::new(plugin.plugin_path()).join(plugin.entry_point());
        let content = std::fs::read_to_string(&entry_path).map_err(|e| {
            DomainError::failure(
                "Runtime.EntryPoint",
                format!("cannot read {}: {e}", entry_path.display()),
            )
        })?;
        content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .ok_or_else(|| {
                DomainError::validation(
                    "Runtime.EntrySymbol",
                    format!("{} names no entry symbol", entry_path.display()),
                )
            })
    }
}

#[async_trait]
impl RuntimeManager for ManagedRuntime {
    fn language(&self) -> PluginLanguage {
        PluginLanguage::Managed
    }

    async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(
            modules = self.registry.symbols().len(),
            "managed runtime initialized"
        );
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn validate(&self, plugin: &Plugin) -> Result<bool> {
        let symbol = match Self::entry_symbol(plugin) {
            Ok(symbol) => symbol,
            Err(_) => return Ok(false),
        };
        Ok(self.registry.resolve(&symbol).is_some())
    }

    async fn execute(
        &self,
        plugin: &Plugin,
        input: ExecutionInput,
        dependencies: &DependencyContext,
    ) -> Result<ExecutionResult> {
        let symbol = Self::entry_symbol(plugin)?;
        let module = self.registry.resolve(&symbol).ok_or_else(|| {
            DomainError::validation(
                "Runtime.EntrySymbol",
                format!("unknown managed entry symbol {symbol:?}"),
            )
        })?;

        let context = ManagedContext {
            configuration: input.configuration,
            input_data: input.input_data,
            working_directory: input.working_directory,
            execution_parameters: input.execution_parameters,
            assemblies: dependencies.assemblies.clone(),
            cancellation: input.cancellation.clone(),
        };

        let started = Instant::now();
        let invocation = module.invoke(context);
        let envelope = tokio::select! {
            outcome = tokio::time::timeout(input.deadline, invocation) => {
                match outcome {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(DomainError::failure(
                            CODE_TIMEOUT,
                            format!("managed plugin {} exceeded its deadline", plugin.name()),
                        ));
                    }
                }
            }
            _ = input.cancellation.cancelled() => {
                return Err(DomainError::failure(
                    CODE_CANCELLED,
                    format!("managed plugin {} was cancelled", plugin.name()),
                ));
            }
        };

        Ok(ExecutionResult {
            envelope,
            exit_code: Some(0),
            output_truncated: false,
            duration: started.elapsed(),
        })
    }
}

/// Built-in managed modules shipped with the host
pub mod builtin {
    use super::*;

    /// Formats "<greeting>, <input>!" from parameters and configuration
    pub struct GreetModule;

    #[async_trait]
    impl ManagedModule for GreetModule {
        fn symbol(&self) -> &str {
            "greet"
        }

        async fn invoke(&self, context: ManagedContext) -> Result<PluginEnvelope> {
            let greeting = context
                .execution_parameters
                .get("greeting")
                .or_else(|| context.configuration.get("greeting"))
                .and_then(Value::as_str)
                .unwrap_or("Hello");
            let subject = context
                .input_data
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or("world");

            let mut envelope =
                PluginEnvelope::success(format!("{greeting}, {subject}! (from the managed host)"));
            envelope.data = Some(Value::String(format!("{greeting}, {subject}!")));
            Ok(envelope)
        }
    }

    /// Returns its input data untouched
    pub struct EchoModule;

    #[async_trait]
    impl ManagedModule for EchoModule {
        fn symbol(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, context: ManagedContext) -> Result<PluginEnvelope> {
            let mut envelope = PluginEnvelope::success("echo");
            envelope.data = context.input_data;
            Ok(envelope)
        }
    }

    /// Always reports failure; used to exercise failure propagation
    pub struct FailingModule;

    #[async_trait]
    impl ManagedModule for FailingModule {
        fn symbol(&self) -> &str {
            "always_fail"
        }

        async fn invoke(&self, _context: ManagedContext) -> Result<PluginEnvelope> {
            Ok(PluginEnvelope::failure(
                "this module always fails",
                vec!["failing module invoked".into()],
            ))
        }
    }
}
