// Script (S) and portable (P) runtimes
//
// Both languages execute the same way: spawn the interpreter on the entry
// file, hand the JSON context over stdin, and read the result envelope from
// stdout. They differ only in the interpreter binary and the environment
// variable carrying the resolved package search path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use devflow_core::{DomainError, Plugin, PluginEnvelope, PluginLanguage, Result};

use crate::resolver::DependencyContext;

use super::subprocess::{self, SubprocessSpec, Termination};
use super::{
    ExecutionInput, ExecutionResult, RuntimeManager, CODE_CANCELLED, CODE_ENVELOPE,
    CODE_MEMORY_LIMIT, CODE_TIMEOUT,
};

const STDERR_TAIL_LINES: usize = 10;
const RAW_TAIL_CHARS: usize = 512;

/// Subprocess-backed runtime for one interpreted language
pub struct InterpreterRuntime {
    language: PluginLanguage,
    program: PathBuf,
    load_path_env: &'static str,
    initialized: AtomicBool,
}

impl InterpreterRuntime {
    /// Script (S) runtime; interpreter defaults to `node`
    pub fn script(program: Option<PathBuf>) -> Self {
        Self {
            language: PluginLanguage::Script,
            program: program.unwrap_or_else(|| PathBuf::from("node")),
            load_path_env: "DEVFLOW_S_PATH",
            initialized: AtomicBool::new(false),
        }
    }

    /// Portable (P) runtime; interpreter defaults to `python3`
    pub fn portable(program: Option<PathBuf>) -> Self {
        Self {
            language: PluginLanguage::Portable,
            program: program.unwrap_or_else(|| PathBuf::from("python3")),
            load_path_env: "DEVFLOW_P_PATH",
            initialized: AtomicBool::new(false),
        }
    }

    fn interpreter_available(&self) -> bool {
        if self.program.components().count() > 1 {
            self.program.is_file()
        } else {
            which::which(&self.program).is_ok()
        }
    }

    fn entry_path(plugin: &Plugin) -> PathBuf {
        Path::new(plugin.plugin_path()).join(plugin.entry_point())
    }

    fn stderr_tail(stderr: &str) -> Vec<String> {
        let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
        lines
            .iter()
            .skip(lines.len().saturating_sub(STDERR_TAIL_LINES))
            .map(|l| l.to_string())
            .collect()
    }
}

#[async_trait]
impl RuntimeManager for InterpreterRuntime {
    fn language(&self) -> PluginLanguage {
        self.language
    }

    async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.interpreter_available() {
            tracing::warn!(
                language = %self.language,
                interpreter = %self.program.display(),
                "interpreter not found; plugins of this language will fail validation"
            );
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn validate(&self, plugin: &Plugin) -> Result<bool> {
        Ok(Self::entry_path(plugin).is_file() && self.interpreter_available())
    }

    async fn execute(
        &self,
        plugin: &Plugin,
        input: ExecutionInput,
        dependencies: &DependencyContext,
    ) -> Result<ExecutionResult> {
        if !self.interpreter_available() {
            return Err(DomainError::failure(
                "Runtime.Toolchain",
                format!(
                    "interpreter {} for language {} not found",
                    self.program.display(),
                    self.language
                ),
            ));
        }

        let entry = Self::entry_path(plugin);
        let context = input.context_json();
        let payload = serde_json::to_vec(&context)
            .map_err(|e| DomainError::unexpected(format!("context serialization: {e}")))?;

        let mut env = Vec::new();
        if !dependencies.load_paths.is_empty() {
            let joined = std::env::join_paths(&dependencies.load_paths)
                .map_err(|e| DomainError::failure("Runtime.LoadPath", e.to_string()))?;
            env.push((
                self.load_path_env.to_string(),
                joined.to_string_lossy().into_owned(),
            ));
        }

        let started = std::time::Instant::now();
        let capture = subprocess::run(SubprocessSpec {
            program: self.program.clone(),
            args: vec![entry.to_string_lossy().into_owned()],
            env,
            cwd: input.working_directory.clone(),
            stdin_payload: payload,
            deadline: input.deadline,
            memory_cap_bytes: input.memory_cap_bytes,
            output_cap_bytes: input.output_cap_bytes,
            cancellation: input.cancellation.clone(),
        })
        .await?;
        let duration = started.elapsed();

        match capture.termination {
            Termination::DeadlineExceeded => {
                let tail = Self::stderr_tail(&capture.stderr).join(" | ");
                Err(DomainError::failure(
                    CODE_TIMEOUT,
                    format!(
                        "plugin {} exceeded its deadline; partial logs: {tail}",
                        plugin.name()
                    ),
                ))
            }
            Termination::MemoryExceeded => Err(DomainError::failure(
                CODE_MEMORY_LIMIT,
                format!("plugin {} exceeded its memory cap", plugin.name()),
            )),
            Termination::Cancelled => Err(DomainError::failure(
                CODE_CANCELLED,
                format!("plugin {} was cancelled", plugin.name()),
            )),
            Termination::Exited => {
                match PluginEnvelope::from_stdout(&capture.stdout) {
                    // The envelope stands even on a non-zero exit
                    Some(envelope) => Ok(ExecutionResult {
                        envelope,
                        exit_code: capture.exit_code,
                        output_truncated: capture.stdout_truncated,
                        duration,
                    }),
                    None if capture.exit_code == Some(0) => Err(DomainError::failure(
                        CODE_ENVELOPE,
                        format!(
                            "plugin {} produced no result envelope; stdout tail: {:?}",
                            plugin.name(),
                            PluginEnvelope::tail(&capture.stdout, RAW_TAIL_CHARS)
                        ),
                    )),
                    None => {
                        let exit = capture
                            .exit_code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "signal".to_string());
                        let envelope = PluginEnvelope::failure(
                            format!("plugin exited with code {exit} and no result envelope"),
                            Self::stderr_tail(&capture.stderr),
                        );
                        Ok(ExecutionResult {
                            envelope,
                            exit_code: capture.exit_code,
                            output_truncated: capture.stdout_truncated,
                            duration,
                        })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Build an S plugin whose entry is a shell script, driven by `sh` so the
    /// tests need no JavaScript toolchain.
    fn sh_plugin(dir: &Path, script: &str) -> Plugin {
        std::fs::write(dir.join("main.sh"), script).unwrap();
        let metadata = devflow_core::PluginMetadata::new(
            "shplug",
            "1.0.0",
            "test",
            PluginLanguage::Script,
        )
        .unwrap();
        let mut plugin = Plugin::register(
            metadata,
            "main.sh",
            dir.to_string_lossy().to_string(),
            vec![],
            vec![],
            Map::new(),
            None,
        )
        .unwrap();
        plugin.clear_domain_events();
        plugin
    }

    fn sh_runtime() -> InterpreterRuntime {
        InterpreterRuntime::script(Some(PathBuf::from("/bin/sh")))
    }

    fn exec_input(workdir: &Path, deadline: Duration) -> ExecutionInput {
        ExecutionInput {
            configuration: Map::new(),
            input_data: Some(Value::String("World".into())),
            working_directory: workdir.to_path_buf(),
            execution_parameters: Map::new(),
            deadline,
            memory_cap_bytes: None,
            output_cap_bytes: 64 * 1024,
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn successful_envelope_round_trips() {
        let dir = TempDir::new().unwrap();
        let plugin = sh_plugin(
            dir.path(),
            "cat > /dev/null\necho '{\"success\": true, \"message\": \"hi\"}'\n",
        );
        let runtime = sh_runtime();
        assert!(runtime.validate(&plugin).await.unwrap());

        let result = runtime
            .execute(
                &plugin,
                exec_input(dir.path(), Duration::from_secs(10)),
                &DependencyContext::default(),
            )
            .await
            .unwrap();
        assert!(result.envelope.success);
        assert_eq!(result.envelope.message.as_deref(), Some("hi"));
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn failure_envelope_survives_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let plugin = sh_plugin(
            dir.path(),
            "cat > /dev/null\necho '{\"success\": false, \"error\": \"boom\"}'\nexit 2\n",
        );
        let result = sh_runtime()
            .execute(
                &plugin,
                exec_input(dir.path(), Duration::from_secs(10)),
                &DependencyContext::default(),
            )
            .await
            .unwrap();
        assert!(!result.envelope.success);
        assert_eq!(result.envelope.error.as_deref(), Some("boom"));
        assert_eq!(result.exit_code, Some(2));
    }

    #[tokio::test]
    async fn nonzero_exit_without_envelope_is_synthesized() {
        let dir = TempDir::new().unwrap();
        let plugin = sh_plugin(
            dir.path(),
            "cat > /dev/null\necho 'something broke' >&2\nexit 7\n",
        );
        let result = sh_runtime()
            .execute(
                &plugin,
                exec_input(dir.path(), Duration::from_secs(10)),
                &DependencyContext::default(),
            )
            .await
            .unwrap();
        assert!(!result.envelope.success);
        assert!(result.envelope.error.as_deref().unwrap().contains("code 7"));
        assert_eq!(result.envelope.logs, vec!["something broke"]);
    }

    #[tokio::test]
    async fn clean_exit_without_envelope_is_an_envelope_failure() {
        let dir = TempDir::new().unwrap();
        let plugin = sh_plugin(dir.path(), "cat > /dev/null\necho 'not json'\n");
        let err = sh_runtime()
            .execute(
                &plugin,
                exec_input(dir.path(), Duration::from_secs(10)),
                &DependencyContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, CODE_ENVELOPE);
        assert!(err.message.contains("not json"));
    }

    #[tokio::test]
    async fn deadline_produces_plugin_timeout() {
        let dir = TempDir::new().unwrap();
        let plugin = sh_plugin(dir.path(), "sleep 10\n");
        let err = sh_runtime()
            .execute(
                &plugin,
                exec_input(dir.path(), Duration::from_millis(200)),
                &DependencyContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, CODE_TIMEOUT);
    }

    #[tokio::test]
    async fn context_json_reaches_the_plugin_on_stdin() {
        let dir = TempDir::new().unwrap();
        // The script succeeds only when stdin mentions inputData
        let plugin = sh_plugin(
            dir.path(),
            "if grep -q inputData; then echo '{\"success\": true}'; else echo '{\"success\": false, \"error\": \"no context\"}'; fi\n",
        );
        let result = sh_runtime()
            .execute(
                &plugin,
                exec_input(dir.path(), Duration::from_secs(10)),
                &DependencyContext::default(),
            )
            .await
            .unwrap();
        assert!(result.envelope.success);
    }

    #[tokio::test]
    async fn load_paths_are_exported_to_the_environment() {
        let dir = TempDir::new().unwrap();
        let plugin = sh_plugin(
            dir.path(),
            "cat > /dev/null\nif [ -n \"$DEVFLOW_S_PATH\" ]; then echo '{\"success\": true}'; else echo '{\"success\": false}'; fi\n",
        );
        let mut deps = DependencyContext::default();
        deps.load_paths.push(dir.path().to_path_buf());

        let result = sh_runtime()
            .execute(
                &plugin,
                exec_input(dir.path(), Duration::from_secs(10)),
                &deps,
            )
            .await
            .unwrap();
        assert!(result.envelope.success);
    }

    #[tokio::test]
    async fn missing_interpreter_fails_validation() {
        let dir = TempDir::new().unwrap();
        let plugin = sh_plugin(dir.path(), "true\n");
        let runtime = InterpreterRuntime::portable(Some(PathBuf::from("/no/such/python")));
        assert!(!runtime.validate(&plugin).await.unwrap());

        let err = runtime
            .execute(
                &plugin,
                exec_input(dir.path(), Duration::from_secs(1)),
                &DependencyContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "Runtime.Toolchain");
    }
}
