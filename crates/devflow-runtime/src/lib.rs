// DevFlow plugin runtime
//
// Everything between a manifest on disk and a structured execution result:
// discovery, dependency resolution with a shared download cache, and the
// per-language runtime managers behind a composite dispatcher.
//
// Key design decisions:
// - S and P plugins run as subprocesses with a JSON context on stdin and the
//   result envelope on stdout; M plugins run in-process via a module registry
// - One global semaphore caps concurrent executions across all languages
// - Registry downloads are single-flighted per (registry, name, version)

pub mod discovery;
pub mod managers;
pub mod resolver;

pub use discovery::{source_hash, DiscoveredPlugin, PluginDiscovery};
pub use managers::interpreter::InterpreterRuntime;
pub use managers::managed::{ManagedContext, ManagedModule, ManagedRuntime, ModuleRegistry};
pub use managers::{
    ExecuteRequest, ExecutionInput, ExecutionResult, RuntimeDispatcher, RuntimeManager,
    CODE_CANCELLED, CODE_ENVELOPE, CODE_MEMORY_LIMIT, CODE_TIMEOUT,
};
pub use resolver::{
    DependencyContext, DependencyGraph, DependencyIssue, DependencyResolver, RegistryCache,
    RegistryClient, ResolvedDependency,
};
