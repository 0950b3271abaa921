// DevFlow core domain
//
// This crate holds the business model shared by the storage, runtime, worker
// and api crates.
//
// Key design decisions:
// - The domain stays DB-agnostic via traits (PluginStore, WorkflowStore, EventPublisher)
// - Aggregates enforce their invariants in static constructors and mutators returning Result
// - Domain events queue on the aggregate and are published by storage after commit
// - Typed IDs are UUID v7 newtypes with a string wire form
// - The error taxonomy (kind + code + message) is the only error type that crosses
//   component boundaries

pub mod config;
pub mod dependency;
pub mod envelope;
pub mod error;
pub mod events;
pub mod ids;
pub mod manifest;
pub mod plugin;
pub mod traits;
pub mod workflow;

// In-memory implementations for examples and testing
pub mod memory;

// Re-exports for convenience
pub use config::{DevFlowConfig, McpServerConfig, PluginsConfig};
pub use dependency::{DependencyKind, PackageRegistry, PluginDependency, VersionSpec};
pub use envelope::PluginEnvelope;
pub use error::{DomainError, ErrorKind, Result};
pub use events::{DomainEvent, EventQueue};
pub use ids::{PluginId, WorkflowId, WorkflowStepId};
pub use manifest::{PluginManifest, MANIFEST_FILE_NAME};
pub use plugin::{Plugin, PluginLanguage, PluginMetadata, PluginStatus};
pub use traits::{
    EventPublisher, PageRequest, PagedResult, PluginFilter, PluginStore, WorkflowStore,
    WorkflowSummary,
};
pub use workflow::{StepStatus, Workflow, WorkflowStatus, WorkflowStep};
