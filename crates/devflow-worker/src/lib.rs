// DevFlow worker: workflow run execution
//
// Decision: one tokio task per workflow run; steps inside a run are strictly
// sequential, runs across workflows execute in parallel
// Decision: every state change goes load-mutate-store through the workflow
// store so API-side pause/cancel writes interleave safely

pub mod runner;
pub mod workflow;

pub use runner::{InMemoryRunner, WorkflowRunInput, WorkflowRunner, DEFAULT_SHUTDOWN_GRACE};
pub use workflow::WorkflowRunWorkflow;
