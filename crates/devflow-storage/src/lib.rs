// DevFlow storage: Postgres persistence for the domain aggregates
//
// Decision: rows are plain FromRow structs; mapping to aggregates lives next
// to them so corrupt data surfaces as Unexpected errors, not panics
// Decision: optimistic concurrency via a row_version column checked in UPDATE

pub mod event_bus;
pub mod migrations;
pub mod models;
pub mod repositories;
pub mod stores;

pub use event_bus::InProcessEventBus;
pub use repositories::Database;
pub use stores::{PgPluginStore, PgWorkflowStore};
