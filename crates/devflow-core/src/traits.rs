// Storage and event ports
//
// The domain stays DB-agnostic: devflow-storage implements these against
// Postgres, tests implement them in memory. Stores own the commit-then-publish
// contract for domain events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::Serialize;

use crate::dependency::VersionSpec;
use crate::error::Result;
use crate::events::DomainEvent;
use crate::ids::{PluginId, WorkflowId};
use crate::plugin::{Plugin, PluginLanguage, PluginStatus};
use crate::workflow::{Workflow, WorkflowStatus};

/// Filter for plugin listings
#[derive(Debug, Clone, Default)]
pub struct PluginFilter {
    pub status: Option<PluginStatus>,
    pub language: Option<PluginLanguage>,
    pub name_contains: Option<String>,
}

/// 1-based pagination request; clamped by the store
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

impl PageRequest {
    pub fn clamped(&self) -> (u32, u32) {
        (self.page.max(1), self.page_size.clamp(1, 100))
    }

    pub fn offset(&self) -> i64 {
        let (page, size) = self.clamped();
        i64::from(page - 1) * i64::from(size)
    }
}

/// One page of query results
#[derive(Debug, Clone, Serialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// Read-model row for workflow listings
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub status: WorkflowStatus,
    pub step_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence port for the Plugin aggregate
#[async_trait]
pub trait PluginStore: Send + Sync {
    async fn get(&self, id: PluginId) -> Result<Option<Plugin>>;

    /// Persist a new plugin, then drain and publish its events
    async fn insert(&self, plugin: &mut Plugin) -> Result<()>;

    /// Persist changes under optimistic concurrency (Conflict on a stale
    /// row version), then drain and publish events
    async fn update(&self, plugin: &mut Plugin) -> Result<()>;

    async fn delete(&self, id: PluginId) -> Result<bool>;

    async fn list(&self, filter: PluginFilter) -> Result<Vec<Plugin>>;

    async fn find_by_name_version(&self, name: &str, version: &Version)
        -> Result<Option<Plugin>>;

    /// Highest Available plugin satisfying the version spec
    async fn find_available_by_spec(
        &self,
        name: &str,
        spec: &VersionSpec,
    ) -> Result<Option<Plugin>>;

    async fn exists(&self, name: &str, version: &Version) -> Result<bool>;
}

/// Persistence port for the Workflow aggregate (steps included)
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get(&self, id: WorkflowId) -> Result<Option<Workflow>>;

    async fn insert(&self, workflow: &mut Workflow) -> Result<()>;

    /// Persist the aggregate and reconcile its steps in one transaction;
    /// Conflict on a stale row version
    async fn update(&self, workflow: &mut Workflow) -> Result<()>;

    /// Cascade-deletes owned steps
    async fn delete(&self, id: WorkflowId) -> Result<bool>;

    async fn list(
        &self,
        page: PageRequest,
        status: Option<WorkflowStatus>,
        search: Option<&str>,
    ) -> Result<PagedResult<WorkflowSummary>>;

    async fn exists_with_name(&self, name: &str, exclude: Option<WorkflowId>) -> Result<bool>;
}

/// Domain-event fanout; implementations must not fail the surrounding commit
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_request_clamps() {
        let page = PageRequest { page: 0, page_size: 500 };
        assert_eq!(page.clamped(), (1, 100));
        assert_eq!(page.offset(), 0);

        let third = PageRequest { page: 3, page_size: 10 };
        assert_eq!(third.offset(), 20);
    }
}
