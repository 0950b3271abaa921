// Postgres-backed implementations of the core persistence ports
//
// Commit first, publish after: domain events drain from the aggregate only
// once the SQL has committed, and a publish failure is logged, never bubbled.

use async_trait::async_trait;
use semver::Version;
use std::sync::Arc;

use devflow_core::{
    DomainError, DomainEvent, EventPublisher, PageRequest, PagedResult, Plugin, PluginFilter,
    PluginId, PluginStore, Result, VersionSpec, Workflow, WorkflowId, WorkflowStatus,
    WorkflowStore, WorkflowSummary,
};

use crate::models::{PluginRow, WorkflowRow, WorkflowStepRow};
use crate::repositories::Database;

fn storage_error(err: anyhow::Error) -> DomainError {
    if let Some(sqlx::Error::Database(db_err)) = err.downcast_ref::<sqlx::Error>() {
        if db_err.is_unique_violation() {
            return DomainError::conflict("Storage.Unique", db_err.to_string());
        }
    }
    DomainError::failure("Storage.Database", err.to_string())
}

async fn publish_all(publisher: &dyn EventPublisher, events: Vec<DomainEvent>) {
    for event in events {
        let event_type = event.event_type();
        if let Err(e) = publisher.publish(event).await {
            tracing::warn!(event_type, error = %e, "domain event publication failed");
        }
    }
}

// ============================================
// Plugins
// ============================================

#[derive(Clone)]
pub struct PgPluginStore {
    db: Database,
    publisher: Arc<dyn EventPublisher>,
}

impl PgPluginStore {
    pub fn new(db: Database, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { db, publisher }
    }
}

#[async_trait]
impl PluginStore for PgPluginStore {
    async fn get(&self, id: PluginId) -> Result<Option<Plugin>> {
        let row = self.db.get_plugin(id.as_uuid()).await.map_err(storage_error)?;
        row.map(PluginRow::into_aggregate).transpose()
    }

    async fn insert(&self, plugin: &mut Plugin) -> Result<()> {
        let row = PluginRow::from_aggregate(plugin);
        self.db.insert_plugin(&row).await.map_err(storage_error)?;
        plugin.set_row_version(1);
        publish_all(self.publisher.as_ref(), plugin.take_events()).await;
        Ok(())
    }

    async fn update(&self, plugin: &mut Plugin) -> Result<()> {
        let row = PluginRow::from_aggregate(plugin);
        let new_version = self.db.update_plugin(&row).await.map_err(storage_error)?;
        match new_version {
            Some(version) => {
                plugin.set_row_version(version);
                publish_all(self.publisher.as_ref(), plugin.take_events()).await;
                Ok(())
            }
            None => Err(DomainError::conflict(
                "Plugin.VersionConflict",
                format!("plugin {} was modified concurrently", plugin.id()),
            )),
        }
    }

    async fn delete(&self, id: PluginId) -> Result<bool> {
        self.db.delete_plugin(id.as_uuid()).await.map_err(storage_error)
    }

    async fn list(&self, filter: PluginFilter) -> Result<Vec<Plugin>> {
        let status = filter.status.map(|s| s.as_str().to_string());
        let language = filter.language.map(|l| l.as_str().to_string());
        let rows = self
            .db
            .list_plugins(
                status.as_deref(),
                language.as_deref(),
                filter.name_contains.as_deref(),
            )
            .await
            .map_err(storage_error)?;
        rows.into_iter().map(PluginRow::into_aggregate).collect()
    }

    async fn find_by_name_version(&self, name: &str, version: &Version) -> Result<Option<Plugin>> {
        let row = self
            .db
            .find_plugin_by_name_version(name, &version.to_string())
            .await
            .map_err(storage_error)?;
        row.map(PluginRow::into_aggregate).transpose()
    }

    async fn find_available_by_spec(
        &self,
        name: &str,
        spec: &VersionSpec,
    ) -> Result<Option<Plugin>> {
        let rows = self.db.list_plugins_by_name(name).await.map_err(storage_error)?;
        let mut best: Option<Plugin> = None;
        for row in rows {
            let plugin = row.into_aggregate()?;
            if plugin.status() != devflow_core::PluginStatus::Available {
                continue;
            }
            if !spec.matches(plugin.version()) {
                continue;
            }
            let better = match &best {
                Some(current) => plugin.version() > current.version(),
                None => true,
            };
            if better {
                best = Some(plugin);
            }
        }
        Ok(best)
    }

    async fn exists(&self, name: &str, version: &Version) -> Result<bool> {
        self.db
            .plugin_exists(name, &version.to_string())
            .await
            .map_err(storage_error)
    }
}

// ============================================
// Workflows
// ============================================

#[derive(Clone)]
pub struct PgWorkflowStore {
    db: Database,
    publisher: Arc<dyn EventPublisher>,
}

impl PgWorkflowStore {
    pub fn new(db: Database, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { db, publisher }
    }

    fn step_rows(workflow: &Workflow) -> Vec<WorkflowStepRow> {
        let workflow_id = workflow.id().as_uuid();
        workflow
            .steps()
            .iter()
            .enumerate()
            .map(|(i, step)| WorkflowStepRow::from_step(workflow_id, i as i32, step))
            .collect()
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn get(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        let found = self.db.get_workflow(id.as_uuid()).await.map_err(storage_error)?;
        found
            .map(|(row, steps)| row.into_aggregate(steps))
            .transpose()
    }

    async fn insert(&self, workflow: &mut Workflow) -> Result<()> {
        let row = WorkflowRow::from_aggregate(workflow);
        let steps = Self::step_rows(workflow);
        self.db
            .insert_workflow(&row, &steps)
            .await
            .map_err(storage_error)?;
        workflow.set_row_version(1);
        publish_all(self.publisher.as_ref(), workflow.take_events()).await;
        Ok(())
    }

    async fn update(&self, workflow: &mut Workflow) -> Result<()> {
        let row = WorkflowRow::from_aggregate(workflow);
        let steps = Self::step_rows(workflow);
        let new_version = self
            .db
            .update_workflow(&row, &steps)
            .await
            .map_err(storage_error)?;
        match new_version {
            Some(version) => {
                workflow.set_row_version(version);
                publish_all(self.publisher.as_ref(), workflow.take_events()).await;
                Ok(())
            }
            None => Err(DomainError::conflict(
                "Workflow.VersionConflict",
                format!("workflow {} was modified concurrently", workflow.id()),
            )),
        }
    }

    async fn delete(&self, id: WorkflowId) -> Result<bool> {
        self.db.delete_workflow(id.as_uuid()).await.map_err(storage_error)
    }

    async fn list(
        &self,
        page: PageRequest,
        status: Option<WorkflowStatus>,
        search: Option<&str>,
    ) -> Result<PagedResult<WorkflowSummary>> {
        let (page_num, page_size) = page.clamped();
        let status_str = status.map(|s| s.as_str().to_string());
        let (rows, total) = self
            .db
            .list_workflows(
                status_str.as_deref(),
                search,
                i64::from(page_size),
                page.offset(),
            )
            .await
            .map_err(storage_error)?;

        let items = rows
            .into_iter()
            .map(|row| {
                Ok(WorkflowSummary {
                    id: WorkflowId::from(row.id),
                    name: row.name,
                    description: row.description,
                    status: WorkflowStatus::parse(&row.status)?,
                    step_count: row.step_count,
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PagedResult {
            items,
            total,
            page: page_num,
            page_size,
        })
    }

    async fn exists_with_name(&self, name: &str, exclude: Option<WorkflowId>) -> Result<bool> {
        self.db
            .workflow_exists_with_name(name, exclude.map(|id| id.as_uuid()))
            .await
            .map_err(storage_error)
    }
}
