// In-memory store implementations for examples and testing
//
// These honour the same contracts as the Postgres stores: optimistic row
// versions, commit-then-publish event draining, version-spec lookups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use semver::Version;

use crate::dependency::VersionSpec;
use crate::error::{DomainError, Result};
use crate::events::DomainEvent;
use crate::ids::{PluginId, WorkflowId};
use crate::plugin::{Plugin, PluginStatus};
use crate::traits::{
    EventPublisher, PageRequest, PagedResult, PluginFilter, PluginStore, WorkflowStore,
    WorkflowSummary,
};
use crate::workflow::{Workflow, WorkflowStatus};

async fn drain_and_publish(
    publisher: Option<&Arc<dyn EventPublisher>>,
    events: Vec<DomainEvent>,
) {
    if let Some(publisher) = publisher {
        for event in events {
            let event_type = event.event_type();
            if let Err(e) = publisher.publish(event).await {
                tracing::warn!(event_type, error = %e, "domain event publication failed");
            }
        }
    }
}

/// Event publisher that remembers everything it saw
#[derive(Default)]
pub struct CollectingPublisher {
    events: Mutex<Vec<DomainEvent>>,
}

impl CollectingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().expect("publisher lock").clone()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.event_type()).collect()
    }
}

#[async_trait]
impl EventPublisher for CollectingPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.lock().expect("publisher lock").push(event);
        Ok(())
    }
}

/// HashMap-backed PluginStore
#[derive(Default)]
pub struct MemoryPluginStore {
    plugins: Mutex<HashMap<PluginId, Plugin>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl MemoryPluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            plugins: Mutex::new(HashMap::new()),
            publisher: Some(publisher),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PluginId, Plugin>> {
        self.plugins.lock().expect("plugin store lock")
    }
}

#[async_trait]
impl PluginStore for MemoryPluginStore {
    async fn get(&self, id: PluginId) -> Result<Option<Plugin>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn insert(&self, plugin: &mut Plugin) -> Result<()> {
        {
            let mut map = self.lock();
            if map
                .values()
                .any(|p| p.name() == plugin.name() && p.version() == plugin.version())
            {
                return Err(DomainError::conflict(
                    "Storage.Unique",
                    format!("plugin {} {} already exists", plugin.name(), plugin.version()),
                ));
            }
            plugin.set_row_version(1);
            let mut stored = plugin.clone();
            stored.clear_domain_events();
            map.insert(plugin.id(), stored);
        }
        drain_and_publish(self.publisher.as_ref(), plugin.take_events()).await;
        Ok(())
    }

    async fn update(&self, plugin: &mut Plugin) -> Result<()> {
        {
            let mut map = self.lock();
            let stored = map.get(&plugin.id()).ok_or_else(|| {
                DomainError::not_found("Plugin.NotFound", format!("plugin {}", plugin.id()))
            })?;
            if stored.row_version() != plugin.row_version() {
                return Err(DomainError::conflict(
                    "Plugin.VersionConflict",
                    format!("plugin {} was modified concurrently", plugin.id()),
                ));
            }
            plugin.set_row_version(plugin.row_version() + 1);
            let mut updated = plugin.clone();
            updated.clear_domain_events();
            map.insert(plugin.id(), updated);
        }
        drain_and_publish(self.publisher.as_ref(), plugin.take_events()).await;
        Ok(())
    }

    async fn delete(&self, id: PluginId) -> Result<bool> {
        Ok(self.lock().remove(&id).is_some())
    }

    async fn list(&self, filter: PluginFilter) -> Result<Vec<Plugin>> {
        let mut plugins: Vec<Plugin> = self
            .lock()
            .values()
            .filter(|p| filter.status.map(|s| p.status() == s).unwrap_or(true))
            .filter(|p| filter.language.map(|l| p.language() == l).unwrap_or(true))
            .filter(|p| {
                filter
                    .name_contains
                    .as_deref()
                    .map(|n| p.name().to_lowercase().contains(&n.to_lowercase()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        plugins.sort_by(|a, b| {
            a.name()
                .cmp(b.name())
                .then_with(|| a.version().cmp(b.version()))
        });
        Ok(plugins)
    }

    async fn find_by_name_version(&self, name: &str, version: &Version) -> Result<Option<Plugin>> {
        Ok(self
            .lock()
            .values()
            .find(|p| p.name() == name && p.version() == version)
            .cloned())
    }

    async fn find_available_by_spec(
        &self,
        name: &str,
        spec: &VersionSpec,
    ) -> Result<Option<Plugin>> {
        let map = self.lock();
        let mut best: Option<&Plugin> = None;
        for plugin in map.values() {
            if plugin.name() != name
                || plugin.status() != PluginStatus::Available
                || !spec.matches(plugin.version())
            {
                continue;
            }
            if best.map(|b| plugin.version() > b.version()).unwrap_or(true) {
                best = Some(plugin);
            }
        }
        Ok(best.cloned())
    }

    async fn exists(&self, name: &str, version: &Version) -> Result<bool> {
        Ok(self
            .lock()
            .values()
            .any(|p| p.name() == name && p.version() == version))
    }
}

/// HashMap-backed WorkflowStore
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: Mutex<HashMap<WorkflowId, Workflow>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            workflows: Mutex::new(HashMap::new()),
            publisher: Some(publisher),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WorkflowId, Workflow>> {
        self.workflows.lock().expect("workflow store lock")
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn get(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn insert(&self, workflow: &mut Workflow) -> Result<()> {
        {
            let mut map = self.lock();
            workflow.set_row_version(1);
            let mut stored = workflow.clone();
            stored.clear_domain_events();
            map.insert(workflow.id(), stored);
        }
        drain_and_publish(self.publisher.as_ref(), workflow.take_events()).await;
        Ok(())
    }

    async fn update(&self, workflow: &mut Workflow) -> Result<()> {
        {
            let mut map = self.lock();
            let stored = map.get(&workflow.id()).ok_or_else(|| {
                DomainError::not_found("Workflow.NotFound", format!("workflow {}", workflow.id()))
            })?;
            if stored.row_version() != workflow.row_version() {
                return Err(DomainError::conflict(
                    "Workflow.VersionConflict",
                    format!("workflow {} was modified concurrently", workflow.id()),
                ));
            }
            workflow.set_row_version(workflow.row_version() + 1);
            let mut updated = workflow.clone();
            updated.clear_domain_events();
            map.insert(workflow.id(), updated);
        }
        drain_and_publish(self.publisher.as_ref(), workflow.take_events()).await;
        Ok(())
    }

    async fn delete(&self, id: WorkflowId) -> Result<bool> {
        Ok(self.lock().remove(&id).is_some())
    }

    async fn list(
        &self,
        page: PageRequest,
        status: Option<WorkflowStatus>,
        search: Option<&str>,
    ) -> Result<PagedResult<WorkflowSummary>> {
        let (page_num, page_size) = page.clamped();
        let mut matching: Vec<WorkflowSummary> = self
            .lock()
            .values()
            .filter(|w| status.map(|s| w.status() == s).unwrap_or(true))
            .filter(|w| {
                search
                    .map(|s| {
                        let needle = s.to_lowercase();
                        w.name().to_lowercase().contains(&needle)
                            || w.description().to_lowercase().contains(&needle)
                    })
                    .unwrap_or(true)
            })
            .map(|w| WorkflowSummary {
                id: w.id(),
                name: w.name().to_string(),
                description: w.description().to_string(),
                status: w.status(),
                step_count: w.steps().len() as i64,
                created_at: w.created_at(),
                updated_at: w.updated_at(),
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page_size as usize)
            .collect();
        Ok(PagedResult {
            items,
            total,
            page: page_num,
            page_size,
        })
    }

    async fn exists_with_name(&self, name: &str, exclude: Option<WorkflowId>) -> Result<bool> {
        Ok(self
            .lock()
            .values()
            .any(|w| w.name() == name && exclude.map(|id| w.id() != id).unwrap_or(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginLanguage, PluginMetadata};
    use serde_json::Map;

    fn plugin(name: &str, version: &str) -> Plugin {
        let metadata = PluginMetadata::new(name, version, "", PluginLanguage::Script).unwrap();
        Plugin::register(metadata, "main.js", "/p", vec![], vec![], Map::new(), None).unwrap()
    }

    #[tokio::test]
    async fn insert_publishes_queued_events() {
        let publisher = Arc::new(CollectingPublisher::new());
        let store = MemoryPluginStore::with_publisher(publisher.clone());

        let mut p = plugin("hello", "1.0.0");
        store.insert(&mut p).await.unwrap();

        assert_eq!(publisher.event_types(), vec!["plugin.registered"]);
        assert!(!p.has_pending_events());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemoryPluginStore::new();
        let mut p = plugin("hello", "1.0.0");
        store.insert(&mut p).await.unwrap();

        let mut stale = store.get(p.id()).await.unwrap().unwrap();
        let mut fresh = store.get(p.id()).await.unwrap().unwrap();

        fresh.mark_validated(Ok(())).unwrap();
        store.update(&mut fresh).await.unwrap();

        stale.mark_validated(Ok(())).unwrap();
        let err = store.update(&mut stale).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn spec_lookup_prefers_highest_available() {
        let store = MemoryPluginStore::new();
        for (version, available) in [("1.0.0", true), ("1.4.0", true), ("2.0.0", true), ("1.5.0", false)] {
            let mut p = plugin("lib", version);
            if available {
                p.mark_validated(Ok(())).unwrap();
            }
            store.insert(&mut p).await.unwrap();
        }

        let spec = VersionSpec::Caret(Version::parse("1.0.0").unwrap());
        let best = store.find_available_by_spec("lib", &spec).await.unwrap().unwrap();
        assert_eq!(best.version().to_string(), "1.4.0");
    }
}
