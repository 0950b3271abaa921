// Postgres-backed store tests
//
// These run against a real database: `DATABASE_URL=postgres://... cargo test
// -p devflow-storage -- --ignored`. Each test uses fresh aggregates so runs
// do not interfere.

use std::sync::Arc;

use serde_json::Map;

use devflow_core::{
    ErrorKind, PageRequest, Plugin, PluginFilter, PluginLanguage, PluginMetadata, PluginStatus,
    PluginStore, Workflow, WorkflowStatus, WorkflowStore,
};
use devflow_storage::{migrations, Database, InProcessEventBus, PgPluginStore, PgWorkflowStore};

async fn connect() -> (Database, Arc<InProcessEventBus>) {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for these tests");
    let db = Database::from_url(&url).await.expect("connect");
    migrations::run(db.pool()).await.expect("migrate");
    (db, Arc::new(InProcessEventBus::new()))
}

fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::now_v7().simple())
}

fn sample_plugin(name: &str) -> Plugin {
    let metadata = PluginMetadata::new(name, "1.0.0", "store test", PluginLanguage::Script).unwrap();
    Plugin::register(
        metadata,
        "main.js",
        "/plugins/store-test",
        vec!["test".into()],
        vec![devflow_core::PluginDependency::parse("pkg-s:lib^1.0.0").unwrap()],
        Map::new(),
        Some("deadbeef".into()),
    )
    .unwrap()
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn plugin_round_trip_preserves_fields_and_drops_events() {
    let (db, bus) = connect().await;
    let store = PgPluginStore::new(db, bus);

    let name = unique_name("roundtrip");
    let mut plugin = sample_plugin(&name);
    plugin.mark_validated(Ok(())).unwrap();
    store.insert(&mut plugin).await.unwrap();
    assert!(!plugin.has_pending_events(), "events drain on insert");

    let loaded = store.get(plugin.id()).await.unwrap().expect("plugin exists");
    assert_eq!(loaded.name(), name);
    assert_eq!(loaded.status(), PluginStatus::Available);
    assert_eq!(loaded.source_hash(), Some("deadbeef"));
    assert_eq!(loaded.row_version(), 1);
    let identities: Vec<_> = loaded.dependencies().iter().map(|d| d.identity()).collect();
    assert_eq!(identities, vec![("lib", "package")]);
    assert!(!loaded.has_pending_events(), "events are not persisted");

    assert!(store
        .exists(&name, &semver::Version::parse("1.0.0").unwrap())
        .await
        .unwrap());
    assert!(!store
        .exists(&name, &semver::Version::parse("9.9.9").unwrap())
        .await
        .unwrap());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn stale_plugin_update_is_a_conflict() {
    let (db, bus) = connect().await;
    let store = PgPluginStore::new(db, bus);

    let mut plugin = sample_plugin(&unique_name("conflict"));
    store.insert(&mut plugin).await.unwrap();

    let mut copy_a = store.get(plugin.id()).await.unwrap().unwrap();
    let mut copy_b = store.get(plugin.id()).await.unwrap().unwrap();

    copy_a.mark_validated(Ok(())).unwrap();
    store.update(&mut copy_a).await.unwrap();

    copy_b.mark_validated(Err("stale".into())).unwrap();
    let err = store.update(&mut copy_b).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn duplicate_name_version_is_a_conflict() {
    let (db, bus) = connect().await;
    let store = PgPluginStore::new(db, bus);

    let name = unique_name("dup");
    let mut first = sample_plugin(&name);
    store.insert(&mut first).await.unwrap();

    let mut second = sample_plugin(&name);
    let err = store.insert(&mut second).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn plugin_listing_filters_by_status() {
    let (db, bus) = connect().await;
    let store = PgPluginStore::new(db, bus);

    let name = unique_name("filter");
    let mut plugin = sample_plugin(&name);
    plugin.mark_validated(Ok(())).unwrap();
    store.insert(&mut plugin).await.unwrap();

    let available = store
        .list(PluginFilter {
            status: Some(PluginStatus::Available),
            name_contains: Some(name.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(available.len(), 1);

    let disabled = store
        .list(PluginFilter {
            status: Some(PluginStatus::Disabled),
            name_contains: Some(name),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(disabled.is_empty());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn workflow_round_trip_with_steps_and_cascade_delete() {
    let (db, bus) = connect().await;
    let store = PgWorkflowStore::new(db.clone(), bus);

    let mut workflow = Workflow::create(unique_name("wf"), "integration").unwrap();
    let step_a = workflow
        .add_step("first", devflow_core::PluginId::new(), 0, Map::new())
        .unwrap();
    let step_b = workflow
        .add_step("second", devflow_core::PluginId::new(), 1, Map::new())
        .unwrap();
    store.insert(&mut workflow).await.unwrap();

    let mut loaded = store.get(workflow.id()).await.unwrap().unwrap();
    assert_eq!(loaded.steps().len(), 2);
    let ordered: Vec<_> = loaded.steps_in_order().iter().map(|s| s.id()).collect();
    assert_eq!(ordered, vec![step_a, step_b]);

    loaded.start().unwrap();
    loaded.begin_step(step_a).unwrap();
    loaded.complete_step(step_a, Some("out".into())).unwrap();
    store.update(&mut loaded).await.unwrap();

    let reloaded = store.get(workflow.id()).await.unwrap().unwrap();
    assert_eq!(reloaded.status(), WorkflowStatus::Running);
    assert_eq!(reloaded.step(step_a).unwrap().output(), Some("out"));

    assert!(store.delete(workflow.id()).await.unwrap());
    assert!(store.get(workflow.id()).await.unwrap().is_none());
    // Steps must be gone with the parent
    let orphan_steps: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM workflow_steps WHERE workflow_id = $1")
            .bind(workflow.id().as_uuid())
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!(orphan_steps.0, 0);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn workflow_listing_pages_and_searches() {
    let (db, bus) = connect().await;
    let store = PgWorkflowStore::new(db, bus);

    let needle = unique_name("paged");
    for i in 0..3 {
        let mut wf = Workflow::create(format!("{needle}-{i}"), "paging test").unwrap();
        store.insert(&mut wf).await.unwrap();
    }

    let page = store
        .list(
            PageRequest { page: 1, page_size: 2 },
            None,
            Some(&needle),
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total, 3);
    assert_eq!(page.page, 1);

    let rest = store
        .list(
            PageRequest { page: 2, page_size: 2 },
            None,
            Some(&needle),
        )
        .await
        .unwrap();
    assert_eq!(rest.items.len(), 1);
}
