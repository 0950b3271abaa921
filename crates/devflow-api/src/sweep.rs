// Discovery sweep: register new plugins, refresh changed ones, validate
//
// Runs at startup, on demand via the discover_plugins tool, and periodically
// when hot reload is enabled. Plugin ids stay stable across refreshes so
// workflow steps keep their bindings.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use devflow_core::{Plugin, Result};
use devflow_runtime::{DiscoveredPlugin, PluginDiscovery};

use crate::state::McpState;

/// What one sweep did
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOutcome {
    pub discovered: usize,
    pub registered: usize,
    pub refreshed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl SweepOutcome {
    pub fn to_json(self) -> Value {
        serde_json::json!({
            "discovered": self.discovered,
            "registered": self.registered,
            "refreshed": self.refreshed,
            "unchanged": self.unchanged,
            "failed": self.failed,
        })
    }
}

/// Sweep all configured plugin directories
///
/// `last_sweep` short-circuits unchanged plugin directories on hot-reload
/// passes; pass None to force a full diff.
pub async fn run_sweep(state: &McpState, last_sweep: Option<DateTime<Utc>>) -> Result<SweepOutcome> {
    let mut outcome = SweepOutcome::default();

    for discovered in state.discovery.scan() {
        outcome.discovered += 1;
        match sync_plugin(state, &discovered, last_sweep).await {
            Ok(SyncAction::Registered) => outcome.registered += 1,
            Ok(SyncAction::Refreshed) => outcome.refreshed += 1,
            Ok(SyncAction::Unchanged) => outcome.unchanged += 1,
            Err(e) => {
                outcome.failed += 1;
                warn!(
                    plugin = %discovered.manifest.name,
                    error = %e,
                    "could not sync discovered plugin"
                );
            }
        }
    }

    info!(
        discovered = outcome.discovered,
        registered = outcome.registered,
        refreshed = outcome.refreshed,
        failed = outcome.failed,
        "plugin sweep finished"
    );
    Ok(outcome)
}

enum SyncAction {
    Registered,
    Refreshed,
    Unchanged,
}

async fn sync_plugin(
    state: &McpState,
    discovered: &DiscoveredPlugin,
    last_sweep: Option<DateTime<Utc>>,
) -> Result<SyncAction> {
    let manifest = &discovered.manifest;
    let metadata = manifest.metadata()?;

    let existing = state
        .plugin_store
        .find_by_name_version(&metadata.name, &metadata.version)
        .await?;

    match existing {
        None => {
            let mut plugin = Plugin::register(
                metadata,
                manifest.entry_point.clone(),
                discovered.plugin_dir.to_string_lossy().to_string(),
                manifest.capabilities.clone(),
                manifest.parsed_dependencies()?,
                manifest.configuration.clone(),
                Some(discovered.source_hash.clone()),
            )?;
            state.plugin_store.insert(&mut plugin).await?;
            validate_and_persist(state, &mut plugin).await?;
            Ok(SyncAction::Registered)
        }
        Some(mut plugin) => {
            // Cheap mtime gate on periodic sweeps
            if let Some(last) = last_sweep {
                match PluginDiscovery::is_modified(&discovered.plugin_dir, last) {
                    Ok(false) => return Ok(SyncAction::Unchanged),
                    Ok(true) => {}
                    Err(e) => {
                        warn!(plugin = %plugin.name(), error = %e, "mtime check failed, diffing by hash");
                    }
                }
            }
            if plugin.source_hash() == Some(discovered.source_hash.as_str()) {
                return Ok(SyncAction::Unchanged);
            }

            plugin.refresh_from_source(
                manifest.entry_point.clone(),
                discovered.plugin_dir.to_string_lossy().to_string(),
                manifest.capabilities.clone(),
                manifest.parsed_dependencies()?,
                manifest.configuration.clone(),
                Some(discovered.source_hash.clone()),
            )?;
            state.plugin_store.update(&mut plugin).await?;
            validate_and_persist(state, &mut plugin).await?;
            Ok(SyncAction::Refreshed)
        }
    }
}

/// Run runtime validation and persist the resulting status transition
pub async fn validate_and_persist(state: &McpState, plugin: &mut Plugin) -> Result<bool> {
    let (valid, reasons) = state.runtime.validate(plugin).await?;
    let outcome = if valid {
        Ok(())
    } else {
        Err(reasons.join("; "))
    };
    plugin.mark_validated(outcome)?;
    state.plugin_store.update(plugin).await?;
    Ok(valid)
}
