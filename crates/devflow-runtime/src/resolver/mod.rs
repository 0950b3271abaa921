// Dependency resolution
//
// Turns a plugin's declared dependencies into concrete filesystem locations:
// registry packages (cached, downloaded on miss), links to other Available
// plugins, and files inside the plugin's own directory.

pub mod cache;
pub mod registry;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;
use tokio_util::sync::CancellationToken;

use devflow_core::{
    DependencyKind, DomainError, ErrorKind, Plugin, PluginDependency, PluginLanguage,
    PluginStatus, PluginStore, Result,
};

pub use cache::RegistryCache;
pub use registry::RegistryClient;

/// A dependency pinned to a concrete location
#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub dependency: PluginDependency,
    pub resolved_version: Option<Version>,
    pub location: PathBuf,
}

/// A problem found while resolving or validating dependencies
#[derive(Debug, Clone)]
pub struct DependencyIssue {
    pub dependency: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for DependencyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.dependency, self.message)
    }
}

/// Everything a runtime needs to know about a plugin's dependencies
#[derive(Debug, Clone, Default)]
pub struct DependencyContext {
    pub resolved: Vec<ResolvedDependency>,
    /// Package payloads for the managed runtime
    pub assemblies: Vec<PathBuf>,
    /// Search paths exported to subprocess runtimes
    pub load_paths: Vec<PathBuf>,
    pub errors: Vec<DependencyIssue>,
}

impl DependencyContext {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse the recorded issues into one DomainError; Validation issues
    /// dominate because the client can fix those.
    pub fn into_error(self) -> DomainError {
        let kind = if self
            .errors
            .iter()
            .any(|i| i.kind == ErrorKind::Validation)
        {
            ErrorKind::Validation
        } else {
            ErrorKind::Failure
        };
        let detail = self
            .errors
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        DomainError::new(kind, "Dependency.Resolution", detail)
    }
}

/// Plugin dependency graph (PluginRef closure)
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub nodes: Vec<String>,
    pub edges: Vec<(String, String)>,
}

pub struct DependencyResolver {
    cache: Arc<RegistryCache>,
    client: RegistryClient,
    plugin_store: Arc<dyn PluginStore>,
}

impl DependencyResolver {
    pub fn new(
        cache: Arc<RegistryCache>,
        client: RegistryClient,
        plugin_store: Arc<dyn PluginStore>,
    ) -> Self {
        Self {
            cache,
            client,
            plugin_store,
        }
    }

    /// Resolve every declared dependency; problems are collected per
    /// dependency rather than failing fast so callers can report them all.
    pub async fn resolve(
        &self,
        plugin: &Plugin,
        cancellation: &CancellationToken,
    ) -> DependencyContext {
        let mut context = DependencyContext::default();
        let plugin_dir = PathBuf::from(plugin.plugin_path());

        for dependency in plugin.dependencies() {
            match &dependency.kind {
                DependencyKind::Package { registry } => {
                    match self
                        .resolve_package(*registry, dependency, cancellation)
                        .await
                    {
                        Ok((version, dir)) => {
                            match plugin.language() {
                                PluginLanguage::Managed => context.assemblies.push(dir.clone()),
                                _ => context.load_paths.push(dir.clone()),
                            }
                            context.resolved.push(ResolvedDependency {
                                dependency: dependency.clone(),
                                resolved_version: Some(version),
                                location: dir,
                            });
                        }
                        Err(e) => context.errors.push(issue(dependency, e)),
                    }
                }
                DependencyKind::PluginRef => {
                    match self.resolve_plugin_ref(dependency).await {
                        Ok((version, dir)) => context.resolved.push(ResolvedDependency {
                            dependency: dependency.clone(),
                            resolved_version: Some(version),
                            location: dir,
                        }),
                        Err(e) => context.errors.push(issue(dependency, e)),
                    }
                }
                DependencyKind::FileRef => match resolve_file_ref(&plugin_dir, &dependency.name) {
                    Ok(path) => context.resolved.push(ResolvedDependency {
                        dependency: dependency.clone(),
                        resolved_version: None,
                        location: path,
                    }),
                    Err(e) => context.errors.push(issue(dependency, e)),
                },
            }
        }

        context
    }

    async fn resolve_package(
        &self,
        registry: devflow_core::PackageRegistry,
        dependency: &PluginDependency,
        cancellation: &CancellationToken,
    ) -> Result<(Version, PathBuf)> {
        if let Some(version) = self
            .cache
            .best_cached(registry, &dependency.name, &dependency.version)
        {
            let dir = self.cache.package_dir(registry, &dependency.name, &version);
            return Ok((version, dir));
        }

        let version = self
            .client
            .resolve_version(registry, &dependency.name, &dependency.version)
            .await?;
        let dir = self
            .cache
            .ensure(registry, &dependency.name, &version, &self.client, cancellation)
            .await?;
        Ok((version, dir))
    }

    async fn resolve_plugin_ref(
        &self,
        dependency: &PluginDependency,
    ) -> Result<(Version, PathBuf)> {
        let linked = self
            .plugin_store
            .find_available_by_spec(&dependency.name, &dependency.version)
            .await?;
        match linked {
            Some(plugin) if plugin.status() == PluginStatus::Available => Ok((
                plugin.version().clone(),
                PathBuf::from(plugin.plugin_path()),
            )),
            Some(plugin) => Err(DomainError::validation(
                "Dependency.PluginNotAvailable",
                format!(
                    "plugin {} is {} and cannot be linked",
                    plugin.name(),
                    plugin.status()
                ),
            )),
            None => Err(DomainError::not_found(
                "Dependency.PluginNotFound",
                format!(
                    "no available plugin {} satisfies {}",
                    dependency.name, dependency.version
                ),
            )),
        }
    }

    /// Report dependency problems without downloading anything
    pub async fn validate_dependencies(&self, plugin: &Plugin) -> Vec<DependencyIssue> {
        let mut issues = Vec::new();
        let plugin_dir = PathBuf::from(plugin.plugin_path());

        for dependency in plugin.dependencies() {
            match &dependency.kind {
                DependencyKind::Package { registry } => {
                    if self
                        .cache
                        .best_cached(*registry, &dependency.name, &dependency.version)
                        .is_some()
                    {
                        continue;
                    }
                    // Catalog check only; the download happens at execution time
                    match self
                        .client
                        .resolve_version(*registry, &dependency.name, &dependency.version)
                        .await
                    {
                        Ok(_) => {}
                        Err(e) => issues.push(issue(dependency, e)),
                    }
                }
                DependencyKind::PluginRef => {
                    if let Err(e) = self.resolve_plugin_ref(dependency).await {
                        issues.push(issue(dependency, e));
                    }
                }
                DependencyKind::FileRef => {
                    if let Err(e) = resolve_file_ref(&plugin_dir, &dependency.name) {
                        issues.push(issue(dependency, e));
                    }
                }
            }
        }

        issues
    }

    /// PluginRef closure of a plugin; cycles are a Validation error
    pub async fn dependency_graph(
        &self,
        plugin: &Plugin,
        transitive: bool,
    ) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::default();
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        self.walk_plugin_refs(plugin, transitive, &mut graph, &mut visited, &mut stack)
            .await?;
        Ok(graph)
    }

    // Depth-first over PluginRef edges; `stack` holds the names on the current
    // path so a back-edge surfaces as a cycle.
    fn walk_plugin_refs<'a>(
        &'a self,
        plugin: &'a Plugin,
        transitive: bool,
        graph: &'a mut DependencyGraph,
        visited: &'a mut HashSet<String>,
        stack: &'a mut HashSet<String>,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let node = plugin.name().to_string();
            if !visited.insert(node.clone()) {
                return Ok(());
            }
            graph.nodes.push(node.clone());
            stack.insert(node.clone());

            for dependency in plugin.dependencies() {
                if dependency.kind != DependencyKind::PluginRef {
                    continue;
                }
                graph
                    .edges
                    .push((node.clone(), dependency.name.clone()));

                if stack.contains(&dependency.name) {
                    return Err(DomainError::validation(
                        "Dependency.Cycle",
                        format!(
                            "plugin dependency cycle: {} -> {}",
                            node, dependency.name
                        ),
                    ));
                }

                if !transitive {
                    if visited.insert(dependency.name.clone()) {
                        graph.nodes.push(dependency.name.clone());
                    }
                    continue;
                }

                let linked = self
                    .plugin_store
                    .find_available_by_spec(&dependency.name, &dependency.version)
                    .await?;
                match linked {
                    Some(linked) => {
                        self.walk_plugin_refs(&linked, transitive, graph, visited, stack)
                            .await?;
                    }
                    None => {
                        if visited.insert(dependency.name.clone()) {
                            graph.nodes.push(dependency.name.clone());
                        }
                    }
                }
            }

            stack.remove(&node);
            Ok(())
        })
    }
}

fn issue(dependency: &PluginDependency, error: DomainError) -> DependencyIssue {
    DependencyIssue {
        dependency: dependency.name.clone(),
        kind: error.kind,
        message: error.message,
    }
}

/// Resolve a file reference inside the plugin directory, rejecting escapes
fn resolve_file_ref(plugin_dir: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(DomainError::validation(
            "Dependency.FileEscape",
            format!("file reference {relative:?} leaves the plugin directory"),
        ));
    }
    let path = plugin_dir.join(rel);
    if !path.is_file() {
        return Err(DomainError::not_found(
            "Dependency.FileNotFound",
            format!("file reference {relative:?} does not exist"),
        ));
    }
    Ok(path)
}
