//! Per-run facade around the graph and cache.
//!
//! Producers register once per run and may themselves call back into
//! [`DependencyResolver::resolve`] to obtain upstream artefacts; the
//! "currently resolving" guard breaks cycles that slip through at runtime
//! the same way the dependency graph catches them at plan time.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::core::artefact::{Artefact, NodeId, NodeSet};
use crate::core::cache::ResultCache;
use crate::core::config::Options;
use crate::core::errors::{DataPilotError, Result};
use crate::core::graph::DependencyGraph;

/// Floor under `3 * historical_mean` for a node's resolve timeout.
const BASE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A producer computes one node's artefact, optionally pulling upstream
/// artefacts through the resolver handed to it.
pub trait Producer: Send + Sync {
    /// Compute the artefact for `node`, given the source file path and a
    /// resolver scoped to this run for upstream lookups.
    fn produce(&self, node: NodeId, path: &Path, resolver: &DependencyResolver) -> Result<Artefact>;
}

impl<F> Producer for F
where
    F: Fn(NodeId, &Path, &DependencyResolver) -> Result<Artefact> + Send + Sync,
{
    fn produce(&self, node: NodeId, path: &Path, resolver: &DependencyResolver) -> Result<Artefact> {
        self(node, path, resolver)
    }
}

/// Shared state behind [`DependencyResolver`]'s cheap handle. Split out so a
/// handle can be cloned (bumping the `Arc`, not deep-copying) and moved into
/// a detached producer thread without borrowing from the caller's stack.
struct ResolverState {
    path: PathBuf,
    options: Options,
    graph: Arc<DependencyGraph>,
    cache: Arc<ResultCache>,
    producers: RwLock<HashMap<NodeId, Arc<dyn Producer>>>,
    memo: RwLock<HashMap<NodeId, Artefact>>,
    resolving: Mutex<HashSet<NodeId>>,
}

/// Per-run resolver: owns the in-memory memo, consults the shared cache,
/// and dispatches to registered producers under a timeout.
///
/// Cheap to clone — it is a thin handle around an `Arc`-shared state block,
/// so a producer call can be moved onto its own thread without borrowing
/// from the resolving thread.
#[derive(Clone)]
pub struct DependencyResolver {
    state: Arc<ResolverState>,
}

impl DependencyResolver {
    /// Create a resolver scoped to one run over `path` with `options`.
    pub fn new(path: impl Into<PathBuf>, options: Options, graph: Arc<DependencyGraph>, cache: Arc<ResultCache>) -> Self {
        Self {
            state: Arc::new(ResolverState {
                path: path.into(),
                options,
                graph,
                cache,
                producers: RwLock::new(HashMap::new()),
                memo: RwLock::new(HashMap::new()),
                resolving: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Register the producer responsible for computing `section`.
    pub fn register(&self, section: NodeId, producer: Arc<dyn Producer>) {
        self.state.producers.write().insert(section, producer);
    }

    /// Whether a producer is registered for `section`.
    pub fn has_producer(&self, section: NodeId) -> bool {
        self.state.producers.read().contains_key(&section)
    }

    /// Resolve `section`, checking the per-run memo, then the shared cache,
    /// then invoking its producer under a timeout.
    pub fn resolve(&self, section: NodeId) -> Result<Artefact> {
        if let Some(artefact) = self.state.memo.read().get(&section).cloned() {
            return Ok(artefact);
        }

        let deps = self
            .state
            .graph
            .spec(section)
            .map(|s| s.dependencies.clone())
            .unwrap_or_default();

        if let Some(artefact) = self.state.cache.get(&self.state.path, Some(section), &self.state.options, &deps) {
            self.state.memo.write().insert(section, artefact.clone());
            return Ok(artefact);
        }

        {
            let mut resolving = self.state.resolving.lock();
            if resolving.contains(&section) {
                let chain: Vec<NodeId> = resolving.iter().copied().collect();
                return Err(DataPilotError::CyclicResolution {
                    node: section,
                    chain,
                });
            }
            resolving.insert(section);
        }

        let result = self.resolve_uncached(section, &deps);

        self.state.resolving.lock().remove(&section);
        result
    }

    fn resolve_uncached(&self, section: NodeId, deps: &NodeSet) -> Result<Artefact> {
        let producer = self
            .state
            .producers
            .read()
            .get(&section)
            .cloned()
            .ok_or_else(|| DataPilotError::Configuration {
                message: format!("no producer registered for {section}"),
                field: Some("producers".to_string()),
            })?;

        let mean = self.state.graph.mean_runtime(section);
        let timeout = BASE_TIMEOUT.max(Duration::from_millis(3 * mean));

        let path = self.state.path.clone();
        let resolver = self.clone();
        let started = Instant::now();
        let artefact = run_with_timeout(section, timeout, move || producer.produce(section, &path, &resolver))?;
        let elapsed = started.elapsed();
        self.state.graph.record_runtime(section, elapsed.as_millis() as u64);

        artefact.validate_envelope().map_err(|missing| DataPilotError::InvalidArtefact {
            node: section,
            missing_property: missing,
        })?;

        let ttl_ms = estimate_ttl_ms(elapsed);
        self.state
            .cache
            .set(&self.state.path, Some(section), &self.state.options, artefact.clone(), deps.clone(), ttl_ms);
        self.state.memo.write().insert(section, artefact.clone());

        debug!(node = %section, elapsed_ms = elapsed.as_millis(), "resolved node");
        Ok(artefact)
    }

    /// Resolve every section in `sections`, planning first. Executes
    /// sequentially unless `options.parallel` is set, in which case nodes
    /// within the same parallel group resolve concurrently via rayon.
    pub fn resolve_many(&self, sections: &[NodeId]) -> Result<HashMap<NodeId, Artefact>> {
        let plan = self.state.graph.plan(sections, &self.state.options)?;
        let mut results = HashMap::new();

        if self.state.options.parallel {
            use rayon::prelude::*;
            for group in &plan.parallel_groups {
                let group_nodes: Vec<NodeId> = group.iter().copied().collect();
                let resolved: Vec<Result<(NodeId, Artefact)>> = group_nodes
                    .par_iter()
                    .map(|&node| self.resolve(node).map(|a| (node, a)))
                    .collect();
                for item in resolved {
                    let (node, artefact) = item?;
                    results.insert(node, artefact);
                }
            }
        } else {
            for &node in &plan.order {
                if plan.conditional_skips.contains(&node) {
                    continue;
                }
                let artefact = self.resolve(node)?;
                results.insert(node, artefact);
            }
        }

        Ok(results)
    }

    /// Drop `section` from the per-run memo and ask the cache to invalidate
    /// everything downstream of it.
    pub fn invalidate(&self, section: NodeId) {
        self.state.memo.write().remove(&section);
        self.state.cache.invalidate_dependents(section);
    }

    /// The run's source path.
    pub fn path(&self) -> &Path {
        &self.state.path
    }

    /// The run's options.
    pub fn options(&self) -> &Options {
        &self.state.options
    }
}

/// Estimate a cache TTL proportional to how long the node took, clamped to
/// a sane window.
fn estimate_ttl_ms(elapsed: Duration) -> u64 {
    let proportional = elapsed.as_millis() as u64 * 1000;
    proportional.clamp(60_000, 24 * 60 * 60 * 1000)
}

/// Run `f` on a detached thread, but fail with a timeout error if it hasn't
/// finished within `timeout`. The thread is not joined: on expiry this
/// returns immediately and leaves the producer running in the background,
/// since Rust has no safe way to force-kill it. A producer that ignores the
/// deadline keeps burning CPU after its run has already failed, but it no
/// longer blocks the caller's wall clock.
fn run_with_timeout<T>(node: NodeId, timeout: Duration, f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T>
where
    T: Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let result = f();
        let _ = tx.send(result);
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            warn!(node = %node, timeout_ms = timeout.as_millis(), "producer timed out, abandoning thread");
            Err(DataPilotError::Timeout {
                node,
                budget_ms: timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::DependencyGraph;

    fn resolver_for(path: &Path) -> DependencyResolver {
        let graph = Arc::new(DependencyGraph::default_graph().unwrap());
        let cache = Arc::new(ResultCache::new(64 * 1024 * 1024, "1"));
        DependencyResolver::new(path, Options::default(), graph, cache)
    }

    #[test]
    fn resolve_caches_and_memoizes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();
        let resolver = resolver_for(&file);

        let calls = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let calls_clone = calls.clone();
        resolver.register(
            NodeId::Section1,
            Arc::new(move |node, _path: &Path, _r: &DependencyResolver| {
                calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(Artefact::new(node, serde_json::json!({"rows": 1})))
            }),
        );

        resolver.resolve(NodeId::Section1).unwrap();
        resolver.resolve(NodeId::Section1).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_producer_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();
        let resolver = resolver_for(&file);
        let err = resolver.resolve(NodeId::Section1).unwrap_err();
        assert!(matches!(err, DataPilotError::Configuration { .. }));
    }

    #[test]
    fn invalid_artefact_missing_required_property() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();
        let resolver = resolver_for(&file);
        resolver.register(
            NodeId::Section1,
            Arc::new(|node, _path: &Path, _r: &DependencyResolver| {
                Ok(Artefact {
                    node,
                    payload: serde_json::json!({"wrong_key": true}),
                    warnings: vec![],
                    performance: None,
                })
            }),
        );
        let err = resolver.resolve(NodeId::Section1).unwrap_err();
        assert!(matches!(err, DataPilotError::InvalidArtefact { .. }));
    }
}
