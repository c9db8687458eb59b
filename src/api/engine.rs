//! Public, high-level entry point wiring the orchestration core together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::analyzers::registration::register_default_producers;
use crate::api::results::ExecutionEnvelope;
use crate::core::artefact::NodeId;
use crate::core::cache::ResultCache;
use crate::core::config::Options;
use crate::core::errors::ExecutionContext;
use crate::core::executor::SequentialExecutor;
use crate::core::graph::DependencyGraph;

/// Top-level façade: validates options, builds the graph/cache/executor,
/// registers the default section producers, and runs a plan to completion.
///
/// One instance is cheap to construct per run; the [`ResultCache`] it owns
/// can be shared across runs by cloning the `Arc` returned from
/// [`DataPilotEngine::cache`] into a subsequent engine if cross-run reuse is
/// desired.
pub struct DataPilotEngine {
    graph: Arc<DependencyGraph>,
    cache: Arc<ResultCache>,
}

impl DataPilotEngine {
    /// Build an engine with the default dependency graph and a fresh cache
    /// sized from `options`.
    pub fn new(options: &Options) -> crate::Result<Self> {
        options.validate()?;
        let graph = Arc::new(DependencyGraph::default_graph()?);
        let cache = Arc::new(match &options.cache_dir {
            Some(dir) => ResultCache::with_persistence(options.cache_memory_limit_bytes, options.cache_version.clone(), dir),
            None => ResultCache::new(options.cache_memory_limit_bytes, options.cache_version.clone()),
        });
        Ok(Self { graph, cache })
    }

    /// Build an engine sharing an existing graph and cache, e.g. to reuse a
    /// warm cache across multiple files in one process.
    pub fn with_shared_state(graph: Arc<DependencyGraph>, cache: Arc<ResultCache>) -> Self {
        Self { graph, cache }
    }

    /// The shared cache backing this engine, for reuse by a subsequent run.
    pub fn cache(&self) -> Arc<ResultCache> {
        self.cache.clone()
    }

    /// The shared dependency graph backing this engine.
    pub fn graph(&self) -> Arc<DependencyGraph> {
        self.graph.clone()
    }

    /// Run every requested section over `path`, returning the envelope
    /// directly (never propagating a `Result::Err`; failures are encoded as
    /// [`ExecutionEnvelope::Failure`]).
    pub fn run(&self, path: impl AsRef<Path>, options: Options, requested: &[NodeId]) -> ExecutionEnvelope {
        let path: PathBuf = path.as_ref().to_path_buf();
        info!(path = %path.display(), "starting run");

        if let Err(err) = options.validate() {
            return ExecutionEnvelope::from_error(&err, ExecutionContext::default());
        }

        let executor = SequentialExecutor::new(path, options, self.graph.clone(), self.cache.clone());
        register_default_producers(executor.resolver());

        match executor.run(requested) {
            Ok(outcome) => ExecutionEnvelope::from_outcome(outcome),
            Err(err) => {
                let context = ExecutionContext {
                    current_node: None,
                    completed_nodes: Vec::new(),
                    memory_peak_bytes: self.cache.total_size_bytes(),
                };
                ExecutionEnvelope::from_error(&err, context)
            }
        }
    }

    /// Run every section; the default requested set is all six.
    pub fn run_all(&self, path: impl AsRef<Path>, options: Options) -> ExecutionEnvelope {
        self.run(path, options, &NodeId::ALL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_run_over_small_csv_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"name,score\nalice,90\nbob,70\n").unwrap();

        let engine = DataPilotEngine::new(&Options::default()).unwrap();
        let envelope = engine.run_all(&file, Options::default());
        assert!(envelope.is_success());
    }

    #[test]
    fn invalid_options_produce_failure_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"name,score\nalice,90\n").unwrap();

        let mut options = Options::default();
        options.chunk_size = 0;
        let engine = DataPilotEngine::new(&Options::default()).unwrap();
        let envelope = engine.run(&file, options, &NodeId::ALL);
        assert!(!envelope.is_success());
    }
}
