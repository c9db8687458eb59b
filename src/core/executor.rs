//! Top-level run coordinator for one file/options pair.
//!
//! Runs a fixed four-phase pipeline (plan, validate, execute, post-execute),
//! emitting progress through a [`ProgressOrchestrator`] with phased
//! percentages, but driven by a `DependencyGraph`-computed order instead of
//! a hardcoded phase list.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::core::artefact::{Artefact, NodeId};
use crate::core::cache::ResultCache;
use crate::core::config::Options;
use crate::core::errors::{DataPilotError, Result};
use crate::core::graph::{DependencyGraph, ExecutionPlan};
use crate::core::progress::ProgressOrchestrator;
use crate::core::resolver::DependencyResolver;

/// Bound on the rollback stack; older checkpoints are dropped once full.
const ROLLBACK_STACK_CAPACITY: usize = 10;
/// Pre-execution GC hint threshold, as a fraction of the memory budget.
const GC_HINT_FRACTION: f64 = 0.70;
/// Validate-readiness warning threshold, as a fraction of the memory budget.
const READINESS_WARNING_FRACTION: f64 = 0.80;

/// A rollback checkpoint captured before a node begins executing.
#[derive(Debug, Clone)]
struct RollbackPoint {
    node: NodeId,
    at: Instant,
    memory_snapshot_bytes: u64,
}

/// Outcome of a single node's execution attempt.
enum NodeOutcome {
    Completed(Artefact),
    Skipped,
}

/// The final result of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Every artefact produced or retrieved from cache, keyed by node.
    pub artefacts: std::collections::HashMap<NodeId, Artefact>,
    /// Nodes that actually completed, in completion order.
    pub completed: Vec<NodeId>,
    /// Nodes skipped by a condition or an optional-failure policy.
    pub skipped: Vec<NodeId>,
    /// Total wall-clock duration of the run, in milliseconds.
    pub execution_time_ms: u64,
    /// Observed peak memory usage during the run, in bytes.
    pub memory_peak_bytes: u64,
    /// The plan this run executed.
    pub plan: ExecutionPlan,
}

/// Coordinates one run: planning, readiness validation, node execution with
/// rollback, and a post-execution completeness sweep.
pub struct SequentialExecutor {
    path: PathBuf,
    options: Options,
    graph: Arc<DependencyGraph>,
    cache: Arc<ResultCache>,
    resolver: DependencyResolver,
    progress: ProgressOrchestrator,
    cancelled: Arc<AtomicBool>,
    memory_peak_bytes: AtomicU64,
}

impl SequentialExecutor {
    /// Build an executor for one run over `path`.
    pub fn new(
        path: impl Into<PathBuf>,
        options: Options,
        graph: Arc<DependencyGraph>,
        cache: Arc<ResultCache>,
    ) -> Self {
        let path = path.into();
        let resolver = DependencyResolver::new(path.clone(), options.clone(), graph.clone(), cache.clone());
        Self {
            path,
            options,
            graph,
            cache,
            resolver,
            progress: ProgressOrchestrator::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            memory_peak_bytes: AtomicU64::new(0),
        }
    }

    /// The per-run resolver, exposed so callers can register producers
    /// before calling [`SequentialExecutor::run`].
    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// A handle producers or an external caller can use to request
    /// cancellation; observed at the next suspension point.
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Run the full pipeline for `requested` sections (typically
    /// `NodeId::ALL`).
    pub fn run(&self, requested: &[NodeId]) -> Result<RunOutcome> {
        let started = Instant::now();
        self.progress.on_phase_start("initialisation");

        let plan = self.plan_phase(requested)?;

        let active_phases: Vec<&str> = std::iter::once("initialisation")
            .chain(plan.order.iter().map(|n| n.as_str()))
            .collect();
        self.progress.renormalize(&active_phases);

        self.validate_phase(&plan)?;
        self.progress.on_phase_complete("initialisation");

        let (artefacts, completed, skipped) = match self.execute_phase(&plan) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.progress.on_error(&err);
                return Err(err);
            }
        };

        self.post_execution_phase(&plan, &completed)?;

        Ok(RunOutcome {
            artefacts,
            completed,
            skipped,
            execution_time_ms: started.elapsed().as_millis() as u64,
            memory_peak_bytes: self.memory_peak_bytes.load(Ordering::SeqCst),
            plan,
        })
    }

    fn plan_phase(&self, requested: &[NodeId]) -> Result<ExecutionPlan> {
        self.progress.on_progress("initialisation", 0.0);
        let plan = self.graph.plan(requested, &self.options)?;
        for node in &plan.order {
            if !self.resolver.has_producer(*node) {
                return Err(DataPilotError::config_field(
                    format!("no producer registered for {node}"),
                    "producers",
                ));
            }
        }
        self.progress.on_progress("initialisation", 50.0);
        Ok(plan)
    }

    fn validate_phase(&self, plan: &ExecutionPlan) -> Result<()> {
        if plan.order.is_empty() {
            return Err(DataPilotError::config("execution plan is empty"));
        }
        let ratio = self.memory_ratio();
        if ratio > READINESS_WARNING_FRACTION {
            warn!(ratio, "process heap already exceeds 80% of budget before execution");
            self.progress.on_warning("process heap already exceeds 80% of budget before execution");
        }
        self.progress.on_progress("initialisation", 100.0);
        Ok(())
    }

    fn execute_phase(
        &self,
        plan: &ExecutionPlan,
    ) -> Result<(
        std::collections::HashMap<NodeId, Artefact>,
        Vec<NodeId>,
        Vec<NodeId>,
    )> {
        let mut artefacts = std::collections::HashMap::new();
        let mut completed = Vec::new();
        let mut skipped = Vec::new();
        let mut rollback_stack: VecDeque<RollbackPoint> = VecDeque::with_capacity(ROLLBACK_STACK_CAPACITY);

        for &node in &plan.order {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(DataPilotError::Cancelled { node: Some(node) });
            }

            if plan.conditional_skips.contains(&node) {
                skipped.push(node);
                continue;
            }

            self.progress.on_phase_start(node.as_str());

            if rollback_stack.len() == ROLLBACK_STACK_CAPACITY {
                rollback_stack.pop_front();
            }
            rollback_stack.push_back(RollbackPoint {
                node,
                at: Instant::now(),
                memory_snapshot_bytes: self.memory_peak_bytes.load(Ordering::SeqCst),
            });

            if self.memory_ratio() > GC_HINT_FRACTION {
                self.hint_gc();
            }

            match self.execute_node(node) {
                Ok(NodeOutcome::Completed(artefact)) => {
                    completed.push(node);
                    artefacts.insert(node, artefact);
                    self.update_memory_peak();
                    self.cache.invalidate_dependents(node);
                    self.progress.on_phase_complete(node.as_str());
                }
                Ok(NodeOutcome::Skipped) => {
                    skipped.push(node);
                    self.progress.on_phase_complete(node.as_str());
                }
                Err(err) => {
                    self.cache.invalidate_dependents(node);
                    let spec = self.graph.spec(node);
                    let required = spec.map(|s| s.required).unwrap_or(true);
                    let retryable = spec.map(|s| s.retryable).unwrap_or(false);

                    if required {
                        self.rollback(&rollback_stack);
                        return Err(DataPilotError::RequiredSectionFailed {
                            node,
                            message: err.to_string(),
                        });
                    } else if retryable {
                        warn!(node = %node, error = %err, "optional retryable node failed, continuing");
                        self.progress.on_warning(&format!("{node} skipped: {err}"));
                        skipped.push(node);
                    } else {
                        skipped.push(node);
                    }
                    self.progress.on_phase_complete(node.as_str());
                }
            }
        }

        Ok((artefacts, completed, skipped))
    }

    fn execute_node(&self, node: NodeId) -> Result<NodeOutcome> {
        let deps = self
            .graph
            .spec(node)
            .map(|s| s.dependencies.clone())
            .unwrap_or_default();

        if let Some(artefact) = self.cache.get(&self.path, Some(node), &self.options, &deps) {
            return Ok(NodeOutcome::Completed(artefact));
        }

        match self.resolver.resolve(node) {
            Ok(artefact) => Ok(NodeOutcome::Completed(artefact)),
            Err(err) => Err(err),
        }
    }

    fn rollback(&self, stack: &VecDeque<RollbackPoint>) {
        if let Some(point) = stack.back() {
            warn!(node = %point.node, "rolling back run after required-section failure");
        }
        self.resolver.invalidate_all_from(stack.iter().map(|p| p.node));
        self.hint_gc();
    }

    fn post_execution_phase(&self, plan: &ExecutionPlan, completed: &[NodeId]) -> Result<()> {
        self.update_memory_peak();
        let completed_set: std::collections::HashSet<NodeId> = completed.iter().copied().collect();
        let missing: Vec<NodeId> = plan
            .order
            .iter()
            .copied()
            .filter(|node| {
                !plan.conditional_skips.contains(node)
                    && self.graph.spec(*node).map(|s| s.required).unwrap_or(true)
                    && !completed_set.contains(node)
            })
            .collect();

        if !missing.is_empty() {
            error!(missing = ?missing, "required sections incomplete at end of run");
            return Err(DataPilotError::RequiredSectionsIncomplete { missing });
        }
        Ok(())
    }

    fn memory_ratio(&self) -> f64 {
        if self.options.cache_memory_limit_bytes == 0 {
            return 0.0;
        }
        self.cache.total_size_bytes() as f64 / self.options.cache_memory_limit_bytes as f64
    }

    fn update_memory_peak(&self) {
        let current = self.cache.total_size_bytes();
        self.memory_peak_bytes.fetch_max(current, Ordering::SeqCst);
    }

    fn hint_gc(&self) {
        debug_gc_hint();
    }
}

/// Rust has no explicit GC to hint; kept as an explicit, logged no-op so a
/// future allocator-aware build has one seam to hook into.
fn debug_gc_hint() {
    tracing::trace!("memory pressure GC hint");
}

/// Helper extension used only by [`SequentialExecutor::rollback`].
trait InvalidateAll {
    fn invalidate_all_from(&self, nodes: impl Iterator<Item = NodeId>);
}

impl InvalidateAll for DependencyResolver {
    fn invalidate_all_from(&self, nodes: impl Iterator<Item = NodeId>) {
        for node in nodes {
            self.invalidate(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artefact::Artefact;
    use std::sync::Arc as StdArc;

    fn executor_for(path: &Path, options: Options) -> SequentialExecutor {
        let graph = StdArc::new(DependencyGraph::default_graph().unwrap());
        let cache = StdArc::new(ResultCache::new(64 * 1024 * 1024, "1"));
        SequentialExecutor::new(path, options, graph, cache)
    }

    fn register_all_ok(executor: &SequentialExecutor) {
        for node in NodeId::ALL {
            executor.resolver().register(
                node,
                StdArc::new(move |n, _path: &Path, _r: &DependencyResolver| {
                    Ok(Artefact::new(n, serde_json::json!({"ok": true})))
                }),
            );
        }
    }

    #[test]
    fn full_run_completes_all_required_and_optional_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();
        let executor = executor_for(&file, Options::default());
        register_all_ok(&executor);

        let outcome = executor.run(&NodeId::ALL).unwrap();
        assert_eq!(outcome.completed.len(), 6);
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn required_section_failure_fails_whole_run() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();
        let executor = executor_for(&file, Options::default());
        register_all_ok(&executor);
        executor.resolver().register(
            NodeId::Section1,
            StdArc::new(|_n, _path: &Path, _r: &DependencyResolver| {
                Err(DataPilotError::config("boom"))
            }),
        );

        let err = executor.run(&NodeId::ALL).unwrap_err();
        assert!(matches!(err, DataPilotError::RequiredSectionFailed { .. }));
    }

    #[test]
    fn optional_section_failure_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();
        let executor = executor_for(&file, Options::default());
        register_all_ok(&executor);
        executor.resolver().register(
            NodeId::Section4,
            StdArc::new(|_n, _path: &Path, _r: &DependencyResolver| {
                Err(DataPilotError::config("optional failure"))
            }),
        );

        let outcome = executor.run(&NodeId::ALL).unwrap();
        assert!(outcome.skipped.contains(&NodeId::Section4));
        assert!(outcome.completed.contains(&NodeId::Section1));
    }
}
