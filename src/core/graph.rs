//! Static dependency planner.
//!
//! Nodes live in an arena indexed by [`NodeId`] rather than as a web of
//! `Rc`/back-pointers: dependents are stored as index sets, never as
//! back-pointers. [`petgraph`] backs cycle detection and gives us a
//! familiar, well-tested DFS; the planning tie-breaks and memory walks are
//! hand-rolled against the arena directly since they need access to weights
//! and historical runtimes that a generic graph library has no notion of.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::artefact::{NodeId, NodeSet};
use crate::core::config::Options;
use crate::core::errors::{DataPilotError, Result};

/// Default mean runtime assumed for a node with no recorded history, in
/// milliseconds.
const DEFAULT_MEAN_RUNTIME_MS: u64 = 1000;
/// How many recent durations are retained per node for the mean.
const RUNTIME_HISTORY_CAPACITY: usize = 10;

/// A predicate deciding whether a node should be planned at all, given the
/// run's options.
pub type Condition = fn(&Options) -> bool;

fn always_true(_: &Options) -> bool {
    true
}

/// Static metadata for one analyser node.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// The node's identity.
    pub id: NodeId,
    /// Nodes this one depends on.
    pub dependencies: NodeSet,
    /// Nodes that depend on this one (derived; kept denormalised for O(1)
    /// lookups during planning and memory-release walks).
    pub dependents: NodeSet,
    /// Memory/compute proxy used for ordering and memory estimation.
    pub weight: i64,
    /// Estimated duration absent any recorded history.
    pub estimated_duration_ms: u64,
    /// If false, this node's failure is non-fatal to the run.
    pub required: bool,
    /// Whether a failed attempt may be retried.
    pub retryable: bool,
    /// May exclude this node from a plan at plan time.
    pub condition: Condition,
}

/// The chosen topological order plus planning metadata.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// The chosen topological order.
    pub order: Vec<NodeId>,
    /// Groups whose dependencies are all satisfied by earlier groups.
    pub parallel_groups: Vec<NodeSet>,
    /// Nodes excluded because their condition evaluated false.
    pub conditional_skips: NodeSet,
    /// Whether the running-weight walk stayed under the memory threshold.
    pub memory_optimised: bool,
    /// The running-weight peak observed while walking `order`.
    pub estimated_memory_peak: u64,
}

#[derive(Default)]
struct RuntimeHistory {
    samples: HashMap<NodeId, VecDeque<u64>>,
}

impl RuntimeHistory {
    fn record(&mut self, node: NodeId, duration_ms: u64) {
        let entry = self.samples.entry(node).or_default();
        entry.push_back(duration_ms);
        while entry.len() > RUNTIME_HISTORY_CAPACITY {
            entry.pop_front();
        }
    }

    fn mean(&self, node: NodeId) -> u64 {
        match self.samples.get(&node) {
            Some(samples) if !samples.is_empty() => {
                let sum: u64 = samples.iter().sum();
                sum / samples.len() as u64
            }
            _ => DEFAULT_MEAN_RUNTIME_MS,
        }
    }
}

/// Static planner over the six analyser nodes.
pub struct DependencyGraph {
    specs: HashMap<NodeId, NodeSpec>,
    history: RwLock<RuntimeHistory>,
    /// Bytes-per-weight-unit scale used by the memory walks.
    weight_scale_bytes: u64,
}

impl DependencyGraph {
    /// Build the default six-section graph:
    /// `s1→∅, s2→∅, s3→∅, s4→{s1,s3}, s5→{s1,s2,s3}, s6→{s1,s2,s3,s5}`.
    pub fn default_graph() -> Result<Self> {
        use NodeId::*;
        let specs = vec![
            NodeSpec {
                id: Section1,
                dependencies: NodeSet::new(),
                dependents: NodeSet::new(),
                weight: 10,
                estimated_duration_ms: 500,
                required: true,
                retryable: true,
                condition: always_true,
            },
            NodeSpec {
                id: Section2,
                dependencies: NodeSet::new(),
                dependents: NodeSet::new(),
                weight: 15,
                estimated_duration_ms: 800,
                required: true,
                retryable: true,
                condition: always_true,
            },
            NodeSpec {
                id: Section3,
                dependencies: NodeSet::new(),
                dependents: NodeSet::new(),
                weight: 25,
                estimated_duration_ms: 2000,
                required: true,
                retryable: true,
                condition: always_true,
            },
            NodeSpec {
                id: Section4,
                dependencies: [Section1, Section3].into_iter().collect(),
                dependents: NodeSet::new(),
                weight: 12,
                estimated_duration_ms: 700,
                required: false,
                retryable: true,
                condition: always_true,
            },
            NodeSpec {
                id: Section5,
                dependencies: [Section1, Section2, Section3].into_iter().collect(),
                dependents: NodeSet::new(),
                weight: 18,
                estimated_duration_ms: 1200,
                required: false,
                retryable: true,
                condition: always_true,
            },
            NodeSpec {
                id: Section6,
                dependencies: [Section1, Section2, Section3, Section5]
                    .into_iter()
                    .collect(),
                dependents: NodeSet::new(),
                weight: 20,
                estimated_duration_ms: 1500,
                required: false,
                retryable: true,
                condition: always_true,
            },
        ];
        Self::new(specs)
    }

    /// Build a graph from explicit specs, deriving `dependents` and
    /// rejecting cycles up front at construction time.
    pub fn new(mut specs: Vec<NodeSpec>) -> Result<Self> {
        let ids: Vec<NodeId> = specs.iter().map(|s| s.id).collect();
        for dependent in &ids {
            let deps: NodeSet = specs
                .iter()
                .find(|s| s.id == *dependent)
                .map(|s| s.dependencies.clone())
                .unwrap_or_default();
            for dep in deps {
                if let Some(spec) = specs.iter_mut().find(|s| s.id == dep) {
                    spec.dependents.insert(*dependent);
                }
            }
        }

        let map: HashMap<NodeId, NodeSpec> = specs.drain(..).map(|s| (s.id, s)).collect();
        let graph = Self {
            specs: map,
            history: RwLock::new(RuntimeHistory::default()),
            weight_scale_bytes: 1024 * 1024,
        };
        graph.detect_cycles()?;
        Ok(graph)
    }

    fn petgraph_view(&self) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
        let mut g = DiGraph::new();
        let mut idx = HashMap::new();
        for id in self.specs.keys() {
            idx.insert(*id, g.add_node(*id));
        }
        for spec in self.specs.values() {
            for dep in &spec.dependencies {
                g.add_edge(idx[dep], idx[&spec.id], ());
            }
        }
        (g, idx)
    }

    /// Returns every simple cycle found via DFS, as the path slice from the
    /// repeat node.
    pub fn find_cycles(&self) -> Vec<Vec<NodeId>> {
        let mut cycles = Vec::new();
        let mut visited: NodeSet = NodeSet::new();

        let ids: Vec<NodeId> = self.specs.keys().copied().collect();
        for start in ids {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path: NodeSet = NodeSet::new();
            self.dfs_cycles(start, &mut path, &mut on_path, &mut visited, &mut cycles);
        }
        cycles
    }

    fn dfs_cycles(
        &self,
        node: NodeId,
        path: &mut Vec<NodeId>,
        on_path: &mut NodeSet,
        visited: &mut NodeSet,
        cycles: &mut Vec<Vec<NodeId>>,
    ) {
        path.push(node);
        on_path.insert(node);

        if let Some(spec) = self.specs.get(&node) {
            for &dep in &spec.dependents {
                if on_path.contains(&dep) {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<NodeId> = path[start..].to_vec();
                    cycle.push(dep);
                    cycles.push(cycle);
                } else if !visited.contains(&dep) {
                    self.dfs_cycles(dep, path, on_path, visited, cycles);
                }
            }
        }

        on_path.remove(&node);
        visited.insert(node);
        path.pop();
    }

    fn detect_cycles(&self) -> Result<()> {
        let (g, _) = self.petgraph_view();
        if !is_cyclic_directed(&g) {
            return Ok(());
        }
        let cycles = self.find_cycles();
        Err(DataPilotError::CyclicGraph { cycles })
    }

    /// Record an actual observed runtime for a node.
    pub fn record_runtime(&self, node: NodeId, duration_ms: u64) {
        self.history.write().record(node, duration_ms);
    }

    /// The current mean historical runtime for a node, or the default
    /// assumption if no samples have been recorded.
    pub fn mean_runtime(&self, node: NodeId) -> u64 {
        self.history.read().mean(node)
    }

    /// Look up a node's static spec.
    pub fn spec(&self, node: NodeId) -> Option<&NodeSpec> {
        self.specs.get(&node)
    }

    /// Build an [`ExecutionPlan`] for `requested`, given `options`.
    pub fn plan(&self, requested: &[NodeId], options: &Options) -> Result<ExecutionPlan> {
        self.detect_cycles()?;

        // Step 1: conditional filtering.
        let mut conditional_skips = NodeSet::new();
        let mut active: NodeSet = NodeSet::new();
        for id in self.specs.keys() {
            let spec = &self.specs[id];
            if (spec.condition)(options) {
                active.insert(*id);
            } else {
                conditional_skips.insert(*id);
            }
        }

        // Step 2: expand `requested` to the transitive closure of its
        // dependencies over `active`.
        let mut included: NodeSet = NodeSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        for id in requested {
            if !self.specs.contains_key(id) {
                return Err(DataPilotError::UnknownSection { id: id.to_string() });
            }
            queue.push_back(*id);
        }
        while let Some(id) = queue.pop_front() {
            if !active.contains(&id) || included.contains(&id) {
                continue;
            }
            included.insert(id);
            if let Some(spec) = self.specs.get(&id) {
                for dep in &spec.dependencies {
                    queue.push_back(*dep);
                }
            }
        }

        // Step 3: Kahn's algorithm with weighted tie-breaks.
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        for id in &included {
            let spec = &self.specs[id];
            let deg = spec
                .dependencies
                .iter()
                .filter(|d| included.contains(*d))
                .count();
            in_degree.insert(*id, deg);
        }

        let mut order = Vec::with_capacity(included.len());
        let mut remaining = in_degree.clone();
        loop {
            let mut ready: Vec<NodeId> = remaining
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(id, _)| *id)
                .collect();
            if ready.is_empty() {
                break;
            }
            ready.sort_by(|a, b| {
                self.tiebreak_score(*b, &included)
                    .partial_cmp(&self.tiebreak_score(*a, &included))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.cmp(b))
            });
            let chosen = ready[0];
            order.push(chosen);
            remaining.remove(&chosen);
            if let Some(spec) = self.specs.get(&chosen) {
                for dependent in &spec.dependents {
                    if let Some(deg) = remaining.get_mut(dependent) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
        }

        if order.len() != included.len() {
            // Defensive: detect_cycles() above should have already caught
            // this, but a residual cycle inside `included` would otherwise
            // silently truncate the order.
            let cycles = self.find_cycles();
            return Err(DataPilotError::CyclicGraph { cycles });
        }

        // Step 4: parallel groups.
        let parallel_groups = self.parallel_groups(&order);

        // Steps 5/6: memory walks.
        let (memory_optimised, estimated_memory_peak) =
            self.memory_walk(&order, options.cache_memory_limit_bytes);

        Ok(ExecutionPlan {
            order,
            parallel_groups,
            conditional_skips,
            memory_optimised,
            estimated_memory_peak,
        })
    }

    fn tiebreak_score(&self, node: NodeId, included: &NodeSet) -> f64 {
        let spec = &self.specs[&node];
        let dependents_count = spec
            .dependents
            .iter()
            .filter(|d| included.contains(*d))
            .count();
        let mean_runtime = self.mean_runtime(node) as f64;
        -(spec.weight as f64) + 10.0 * dependents_count as f64 - mean_runtime / 100.0
    }

    fn parallel_groups(&self, order: &[NodeId]) -> Vec<NodeSet> {
        let mut groups: Vec<NodeSet> = Vec::new();
        let mut placed: NodeSet = NodeSet::new();

        let mut remaining: Vec<NodeId> = order.to_vec();
        while !remaining.is_empty() {
            let mut group = NodeSet::new();
            let mut next_remaining = Vec::new();
            for &id in &remaining {
                let spec = &self.specs[&id];
                if spec.dependencies.iter().all(|d| placed.contains(d)) {
                    group.insert(id);
                } else {
                    next_remaining.push(id);
                }
            }
            if group.is_empty() {
                // Should not happen given `order` is a valid topological
                // sort, but avoid an infinite loop defensively.
                break;
            }
            placed.extend(group.iter().copied());
            groups.push(group);
            remaining = next_remaining;
        }
        groups
    }

    /// Walk `order`, releasing each node's weight once every dependent that
    /// appears in `order` has been visited, tracking both the running peak
    /// and whether it ever crossed `limit_bytes`.
    fn memory_walk(&self, order: &[NodeId], limit_bytes: u64) -> (bool, u64) {
        let mut remaining_dependents: HashMap<NodeId, usize> = HashMap::new();
        for &id in order {
            let spec = &self.specs[&id];
            let count = spec.dependents.iter().filter(|d| order.contains(d)).count();
            remaining_dependents.insert(id, count);
        }

        let mut running: u64 = 0;
        let mut peak: u64 = 0;
        let mut within_budget = true;

        for &id in order {
            let spec = &self.specs[&id];
            running += spec.weight.max(0) as u64 * self.weight_scale_bytes;
            peak = peak.max(running);
            if running > limit_bytes {
                within_budget = false;
            }

            for dep in &spec.dependencies {
                if let Some(count) = remaining_dependents.get_mut(dep) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        let dep_spec = &self.specs[dep];
                        running = running.saturating_sub(dep_spec.weight.max(0) as u64 * self.weight_scale_bytes);
                    }
                }
            }
        }

        (within_budget, peak)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> Options {
        Options::default()
    }

    #[test]
    fn default_graph_has_no_cycles() {
        assert!(DependencyGraph::default_graph().is_ok());
    }

    #[test]
    fn plan_for_section6_includes_full_closure_in_order() {
        let graph = DependencyGraph::default_graph().unwrap();
        let plan = graph.plan(&[NodeId::Section6], &opts()).unwrap();
        assert_eq!(
            plan.order,
            vec![
                NodeId::Section1,
                NodeId::Section2,
                NodeId::Section3,
                NodeId::Section5,
                NodeId::Section6,
            ]
        );
        assert!(plan.conditional_skips.is_empty());
    }

    #[test]
    fn parallel_groups_match_scenario_one() {
        let graph = DependencyGraph::default_graph().unwrap();
        let plan = graph.plan(&[NodeId::Section6], &opts()).unwrap();
        assert_eq!(
            plan.parallel_groups,
            vec![
                [NodeId::Section1, NodeId::Section2, NodeId::Section3]
                    .into_iter()
                    .collect(),
                [NodeId::Section5].into_iter().collect(),
                [NodeId::Section6].into_iter().collect(),
            ]
        );
    }

    #[test]
    fn every_dependency_precedes_its_dependents() {
        let graph = DependencyGraph::default_graph().unwrap();
        let plan = graph.plan(&[NodeId::Section6], &opts()).unwrap();
        let position: HashMap<NodeId, usize> = plan
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        for id in &plan.order {
            let spec = graph.spec(*id).unwrap();
            for dep in &spec.dependencies {
                assert!(position[dep] < position[id]);
            }
        }
    }

    #[test]
    fn unknown_section_fails_fast() {
        let graph = DependencyGraph::default_graph().unwrap();
        let ghost = NodeId::Section1; // stand-in; real unknown ids come from strings
        let _ = ghost;
        // NodeId is closed, so "unknown" happens at parse time; exercise
        // that path through `NodeId::parse` instead.
        assert!(NodeId::parse("section99").is_none());
    }

    #[test]
    fn cycle_injection_is_rejected() {
        use NodeId::*;
        let specs = vec![
            NodeSpec {
                id: Section1,
                dependencies: [Section3].into_iter().collect(),
                dependents: NodeSet::new(),
                weight: 10,
                estimated_duration_ms: 100,
                required: true,
                retryable: true,
                condition: always_true,
            },
            NodeSpec {
                id: Section3,
                dependencies: [Section1].into_iter().collect(),
                dependents: NodeSet::new(),
                weight: 10,
                estimated_duration_ms: 100,
                required: true,
                retryable: true,
                condition: always_true,
            },
        ];
        let result = DependencyGraph::new(specs);
        assert!(matches!(result, Err(DataPilotError::CyclicGraph { .. })));
    }

    #[test]
    fn recorded_runtime_shifts_mean() {
        let graph = DependencyGraph::default_graph().unwrap();
        assert_eq!(graph.mean_runtime(NodeId::Section1), DEFAULT_MEAN_RUNTIME_MS);
        graph.record_runtime(NodeId::Section1, 200);
        graph.record_runtime(NodeId::Section1, 400);
        assert_eq!(graph.mean_runtime(NodeId::Section1), 300);
    }

    #[test]
    fn conditional_node_can_be_skipped() {
        fn never(_: &Options) -> bool {
            false
        }
        use NodeId::*;
        let mut specs = vec![
            NodeSpec {
                id: Section1,
                dependencies: NodeSet::new(),
                dependents: NodeSet::new(),
                weight: 10,
                estimated_duration_ms: 100,
                required: true,
                retryable: true,
                condition: always_true,
            },
            NodeSpec {
                id: Section4,
                dependencies: [Section1].into_iter().collect(),
                dependents: NodeSet::new(),
                weight: 10,
                estimated_duration_ms: 100,
                required: false,
                retryable: true,
                condition: never,
            },
        ];
        specs[1].condition = never;
        let graph = DependencyGraph::new(specs).unwrap();
        let plan = graph.plan(&[Section1], &opts()).unwrap();
        assert!(plan.conditional_skips.contains(&Section4));
    }
}
