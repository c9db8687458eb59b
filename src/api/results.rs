//! The public result envelope a run returns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::artefact::{Artefact, NodeId};
use crate::core::errors::ExecutionContext;
use crate::core::executor::RunOutcome;

/// Run-level metadata attached to every envelope, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Total wall-clock duration, in milliseconds.
    pub execution_time_ms: u64,
    /// Sections that actually completed.
    pub sections_executed: Vec<NodeId>,
    /// Sections skipped (condition false or optional failure).
    pub sections_skipped: Vec<NodeId>,
    /// Observed peak memory usage, in bytes.
    pub memory_peak_bytes: u64,
    /// The topological order the plan computed.
    pub plan_order: Vec<NodeId>,
}

/// The top-level value returned by [`crate::api::engine::DataPilotEngine::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionEnvelope {
    /// The run completed (possibly with some optional sections skipped).
    Success {
        /// Always `true`; present for a stable wire shape.
        success: bool,
        /// Every artefact produced or retrieved from cache, keyed by node.
        data: HashMap<NodeId, Artefact>,
        /// Run-level metadata.
        metadata: RunMetadata,
    },
    /// The run failed before producing a usable result set.
    Failure {
        /// Always `false`; present for a stable wire shape.
        success: bool,
        /// Human-readable error description.
        error: String,
        /// Actionable suggestions derived from the error kind.
        suggestions: Vec<String>,
        /// Partial metadata captured at the point of failure.
        metadata: FailureMetadata,
    },
}

/// Partial context captured when a run fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureMetadata {
    /// The node being executed when the failure occurred, if any.
    pub current_node: Option<NodeId>,
    /// Nodes that had already completed successfully.
    pub completed_nodes: Vec<NodeId>,
    /// Observed memory peak at the time of failure, in bytes.
    pub memory_peak_bytes: u64,
}

impl From<ExecutionContext> for FailureMetadata {
    fn from(ctx: ExecutionContext) -> Self {
        Self {
            current_node: ctx.current_node,
            completed_nodes: ctx.completed_nodes,
            memory_peak_bytes: ctx.memory_peak_bytes,
        }
    }
}

impl ExecutionEnvelope {
    /// Build a success envelope from a completed [`RunOutcome`].
    pub fn from_outcome(outcome: RunOutcome) -> Self {
        Self::Success {
            success: true,
            metadata: RunMetadata {
                execution_time_ms: outcome.execution_time_ms,
                sections_executed: outcome.completed,
                sections_skipped: outcome.skipped,
                memory_peak_bytes: outcome.memory_peak_bytes,
                plan_order: outcome.plan.order,
            },
            data: outcome.artefacts,
        }
    }

    /// Build a failure envelope from an error and its captured context.
    pub fn from_error(error: &crate::core::errors::DataPilotError, context: ExecutionContext) -> Self {
        Self::Failure {
            success: false,
            error: error.to_string(),
            suggestions: error.suggestions(),
            metadata: context.into(),
        }
    }

    /// Whether this envelope represents a successful run.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::DataPilotError;

    #[test]
    fn failure_envelope_carries_suggestions() {
        let error = DataPilotError::MemoryExceeded {
            current_bytes: 100,
            limit_bytes: 50,
        };
        let envelope = ExecutionEnvelope::from_error(&error, ExecutionContext::default());
        match envelope {
            ExecutionEnvelope::Failure { suggestions, .. } => assert!(!suggestions.is_empty()),
            _ => panic!("expected Failure variant"),
        }
    }
}
