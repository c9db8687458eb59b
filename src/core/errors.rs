//! Error types for the DataPilot orchestration core.
//!
//! Every distinguishable failure mode is its own variant carrying
//! structured fields rather than a free-form message, so callers can match
//! on the failure and the executor can apply the required/optional/retryable
//! policy without string parsing.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::artefact::NodeId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DataPilotError>;

/// A snapshot of execution state attached to a propagated error so callers
/// get actionable context without re-deriving it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// The node being executed when the failure occurred, if any.
    pub current_node: Option<NodeId>,
    /// Nodes that had already completed successfully.
    pub completed_nodes: Vec<NodeId>,
    /// Observed process memory peak in bytes at the time of failure.
    pub memory_peak_bytes: u64,
}

/// Comprehensive error type for all orchestration-core operations.
#[derive(Error, Debug)]
pub enum DataPilotError {
    /// Unknown section id, invalid option value, or missing producer.
    #[error("configuration error: {message}")]
    Configuration {
        /// Human-readable description.
        message: String,
        /// Configuration field that caused the error, if applicable.
        field: Option<String>,
    },

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency graph: {cycles:?}")]
    CyclicGraph {
        /// Each simple cycle found, as a sequence of node ids.
        cycles: Vec<Vec<NodeId>>,
    },

    /// A `resolve()` call formed a cycle at run time through recursive
    /// upstream resolution.
    #[error("cyclic resolution detected at {node}: in-flight chain {chain:?}")]
    CyclicResolution {
        /// The node whose resolution re-entered itself.
        node: NodeId,
        /// The currently-resolving chain at the time of detection.
        chain: Vec<NodeId>,
    },

    /// Format detection failed or fell below the confidence threshold.
    #[error("format error: {message}")]
    Format {
        /// Human-readable description.
        message: String,
        /// Extensions the registry knows how to parse.
        supported_extensions: Vec<String>,
        /// Best-guess detection, if any was made.
        best_guess: Option<String>,
    },

    /// A file is missing, unreadable, or exceeds the supported size.
    #[error("I/O error: {message}")]
    Io {
        /// Human-readable description.
        message: String,
        /// The path involved, if known.
        path: Option<PathBuf>,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Unrecoverable structural problem in the input (vs. a single bad row,
    /// which is recovered locally and surfaced as a warning).
    #[error("parse error: {message}")]
    Parse {
        /// Human-readable description.
        message: String,
        /// Row index at which parsing became unrecoverable, if known.
        row_index: Option<u64>,
    },

    /// A producer returned a result missing the required envelope.
    #[error("invalid artefact for {node}: missing `{missing_property}`")]
    InvalidArtefact {
        /// The node whose producer misbehaved.
        node: NodeId,
        /// The envelope property that was required but absent.
        missing_property: &'static str,
    },

    /// A mandatory node failed during execution.
    #[error("required section failed: {node}: {message}")]
    RequiredSectionFailed {
        /// The node that failed.
        node: NodeId,
        /// Human-readable description of the failure.
        message: String,
    },

    /// The plan finished but a required node never reached `completed`.
    #[error("required sections incomplete: {missing:?}")]
    RequiredSectionsIncomplete {
        /// Required nodes that did not complete.
        missing: Vec<NodeId>,
    },

    /// A node exceeded its adaptive deadline.
    #[error("timeout: {node} exceeded {budget_ms}ms")]
    Timeout {
        /// The node that timed out.
        node: NodeId,
        /// The deadline that was exceeded, in milliseconds.
        budget_ms: u64,
    },

    /// External cancellation was observed at a suspension point.
    #[error("cancelled at {node:?}")]
    Cancelled {
        /// The node that was executing when cancellation was observed.
        node: Option<NodeId>,
    },

    /// The memory guard tripped.
    #[error("memory budget exceeded: {current_bytes} > {limit_bytes}")]
    MemoryExceeded {
        /// Observed usage at the time the guard tripped.
        current_bytes: u64,
        /// The configured limit.
        limit_bytes: u64,
    },

    /// An id outside the closed `NodeId` set was requested.
    #[error("unknown section: {id}")]
    UnknownSection {
        /// The unrecognised id as supplied by the caller.
        id: String,
    },
}

impl DataPilotError {
    /// Build a suggestion list a caller can surface directly to a user.
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Self::CyclicGraph { .. } => vec![
                "remove one edge from each reported cycle".to_string(),
                "check custom node conditions for accidental self-dependency".to_string(),
            ],
            Self::Format {
                supported_extensions,
                ..
            } => vec![format!(
                "supported extensions: {}",
                supported_extensions.join(", ")
            )],
            Self::Timeout { node, .. } => vec![format!(
                "increase the base timeout or investigate why {node} is slow"
            )],
            Self::MemoryExceeded { .. } => vec![
                "lower cache_memory_limit or reduce max_rows".to_string(),
                "enable memory_optimised planning".to_string(),
            ],
            Self::UnknownSection { .. } => {
                vec!["valid sections are section1..section6".to_string()]
            }
            _ => Vec::new(),
        }
    }

    /// Construct a configuration error without a specific field.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Construct a configuration error tied to a specific field.
    pub fn config_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Construct an I/O error with a path attached.
    pub fn io(message: impl Into<String>, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            message: message.into(),
            path: Some(path.into()),
            source,
        }
    }
}

impl From<io::Error> for DataPilotError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            message: "I/O operation failed".to_string(),
            path: None,
            source: err,
        }
    }
}

impl From<serde_json::Error> for DataPilotError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration {
            message: format!("JSON (de)serialization failed: {err}"),
            field: None,
        }
    }
}

impl From<serde_yaml::Error> for DataPilotError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("YAML (de)serialization failed: {err}"),
            field: None,
        }
    }
}

impl From<csv::Error> for DataPilotError {
    fn from(err: csv::Error) -> Self {
        Self::Parse {
            message: format!("CSV parsing failed: {err}"),
            row_index: err.position().map(|p| p.record()),
        }
    }
}

/// Extension trait attaching an [`ExecutionContext`] snapshot to an error
/// on the way out of the executor.
pub trait DataPilotResultExt<T> {
    /// Attach an execution context snapshot, returned alongside the error by
    /// the executor's public surface (the context itself is carried by
    /// [`crate::api::results::ExecutionEnvelope`], not by the error type, to
    /// keep `DataPilotError` implementing `std::error::Error` cleanly).
    fn with_node(self, node: NodeId) -> Result<T>;
}

impl<T> DataPilotResultExt<T> for Result<T> {
    fn with_node(self, node: NodeId) -> Result<T> {
        self.map_err(|err| match err {
            DataPilotError::RequiredSectionFailed { message, .. } => {
                DataPilotError::RequiredSectionFailed { node, message }
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_carries_field() {
        let err = DataPilotError::config_field("bad value", "max_rows");
        match err {
            DataPilotError::Configuration { field, .. } => {
                assert_eq!(field.as_deref(), Some("max_rows"));
            }
            _ => panic!("expected Configuration variant"),
        }
    }

    #[test]
    fn memory_exceeded_has_suggestions() {
        let err = DataPilotError::MemoryExceeded {
            current_bytes: 100,
            limit_bytes: 50,
        };
        assert!(!err.suggestions().is_empty());
    }
}
