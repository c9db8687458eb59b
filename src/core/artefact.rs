//! The closed `NodeId` set and the artefact envelope every section
//! analyser's result must expose.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The six section analysers, as a closed, totally-ordered set.
///
/// Ordering matches the default graph declaration order and is used as a
/// deterministic tiebreak wherever two nodes otherwise compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeId {
    /// Dataset overview.
    Section1,
    /// Data quality audit.
    Section2,
    /// Exploratory data analysis.
    Section3,
    /// Visualisation suggestions.
    Section4,
    /// Data engineering hints.
    Section5,
    /// Modelling guidance.
    Section6,
}

impl NodeId {
    /// All six nodes, in their canonical declaration order.
    pub const ALL: [NodeId; 6] = [
        NodeId::Section1,
        NodeId::Section2,
        NodeId::Section3,
        NodeId::Section4,
        NodeId::Section5,
        NodeId::Section6,
    ];

    /// Parse a `NodeId` from its wire/string form (`"section1"` .. `"section6"`).
    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "section1" => Some(Self::Section1),
            "section2" => Some(Self::Section2),
            "section3" => Some(Self::Section3),
            "section4" => Some(Self::Section4),
            "section5" => Some(Self::Section5),
            "section6" => Some(Self::Section6),
            _ => None,
        }
    }

    /// The canonical string form, used in cache keys and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Section1 => "section1",
            Self::Section2 => "section2",
            Self::Section3 => "section3",
            Self::Section4 => "section4",
            Self::Section5 => "section5",
            Self::Section6 => "section6",
        }
    }

    /// The envelope property name this node's artefact must carry.
    pub fn required_property(&self) -> &'static str {
        match self {
            Self::Section1 => "overview",
            Self::Section2 => "quality_audit",
            Self::Section3 => "eda_analysis",
            Self::Section4 => "visualization_analysis",
            Self::Section5 => "engineering_analysis",
            Self::Section6 => "modeling_analysis",
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single warning raised during analysis; always attached to an
/// [`Artefact`]'s envelope rather than propagated as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    /// Short machine-matchable code, e.g. `"row_parse_error"`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Node that raised the warning.
    pub node: Option<NodeId>,
}

impl Warning {
    /// Construct a warning not tied to a specific node.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            node: None,
        }
    }

    /// Construct a warning tied to a specific node.
    pub fn for_node(node: NodeId, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            node: Some(node),
        }
    }
}

/// Optional self-reported performance metrics a producer may attach.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfMetrics {
    /// Wall-clock duration the producer spent computing, in milliseconds.
    pub duration_ms: u64,
    /// Rows the producer scanned, if it streamed the source file itself.
    pub rows_scanned: Option<u64>,
    /// Peak heap delta observed while the producer ran, in bytes.
    pub peak_memory_delta_bytes: Option<u64>,
}

/// The opaque per-section result. The core treats the payload as opaque
/// (`serde_json::Value`) except for the envelope fields it validates
/// against: `warnings` and the section-specific required property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artefact {
    /// The node that produced this artefact.
    pub node: NodeId,
    /// The envelope payload. Must contain `node.required_property()` as a
    /// top-level key; validated by [`Artefact::validate_envelope`].
    pub payload: serde_json::Value,
    /// Warnings raised while producing this artefact.
    pub warnings: Vec<Warning>,
    /// Optional self-reported performance metrics.
    pub performance: Option<PerfMetrics>,
}

impl Artefact {
    /// Build an artefact, wrapping `body` under the node's required
    /// property name so `validate_envelope` always succeeds for
    /// well-behaved producers.
    pub fn new(node: NodeId, body: serde_json::Value) -> Self {
        let mut payload = serde_json::Map::new();
        payload.insert(node.required_property().to_string(), body);
        Self {
            node,
            payload: serde_json::Value::Object(payload),
            warnings: Vec::new(),
            performance: None,
        }
    }

    /// Attach warnings to this artefact, replacing any previously set.
    pub fn with_warnings(mut self, warnings: Vec<Warning>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Attach performance metrics to this artefact.
    pub fn with_performance(mut self, perf: PerfMetrics) -> Self {
        self.performance = Some(perf);
        self
    }

    /// Validate that this artefact carries the envelope its node requires.
    /// Returns the missing property name on failure so the caller can build
    /// a precise `InvalidArtefact` error.
    pub fn validate_envelope(&self) -> std::result::Result<(), &'static str> {
        let required = self.node.required_property();
        match &self.payload {
            serde_json::Value::Object(map) if map.contains_key(required) => Ok(()),
            _ => Err(required),
        }
    }
}

/// A deterministic, de-duplicated set of node ids (dependencies,
/// dependents, conditional skips).
pub type NodeSet = BTreeSet<NodeId>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trips_through_its_string_form() {
        for node in NodeId::ALL {
            assert_eq!(NodeId::parse(node.as_str()), Some(node));
        }
        assert_eq!(NodeId::parse("section99"), None);
    }

    #[test]
    fn new_artefact_satisfies_its_own_envelope() {
        for node in NodeId::ALL {
            let artefact = Artefact::new(node, serde_json::json!({"x": 1}));
            assert!(artefact.validate_envelope().is_ok());
        }
    }

    #[test]
    fn missing_required_property_fails_validation() {
        let artefact = Artefact {
            node: NodeId::Section1,
            payload: serde_json::json!({"wrong_key": true}),
            warnings: Vec::new(),
            performance: None,
        };
        assert_eq!(artefact.validate_envelope(), Err("overview"));
    }
}
