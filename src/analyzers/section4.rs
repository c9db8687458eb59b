//! Section 4: visualisation suggestion producer.
//!
//! Depends on sections 1 and 3; turns their already-resolved artefacts into
//! chart-type suggestions rather than re-scanning the file, demonstrating
//! real dependency passing through the resolver.

use std::path::Path;

use crate::core::artefact::{Artefact, NodeId};
use crate::core::errors::Result;
use crate::core::resolver::{DependencyResolver, Producer};

/// Computes the `visualization_analysis` artefact.
pub struct Section4Producer;

impl Producer for Section4Producer {
    fn produce(&self, node: NodeId, _path: &Path, resolver: &DependencyResolver) -> Result<Artefact> {
        let overview = resolver.resolve(NodeId::Section1)?;
        let eda = resolver.resolve(NodeId::Section3)?;

        let columns = overview
            .payload
            .get("overview")
            .and_then(|o| o.get("columns"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));

        let numeric_columns: Vec<String> = eda
            .payload
            .get("eda_analysis")
            .and_then(|e| e.get("columns"))
            .and_then(|c| c.as_array())
            .map(|cols| {
                cols.iter()
                    .filter(|c| c.get("numeric_ratio").and_then(|r| r.as_f64()).unwrap_or(0.0) > 0.8)
                    .filter_map(|c| c.get("column").and_then(|v| v.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let accessible = resolver.options().accessibility;
        let max_recommendations = resolver.options().max_recommendations;

        let mut recommendations: Vec<serde_json::Value> = numeric_columns
            .iter()
            .take(max_recommendations)
            .map(|col| {
                serde_json::json!({
                    "column": col,
                    "chart_type": "histogram",
                    "accessible_palette": accessible,
                })
            })
            .collect();
        recommendations.truncate(max_recommendations);

        let body = serde_json::json!({
            "columns_considered": columns,
            "recommendations": recommendations,
        });

        Ok(Artefact::new(node, body))
    }
}
