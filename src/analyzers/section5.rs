//! Section 5: data engineering hints producer.
//!
//! Depends on sections 1, 2, and 3; combines their artefacts into schema
//! and storage recommendations targeting `options.database`/`options.framework`
//! when set.

use std::path::Path;

use crate::core::artefact::{Artefact, NodeId};
use crate::core::errors::Result;
use crate::core::resolver::{DependencyResolver, Producer};

/// Computes the `engineering_analysis` artefact.
pub struct Section5Producer;

impl Producer for Section5Producer {
    fn produce(&self, node: NodeId, _path: &Path, resolver: &DependencyResolver) -> Result<Artefact> {
        let overview = resolver.resolve(NodeId::Section1)?;
        let quality = resolver.resolve(NodeId::Section2)?;
        let eda = resolver.resolve(NodeId::Section3)?;

        let row_count = overview
            .payload
            .get("overview")
            .and_then(|o| o.get("row_count"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let low_completeness_columns: Vec<String> = quality
            .payload
            .get("quality_audit")
            .and_then(|q| q.get("columns"))
            .and_then(|c| c.as_array())
            .map(|cols| {
                cols.iter()
                    .filter(|c| c.get("completeness").and_then(|v| v.as_f64()).unwrap_or(1.0) < 0.95)
                    .filter_map(|c| c.get("column").and_then(|v| v.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let suggested_types: Vec<serde_json::Value> = eda
            .payload
            .get("eda_analysis")
            .and_then(|e| e.get("columns"))
            .and_then(|c| c.as_array())
            .map(|cols| {
                cols.iter()
                    .map(|c| {
                        let numeric_ratio = c.get("numeric_ratio").and_then(|v| v.as_f64()).unwrap_or(0.0);
                        let inferred = if numeric_ratio > 0.9 { "numeric" } else { "text" };
                        serde_json::json!({
                            "column": c.get("column"),
                            "inferred_type": inferred,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let options = resolver.options();
        let body = serde_json::json!({
            "row_count": row_count,
            "database_target": options.database,
            "framework_target": options.framework,
            "columns_needing_validation": low_completeness_columns,
            "suggested_types": suggested_types,
        });

        Ok(Artefact::new(node, body))
    }
}
