//! Section 6: modelling guidance producer.
//!
//! Depends on sections 1, 2, 3, and 5; the deepest node in the default
//! graph, synthesising upstream artefacts into a modelling recommendation
//! shaped by `options.focus`/`options.interpretability`.

use std::path::Path;

use crate::core::artefact::{Artefact, NodeId};
use crate::core::errors::Result;
use crate::core::resolver::{DependencyResolver, Producer};

/// Computes the `modeling_analysis` artefact.
pub struct Section6Producer;

impl Producer for Section6Producer {
    fn produce(&self, node: NodeId, _path: &Path, resolver: &DependencyResolver) -> Result<Artefact> {
        let overview = resolver.resolve(NodeId::Section1)?;
        let _quality = resolver.resolve(NodeId::Section2)?;
        let eda = resolver.resolve(NodeId::Section3)?;
        let engineering = resolver.resolve(NodeId::Section5)?;

        let row_count = overview
            .payload
            .get("overview")
            .and_then(|o| o.get("row_count"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let numeric_columns = eda
            .payload
            .get("eda_analysis")
            .and_then(|e| e.get("columns"))
            .and_then(|c| c.as_array())
            .map(|cols| {
                cols.iter()
                    .filter(|c| c.get("numeric_ratio").and_then(|v| v.as_f64()).unwrap_or(0.0) > 0.8)
                    .count()
            })
            .unwrap_or(0);

        let options = resolver.options();
        let focus = options.focus.clone().unwrap_or_else(|| "exploratory".to_string());
        let suggested_models: Vec<&str> = match (focus.as_str(), options.interpretability) {
            ("classification", true) => vec!["logistic_regression", "decision_tree"],
            ("classification", false) => vec!["gradient_boosted_trees", "random_forest"],
            ("regression", true) => vec!["linear_regression", "decision_tree_regressor"],
            ("regression", false) => vec!["gradient_boosted_trees_regressor"],
            _ => vec!["clustering", "summary_statistics"],
        };

        let body = serde_json::json!({
            "row_count": row_count,
            "numeric_feature_count": numeric_columns,
            "focus": focus,
            "interpretability_preferred": options.interpretability,
            "suggested_models": suggested_models,
            "engineering_notes_considered": engineering.payload.get("engineering_analysis").is_some(),
        });

        Ok(Artefact::new(node, body))
    }
}
