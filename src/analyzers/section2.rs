//! Section 2: data quality audit producer.
//!
//! Scans the source file independently of section 1 (the default graph
//! declares no dependency between them) and reports per-column empty-cell
//! counts as a proxy for completeness.

use std::path::Path;

use crate::core::artefact::{Artefact, NodeId};
use crate::core::errors::Result;
use crate::core::resolver::{DependencyResolver, Producer};
use crate::parser::ParserRegistry;

/// Computes the `quality_audit` artefact.
pub struct Section2Producer;

impl Producer for Section2Producer {
    fn produce(&self, node: NodeId, path: &Path, resolver: &DependencyResolver) -> Result<Artefact> {
        let registry = ParserRegistry::with_builtin_formats();
        let mut stream = registry.parse(path, resolver.options())?;
        let column_names = stream.column_names().to_vec();
        let mut empty_counts = vec![0u64; column_names.len()];
        let mut row_count: u64 = 0;

        for row in stream.by_ref() {
            let row = row?;
            for (i, field) in row.fields.iter().enumerate() {
                if let Some(count) = empty_counts.get_mut(i) {
                    if field.is_empty() {
                        *count += 1;
                    }
                }
            }
            row_count += 1;
        }

        let per_column: Vec<serde_json::Value> = column_names
            .iter()
            .zip(empty_counts.iter())
            .map(|(name, empty)| {
                let completeness = if row_count == 0 {
                    1.0
                } else {
                    1.0 - (*empty as f64 / row_count as f64)
                };
                serde_json::json!({
                    "column": name,
                    "empty_cells": empty,
                    "completeness": completeness,
                })
            })
            .collect();

        let body = serde_json::json!({
            "rows_scanned": row_count,
            "columns": per_column,
        });

        Ok(Artefact::new(node, body).with_warnings(stream.stats().warnings))
    }
}
