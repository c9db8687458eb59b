//! Section 3: exploratory data analysis producer.
//!
//! Streams the source file and reports, per column, whether values look
//! numeric and a lightweight min/max over the values that parse as numbers.
//! Respects `sample_rows`/`sample_percentage` when set, sampling every-Nth
//! row (the default `Random` method degrades to systematic sampling here
//! since no seeded RNG is part of the cacheable option surface).

use std::path::Path;

use crate::core::artefact::{Artefact, NodeId};
use crate::core::errors::Result;
use crate::core::resolver::{DependencyResolver, Producer};
use crate::parser::ParserRegistry;

/// Computes the `eda_analysis` artefact.
pub struct Section3Producer;

#[derive(Default, Clone)]
struct ColumnStats {
    numeric_count: u64,
    total_count: u64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Producer for Section3Producer {
    fn produce(&self, node: NodeId, path: &Path, resolver: &DependencyResolver) -> Result<Artefact> {
        let options = resolver.options();
        let registry = ParserRegistry::with_builtin_formats();
        let mut stream = registry.parse(path, options)?;
        let column_names = stream.column_names().to_vec();
        let mut stats = vec![ColumnStats::default(); column_names.len()];

        let sample_every = sample_stride(options.sample_percentage);
        let mut seen: u64 = 0;
        let mut sampled: u64 = 0;

        for row in stream.by_ref() {
            let row = row?;
            seen += 1;
            if seen % sample_every != 0 {
                continue;
            }
            if let Some(cap) = options.sample_rows {
                if sampled >= cap {
                    break;
                }
            }
            sampled += 1;

            for (i, field) in row.fields.iter().enumerate() {
                let Some(column) = stats.get_mut(i) else { continue };
                column.total_count += 1;
                if let Ok(value) = field.parse::<f64>() {
                    column.numeric_count += 1;
                    column.min = Some(column.min.map_or(value, |m| m.min(value)));
                    column.max = Some(column.max.map_or(value, |m| m.max(value)));
                }
            }
        }

        let per_column: Vec<serde_json::Value> = column_names
            .iter()
            .zip(stats.iter())
            .map(|(name, s)| {
                let numeric_ratio = if s.total_count == 0 {
                    0.0
                } else {
                    s.numeric_count as f64 / s.total_count as f64
                };
                serde_json::json!({
                    "column": name,
                    "numeric_ratio": numeric_ratio,
                    "min": s.min,
                    "max": s.max,
                })
            })
            .collect();

        let body = serde_json::json!({
            "rows_sampled": sampled,
            "rows_seen": seen,
            "confidence": options.confidence,
            "columns": per_column,
        });

        Ok(Artefact::new(node, body).with_warnings(stream.stats().warnings))
    }
}

fn sample_stride(sample_percentage: Option<f64>) -> u64 {
    match sample_percentage {
        Some(p) if p > 0.0 && p < 100.0 => (100.0 / p).round().max(1.0) as u64,
        _ => 1,
    }
}
