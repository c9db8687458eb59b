//! Section 1: dataset overview producer.
//!
//! Reads the source file once and reports shape (row/column counts), the
//! detected format, and column names. No statistical content beyond that
//! is in scope here.

use std::path::Path;

use crate::core::artefact::{Artefact, NodeId};
use crate::core::errors::Result;
use crate::core::resolver::{DependencyResolver, Producer};
use crate::parser::ParserRegistry;

/// Computes the `overview` artefact.
pub struct Section1Producer;

impl Producer for Section1Producer {
    fn produce(&self, node: NodeId, path: &Path, resolver: &DependencyResolver) -> Result<Artefact> {
        let registry = ParserRegistry::with_builtin_formats();
        let detected = registry.detect(path)?;
        let mut stream = registry.parse(path, resolver.options())?;

        let column_names = stream.column_names().to_vec();
        let mut row_count: u64 = 0;
        for row in stream.by_ref() {
            row?;
            row_count += 1;
        }

        let body = serde_json::json!({
            "format": detected.format,
            "row_count": row_count,
            "column_count": column_names.len(),
            "columns": column_names,
        });

        Ok(Artefact::new(node, body).with_warnings(stream.stats().warnings))
    }
}
