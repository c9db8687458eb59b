//! Format dispatch: detection, registration, and lazy row streaming.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::config::Options;
use crate::core::errors::{DataPilotError, Result};

/// Confidence threshold above which [`ParserRegistry::detect`] stops
/// walking lower-priority detectors.
const CONFIDENT_THRESHOLD: f64 = 0.7;

/// Maximum supported input size; files above this are refused outright.
pub const MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// One record read from a tabular source. Absent cells are empty strings,
/// never absent entries, so `fields.len()` is stable across a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    /// Zero-based row index within the source, counting only data rows
    /// (the header row, if any, is not counted).
    pub index: u64,
    /// Ordered field values.
    pub fields: Vec<String>,
}

/// Result of [`ParserRegistry::detect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFormat {
    /// Format name, e.g. `"csv"`, `"tsv"`, `"json"`, `"xlsx"`, `"parquet"`.
    pub format: String,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
    /// Detector-supplied metadata: delimiter, encoding, sheet names, schema,
    /// whatever is applicable to the format.
    pub metadata: serde_json::Value,
}

/// Statistics a parser exposes once its row stream has been fully consumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserStats {
    /// Total data rows read.
    pub rows_read: u64,
    /// Total bytes read from the source.
    pub bytes_read: u64,
    /// Non-fatal warnings raised while parsing (e.g. malformed rows
    /// recovered locally).
    pub warnings: Vec<crate::core::artefact::Warning>,
}

/// A finite, single-use lazy sequence of [`Row`] plus post-consumption
/// statistics. Parsers implement this instead of returning a bare
/// iterator so `stats()` is available once the stream is drained.
pub trait RowStream: Iterator<Item = Result<Row>> {
    /// Statistics accumulated so far. Only meaningful once the stream has
    /// been fully consumed; earlier calls reflect partial progress.
    fn stats(&self) -> ParserStats;

    /// Column names, if the format determined them ahead of streaming
    /// (header row or schema-derived), else synthesized `column_N` names.
    fn column_names(&self) -> &[String];
}

type Detector = fn(&Path) -> Option<DetectedFormat>;
type ParserFactory = fn(&Path, &Options) -> Result<Box<dyn RowStream>>;

struct FormatEntry {
    name: &'static str,
    detector: Detector,
    factory: ParserFactory,
    priority: u32,
    extensions: Vec<&'static str>,
}

/// Dispatches a source file to the highest-confidence registered format.
pub struct ParserRegistry {
    formats: Vec<FormatEntry>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtin_formats()
    }
}

impl ParserRegistry {
    /// An empty registry with no formats registered.
    pub fn new() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    /// A registry with the five built-in formats registered at their
    /// default tie-break priorities.
    pub fn with_builtin_formats() -> Self {
        let mut registry = Self::new();
        registry.register(
            "csv",
            crate::parser::csv_format::detect_csv,
            crate::parser::csv_format::parse_csv,
            100,
            vec!["csv"],
        );
        registry.register(
            "tsv",
            crate::parser::csv_format::detect_tsv,
            crate::parser::csv_format::parse_tsv,
            90,
            vec!["tsv", "tab"],
        );
        registry.register(
            "json",
            crate::parser::json_format::detect_json,
            crate::parser::json_format::parse_json,
            80,
            vec!["json", "jsonl", "ndjson"],
        );
        registry.register(
            "xlsx",
            crate::parser::spreadsheet_format::detect_spreadsheet,
            crate::parser::spreadsheet_format::parse_spreadsheet,
            70,
            vec!["xlsx", "xls", "xlsm"],
        );
        registry.register(
            "parquet",
            crate::parser::parquet_format::detect_parquet,
            crate::parser::parquet_format::parse_parquet,
            60,
            vec!["parquet"],
        );
        registry
    }

    /// Register a format: a detector, a streaming parser factory, a
    /// tie-break priority, and the extensions it claims.
    pub fn register(
        &mut self,
        name: &'static str,
        detector: Detector,
        factory: ParserFactory,
        priority: u32,
        extensions: Vec<&'static str>,
    ) {
        self.formats.push(FormatEntry {
            name,
            detector,
            factory,
            priority,
            extensions,
        });
        self.formats.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Detect the format of `path`, walking detectors in descending
    /// priority order and returning the first confident match, else the
    /// highest-confidence result seen.
    pub fn detect(&self, path: &Path) -> Result<DetectedFormat> {
        self.check_size(path)?;

        let mut best: Option<DetectedFormat> = None;
        for entry in &self.formats {
            if let Some(detected) = (entry.detector)(path) {
                if detected.confidence >= CONFIDENT_THRESHOLD {
                    return Ok(detected);
                }
                let replace = best
                    .as_ref()
                    .map(|b| detected.confidence > b.confidence)
                    .unwrap_or(true);
                if replace {
                    best = Some(detected);
                }
            }
        }

        best.ok_or_else(|| DataPilotError::Format {
            message: format!("could not detect format for {}", path.display()),
            supported_extensions: self.all_extensions(),
            best_guess: None,
        })
    }

    /// Detect, then build a lazy row stream for `path` under `options`.
    pub fn parse(&self, path: &Path, options: &Options) -> Result<Box<dyn RowStream>> {
        self.check_size(path)?;
        let detected = self.detect(path)?;
        let entry = self
            .formats
            .iter()
            .find(|e| e.name == detected.format)
            .ok_or_else(|| DataPilotError::Format {
                message: format!("no parser registered for detected format {}", detected.format),
                supported_extensions: self.all_extensions(),
                best_guess: Some(detected.format.clone()),
            })?;
        (entry.factory)(path, options)
    }

    fn check_size(&self, path: &Path) -> Result<()> {
        let size = std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| DataPilotError::io(format!("cannot stat {}", path.display()), path, e))?;
        if size > MAX_FILE_SIZE_BYTES {
            return Err(DataPilotError::Format {
                message: format!("file exceeds maximum supported size of {MAX_FILE_SIZE_BYTES} bytes"),
                supported_extensions: self.all_extensions(),
                best_guess: None,
            });
        }
        Ok(())
    }

    fn all_extensions(&self) -> Vec<String> {
        self.formats
            .iter()
            .flat_map(|e| e.extensions.iter().map(|s| s.to_string()))
            .collect()
    }
}

/// Decide whether the first row of a delimited file is a header row: more
/// than half of its non-empty cells must be non-numeric. If
/// `override_has_header` is set, it wins outright.
pub fn looks_like_header(first_row: &[String], override_has_header: Option<bool>) -> bool {
    if let Some(forced) = override_has_header {
        return forced;
    }
    let non_empty: Vec<&String> = first_row.iter().filter(|c| !c.is_empty()).collect();
    if non_empty.is_empty() {
        return false;
    }
    let non_numeric = non_empty
        .iter()
        .filter(|cell| cell.parse::<f64>().is_err())
        .count();
    non_numeric * 2 > non_empty.len()
}

/// Synthesize `column_0`, `column_1`, ... names for a row with no header.
pub fn synthesize_column_names(width: usize) -> Vec<String> {
    (0..width).map(|i| format!("column_{i}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_detection_requires_majority_non_numeric() {
        let header = vec!["name".to_string(), "age".to_string()];
        assert!(looks_like_header(&header, None));
        let data = vec!["1".to_string(), "2".to_string()];
        assert!(!looks_like_header(&data, None));
    }

    #[test]
    fn header_override_wins() {
        let numeric_row = vec!["1".to_string(), "2".to_string()];
        assert!(looks_like_header(&numeric_row, Some(true)));
    }

    #[test]
    fn synthesized_names_are_positional() {
        assert_eq!(synthesize_column_names(3), vec!["column_0", "column_1", "column_2"]);
    }
}
