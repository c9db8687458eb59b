//! Configuration types consumed by the orchestration core.
//!
//! The core never loads a config file or reads the environment itself —
//! `Options` arrives as a single value, fully built, from the CLI/config
//! layer at the engine boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::errors::{DataPilotError, Result};

/// Privacy mode affecting hashing output in section 5's engineering
/// analysis (cacheable; part of the key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyMode {
    /// No redaction.
    Full,
    /// Partial redaction of identifying columns.
    Redacted,
    /// Minimal output, maximal redaction.
    Minimal,
}

impl Default for PrivacyMode {
    fn default() -> Self {
        Self::Full
    }
}

/// Sampling method used by section 3's exploratory analysis (cacheable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleMethod {
    /// Simple random sampling.
    Random,
    /// Systematic (every-Nth-row) sampling.
    Systematic,
    /// Stratified sampling by a detected categorical column.
    Stratified,
}

impl Default for SampleMethod {
    fn default() -> Self {
        Self::Random
    }
}

/// The full configuration record handed into the orchestration core.
///
/// Only a fixed subset of fields influence the cache key; see
/// [`CacheableOptions`] for the exact projection. Every other field here is
/// a behavioural knob the core still honours but that does not affect
/// artefact content in a way the cache needs to track (e.g. `parallel`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    // --- cacheable: scan/hashing ---
    /// Upper bound on rows scanned by any node.
    pub max_rows: Option<u64>,
    /// Whether file hashing is enabled at all.
    pub enable_hashing: bool,
    /// Affects hashing output shape.
    pub privacy_mode: PrivacyMode,

    // --- cacheable: parser behaviour ---
    /// Parser batch size, in rows.
    pub chunk_size: usize,
    /// Field delimiter override; `None` lets the parser detect it.
    pub delimiter: Option<char>,
    /// Quote character override.
    pub quote: Option<char>,
    /// Text encoding override; `None` lets the parser detect it.
    pub encoding: Option<String>,
    /// Whether the first row is a header row; `None` lets the parser decide.
    pub has_header: Option<bool>,

    // --- cacheable: JSON parser shape ---
    /// JSONPath selecting the array/object of records within the document.
    pub json_path: Option<String>,
    /// How a top-level JSON array of objects is interpreted into rows.
    pub array_mode: Option<String>,
    /// Whether nested objects are flattened into dotted column names.
    pub flatten_objects: bool,

    // --- cacheable: spreadsheet selection ---
    /// Sheet selected by name.
    pub sheet_name: Option<String>,
    /// Sheet selected by index (used when `sheet_name` is absent).
    pub sheet_index: Option<usize>,
    /// Column subset to load, by name.
    pub columns: Option<Vec<String>>,
    /// First row (0-based, inclusive) to load.
    pub row_start: Option<u64>,
    /// Last row (0-based, inclusive) to load.
    pub row_end: Option<u64>,

    // --- cacheable: section 4 (visualisation) ---
    /// Favour accessible (colourblind-safe, high-contrast) chart suggestions.
    pub accessibility: bool,
    /// Requested complexity tier of suggested visualisations.
    pub complexity: Option<String>,
    /// Cap on the number of recommendations returned.
    pub max_recommendations: usize,
    /// Whether to include example code snippets in recommendations.
    pub include_code: bool,

    // --- cacheable: section 5 (engineering) ---
    /// Target database dialect for engineering hints.
    pub database: Option<String>,
    /// Target application framework for engineering hints.
    pub framework: Option<String>,

    // --- cacheable: section 6 (modelling) ---
    /// Modelling focus (e.g. `"classification"`, `"regression"`).
    pub focus: Option<String>,
    /// Whether to favour interpretable models over raw performance.
    pub interpretability: bool,

    // --- cacheable: section 3 sampling ---
    /// Percentage of rows to sample for EDA, in `(0, 100]`.
    pub sample_percentage: Option<f64>,
    /// Absolute row cap for EDA sampling.
    pub sample_rows: Option<u64>,
    /// Sampling method.
    pub sample_method: SampleMethod,
    /// Desired statistical confidence level, in `(0, 1)`.
    pub confidence: Option<f64>,

    // --- cacheable: global invalidation ---
    /// Bumping this invalidates every cache entry regardless of other
    /// fields (entries compare `cache_version` during validation).
    pub cache_version: String,

    // --- non-cacheable behavioural knobs ---
    /// Allow parallel execution of nodes within the same plan group.
    pub parallel: bool,
    /// Cache memory budget, in bytes.
    pub cache_memory_limit_bytes: u64,
    /// Optional on-disk cache directory; `None` disables persistence.
    pub cache_dir: Option<std::path::PathBuf>,
    /// Abort row-level parsing on the first malformed row instead of
    /// recovering locally and surfacing a warning.
    pub strict: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_rows: None,
            enable_hashing: true,
            privacy_mode: PrivacyMode::default(),
            chunk_size: 10_000,
            delimiter: None,
            quote: None,
            encoding: None,
            has_header: None,
            json_path: None,
            array_mode: None,
            flatten_objects: true,
            sheet_name: None,
            sheet_index: None,
            columns: None,
            row_start: None,
            row_end: None,
            accessibility: true,
            complexity: None,
            max_recommendations: 10,
            include_code: false,
            database: None,
            framework: None,
            focus: None,
            interpretability: false,
            sample_percentage: None,
            sample_rows: None,
            sample_method: SampleMethod::default(),
            confidence: Some(0.95),
            cache_version: "1".to_string(),
            parallel: false,
            cache_memory_limit_bytes: 512 * 1024 * 1024,
            cache_dir: None,
            strict: false,
        }
    }
}

impl Options {
    /// Validate option values that have closed ranges or must be
    /// internally consistent. Returns on the first failure found.
    pub fn validate(&self) -> Result<()> {
        if let Some(p) = self.sample_percentage {
            if !(p > 0.0 && p <= 100.0) {
                return Err(DataPilotError::config_field(
                    "sample_percentage must be in (0, 100]",
                    "sample_percentage",
                ));
            }
        }
        if let Some(c) = self.confidence {
            if !(0.0..1.0).contains(&c) {
                return Err(DataPilotError::config_field(
                    "confidence must be in (0, 1)",
                    "confidence",
                ));
            }
        }
        if self.chunk_size == 0 {
            return Err(DataPilotError::config_field(
                "chunk_size must be positive",
                "chunk_size",
            ));
        }
        if let (Some(start), Some(end)) = (self.row_start, self.row_end) {
            if start > end {
                return Err(DataPilotError::config_field(
                    "row_start must not exceed row_end",
                    "row_start",
                ));
            }
        }
        Ok(())
    }

    /// Project onto the cacheable subset.
    pub fn cacheable(&self) -> CacheableOptions {
        CacheableOptions::from(self)
    }
}

/// The closed, enumerated subset of [`Options`] that contributes to the
/// cache key. Fields outside this enumeration are ignored for key
/// computation even if `Options` gains them later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheableOptions {
    max_rows: Option<u64>,
    enable_hashing: bool,
    privacy_mode: PrivacyMode,
    chunk_size: usize,
    delimiter: Option<char>,
    quote: Option<char>,
    encoding: Option<String>,
    has_header: Option<bool>,
    json_path: Option<String>,
    array_mode: Option<String>,
    flatten_objects: bool,
    sheet_name: Option<String>,
    sheet_index: Option<usize>,
    columns: Option<Vec<String>>,
    row_start: Option<u64>,
    row_end: Option<u64>,
    accessibility: bool,
    complexity: Option<String>,
    max_recommendations: usize,
    include_code: bool,
    database: Option<String>,
    framework: Option<String>,
    focus: Option<String>,
    interpretability: bool,
    sample_percentage: Option<String>,
    sample_rows: Option<u64>,
    sample_method: SampleMethod,
    confidence: Option<String>,
    cache_version: String,
}

impl From<&Options> for CacheableOptions {
    fn from(o: &Options) -> Self {
        Self {
            max_rows: o.max_rows,
            enable_hashing: o.enable_hashing,
            privacy_mode: o.privacy_mode,
            chunk_size: o.chunk_size,
            delimiter: o.delimiter,
            quote: o.quote,
            encoding: o.encoding.clone(),
            has_header: o.has_header,
            json_path: o.json_path.clone(),
            array_mode: o.array_mode.clone(),
            flatten_objects: o.flatten_objects,
            sheet_name: o.sheet_name.clone(),
            sheet_index: o.sheet_index,
            columns: o.columns.clone().map(|mut c| {
                c.sort();
                c
            }),
            row_start: o.row_start,
            row_end: o.row_end,
            accessibility: o.accessibility,
            complexity: o.complexity.clone(),
            max_recommendations: o.max_recommendations,
            include_code: o.include_code,
            database: o.database.clone(),
            framework: o.framework.clone(),
            focus: o.focus.clone(),
            interpretability: o.interpretability,
            // Floats are not `Ord`/`Eq`-clean for a deterministic key; freeze
            // them into their canonical decimal text instead.
            sample_percentage: o.sample_percentage.map(|p| format!("{p:.6}")),
            sample_rows: o.sample_rows,
            sample_method: o.sample_method,
            confidence: o.confidence.map(|c| format!("{c:.6}")),
            cache_version: o.cache_version.clone(),
        }
    }
}

impl CacheableOptions {
    /// Serialise to a deterministic JSON string with sorted keys.
    /// `serde_json` preserves struct field order, which is fixed in source,
    /// so this is already a canonical serialisation across runs and
    /// processes.
    pub fn canonical_json(&self) -> String {
        // BTreeMap round-trip guarantees key order is independent of the
        // struct's field declaration order, in case that ever changes;
        // absent (null) fields are dropped entirely.
        let value = serde_json::to_value(self).expect("CacheableOptions always serializes");
        let sorted: BTreeMap<String, serde_json::Value> = match value {
            serde_json::Value::Object(map) => map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect(),
            other => {
                let mut m = BTreeMap::new();
                m.insert("value".to_string(), other);
                m
            }
        };
        serde_json::to_string(&sorted).expect("sorted map always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_sample_percentage() {
        let mut opts = Options::default();
        opts.sample_percentage = Some(150.0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn cacheable_projection_is_order_independent_for_columns() {
        let mut a = Options::default();
        a.columns = Some(vec!["b".to_string(), "a".to_string()]);
        let mut b = Options::default();
        b.columns = Some(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(a.cacheable().canonical_json(), b.cacheable().canonical_json());
    }

    #[test]
    fn non_cacheable_field_does_not_change_canonical_json() {
        let mut a = Options::default();
        let mut b = Options::default();
        a.parallel = true;
        b.parallel = false;
        assert_eq!(a.cacheable().canonical_json(), b.cacheable().canonical_json());
    }

    #[test]
    fn cacheable_field_changes_canonical_json() {
        let mut a = Options::default();
        let mut b = Options::default();
        a.max_rows = Some(10);
        b.max_rows = Some(20);
        assert_ne!(a.cacheable().canonical_json(), b.cacheable().canonical_json());
    }
}
