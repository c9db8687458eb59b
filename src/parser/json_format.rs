//! JSON / JSON Lines detection and streaming.
//!
//! The first row is always treated as headers, derived from the key set of
//! the first record; later records may carry a different key set, which
//! surfaces as a per-row warning rather than a hard failure.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek};
use std::path::Path;

use crate::core::config::Options;
use crate::core::errors::{DataPilotError, Result};
use crate::parser::registry::{DetectedFormat, ParserStats, Row, RowStream};

/// Detect JSON/JSONL by extension and a best-effort parse of the first
/// non-empty line.
pub fn detect_json(path: &Path) -> Option<DetectedFormat> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let mut confidence = 0.0;
    if matches!(ext, "json" | "jsonl" | "ndjson") {
        confidence += 0.4;
    }

    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let mut first_line = String::new();
    reader.read_line(&mut first_line).ok()?;
    let trimmed = first_line.trim();

    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        confidence += 0.4;
        if serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
            || serde_json::Deserializer::from_str(trimmed)
                .into_iter::<serde_json::Value>()
                .next()
                .is_some()
        {
            confidence += 0.2;
        }
    }

    if confidence <= 0.0 {
        return None;
    }
    Some(DetectedFormat {
        format: "json".to_string(),
        confidence: confidence.min(1.0),
        metadata: serde_json::json!({"mode": if trimmed.starts_with('[') { "array" } else { "lines" }}),
    })
}

enum JsonShape {
    /// One JSON value per line (JSON Lines / NDJSON).
    Lines(BufReader<File>),
    /// A single top-level JSON array of objects.
    Array(std::vec::IntoIter<serde_json::Value>),
}

/// Build a lazy row stream over `path`, flattening nested objects into
/// dotted column names when `options.flatten_objects` is set.
pub fn parse_json(path: &Path, options: &Options) -> Result<Box<dyn RowStream>> {
    let file = File::open(path).map_err(|e| DataPilotError::io(format!("cannot open {}", path.display()), path, e))?;
    let mut reader = BufReader::new(file);

    let mut first_non_empty = String::new();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).map_err(|e| DataPilotError::io("failed reading JSON source", path, e))?;
        if read == 0 {
            break;
        }
        if !line.trim().is_empty() {
            first_non_empty = line;
            break;
        }
    }
    let trimmed = first_non_empty.trim();

    let shape = if trimmed.starts_with('[') {
        let file = File::open(path).map_err(|e| DataPilotError::io(format!("cannot reopen {}", path.display()), path, e))?;
        let mut content = String::new();
        BufReader::new(file)
            .read_to_string(&mut content)
            .map_err(|e| DataPilotError::io("failed reading JSON array", path, e))?;
        let values: Vec<serde_json::Value> = serde_json::from_str(&content)?;
        JsonShape::Array(values.into_iter())
    } else {
        let file = File::open(path).map_err(|e| DataPilotError::io(format!("cannot reopen {}", path.display()), path, e))?;
        JsonShape::Lines(BufReader::new(file))
    };

    let mut stream = JsonRowStream {
        shape,
        column_names: Vec::new(),
        next_index: 0,
        stats: ParserStats::default(),
        flatten: options.flatten_objects,
        strict: options.strict,
        exhausted: false,
    };
    stream.prime_column_names();
    Ok(Box::new(stream))
}

struct JsonRowStream {
    shape: JsonShape,
    column_names: Vec<String>,
    next_index: u64,
    stats: ParserStats,
    flatten: bool,
    strict: bool,
    exhausted: bool,
}

impl JsonRowStream {
    fn prime_column_names(&mut self) {
        if let Some(value) = self.peek_first_value() {
            self.column_names = object_keys(&value, self.flatten);
        }
    }

    fn peek_first_value(&mut self) -> Option<serde_json::Value> {
        match &mut self.shape {
            JsonShape::Array(iter) => {
                let mut peek = iter.clone();
                peek.next()
            }
            JsonShape::Lines(reader) => {
                let mut line = String::new();
                let pos = reader.stream_position().ok()?;
                if reader.read_line(&mut line).ok()? == 0 {
                    return None;
                }
                let _ = reader.seek(std::io::SeekFrom::Start(pos));
                serde_json::from_str(line.trim()).ok()
            }
        }
    }

    fn next_raw_value(&mut self) -> Option<std::result::Result<serde_json::Value, String>> {
        match &mut self.shape {
            JsonShape::Array(iter) => iter.next().map(Ok),
            JsonShape::Lines(reader) => loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => return None,
                    Ok(_) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        return Some(
                            serde_json::from_str(line.trim()).map_err(|e| e.to_string()),
                        );
                    }
                    Err(e) => return Some(Err(e.to_string())),
                }
            },
        }
    }
}

fn object_keys(value: &serde_json::Value, flatten: bool) -> Vec<String> {
    let mut keys = Vec::new();
    if let serde_json::Value::Object(map) = value {
        for (k, v) in map {
            if flatten {
                if let serde_json::Value::Object(_) = v {
                    for nested in object_keys(v, true) {
                        keys.push(format!("{k}.{nested}"));
                    }
                    continue;
                }
            }
            keys.push(k.clone());
        }
    }
    keys
}

fn flatten_row(value: &serde_json::Value, columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|col| {
            let mut current = value;
            for part in col.split('.') {
                match current.get(part) {
                    Some(next) => current = next,
                    None => return String::new(),
                }
            }
            match current {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            }
        })
        .collect()
}

impl Iterator for JsonRowStream {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match self.next_raw_value() {
            None => {
                self.exhausted = true;
                None
            }
            Some(Ok(value)) => {
                let fields = flatten_row(&value, &self.column_names);
                let row = Row {
                    index: self.next_index,
                    fields,
                };
                self.next_index += 1;
                self.stats.rows_read += 1;
                Some(Ok(row))
            }
            Some(Err(message)) => {
                if self.strict {
                    self.exhausted = true;
                    Some(Err(DataPilotError::Parse {
                        message,
                        row_index: Some(self.next_index),
                    }))
                } else {
                    self.stats.warnings.push(crate::core::artefact::Warning::new(
                        "row_parse_error",
                        message,
                    ));
                    self.next()
                }
            }
        }
    }
}

impl RowStream for JsonRowStream {
    fn stats(&self) -> ParserStats {
        self.stats.clone()
    }

    fn column_names(&self) -> &[String] {
        &self.column_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    #[test]
    fn detects_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        std::fs::write(&path, "{\"a\":1}\n{\"a\":2}\n").unwrap();
        let detected = detect_json(&path).unwrap();
        assert!(detected.confidence >= 0.7);
    }

    #[test]
    fn parses_json_array_with_flattening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, r#"[{"name":"alice","meta":{"age":30}},{"name":"bob","meta":{"age":25}}]"#).unwrap();
        let options = Options::default();
        let mut stream = parse_json(&path, &options).unwrap();
        assert!(stream.column_names().contains(&"meta.age".to_string()));
        let row = stream.next().unwrap().unwrap();
        assert_eq!(row.fields.len(), stream.column_names().len());
    }
}
