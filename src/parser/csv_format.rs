//! CSV and TSV detection and streaming.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use crate::core::config::Options;
use crate::core::errors::{DataPilotError, Result};
use crate::parser::registry::{looks_like_header, synthesize_column_names, DetectedFormat, ParserStats, Row, RowStream};

const SNIFF_WINDOW_BYTES: usize = 8 * 1024;

fn sniff_prefix(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; SNIFF_WINDOW_BYTES];
    let read = file.read(&mut buf)?;
    buf.truncate(read);
    Ok(buf)
}

fn delimiter_confidence(prefix: &[u8], delimiter: u8) -> f64 {
    let text = String::from_utf8_lossy(prefix);
    let mut lines = text.lines().take(10);
    let counts: Vec<usize> = lines
        .by_ref()
        .map(|line| line.bytes().filter(|&b| b == delimiter).count())
        .collect();
    if counts.is_empty() || counts[0] == 0 {
        return 0.0;
    }
    let consistent = counts.iter().filter(|&&c| c == counts[0]).count();
    0.5 + 0.5 * (consistent as f64 / counts.len() as f64)
}

/// Detect CSV by extension and comma-consistency across the first lines.
pub fn detect_csv(path: &Path) -> Option<DetectedFormat> {
    let prefix = sniff_prefix(path).ok()?;
    let mut confidence = delimiter_confidence(&prefix, b',');
    if path.extension().and_then(|e| e.to_str()) == Some("csv") {
        confidence = (confidence + 0.3).min(1.0);
    }
    if confidence <= 0.0 {
        return None;
    }
    Some(DetectedFormat {
        format: "csv".to_string(),
        confidence,
        metadata: serde_json::json!({"delimiter": ","}),
    })
}

/// Detect TSV by extension and tab-consistency across the first lines.
pub fn detect_tsv(path: &Path) -> Option<DetectedFormat> {
    let prefix = sniff_prefix(path).ok()?;
    let mut confidence = delimiter_confidence(&prefix, b'\t');
    if path.extension().and_then(|e| e.to_str()) == Some("tsv") {
        confidence = (confidence + 0.3).min(1.0);
    }
    if confidence <= 0.0 {
        return None;
    }
    Some(DetectedFormat {
        format: "tsv".to_string(),
        confidence,
        metadata: serde_json::json!({"delimiter": "\t"}),
    })
}

/// Build a lazy row stream over `path` as comma-delimited.
pub fn parse_csv(path: &Path, options: &Options) -> Result<Box<dyn RowStream>> {
    parse_delimited(path, options, options.delimiter.unwrap_or(',') as u8)
}

/// Build a lazy row stream over `path` as tab-delimited.
pub fn parse_tsv(path: &Path, options: &Options) -> Result<Box<dyn RowStream>> {
    parse_delimited(path, options, options.delimiter.unwrap_or('\t') as u8)
}

fn decode_to_utf8(path: &Path, encoding_hint: Option<&str>) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| DataPilotError::io(format!("cannot read {}", path.display()), path, e))?;

    let encoding = match encoding_hint {
        Some("utf-8") | Some("utf8") => encoding_rs::UTF_8,
        Some("utf-16") | Some("utf16") => encoding_rs::UTF_16LE,
        Some("latin-1") | Some("latin1") | Some("iso-8859-1") => encoding_rs::WINDOWS_1252,
        _ => encoding_rs::Encoding::for_bom(&bytes)
            .map(|(enc, _)| enc)
            .unwrap_or(encoding_rs::UTF_8),
    };

    let (decoded, _, had_errors) = encoding.decode(&bytes);
    if had_errors && encoding != encoding_rs::UTF_8 {
        // Fall back to a lossless re-decode as UTF-8 if the hinted/sniffed
        // encoding produced replacement characters.
        let (utf8_decoded, _, _) = encoding_rs::UTF_8.decode(&bytes);
        return Ok(utf8_decoded.into_owned());
    }
    Ok(decoded.into_owned())
}

fn parse_delimited(path: &Path, options: &Options, delimiter: u8) -> Result<Box<dyn RowStream>> {
    let quote = options.quote.unwrap_or('"') as u8;

    let needs_decode = options.encoding.is_some();
    let mut builder = csv::ReaderBuilder::new();
    builder.delimiter(delimiter).quote(quote).has_headers(false).flexible(true);

    let mut reader = if needs_decode {
        let text = decode_to_utf8(path, options.encoding.as_deref())?;
        builder.from_reader(Box::new(Cursor::new(text.into_bytes())) as Box<dyn Read>)
    } else {
        let file = File::open(path).map_err(|e| DataPilotError::io(format!("cannot open {}", path.display()), path, e))?;
        builder.from_reader(Box::new(file) as Box<dyn Read>)
    };

    let mut records = reader.into_records();
    let first_record = records.next().transpose()?;
    let first_fields: Vec<String> = first_record
        .as_ref()
        .map(|r| r.iter().map(|f| f.to_string()).collect())
        .unwrap_or_default();

    let has_header = looks_like_header(&first_fields, options.has_header);
    let column_names = if has_header {
        first_fields.clone()
    } else {
        synthesize_column_names(first_fields.len())
    };

    let pending_first_row = if has_header {
        None
    } else {
        Some(Row {
            index: 0,
            fields: first_fields,
        })
    };

    Ok(Box::new(DelimitedRowStream {
        records,
        column_names,
        pending_first_row,
        next_index: if has_header { 0 } else { 1 },
        stats: ParserStats::default(),
        strict: options.strict,
    }))
}

struct DelimitedRowStream {
    records: csv::StringRecordsIntoIter<Box<dyn Read>>,
    column_names: Vec<String>,
    pending_first_row: Option<Row>,
    next_index: u64,
    stats: ParserStats,
    strict: bool,
}

impl Iterator for DelimitedRowStream {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.pending_first_row.take() {
            self.stats.rows_read += 1;
            return Some(Ok(row));
        }

        match self.records.next() {
            Some(Ok(record)) => {
                let row = Row {
                    index: self.next_index,
                    fields: record.iter().map(|f| f.to_string()).collect(),
                };
                self.next_index += 1;
                self.stats.rows_read += 1;
                Some(Ok(row))
            }
            Some(Err(err)) => {
                if self.strict {
                    Some(Err(DataPilotError::from(err)))
                } else {
                    self.stats.warnings.push(crate::core::artefact::Warning::new(
                        "row_parse_error",
                        err.to_string(),
                    ));
                    self.next()
                }
            }
            None => None,
        }
    }
}

impl RowStream for DelimitedRowStream {
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

    #[test]
    fn detects_csv_by_delimiter_consistency() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, b"a,b,c\n1,2,3\n4,5,6\n").unwrap();
        let detected = detect_csv(&path).unwrap();
        assert!(detected.confidence >= 0.7);
    }

    #[test]
    fn parses_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, b"name,age\nalice,30\nbob,25\n").unwrap();
        let options = Options::default();
        let mut stream = parse_csv(&path, &options).unwrap();
        assert_eq!(stream.column_names(), &["name".to_string(), "age".to_string()]);
        let row1 = stream.next().unwrap().unwrap();
        assert_eq!(row1.fields, vec!["alice".to_string(), "30".to_string()]);
        let row2 = stream.next().unwrap().unwrap();
        assert_eq!(row2.fields, vec!["bob".to_string(), "25".to_string()]);
        assert!(stream.next().is_none());
    }

    #[test]
    fn headerless_numeric_first_row_is_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, b"1,2\n3,4\n").unwrap();
        let options = Options::default();
        let mut stream = parse_csv(&path, &options).unwrap();
        assert_eq!(stream.column_names(), &["column_0".to_string(), "column_1".to_string()]);
        let row1 = stream.next().unwrap().unwrap();
        assert_eq!(row1.fields, vec!["1".to_string(), "2".to_string()]);
    }
}
