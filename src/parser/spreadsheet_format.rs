//! XLSX/XLS detection and streaming via `calamine`.
//!
//! `calamine` loads a sheet's cells eagerly per-sheet rather than exposing a
//! true row-at-a-time stream, so the whole selected sheet is materialised
//! into memory on `parse_spreadsheet` and then served through the
//! `RowStream` contract from a `Vec` cursor.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};

use crate::core::config::Options;
use crate::core::errors::{DataPilotError, Result};
use crate::parser::registry::{looks_like_header, synthesize_column_names, DetectedFormat, ParserStats, Row, RowStream};

/// Detect XLSX/XLS/XLSM by extension and whether `calamine` can open it.
pub fn detect_spreadsheet(path: &Path) -> Option<DetectedFormat> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
    if !matches!(ext.as_str(), "xlsx" | "xls" | "xlsm") {
        return None;
    }
    let workbook = open_workbook_auto(path).ok()?;
    let sheet_names = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        return None;
    }
    Some(DetectedFormat {
        format: "xlsx".to_string(),
        confidence: 0.95,
        metadata: serde_json::json!({"sheets": sheet_names}),
    })
}

fn select_sheet_name(workbook: &calamine::Sheets<std::io::BufReader<std::fs::File>>, options: &Options) -> Option<String> {
    let names = workbook.sheet_names();
    if let Some(name) = &options.sheet_name {
        if names.iter().any(|n| n == name) {
            return Some(name.clone());
        }
    }
    if let Some(index) = options.sheet_index {
        return names.get(index).cloned();
    }
    names.first().cloned()
}

/// Build a lazy row stream over the selected sheet of `path`.
pub fn parse_spreadsheet(path: &Path, options: &Options) -> Result<Box<dyn RowStream>> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| DataPilotError::Format {
            message: format!("failed to open spreadsheet {}: {e}", path.display()),
            supported_extensions: vec!["xlsx".to_string(), "xls".to_string(), "xlsm".to_string()],
            best_guess: Some("xlsx".to_string()),
        })?;

    let sheet_name = select_sheet_name(&workbook, options).ok_or_else(|| DataPilotError::Format {
        message: format!("no sheets found in {}", path.display()),
        supported_extensions: vec!["xlsx".to_string()],
        best_guess: None,
    })?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| DataPilotError::Parse {
            message: format!("failed to read sheet {sheet_name}: {e}"),
            row_index: None,
        })?;

    let mut rows: Vec<Vec<String>> = range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    if let (Some(start), Some(end)) = (options.row_start, options.row_end) {
        let start = start as usize;
        let end = ((end as usize) + 1).min(rows.len());
        rows = if start < rows.len() { rows[start..end].to_vec() } else { Vec::new() };
    }

    let first_row = rows.first().cloned().unwrap_or_default();
    let has_header = looks_like_header(&first_row, options.has_header);
    let column_names = if has_header {
        first_row
    } else {
        synthesize_column_names(rows.first().map(|r| r.len()).unwrap_or(0))
    };

    let data_rows: Vec<Vec<String>> = if has_header {
        rows.into_iter().skip(1).collect()
    } else {
        rows
    };

    let (column_names, data_rows) = if let Some(subset) = &options.columns {
        let indices: Vec<usize> = subset
            .iter()
            .filter_map(|name| column_names.iter().position(|c| c == name))
            .collect();
        let projected_names = indices.iter().map(|&i| column_names[i].clone()).collect();
        let projected_rows = data_rows
            .into_iter()
            .map(|row| indices.iter().map(|&i| row.get(i).cloned().unwrap_or_default()).collect())
            .collect();
        (projected_names, projected_rows)
    } else {
        (column_names, data_rows)
    };

    Ok(Box::new(SpreadsheetRowStream {
        rows: data_rows.into_iter(),
        column_names,
        next_index: 0,
        stats: ParserStats::default(),
    }))
}

fn cell_to_string(data: &Data) -> String {
    match data {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.to_string(),
        Data::Error(e) => format!("{e:?}"),
        Data::DurationIso(s) => s.clone(),
        Data::DateTimeIso(s) => s.clone(),
    }
}

struct SpreadsheetRowStream {
    rows: std::vec::IntoIter<Vec<String>>,
    column_names: Vec<String>,
    next_index: u64,
    stats: ParserStats,
}

impl Iterator for SpreadsheetRowStream {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let fields = self.rows.next()?;
        let row = Row {
            index: self.next_index,
            fields,
        };
        self.next_index += 1;
        self.stats.rows_read += 1;
        Some(Ok(row))
    }
}

impl RowStream for SpreadsheetRowStream {
    fn stats(&self) -> ParserStats {
        self.stats.clone()
    }

    fn column_names(&self) -> &[String] {
        &self.column_names
    }
}
