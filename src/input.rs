//! Loading survey responses from disk.
//!
//! Supported layouts:
//! - `.txt`: one response per non-blank line
//! - `.csv`: a headed table with the response text in the `column` field
//! - `.json`: an array of strings, or an array of objects with the response
//!   text under `column`

use std::path::Path;

use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_COLUMN: &str = "response";

#[derive(Debug, Error)]
pub enum InputError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON input: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid CSV input: {0}")]
    Csv(#[from] csv::Error),
    #[error("unsupported input format: {0}")]
    Format(String),
    #[error("missing column '{column}' in record {index}")]
    MissingColumn { column: String, index: usize },
    #[error("no responses found in input")]
    Empty,
}

pub fn load_responses(path: impl AsRef<Path>, column: &str) -> Result<Vec<String>, InputError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let responses = match ext.as_deref() {
        Some("json") => parse_json_responses(&raw, column)?,
        Some("csv") => parse_csv_responses(&raw, column)?,
        Some("txt") | None => parse_text_responses(&raw),
        Some(other) => return Err(InputError::Format(format!(".{other}"))),
    };

    if responses.is_empty() {
        return Err(InputError::Empty);
    }
    Ok(responses)
}

fn parse_text_responses(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Response text from the `column` field of each data row.
///
/// Blank cells are kept (trimmed) so indices line up with the source rows.
pub fn parse_csv_responses(raw: &str, column: &str) -> Result<Vec<String>, InputError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(raw.as_bytes());
    let position = reader
        .headers()?
        .iter()
        .position(|h| h.trim_start_matches('\u{feff}').trim() == column)
        .ok_or_else(|| InputError::MissingColumn {
            column: column.to_string(),
            index: 0,
        })?;

    reader
        .records()
        .enumerate()
        .map(|(index, record)| {
            let record = record?;
            record
                .get(position)
                .map(|cell| cell.trim().to_string())
                .ok_or_else(|| InputError::MissingColumn {
                    column: column.to_string(),
                    index,
                })
        })
        .collect()
}

/// Blank entries are kept (trimmed) so indices line up with the source rows.
pub fn parse_json_responses(raw: &str, column: &str) -> Result<Vec<String>, InputError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Array(items) = value else {
        return Err(InputError::Format("expected a JSON array".to_string()));
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::String(s) => Ok(s.trim().to_string()),
            Value::Object(obj) => match obj.get(column) {
                Some(Value::String(s)) => Ok(s.trim().to_string()),
                Some(Value::Null) => Ok(String::new()),
                Some(other) => Ok(other.to_string()),
                None => Err(InputError::MissingColumn {
                    column: column.to_string(),
                    index,
                }),
            },
            other => Err(InputError::Format(format!(
                "record {index} is neither a string nor an object: {other}"
            ))),
        })
        .collect()
}
