use water_client::{RawUsagePayload, UsageRow};

use crate::pipeline::UsageError;

/// Column names the portal has used for the daily usage figure, most
/// preferred first.
pub const DEFAULT_USAGE_COLUMNS: &[&str] = &["Usage", "Usage (Gallons)", "Gallons"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractedUsage {
    pub value: f64,
    pub row_count: Option<u64>,
}

/// Pulls the latest usage figure out of a raw payload.
///
/// Rules:
/// - Rows: the last row wins; the first configured column with a non-blank
///   value is used.
/// - Text: must already be a bare number.
/// - Non-numeric or non-finite values are rejected, never read as zero.
#[derive(Debug, Clone)]
pub struct UsageExtractor {
    usage_columns: Vec<String>,
}

impl Default for UsageExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_USAGE_COLUMNS.iter().map(|c| c.to_string()).collect())
    }
}

impl UsageExtractor {
    pub fn new(usage_columns: Vec<String>) -> Self {
        Self { usage_columns }
    }

    pub fn extract(&self, payload: &RawUsagePayload) -> Result<ExtractedUsage, UsageError> {
        match payload {
            RawUsagePayload::Rows(rows) => {
                let latest = rows
                    .last()
                    .ok_or_else(|| UsageError::EmptyResult("CSV contained no rows".to_string()))?;
                let value = self.usage_from_row(latest)?;
                Ok(ExtractedUsage {
                    value,
                    row_count: payload.row_count(),
                })
            }
            RawUsagePayload::Text(text) => Ok(ExtractedUsage {
                value: parse_usage_number(text)?,
                row_count: None,
            }),
        }
    }

    fn usage_from_row(&self, row: &UsageRow) -> Result<f64, UsageError> {
        let mut blank_column = None;

        for column in &self.usage_columns {
            match row.get(column) {
                Some(value) if !value.trim().is_empty() => return parse_usage_number(value),
                Some(_) => {
                    blank_column.get_or_insert(column.as_str());
                }
                None => {}
            }
        }

        match blank_column {
            Some(column) => Err(UsageError::Parse(format!(
                "column '{column}' is empty in latest row"
            ))),
            None => {
                let present: Vec<&str> = row.column_names().collect();
                Err(UsageError::Schema(format!(
                    "no usage column in CSV (expected one of {:?}); found columns {:?}",
                    self.usage_columns, present
                )))
            }
        }
    }
}

/// Parse a usage figure, tolerating surrounding whitespace and thousands
/// separators.
pub fn parse_usage_number(raw: &str) -> Result<f64, UsageError> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(UsageError::Parse(format!("'{}'", raw.trim()))),
    }
}

/// Reduce usage element text such as `"45.2 gallons"` or
/// `"Usage: 1,234.5 gal"` to the bare number.
///
/// Text with no digits comes back trimmed so the later parse reports it.
pub fn normalize_usage_text(raw: &str) -> String {
    let trimmed = raw.trim();
    let chars: Vec<char> = trimmed.chars().collect();

    let Some(first_digit) = chars.iter().position(|c| c.is_ascii_digit()) else {
        return trimmed.to_string();
    };

    let mut start = first_digit;
    if start > 0 && chars[start - 1] == '.' {
        start -= 1;
    }
    if start > 0 && chars[start - 1] == '-' {
        start -= 1;
    }

    chars[start..]
        .iter()
        .take_while(|c| c.is_ascii_digit() || **c == '.' || **c == ',' || **c == '-')
        .filter(|c| **c != ',')
        .collect::<String>()
        .trim_end_matches('.')
        .to_string()
}
