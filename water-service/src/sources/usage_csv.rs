use water_client::UsageRow;

use crate::pipeline::UsageError;

/// Parse a WaterSmart usage export into header-keyed rows, in file order.
///
/// Header names are trimmed; short records simply lack the trailing columns.
pub fn parse_usage_csv(bytes: &[u8]) -> Result<Vec<UsageRow>, UsageError> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| UsageError::Schema(format!("failed to read CSV headers: {e}")))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result
            .map_err(|e| UsageError::Schema(format!("failed to read CSV record: {e}")))?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }

        let row: UsageRow = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.as_str(), value))
            .collect();
        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rows_in_order() {
        let csv = b"Date,Usage (Gallons),Meter\n2024-05-01,110,A\n2024-05-02,123.4,A\n";
        let rows = parse_usage_csv(csv).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("Usage (Gallons)"), Some("123.4"));
        let names: Vec<&str> = rows[0].column_names().collect();
        assert_eq!(names, vec!["Date", "Usage (Gallons)", "Meter"]);
    }

    #[test]
    fn header_only_file_has_no_rows() {
        let rows = parse_usage_csv(b"Date,Gallons\n").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn blank_lines_and_padded_headers_are_tolerated() {
        let csv = b" Date , Gallons \n2024-05-01,12\n,\n";
        let rows = parse_usage_csv(csv).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("Gallons"), Some("12"));
    }

    #[test]
    fn short_record_keeps_leading_columns() {
        let csv = b"Date,Gallons,Notes\n2024-05-01,12\n";
        let rows = parse_usage_csv(csv).unwrap();

        assert_eq!(rows[0].get("Gallons"), Some("12"));
        assert_eq!(rows[0].get("Notes"), None);
    }
}
