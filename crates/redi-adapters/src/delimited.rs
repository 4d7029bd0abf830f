//! Delimited-file (CSV) reader for the offline bulk-import path.

use std::path::Path;

use anyhow::Context;
use csv::{ReaderBuilder, Trim};
use redi_core::RawRecord;
use serde_json::Value as JsonValue;

/// Parse delimited text with a header row into raw records.
///
/// A UTF-8 BOM is tolerated, fields are trimmed, and rows whose every cell is
/// empty are skipped. Short rows only populate the columns they have.
pub fn parse_delimited(bytes: &[u8], delimiter: u8) -> anyhow::Result<Vec<RawRecord>> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader.headers().context("reading header row")?.clone();
    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("reading row {}", index + 2))?;
        if row.iter().all(str::is_empty) {
            continue;
        }
        let record: RawRecord = headers
            .iter()
            .zip(row.iter())
            .filter(|(header, _)| !header.is_empty())
            .map(|(header, cell)| (header.to_string(), JsonValue::String(cell.to_string())))
            .collect();
        records.push(record);
    }
    Ok(records)
}

pub fn read_delimited(path: impl AsRef<Path>, delimiter: u8) -> anyhow::Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_delimited(&bytes, delimiter).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_row_maps_columns_and_bom_is_stripped() {
        let text = "\u{feff}state_name,District Name,fin_year,month,SC_persondays\n\
                    Gujarat , Surat,2023-24,Apr,\"1,200\"\n\
                    ,,,,\n";
        let records = parse_delimited(text.as_bytes(), b',').unwrap();
        assert_eq!(records.len(), 1);
        let first = &records[0];
        assert_eq!(first.get("state_name"), Some(&json!("Gujarat")));
        assert_eq!(first.get("District Name"), Some(&json!("Surat")));
        assert_eq!(first.get("SC_persondays"), Some(&json!("1,200")));
    }

    #[test]
    fn short_rows_are_tolerated() {
        let records = parse_delimited(b"a;b;c\n1;2\n", b';').unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].len(), 2);
    }

    #[test]
    fn read_delimited_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_delimited(dir.path().join("absent.csv"), b',').unwrap_err();
        assert!(err.to_string().contains("absent.csv"));
    }
}
