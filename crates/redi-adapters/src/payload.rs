//! Upstream response body → raw record list.

use redi_core::RawRecord;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Property names the upstream has been seen to wrap its record array in.
pub const WRAPPER_KEYS: [&str; 4] = ["records", "data", "rows", "result"];

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Array,
    Wrapped(&'static str),
    /// Object whose keys are all decimal indices.
    ArrayLike,
}

#[derive(Debug, Clone)]
pub struct ExtractedBatch {
    pub records: Vec<RawRecord>,
    pub shape: PayloadShape,
    pub dropped_non_objects: usize,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("upstream returned an HTML page instead of JSON (title: {})", display_title(.title))]
    Html {
        title: Option<String>,
        preview: String,
    },
    #[error("upstream body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no records found in upstream payload (top-level keys: {keys:?})")]
    NoRecords { keys: Vec<String> },
}

fn display_title(title: &Option<String>) -> &str {
    title.as_deref().unwrap_or("<none>")
}

/// JSON never starts with `<`, so any markup prefix means an error page.
fn looks_like_html(text: &str) -> bool {
    text.trim_start_matches('\u{feff}').trim_start().starts_with('<')
}

fn html_error(text: &str) -> PayloadError {
    let document = Html::parse_document(text);
    let title = Selector::parse("title").ok().and_then(|sel| {
        document
            .select(&sel)
            .next()
            .map(|n| n.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    });
    PayloadError::Html {
        title,
        preview: text.chars().take(PREVIEW_CHARS).collect(),
    }
}

fn is_index_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

fn collect_objects(values: Vec<JsonValue>, shape: PayloadShape) -> ExtractedBatch {
    let total = values.len();
    let records = values
        .into_iter()
        .filter_map(|v| match v {
            JsonValue::Object(map) => Some(map),
            _ => None,
        })
        .collect::<Vec<_>>();
    ExtractedBatch {
        dropped_non_objects: total - records.len(),
        records,
        shape,
    }
}

/// Detect which of the known payload shapes `body` has and return its records.
///
/// HTML bodies, including JSON strings that carry an HTML page, fail fast.
pub fn extract_records(body: &[u8]) -> Result<ExtractedBatch, PayloadError> {
    let text = String::from_utf8_lossy(body);
    if looks_like_html(&text) {
        return Err(html_error(&text));
    }

    let value: JsonValue = serde_json::from_str(text.trim_start_matches('\u{feff}'))?;
    let batch = match value {
        JsonValue::Array(values) => collect_objects(values, PayloadShape::Array),
        JsonValue::String(inner) if looks_like_html(&inner) => return Err(html_error(&inner)),
        JsonValue::Object(mut map) => {
            let wrapped = WRAPPER_KEYS
                .iter()
                .find(|key| map.get(**key).is_some_and(JsonValue::is_array));
            if let Some(key) = wrapped {
                let values = match map.remove(*key) {
                    Some(JsonValue::Array(values)) => values,
                    _ => Vec::new(),
                };
                collect_objects(values, PayloadShape::Wrapped(*key))
            } else if !map.is_empty() && map.keys().all(|k| is_index_key(k)) {
                let mut entries = map.into_iter().collect::<Vec<_>>();
                entries.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
                collect_objects(
                    entries.into_iter().map(|(_, v)| v).collect(),
                    PayloadShape::ArrayLike,
                )
            } else {
                return Err(PayloadError::NoRecords {
                    keys: map.keys().take(20).cloned().collect(),
                });
            }
        }
        _ => return Err(PayloadError::NoRecords { keys: Vec::new() }),
    };

    if batch.records.is_empty() {
        return Err(PayloadError::NoRecords { keys: Vec::new() });
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_array_is_accepted() {
        let batch = extract_records(br#"[{"state_name":"Goa"},{"state_name":"Assam"}]"#).unwrap();
        assert_eq!(batch.shape, PayloadShape::Array);
        assert_eq!(batch.records.len(), 2);
    }

    #[test]
    fn wrapped_array_uses_first_known_property() {
        let body = br#"{"total": 2, "data": [{"a": 1}], "records": [{"b": 1}, {"b": 2}]}"#;
        let batch = extract_records(body).unwrap();
        assert_eq!(batch.shape, PayloadShape::Wrapped("records"));
        assert_eq!(batch.records.len(), 2);
    }

    #[test]
    fn array_like_object_is_ordered_numerically() {
        let body = br#"{"10": {"i": 10}, "2": {"i": 2}, "0": {"i": 0}}"#;
        let batch = extract_records(body).unwrap();
        assert_eq!(batch.shape, PayloadShape::ArrayLike);
        let order = batch
            .records
            .iter()
            .map(|r| r["i"].as_i64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(order, vec![0, 2, 10]);
    }

    #[test]
    fn html_error_page_fails_fast_with_title() {
        let body = b"<!DOCTYPE html><html><head><title>502 Bad Gateway</title></head><body/></html>";
        match extract_records(body) {
            Err(PayloadError::Html { title, .. }) => {
                assert_eq!(title.as_deref(), Some("502 Bad Gateway"))
            }
            other => panic!("expected html error, got {other:?}"),
        }
    }

    #[test]
    fn html_wrapped_in_json_string_is_detected() {
        let body = br#""<html><body>maintenance</body></html>""#;
        assert!(matches!(extract_records(body), Err(PayloadError::Html { .. })));
    }

    #[test]
    fn non_object_elements_are_dropped_and_counted() {
        let batch = extract_records(br#"[{"a":1}, 3, "x", {"b":2}]"#).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.dropped_non_objects, 2);
    }

    #[test]
    fn unknown_object_shape_reports_keys() {
        match extract_records(br#"{"message": "quota exceeded"}"#) {
            Err(PayloadError::NoRecords { keys }) => assert_eq!(keys, vec!["message".to_string()]),
            other => panic!("expected no-records error, got {other:?}"),
        }
    }

    #[test]
    fn empty_array_is_no_records() {
        assert!(matches!(
            extract_records(b"[]"),
            Err(PayloadError::NoRecords { .. })
        ));
    }

    #[test]
    fn invalid_json_is_reported() {
        assert!(matches!(extract_records(b"{not json"), Err(PayloadError::Json(_))));
    }
}
