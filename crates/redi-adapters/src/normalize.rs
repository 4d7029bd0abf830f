//! Raw record → canonical record mapping.
//!
//! Every canonical field is resolved by [`resolve`], which walks the field's
//! candidate list in priority order and, for each candidate, tries an exact key
//! match, then a case-insensitive match, then a separator-insensitive match.
//! The first present, non-empty (and for numeric fields, parseable) value wins.

use std::collections::BTreeSet;

use chrono::Utc;
use redi_core::{CanonicalRecord, ExtendedFields, Metrics, NaturalKey, RawRecord, VolumeSource};
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;
use thiserror::Error;

use crate::catalog::{CanonicalField, FieldCatalog};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record is missing natural-key fields: {}", join_fields(.missing))]
pub struct MissingKeyFields {
    pub missing: Vec<CanonicalField>,
}

fn join_fields(fields: &[CanonicalField]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A successful lookup: which raw key matched and the value it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub raw_key: String,
    pub value: T,
}

#[derive(Debug, Clone, Copy)]
enum MatchPass {
    CaseInsensitive,
    SeparatorInsensitive,
}

/// Lowercase and drop spaces, underscores and hyphens.
pub fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

fn key_matches(pass: MatchPass, candidate: &str, raw_key: &str) -> bool {
    match pass {
        MatchPass::CaseInsensitive => candidate.to_lowercase() == raw_key.to_lowercase(),
        MatchPass::SeparatorInsensitive => fold_key(candidate) == fold_key(raw_key),
    }
}

/// Generic first-present resolution over a candidate list.
///
/// `parse` turns a raw value into `Some(T)` when it is usable; `None` makes
/// the resolver keep looking, first within the same pass and then with the
/// next pass or candidate.
pub fn resolve<T>(
    raw: &RawRecord,
    candidates: &[String],
    parse: impl Fn(&JsonValue) -> Option<T>,
) -> Option<Resolved<T>> {
    for candidate in candidates {
        if let Some(value) = raw.get(candidate).and_then(&parse) {
            return Some(Resolved {
                raw_key: candidate.clone(),
                value,
            });
        }
        for pass in [MatchPass::CaseInsensitive, MatchPass::SeparatorInsensitive] {
            for (raw_key, raw_value) in raw {
                if !key_matches(pass, candidate, raw_key) {
                    continue;
                }
                if let Some(value) = parse(raw_value) {
                    return Some(Resolved {
                        raw_key: raw_key.clone(),
                        value,
                    });
                }
            }
        }
    }
    None
}

/// Non-empty trimmed text. Strings and numbers qualify; null, bools and containers do not.
pub fn parse_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Finite number, accepting thousands separators in string form.
pub fn parse_number(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',').collect();
            let cleaned = cleaned.trim();
            if cleaned.is_empty() {
                None
            } else {
                cleaned.parse::<f64>().ok()
            }
        }
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    catalog: FieldCatalog,
}

impl Normalizer {
    pub fn new(catalog: FieldCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    fn text(&self, raw: &RawRecord, field: CanonicalField) -> Option<Resolved<String>> {
        resolve(raw, self.catalog.candidates(field), parse_text)
    }

    fn number(&self, raw: &RawRecord, field: CanonicalField) -> Option<Resolved<f64>> {
        resolve(raw, self.catalog.candidates(field), parse_number)
    }

    /// Map one raw record onto the canonical shape.
    pub fn normalize(
        &self,
        raw: &RawRecord,
        source_tag: &str,
    ) -> Result<CanonicalRecord, MissingKeyFields> {
        let mut consumed = BTreeSet::new();
        let mut key_parts = Vec::with_capacity(CanonicalField::KEY_FIELDS.len());
        let mut missing = Vec::new();

        for field in CanonicalField::KEY_FIELDS {
            match self.text(raw, field) {
                Some(found) => {
                    consumed.insert(found.raw_key);
                    key_parts.push(found.value);
                }
                None => missing.push(field),
            }
        }
        if !missing.is_empty() {
            return Err(MissingKeyFields { missing });
        }

        let direct_volume = self.number(raw, CanonicalField::PrimaryVolume);
        let (primary_volume, volume_source) = match direct_volume {
            Some(found) => {
                consumed.insert(found.raw_key);
                (found.value, VolumeSource::Direct)
            }
            None => {
                let sum: f64 = CanonicalField::VOLUME_COMPONENTS
                    .into_iter()
                    .filter_map(|field| self.number(raw, field))
                    .map(|found| found.value)
                    .sum();
                (sum, VolumeSource::ComponentSum)
            }
        };

        let mut metric = |field: CanonicalField| -> f64 {
            match self.number(raw, field) {
                Some(found) => {
                    consumed.insert(found.raw_key);
                    found.value
                }
                None => 0.0,
            }
        };

        let metrics = Metrics {
            primary_volume,
            works_completed: metric(CanonicalField::WorksCompleted),
            works_in_progress: metric(CanonicalField::WorksInProgress),
            payments_made: metric(CanonicalField::PaymentsMade),
            amount_spent: metric(CanonicalField::AmountSpent),
        };

        let extended_fields: ExtendedFields = raw
            .iter()
            .filter(|(key, _)| !consumed.contains(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut parts = key_parts.into_iter();
        let key = NaturalKey {
            region: parts.next().unwrap_or_default(),
            sub_region: parts.next().unwrap_or_default(),
            fiscal_year: parts.next().unwrap_or_default(),
            period: parts.next().unwrap_or_default(),
        };

        Ok(CanonicalRecord {
            key,
            metrics,
            extended_fields,
            volume_source,
            source_tag: source_tag.to_string(),
            last_updated: Utc::now(),
        })
    }

    /// Raw column names that look like a misspelling of `field`, best first.
    pub fn suggest_columns(&self, raw: &RawRecord, field: CanonicalField) -> Vec<String> {
        let candidates = self
            .catalog
            .candidates(field)
            .iter()
            .map(|c| fold_key(c))
            .collect::<Vec<_>>();
        let mut scored = raw
            .keys()
            .filter_map(|raw_key| {
                let folded = fold_key(raw_key);
                let best = candidates
                    .iter()
                    .map(|c| jaro_winkler(c, &folded))
                    .fold(0.0_f64, f64::max);
                (best >= 0.8).then(|| (best, raw_key.clone()))
            })
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.into_iter().take(3).map(|(_, key)| key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawRecord {
        value.as_object().cloned().expect("object literal")
    }

    fn normalize(value: JsonValue) -> Result<CanonicalRecord, MissingKeyFields> {
        Normalizer::default().normalize(&raw(value), redi_core::SOURCE_TAG_API)
    }

    #[test]
    fn scenario_record_derives_volume_from_components() {
        let record = normalize(json!({
            "state_name": "Gujarat",
            "district_name": "Surat",
            "fin_year": "2023-24",
            "month": "Apr",
            "SC_persondays": "100",
            "ST_persondays": "50"
        }))
        .unwrap();

        assert_eq!(record.key, NaturalKey::new("Gujarat", "Surat", "2023-24", "Apr"));
        assert_eq!(record.metrics.primary_volume, 150.0);
        assert_eq!(record.volume_source, VolumeSource::ComponentSum);
        assert_eq!(record.extended_fields.get("SC_persondays"), Some(&json!("100")));
        assert!(!record.extended_fields.contains_key("state_name"));
    }

    #[test]
    fn direct_volume_wins_over_components() {
        let record = normalize(json!({
            "state": "Kerala", "district": "Idukki", "fin_year": "2022-23", "month": "Jan",
            "person_days_generated": "1,250", "SC_persondays": "10"
        }))
        .unwrap();
        assert_eq!(record.metrics.primary_volume, 1250.0);
        assert_eq!(record.volume_source, VolumeSource::Direct);
        assert!(!record.extended_fields.contains_key("person_days_generated"));
    }

    #[test]
    fn spelling_variants_resolve_to_the_same_region() {
        let base = json!({"district_name": "Surat", "fin_year": "2023-24", "month": "Apr"});
        let mut regions = Vec::new();
        for column in ["STATE_NAME", "state_name", "State Name", "state-name"] {
            let mut value = raw(base.clone());
            value.insert(column.to_string(), json!(" Gujarat "));
            let record = Normalizer::default()
                .normalize(&value, redi_core::SOURCE_TAG_API)
                .unwrap();
            regions.push(record.key.region);
        }
        assert!(regions.iter().all(|r| r == "Gujarat"), "{regions:?}");
    }

    #[test]
    fn unparseable_numeric_falls_through_to_next_candidate() {
        let record = normalize(json!({
            "state": "Assam", "district": "Cachar", "fin_year": "2023-24", "month": "Jun",
            "Total_Exp": "n/a",
            "total_expenditure": "42.5"
        }))
        .unwrap();
        assert_eq!(record.metrics.amount_spent, 42.5);
        assert_eq!(record.extended_fields.get("Total_Exp"), Some(&json!("n/a")));
    }

    #[test]
    fn absent_metrics_default_to_zero() {
        let record = normalize(json!({
            "state": "Assam", "district": "Cachar", "fin_year": "2023-24", "month": "Jun",
            "Number_of_Completed_Works": "NaN"
        }))
        .unwrap();
        assert_eq!(record.metrics, Metrics::default());
    }

    #[test]
    fn missing_key_fields_are_reported_not_defaulted() {
        let err = normalize(json!({
            "district_name": "Surat", "fin_year": "2023-24", "month": "  ",
            "SC_persondays": "3"
        }))
        .unwrap_err();
        assert_eq!(
            err.missing,
            vec![CanonicalField::Region, CanonicalField::Period]
        );
        assert!(err.to_string().contains("region, period"));
    }

    #[test]
    fn numeric_json_values_are_accepted() {
        let record = normalize(json!({
            "state": "Goa", "district": "North Goa", "fin_year": 2024, "month": "Mar",
            "works_completed": 7
        }))
        .unwrap();
        assert_eq!(record.key.fiscal_year, "2024");
        assert_eq!(record.metrics.works_completed, 7.0);
    }

    #[test]
    fn empty_value_does_not_block_later_match() {
        let record = normalize(json!({
            "state_name": "", "STATE": "Punjab",
            "district": "Ludhiana", "fin_year": "2023-24", "month": "Feb"
        }))
        .unwrap();
        assert_eq!(record.key.region, "Punjab");
        assert_eq!(record.extended_fields.get("state_name"), Some(&json!("")));
    }

    #[test]
    fn exact_spelling_beats_looser_matches() {
        let record = raw(json!({
            "STATE NAME": "Loose",
            "State_Name": "Cased",
            "state_name": "Exact",
        }));
        let candidates = vec!["state_name".to_string()];
        let found = resolve(&record, &candidates, parse_text).unwrap();
        assert_eq!(found.raw_key, "state_name");
        assert_eq!(found.value, "Exact");

        let record = raw(json!({ "STATE NAME": "Loose", "State_Name": "Cased" }));
        let found = resolve(&record, &candidates, parse_text).unwrap();
        assert_eq!(found.raw_key, "State_Name");
    }

    #[test]
    fn number_parsing_rules() {
        assert_eq!(parse_number(&json!("1,234.5")), Some(1234.5));
        assert_eq!(parse_number(&json!(" 12 ")), Some(12.0));
        assert_eq!(parse_number(&json!("inf")), None);
        assert_eq!(parse_number(&json!("")), None);
        assert_eq!(parse_number(&json!(null)), None);
        assert_eq!(parse_number(&json!("12abc")), None);
    }

    #[test]
    fn suggestions_point_at_near_miss_columns() {
        let normalizer = Normalizer::default();
        let value = raw(json!({"stat_nme": "Goa", "district": "North Goa"}));
        let suggestions = normalizer.suggest_columns(&value, CanonicalField::Region);
        assert_eq!(suggestions.first().map(String::as_str), Some("stat_nme"));
    }
}
