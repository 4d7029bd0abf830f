//! Declarative candidate-key lists per canonical field.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Region,
    SubRegion,
    FiscalYear,
    Period,
    PrimaryVolume,
    WorksCompleted,
    WorksInProgress,
    PaymentsMade,
    AmountSpent,
    ScVolume,
    StVolume,
    WomenVolume,
    CentralLiabilityVolume,
}

impl CanonicalField {
    pub const KEY_FIELDS: [CanonicalField; 4] = [
        CanonicalField::Region,
        CanonicalField::SubRegion,
        CanonicalField::FiscalYear,
        CanonicalField::Period,
    ];

    /// Sub-population components summed when no direct primary volume exists.
    pub const VOLUME_COMPONENTS: [CanonicalField; 4] = [
        CanonicalField::ScVolume,
        CanonicalField::StVolume,
        CanonicalField::WomenVolume,
        CanonicalField::CentralLiabilityVolume,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalField::Region => "region",
            CanonicalField::SubRegion => "sub_region",
            CanonicalField::FiscalYear => "fiscal_year",
            CanonicalField::Period => "period",
            CanonicalField::PrimaryVolume => "primary_volume",
            CanonicalField::WorksCompleted => "works_completed",
            CanonicalField::WorksInProgress => "works_in_progress",
            CanonicalField::PaymentsMade => "payments_made",
            CanonicalField::AmountSpent => "amount_spent",
            CanonicalField::ScVolume => "sc_volume",
            CanonicalField::StVolume => "st_volume",
            CanonicalField::WomenVolume => "women_volume",
            CanonicalField::CentralLiabilityVolume => "central_liability_volume",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AliasFile {
    #[serde(default)]
    aliases: BTreeMap<CanonicalField, Vec<String>>,
}

/// Priority-ordered source spellings for every canonical field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCatalog {
    candidates: BTreeMap<CanonicalField, Vec<String>>,
}

impl Default for FieldCatalog {
    fn default() -> Self {
        use CanonicalField::*;

        let table: [(CanonicalField, &[&str]); 13] = [
            (Region, &["state_name", "State_Name", "STATE_NAME", "state", "State", "STATE"]),
            (
                SubRegion,
                &["district_name", "District_Name", "DISTRICT_NAME", "district", "District", "DISTRICT"],
            ),
            (
                FiscalYear,
                &["fin_year", "Fin_Year", "FIN_YEAR", "financial_year", "Financial Year", "financialyear"],
            ),
            (Period, &["month", "Month", "MONTH"]),
            (
                PrimaryVolume,
                &["person_days_generated", "Person_Days_Generated", "personDaysGenerated", "PERSON_DAYS"],
            ),
            (
                WorksCompleted,
                &["Number_of_Completed_Works", "number_of_completed_works", "works_completed"],
            ),
            (
                WorksInProgress,
                &["Number_of_Ongoing_Works", "number_of_ongoing_works", "works_in_progress"],
            ),
            (
                PaymentsMade,
                &["Total_No_of_JobCards_issued", "total_no_of_jobcards_issued", "payments_made"],
            ),
            (
                AmountSpent,
                &["Total_Exp", "total_exp", "Total_Expenditure", "total_expenditure", "amount_spent"],
            ),
            (ScVolume, &["SC_persondays", "sc_persondays", "SC Persondays", "scPersondays"]),
            (StVolume, &["ST_persondays", "st_persondays", "ST Persondays", "stPersondays"]),
            (
                WomenVolume,
                &["Women_Persondays", "women_persondays", "Women Persondays", "womenPersondays"],
            ),
            (
                CentralLiabilityVolume,
                &[
                    "Persondays_of_Central_Liability_so_far",
                    "persondays_of_central_liability_so_far",
                    "Central_Liability_Persondays",
                ],
            ),
        ];

        let candidates = table
            .into_iter()
            .map(|(field, names)| (field, names.iter().map(|s| s.to_string()).collect()))
            .collect();
        Self { candidates }
    }
}

impl FieldCatalog {
    pub fn candidates(&self, field: CanonicalField) -> &[String] {
        self.candidates
            .get(&field)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Append extra spellings after the built-in ones; duplicates are ignored.
    pub fn extend(&mut self, field: CanonicalField, names: impl IntoIterator<Item = String>) {
        let list = self.candidates.entry(field).or_default();
        for name in names {
            let name = name.trim().to_string();
            if !name.is_empty() && !list.contains(&name) {
                list.push(name);
            }
        }
    }

    /// Merge an alias document of the form `aliases: { region: [..], .. }`.
    pub fn apply_aliases_yaml(&mut self, text: &str) -> anyhow::Result<()> {
        let file: AliasFile = serde_yaml::from_str(text).context("parsing field alias yaml")?;
        for (field, names) in file.aliases {
            self.extend(field, names);
        }
        Ok(())
    }

    pub fn with_overrides(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut catalog = Self::default();
        catalog
            .apply_aliases_yaml(&text)
            .with_context(|| format!("applying aliases from {}", path.display()))?;
        Ok(catalog)
    }
}
