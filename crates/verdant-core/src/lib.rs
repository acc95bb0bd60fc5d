//! Core domain model and country reference tables for Verdant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed `type` key of the singleton ingestion-metadata document.
pub const METADATA_TYPE_KEY: &str = "data_source";

/// Which pipeline produced a persisted record. Whole-record tag: a record
/// reconciled from real rows keeps the provider tag even when individual
/// fields had to be derived or estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Synthetic,
    Owid,
    WorldBank,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Synthetic => "synthetic",
            Provenance::Owid => "owid",
            Provenance::WorldBank => "world_bank",
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key shared by both record collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub country: String,
    pub year: i32,
}

impl RecordKey {
    pub fn new(country: impl Into<String>, year: i32) -> Self {
        Self {
            country: country.into(),
            year,
        }
    }
}

/// Canonical CO2 emissions record, keyed by (country, year).
///
/// `co2_per_capita` is either taken from a source or derived as
/// `co2_emissions * 1e6 / population`; it is `0.0` only when the population
/// is unknown, which dashboard consumers read as "unknown" for rankings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionRecord {
    pub country: String,
    pub year: i32,
    /// Metric megatons.
    pub co2_emissions: f64,
    pub population: Option<u64>,
    pub gdp_per_capita: Option<f64>,
    /// Metric tons per person.
    pub co2_per_capita: f64,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmissionRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.country.clone(), self.year)
    }
}

/// Canonical renewable-energy record, keyed by (country, year).
/// All quantities in TWh except `renewable_percentage` in [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyRecord {
    pub country: String,
    pub year: i32,
    pub renewable_percentage: f64,
    pub total_energy_consumption: f64,
    pub renewable_energy: f64,
    pub fossil_fuel_energy: f64,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnergyRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.country.clone(), self.year)
    }

    /// Split invariant: renewable + fossil must re-add to the total.
    pub fn is_balanced(&self, tolerance: f64) -> bool {
        (self.renewable_energy + self.fossil_fuel_energy - self.total_energy_consumption).abs()
            <= tolerance
    }
}

/// Singleton document describing the most recent successful reconciliation.
/// The orchestrator's staleness gate treats this record as authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionMetadata {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub primary_source: String,
    pub co2_source: String,
    pub energy_source: String,
    pub coverage_start: i32,
    pub coverage_end: i32,
    pub countries_count: usize,
    pub last_updated: DateTime<Utc>,
}

/// Target countries, canonical names as used by the bulk provider.
pub const TARGET_COUNTRIES: [&str; 50] = [
    "United States",
    "China",
    "India",
    "Russia",
    "Japan",
    "Germany",
    "Iran",
    "South Korea",
    "Saudi Arabia",
    "Indonesia",
    "Canada",
    "Mexico",
    "Brazil",
    "Australia",
    "United Kingdom",
    "Italy",
    "France",
    "Turkey",
    "Poland",
    "Thailand",
    "Egypt",
    "Argentina",
    "Malaysia",
    "Netherlands",
    "Spain",
    "Pakistan",
    "Bangladesh",
    "Vietnam",
    "Nigeria",
    "Philippines",
    "South Africa",
    "Iraq",
    "Venezuela",
    "Kazakhstan",
    "Algeria",
    "Chile",
    "Morocco",
    "Peru",
    "Israel",
    "Norway",
    "Finland",
    "Denmark",
    "Sweden",
    "Switzerland",
    "Austria",
    "Belgium",
    "Portugal",
    "Czech Republic",
    "Greece",
    "Ukraine",
];

/// ISO3 code to canonical country name, used to join per-indicator rows to
/// the names the bulk provider (and the store) keys on.
const ISO3_TO_NAME: [(&str, &str); 50] = [
    ("USA", "United States"),
    ("CHN", "China"),
    ("IND", "India"),
    ("RUS", "Russia"),
    ("JPN", "Japan"),
    ("DEU", "Germany"),
    ("IRN", "Iran"),
    ("KOR", "South Korea"),
    ("SAU", "Saudi Arabia"),
    ("IDN", "Indonesia"),
    ("CAN", "Canada"),
    ("MEX", "Mexico"),
    ("BRA", "Brazil"),
    ("AUS", "Australia"),
    ("GBR", "United Kingdom"),
    ("ITA", "Italy"),
    ("FRA", "France"),
    ("TUR", "Turkey"),
    ("POL", "Poland"),
    ("THA", "Thailand"),
    ("EGY", "Egypt"),
    ("ARG", "Argentina"),
    ("MYS", "Malaysia"),
    ("NLD", "Netherlands"),
    ("ESP", "Spain"),
    ("PAK", "Pakistan"),
    ("BGD", "Bangladesh"),
    ("VNM", "Vietnam"),
    ("NGA", "Nigeria"),
    ("PHL", "Philippines"),
    ("ZAF", "South Africa"),
    ("IRQ", "Iraq"),
    ("VEN", "Venezuela"),
    ("KAZ", "Kazakhstan"),
    ("DZA", "Algeria"),
    ("CHL", "Chile"),
    ("MAR", "Morocco"),
    ("PER", "Peru"),
    ("ISR", "Israel"),
    ("NOR", "Norway"),
    ("FIN", "Finland"),
    ("DNK", "Denmark"),
    ("SWE", "Sweden"),
    ("CHE", "Switzerland"),
    ("AUT", "Austria"),
    ("BEL", "Belgium"),
    ("PRT", "Portugal"),
    ("CZE", "Czech Republic"),
    ("GRC", "Greece"),
    ("UKR", "Ukraine"),
];

/// Estimated annual total energy consumption per country in TWh. The
/// per-indicator provider has no total-consumption series, so energy splits
/// are derived against these fixed estimates.
const ENERGY_ESTIMATES_TWH: [(&str, f64); 50] = [
    ("USA", 4000.0),
    ("CHN", 7500.0),
    ("IND", 1200.0),
    ("RUS", 1100.0),
    ("JPN", 1000.0),
    ("DEU", 600.0),
    ("BRA", 600.0),
    ("CAN", 650.0),
    ("KOR", 550.0),
    ("GBR", 350.0),
    ("ITA", 320.0),
    ("FRA", 480.0),
    ("AUS", 260.0),
    ("ESP", 280.0),
    ("MEX", 300.0),
    ("IDN", 250.0),
    ("TUR", 280.0),
    ("SAU", 350.0),
    ("IRN", 280.0),
    ("THA", 200.0),
    ("ZAF", 230.0),
    ("POL", 170.0),
    ("ARG", 130.0),
    ("EGY", 180.0),
    ("NLD", 120.0),
    ("MYS", 180.0),
    ("PAK", 120.0),
    ("VNM", 220.0),
    ("BGD", 80.0),
    ("NGA", 30.0),
    ("PHL", 100.0),
    ("IRQ", 90.0),
    ("VEN", 80.0),
    ("KAZ", 100.0),
    ("DZA", 70.0),
    ("CHL", 80.0),
    ("MAR", 40.0),
    ("PER", 55.0),
    ("ISR", 65.0),
    ("NOR", 140.0),
    ("FIN", 85.0),
    ("DNK", 35.0),
    ("SWE", 140.0),
    ("CHE", 60.0),
    ("AUT", 75.0),
    ("BEL", 85.0),
    ("PRT", 50.0),
    ("CZE", 75.0),
    ("GRC", 50.0),
    ("UKR", 120.0),
];

/// Fallback estimate for countries outside the curated table.
pub const DEFAULT_ENERGY_ESTIMATE_TWH: f64 = 50.0;

pub fn iso3_to_country_name(iso3: &str) -> Option<&'static str> {
    ISO3_TO_NAME
        .iter()
        .find(|(code, _)| *code == iso3)
        .map(|(_, name)| *name)
}

pub fn country_iso3_codes() -> impl Iterator<Item = &'static str> {
    ISO3_TO_NAME.iter().map(|(code, _)| *code)
}

pub fn is_target_country(name: &str) -> bool {
    TARGET_COUNTRIES.contains(&name)
}

pub fn estimated_annual_energy_twh(iso3: &str) -> f64 {
    ENERGY_ESTIMATES_TWH
        .iter()
        .find(|(code, _)| *code == iso3)
        .map(|(_, twh)| *twh)
        .unwrap_or(DEFAULT_ENERGY_ESTIMATE_TWH)
}
