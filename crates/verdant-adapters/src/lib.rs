//! Provider adapters: OWID bulk CSV and World Bank per-indicator JSON.
//!
//! Both adapters isolate per-call failures: a call that yields no usable
//! payload returns an empty result and a warning, while a provider that is
//! unreachable outright surfaces [`SourceError::Transport`] for the
//! orchestrator to escalate.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use verdant_core::is_target_country;
use verdant_store::{FetchError, HttpFetcher, RawArchive};

pub const OWID_PROVIDER: &str = "owid";
pub const WORLD_BANK_PROVIDER: &str = "world_bank";

pub const DEFAULT_OWID_CO2_URL: &str =
    "https://raw.githubusercontent.com/owid/co2-data/master/owid-co2-data.csv";
pub const DEFAULT_WORLD_BANK_BASE_URL: &str = "https://api.worldbank.org/v2";

/// Large enough that the 50-country batch over a 14-year range never
/// paginates; the envelope's page count is still checked on every call.
const WORLD_BANK_PAGE_SIZE: u32 = 5000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{provider} unreachable")]
    Transport {
        provider: &'static str,
        #[source]
        source: FetchError,
    },
    #[error("{provider} payload malformed: {detail}")]
    Malformed {
        provider: &'static str,
        detail: String,
    },
}

impl SourceError {
    pub fn is_transport(&self) -> bool {
        matches!(self, SourceError::Transport { .. })
    }
}

/// One accepted row of the bulk dataset. Numeric fields are optional; a row
/// with neither emissions figure is dropped at parse time.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkEmissionRow {
    pub country: String,
    pub year: i32,
    /// Metric megatons.
    pub co2_total_mt: Option<f64>,
    /// Metric tons per person.
    pub co2_per_capita: Option<f64>,
    pub population: Option<u64>,
    /// Whole-economy GDP in current USD, as published by the bulk source.
    pub gdp_total: Option<f64>,
}

/// One row of a per-indicator response; `value` is nullable upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorObservation {
    pub iso3: String,
    pub year: i32,
    pub value: Option<f64>,
}

/// World Bank indicator codes consumed by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Co2PerCapita,
    Co2TotalKt,
    RenewableShare,
    Population,
    GdpPerCapita,
}

impl Indicator {
    pub fn code(&self) -> &'static str {
        match self {
            Indicator::Co2PerCapita => "EN.ATM.CO2E.PC",
            Indicator::Co2TotalKt => "EN.ATM.CO2E.KT",
            Indicator::RenewableShare => "EG.FEC.RNEW.ZS",
            Indicator::Population => "SP.POP.TOTL",
            Indicator::GdpPerCapita => "NY.GDP.PCAP.CD",
        }
    }
}

/// Bulk emissions feed, grouped per year so callers can work through the
/// range in ascending order without re-fetching.
#[async_trait]
pub trait EmissionSource: Send + Sync {
    async fn fetch_emissions(
        &self,
        years: RangeInclusive<i32>,
    ) -> Result<BTreeMap<i32, Vec<BulkEmissionRow>>, SourceError>;
}

/// Renewable-share feed, one call per year.
#[async_trait]
pub trait RenewableSource: Send + Sync {
    async fn fetch_renewable_share(
        &self,
        year: i32,
    ) -> Result<Vec<IndicatorObservation>, SourceError>;
}

/// All five indicators for a single year, fetched concurrently and indexed
/// by ISO3 code (null observations dropped).
#[derive(Debug, Clone, Default)]
pub struct YearProfile {
    pub co2_total_kt: HashMap<String, f64>,
    pub co2_per_capita: HashMap<String, f64>,
    pub population: HashMap<String, f64>,
    pub gdp_per_capita: HashMap<String, f64>,
    pub renewable_share: HashMap<String, f64>,
}

#[async_trait]
pub trait YearProfileSource: Send + Sync {
    async fn fetch_year_profile(&self, year: i32) -> Result<YearProfile, SourceError>;
}

/// Adapter for the bulk tabular provider: one GET of the full delimited
/// dataset, partitioned by year after filtering to the target country list.
pub struct OwidBulkAdapter {
    http: Arc<HttpFetcher>,
    url: String,
    archive: Option<Arc<RawArchive>>,
}

impl OwidBulkAdapter {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: Arc<RawArchive>) -> Self {
        self.archive = Some(archive);
        self
    }
}

#[async_trait]
impl EmissionSource for OwidBulkAdapter {
    async fn fetch_emissions(
        &self,
        years: RangeInclusive<i32>,
    ) -> Result<BTreeMap<i32, Vec<BulkEmissionRow>>, SourceError> {
        let response = match self.http.fetch_bytes(OWID_PROVIDER, &self.url).await {
            Ok(response) => response,
            Err(err) if err.is_transport() => {
                return Err(SourceError::Transport {
                    provider: OWID_PROVIDER,
                    source: err,
                });
            }
            Err(err) => {
                // Provider reachable but refusing the call; empty result,
                // the orchestrator decides whether the run is still viable.
                warn!(provider = OWID_PROVIDER, error = %err, "bulk call failed");
                return Ok(BTreeMap::new());
            }
        };

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .store_payload(OWID_PROVIDER, Utc::now(), "csv", &response.body)
                .await
            {
                warn!(provider = OWID_PROVIDER, error = %err, "archiving bulk payload failed");
            }
        }

        let text = response.text().map_err(|err| SourceError::Malformed {
            provider: OWID_PROVIDER,
            detail: err.to_string(),
        })?;
        let by_year = parse_bulk_csv(&text, &years).map_err(|detail| SourceError::Malformed {
            provider: OWID_PROVIDER,
            detail,
        })?;
        let accepted: usize = by_year.values().map(Vec::len).sum();
        debug!(
            provider = OWID_PROVIDER,
            years_with_data = by_year.len(),
            accepted,
            "bulk dataset parsed"
        );
        Ok(by_year)
    }
}

/// Parse the bulk CSV, keeping rows inside the year range for target
/// countries that carry at least one usable emissions figure.
pub fn parse_bulk_csv(
    text: &str,
    years: &RangeInclusive<i32>,
) -> Result<BTreeMap<i32, Vec<BulkEmissionRow>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let country_col = column("country").ok_or("missing 'country' column")?;
    let year_col = column("year").ok_or("missing 'year' column")?;
    let co2_col = column("co2");
    let co2_per_capita_col = column("co2_per_capita");
    let population_col = column("population");
    let gdp_col = column("gdp");

    let numeric = |record: &csv::StringRecord, col: Option<usize>| -> Option<f64> {
        col.and_then(|idx| record.get(idx))
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| raw.parse::<f64>().ok())
    };

    let mut by_year: BTreeMap<i32, Vec<BulkEmissionRow>> = BTreeMap::new();
    for record in reader.records() {
        let Ok(record) = record else {
            continue; // malformed line, not worth failing the whole dataset
        };
        let Some(year) = record.get(year_col).and_then(|raw| raw.parse::<i32>().ok()) else {
            continue;
        };
        let Some(country) = record.get(country_col).filter(|c| !c.is_empty()) else {
            continue;
        };
        if !years.contains(&year) || !is_target_country(country) {
            continue;
        }

        let co2_total_mt = numeric(&record, co2_col);
        let co2_per_capita = numeric(&record, co2_per_capita_col);
        if co2_total_mt.is_none() && co2_per_capita.is_none() {
            continue;
        }

        by_year.entry(year).or_default().push(BulkEmissionRow {
            country: country.to_string(),
            year,
            co2_total_mt,
            co2_per_capita,
            population: numeric(&record, population_col).map(|p| p.max(0.0) as u64),
            gdp_total: numeric(&record, gdp_col),
        });
    }
    Ok(by_year)
}

/// Adapter for the per-indicator JSON provider: one call per (indicator,
/// year range) across the semicolon-joined ISO3 batch.
pub struct WorldBankAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
    archive: Option<Arc<RawArchive>>,
}

impl WorldBankAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: Arc<RawArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    fn indicator_url(&self, indicator: Indicator, start_year: i32, end_year: i32) -> String {
        let batch = verdant_core::country_iso3_codes().collect::<Vec<_>>().join(";");
        format!(
            "{}/country/{}/indicator/{}?format=json&date={}:{}&per_page={}",
            self.base_url,
            batch,
            indicator.code(),
            start_year,
            end_year,
            WORLD_BANK_PAGE_SIZE
        )
    }

    /// Fetch one indicator over the year range. Non-2xx responses and
    /// malformed or short envelopes mean "no data for this call"; only a
    /// transport failure escalates.
    pub async fn fetch_indicator(
        &self,
        indicator: Indicator,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<IndicatorObservation>, SourceError> {
        let url = self.indicator_url(indicator, start_year, end_year);
        let response = match self.http.fetch_bytes(WORLD_BANK_PROVIDER, &url).await {
            Ok(response) => response,
            Err(FetchError::Request(err)) => {
                return Err(SourceError::Transport {
                    provider: WORLD_BANK_PROVIDER,
                    source: FetchError::Request(err),
                });
            }
            Err(err) => {
                warn!(
                    provider = WORLD_BANK_PROVIDER,
                    indicator = indicator.code(),
                    error = %err,
                    "indicator call failed"
                );
                return Ok(Vec::new());
            }
        };

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .store_payload(WORLD_BANK_PROVIDER, Utc::now(), "json", &response.body)
                .await
            {
                warn!(provider = WORLD_BANK_PROVIDER, error = %err, "archiving payload failed");
            }
        }

        let Ok(text) = response.text() else {
            warn!(
                provider = WORLD_BANK_PROVIDER,
                indicator = indicator.code(),
                "indicator response is not utf-8"
            );
            return Ok(Vec::new());
        };
        match parse_indicator_envelope(&text) {
            Ok(envelope) => {
                if envelope.pages > 1 {
                    warn!(
                        provider = WORLD_BANK_PROVIDER,
                        indicator = indicator.code(),
                        pages = envelope.pages,
                        "indicator response paginated; rows beyond page 1 were not fetched"
                    );
                }
                Ok(envelope.rows)
            }
            Err(detail) => {
                warn!(
                    provider = WORLD_BANK_PROVIDER,
                    indicator = indicator.code(),
                    detail = %detail,
                    "indicator envelope unusable"
                );
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl RenewableSource for WorldBankAdapter {
    async fn fetch_renewable_share(
        &self,
        year: i32,
    ) -> Result<Vec<IndicatorObservation>, SourceError> {
        self.fetch_indicator(Indicator::RenewableShare, year, year)
            .await
    }
}

#[async_trait]
impl YearProfileSource for WorldBankAdapter {
    async fn fetch_year_profile(&self, year: i32) -> Result<YearProfile, SourceError> {
        let (co2_total_kt, co2_per_capita, population, gdp_per_capita, renewable_share) = tokio::try_join!(
            self.fetch_indicator(Indicator::Co2TotalKt, year, year),
            self.fetch_indicator(Indicator::Co2PerCapita, year, year),
            self.fetch_indicator(Indicator::Population, year, year),
            self.fetch_indicator(Indicator::GdpPerCapita, year, year),
            self.fetch_indicator(Indicator::RenewableShare, year, year),
        )?;
        Ok(YearProfile {
            co2_total_kt: index_by_iso3(co2_total_kt),
            co2_per_capita: index_by_iso3(co2_per_capita),
            population: index_by_iso3(population),
            gdp_per_capita: index_by_iso3(gdp_per_capita),
            renewable_share: index_by_iso3(renewable_share),
        })
    }
}

fn index_by_iso3(rows: Vec<IndicatorObservation>) -> HashMap<String, f64> {
    rows.into_iter()
        .filter_map(|row| row.value.map(|value| (row.iso3, value)))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorEnvelope {
    pub pages: u64,
    pub rows: Vec<IndicatorObservation>,
}

/// Parse the `[metadata, rows]` envelope. An envelope with fewer than two
/// elements is "no data for this call" and comes back empty, not as an
/// error; only undecodable JSON is reported upward as a detail string.
pub fn parse_indicator_envelope(text: &str) -> Result<IndicatorEnvelope, String> {
    let value: JsonValue = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let Some(elements) = value.as_array() else {
        return Err("envelope is not a JSON array".to_string());
    };
    if elements.len() < 2 {
        debug!("envelope has fewer than 2 elements; treating as no data");
        return Ok(IndicatorEnvelope::default());
    }

    let pages = elements[0]
        .get("pages")
        .and_then(JsonValue::as_u64)
        .unwrap_or(1);
    let rows = elements[1]
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let iso3 = row
                        .get("countryiso3code")
                        .and_then(JsonValue::as_str)
                        .filter(|code| !code.is_empty())?;
                    let year = row
                        .get("date")
                        .and_then(JsonValue::as_str)
                        .and_then(|raw| raw.parse::<i32>().ok())?;
                    Some(IndicatorObservation {
                        iso3: iso3.to_string(),
                        year,
                        value: row.get("value").and_then(JsonValue::as_f64),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(IndicatorEnvelope { pages, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BULK_FIXTURE: &str = "\
country,year,iso_code,co2,co2_per_capita,population,gdp
United States,2023,USA,5000,,330000000,25000000000000
Germany,2023,DEU,,8.5,83000000,4200000000000
Germany,2009,DEU,800,9.6,81000000,
Narnia,2023,,42,1.0,1000,
France,2022,FRA,331,4.9,67000000,2900000000000
Italy,2023,ITA,,,59000000,2100000000000
";

    #[test]
    fn bulk_parse_partitions_by_year_and_filters_rows() {
        let by_year = parse_bulk_csv(BULK_FIXTURE, &(2020..=2023)).unwrap();

        // 2009 out of range, Narnia not a target, Italy has no usable figure
        assert_eq!(by_year.keys().copied().collect::<Vec<_>>(), vec![2022, 2023]);
        assert_eq!(by_year[&2023].len(), 2);

        let usa = &by_year[&2023][0];
        assert_eq!(usa.country, "United States");
        assert_eq!(usa.co2_total_mt, Some(5000.0));
        assert_eq!(usa.co2_per_capita, None);
        assert_eq!(usa.population, Some(330_000_000));

        let germany = &by_year[&2023][1];
        assert_eq!(germany.co2_total_mt, None);
        assert_eq!(germany.co2_per_capita, Some(8.5));
    }

    #[test]
    fn bulk_parse_requires_country_and_year_columns() {
        let err = parse_bulk_csv("iso_code,co2\nUSA,5000\n", &(2020..=2023)).unwrap_err();
        assert!(err.contains("country"));
    }

    #[test]
    fn envelope_parses_rows_and_keeps_null_values() {
        let text = r#"[
            {"page": 1, "pages": 1, "per_page": 5000, "total": 2},
            [
                {"countryiso3code": "NOR", "date": "2023", "value": 98.5},
                {"countryiso3code": "DEU", "date": "2023", "value": null},
                {"countryiso3code": "", "date": "2023", "value": 12.0}
            ]
        ]"#;
        let envelope = parse_indicator_envelope(text).unwrap();
        assert_eq!(envelope.pages, 1);
        assert_eq!(envelope.rows.len(), 2);
        assert_eq!(envelope.rows[0].value, Some(98.5));
        assert_eq!(envelope.rows[1].value, None);
    }

    #[test]
    fn short_envelope_means_no_data_not_an_error() {
        let envelope = parse_indicator_envelope(r#"[{"message": "no data"}]"#).unwrap();
        assert!(envelope.rows.is_empty());
    }

    #[test]
    fn undecodable_envelope_is_reported() {
        assert!(parse_indicator_envelope("<html>oops</html>").is_err());
        assert!(parse_indicator_envelope(r#"{"not": "an array"}"#).is_err());
    }

    #[test]
    fn indicator_codes_match_the_published_series() {
        assert_eq!(Indicator::RenewableShare.code(), "EG.FEC.RNEW.ZS");
        assert_eq!(Indicator::Co2TotalKt.code(), "EN.ATM.CO2E.KT");
        assert_eq!(Indicator::Population.code(), "SP.POP.TOTL");
    }
}
