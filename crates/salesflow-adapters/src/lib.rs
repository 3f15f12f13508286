//! Extraction capability + concrete extractors (synthetic, JSON file, HTTP API).

mod http;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use rust_decimal::Decimal;
use salesflow_core::{DateRange, RawSaleRecord, Source, DATE_FORMAT};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use http::{
    status_is_transient, FetchError, HttpClientConfig, HttpFetcher, RetryPolicy, SalesApiRequest,
};

pub const CRATE_NAME: &str = "salesflow-adapters";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed payload from {source_name}: {message}")]
    Malformed {
        source_name: String,
        message: String,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Pulls raw sale records for one source over an inclusive date range.
///
/// Implementations are read-only: they never touch the watermark or the store.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn fetch(
        &self,
        source: &Source,
        range: &DateRange,
    ) -> Result<Vec<RawSaleRecord>, ExtractError>;
}

/// Payload shape accepted from files and APIs: a bare array or `{"records": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordsPayload {
    Bare(Vec<RawSaleRecord>),
    Wrapped { records: Vec<RawSaleRecord> },
}

impl RecordsPayload {
    fn into_records(self) -> Vec<RawSaleRecord> {
        match self {
            Self::Bare(records) | Self::Wrapped { records } => records,
        }
    }
}

fn parse_records(source_name: &str, bytes: &[u8]) -> Result<Vec<RawSaleRecord>, ExtractError> {
    serde_json::from_slice::<RecordsPayload>(bytes)
        .map(RecordsPayload::into_records)
        .map_err(|err| ExtractError::Malformed {
            source_name: source_name.to_string(),
            message: err.to_string(),
        })
}

/// Keeps records dated inside `range`. Records without a parseable date pass
/// through so the transformer's cleaning step decides about them.
fn retain_in_range(records: Vec<RawSaleRecord>, range: &DateRange) -> Vec<RawSaleRecord> {
    records
        .into_iter()
        .filter(|record| {
            match record
                .date
                .as_deref()
                .and_then(|d| chrono::NaiveDate::parse_from_str(d.trim(), DATE_FORMAT).ok())
            {
                Some(date) => range.contains(date),
                None => true,
            }
        })
        .collect()
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub sku: String,
    pub name: String,
    pub category: String,
    pub price: Decimal,
}

impl CatalogProduct {
    pub fn new(sku: &str, name: &str, category: &str, price: Decimal) -> Self {
        Self {
            sku: sku.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            price,
        }
    }
}

/// Catalog served by the demo `mock_api` source.
pub fn default_catalog() -> Vec<CatalogProduct> {
    vec![
        CatalogProduct::new("PROD001", "iPhone 14", "Smartphones", Decimal::new(79999, 2)),
        CatalogProduct::new("PROD002", "Samsung Galaxy", "Smartphones", Decimal::new(69999, 2)),
        CatalogProduct::new("PROD003", "MacBook Pro", "Laptops", Decimal::new(199999, 2)),
    ]
}

/// Deterministic generator: one record per catalog product per day.
///
/// Quantities fall in `1..=10` and are derived from a SHA-256 of the SKU and
/// date, so the output is a pure function of the catalog and the range.
#[derive(Debug, Clone)]
pub struct SyntheticExtractor {
    catalog: Vec<CatalogProduct>,
}

impl Default for SyntheticExtractor {
    fn default() -> Self {
        Self::new(default_catalog())
    }
}

impl SyntheticExtractor {
    pub fn new(catalog: Vec<CatalogProduct>) -> Self {
        Self { catalog }
    }

    pub fn quantity_for(sku: &str, date: chrono::NaiveDate) -> i64 {
        let mut hasher = Sha256::new();
        hasher.update(sku.as_bytes());
        hasher.update(b":");
        hasher.update(date.format(DATE_FORMAT).to_string().as_bytes());
        let digest = hasher.finalize();
        i64::from(digest[0] % 10) + 1
    }

    pub fn generate(&self, range: &DateRange) -> Vec<RawSaleRecord> {
        let mut out = Vec::with_capacity(self.catalog.len() * range.days().count());
        for date in range.days() {
            for product in &self.catalog {
                let quantity = Self::quantity_for(&product.sku, date);
                let revenue = product.price * Decimal::from(quantity);
                out.push(RawSaleRecord {
                    sku: Some(product.sku.clone()),
                    product_name: Some(product.name.clone()),
                    category: Some(product.category.clone()),
                    price: Some(JsonValue::String(product.price.to_string())),
                    date: Some(date.format(DATE_FORMAT).to_string()),
                    quantity: Some(JsonValue::from(quantity)),
                    revenue: Some(JsonValue::String(revenue.to_string())),
                });
            }
        }
        out
    }
}

#[async_trait]
impl Extractor for SyntheticExtractor {
    fn kind(&self) -> &'static str {
        "synthetic"
    }

    async fn fetch(
        &self,
        _source: &Source,
        range: &DateRange,
    ) -> Result<Vec<RawSaleRecord>, ExtractError> {
        Ok(self.generate(range))
    }
}

/// Reads a JSON export of raw records from disk.
#[derive(Debug, Clone)]
pub struct FileExtractor {
    path: PathBuf,
}

impl FileExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Extractor for FileExtractor {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn fetch(
        &self,
        source: &Source,
        range: &DateRange,
    ) -> Result<Vec<RawSaleRecord>, ExtractError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let records = parse_records(&source.name, &bytes)?;
        Ok(retain_in_range(records, range))
    }
}

/// Calls the source's `api_endpoint` with the range as query parameters and
/// the API key as bearer token.
#[derive(Debug, Clone)]
pub struct ApiExtractor {
    http: HttpFetcher,
}

impl ApiExtractor {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Extractor for ApiExtractor {
    fn kind(&self) -> &'static str {
        "api"
    }

    async fn fetch(
        &self,
        source: &Source,
        range: &DateRange,
    ) -> Result<Vec<RawSaleRecord>, ExtractError> {
        let body = self
            .http
            .fetch_sales(&SalesApiRequest {
                source_name: &source.name,
                endpoint: &source.api_endpoint,
                start_date: range.start.format(DATE_FORMAT).to_string(),
                end_date: range.end.format(DATE_FORMAT).to_string(),
                api_key: (!source.api_key.is_empty()).then_some(source.api_key.as_str()),
            })
            .await?;
        let records = parse_records(&source.name, &body)?;
        Ok(retain_in_range(records, range))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractorSettings {
    pub http: HttpClientConfig,
    /// Directory holding `<source name>.json` exports for file-backed sources.
    pub fixtures_dir: Option<PathBuf>,
    /// Product catalog for the synthetic feed; the built-in catalog when unset.
    pub catalog_file: Option<PathBuf>,
}

/// Picks the extractor for a source: its API when it has an endpoint, a JSON
/// export when one exists under `fixtures_dir`, the synthetic feed otherwise.
pub fn extractor_for_source(
    source: &Source,
    settings: &ExtractorSettings,
) -> anyhow::Result<Box<dyn Extractor>> {
    if source.has_endpoint() {
        let http = HttpFetcher::new(settings.http.clone())?;
        return Ok(Box::new(ApiExtractor::new(http)));
    }
    if let Some(dir) = &settings.fixtures_dir {
        let path = dir.join(format!("{}.json", source.name));
        if path.exists() {
            return Ok(Box::new(FileExtractor::new(path)));
        }
    }
    match &settings.catalog_file {
        Some(path) => Ok(Box::new(SyntheticExtractor::new(load_catalog(path)?))),
        None => Ok(Box::new(SyntheticExtractor::default())),
    }
}

/// Loads a catalog file (JSON array of products) for a custom synthetic feed.
pub fn load_catalog(path: impl AsRef<Path>) -> anyhow::Result<Vec<CatalogProduct>> {
    read_json_file(path)
}
