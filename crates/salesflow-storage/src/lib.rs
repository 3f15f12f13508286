//! Relational persistence for SalesFlow: the `SalesStore` contract plus the
//! PostgreSQL and in-memory implementations.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use salesflow_core::{
    DailyMetric, DailyTotals, DateRange, NewProduct, NewSale, NewSource, Product, Sale, Source,
};
use serde::Serialize;
use thiserror::Error;

pub use memory::MemorySalesStore;
pub use postgres::PgSalesStore;

pub const CRATE_NAME: &str = "salesflow-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} {key} does not exist")]
    Missing { entity: &'static str, key: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Sale joined with its product and source, as listed by reporting views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaleListing {
    pub date: NaiveDate,
    pub sku: String,
    pub product_name: String,
    pub category: String,
    pub source_name: String,
    pub quantity: i64,
    pub revenue: Decimal,
}

/// Revenue and units summed under one grouping label (product name or category).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupedRevenue {
    pub label: String,
    pub total_revenue: Decimal,
    pub total_quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevenueTotals {
    pub sale_count: i64,
    pub total_revenue: Decimal,
    pub average_revenue: Decimal,
}

/// Everything the pipeline and the read-only reporting surfaces need from the store.
///
/// The `get_or_create_*` methods are create-if-absent: an existing row is
/// returned untouched with `created == false`. Implementations must keep
/// that atomic per row so concurrent writers cannot duplicate a key.
#[async_trait]
pub trait SalesStore: Send + Sync {
    async fn source_by_name(&self, name: &str) -> Result<Option<Source>, StoreError>;

    /// Inserts the source if its name is unknown, otherwise returns the stored row.
    async fn ensure_source(&self, source: &NewSource) -> Result<Source, StoreError>;

    /// Moves the watermark to `at`. A watermark never moves backwards.
    async fn set_watermark(&self, source_id: i64, at: DateTime<Utc>) -> Result<Source, StoreError>;

    async fn get_or_create_product(
        &self,
        product: &NewProduct,
    ) -> Result<(Product, bool), StoreError>;

    async fn get_or_create_sale(&self, sale: &NewSale) -> Result<(Sale, bool), StoreError>;

    /// Sales dated inside `range`, all sources and products.
    async fn sales_between(&self, range: DateRange) -> Result<Vec<Sale>, StoreError>;

    async fn upsert_daily_metric(&self, totals: &DailyTotals) -> Result<DailyMetric, StoreError>;

    async fn daily_metric(&self, date: NaiveDate) -> Result<Option<DailyMetric>, StoreError>;

    async fn count_products(&self) -> Result<i64, StoreError>;

    async fn count_sales(&self) -> Result<i64, StoreError>;

    /// Listing ordered by date, then SKU.
    async fn sales_in_range(&self, range: DateRange) -> Result<Vec<SaleListing>, StoreError>;

    /// Best sellers by revenue, grouped by product name.
    async fn top_products(&self, limit: usize) -> Result<Vec<GroupedRevenue>, StoreError>;

    async fn category_breakdown(&self) -> Result<Vec<GroupedRevenue>, StoreError>;

    async fn revenue_totals(&self) -> Result<RevenueTotals, StoreError>;
}

/// Descending revenue, label as tie-breaker.
pub(crate) fn sort_grouped(rows: &mut [GroupedRevenue]) {
    rows.sort_by(|a, b| {
        b.total_revenue
            .cmp(&a.total_revenue)
            .then_with(|| a.label.cmp(&b.label))
    });
}
