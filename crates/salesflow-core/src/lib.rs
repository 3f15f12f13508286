//! Core domain model for SalesFlow: persisted entities, pipeline record types, errors.

use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "salesflow-core";

/// Calendar date format accepted on every external surface.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// External feed registered in the store. `last_sync` is the watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub api_endpoint: String,
    pub api_key: String,
    pub is_active: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn has_endpoint(&self) -> bool {
        !self.api_endpoint.trim().is_empty()
    }
}

/// Registration payload for a source; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSource {
    pub name: String,
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub category: String,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes used only when a product with this SKU does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProduct {
    pub sku: String,
    pub name: String,
    pub category: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    pub id: i64,
    pub product_id: i64,
    pub source_id: i64,
    pub date: NaiveDate,
    pub quantity: i64,
    pub revenue: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Sale keyed by `(product_id, date, source_id)`.
///
/// `revenue` left as `None` is derived from the product price when the row
/// is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSale {
    pub product_id: i64,
    pub source_id: i64,
    pub date: NaiveDate,
    pub quantity: i64,
    pub revenue: Option<Decimal>,
}

impl NewSale {
    pub fn resolved_revenue(&self, unit_price: Decimal) -> Decimal {
        self.revenue
            .unwrap_or_else(|| unit_price * Decimal::from(self.quantity))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyMetric {
    pub id: i64,
    pub date: NaiveDate,
    pub total_revenue: Decimal,
    pub total_orders: i64,
    pub avg_order_value: Decimal,
    pub products_sold: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Freshly computed values for one day, before they are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTotals {
    pub date: NaiveDate,
    pub total_revenue: Decimal,
    pub total_orders: i64,
    pub avg_order_value: Decimal,
    pub products_sold: i64,
}

impl DailyTotals {
    /// Folds the sales of a single day. Returns `None` for an empty slice.
    pub fn from_sales(date: NaiveDate, sales: &[Sale]) -> Option<Self> {
        if sales.is_empty() {
            return None;
        }
        let total_revenue: Decimal = sales.iter().map(|s| s.revenue).sum();
        let total_orders = sales.len() as i64;
        let products_sold = sales.iter().map(|s| s.quantity).sum();
        Some(Self {
            date,
            total_revenue,
            total_orders,
            avg_order_value: average_order_value(total_revenue, total_orders),
            products_sold,
        })
    }
}

/// `total_revenue / total_orders` at money scale, `0` when there are no orders.
pub fn average_order_value(total_revenue: Decimal, total_orders: i64) -> Decimal {
    if total_orders <= 0 {
        return Decimal::ZERO;
    }
    (total_revenue / Decimal::from(total_orders))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Flat record as handed over by an extractor.
///
/// Everything is optional and the numeric columns are untyped JSON, so the
/// transformer decides what survives cleaning.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawSaleRecord {
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price: Option<JsonValue>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub quantity: Option<JsonValue>,
    #[serde(default)]
    pub revenue: Option<JsonValue>,
}

/// One cleaned row per `(sku, date)`, ready for loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedSale {
    pub sku: String,
    pub date: NaiveDate,
    pub product_name: String,
    pub category: String,
    pub price: Decimal,
    pub quantity: i64,
    pub revenue: Decimal,
}

impl AggregatedSale {
    pub fn new_product(&self) -> NewProduct {
        NewProduct {
            sku: self.sku.clone(),
            name: self.product_name.clone(),
            category: self.category.clone(),
            price: self.price,
        }
    }
}

/// Inclusive calendar range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Range of `days` days before `end` through `end`.
    pub fn trailing(end: NaiveDate, days: u32) -> Self {
        Self {
            start: end - Duration::days(i64::from(days)),
            end,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Every day in the range, oldest first. Empty when `start > end`.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}..={}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

pub fn parse_date_arg(input: &str) -> Result<NaiveDate, EtlError> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT)
        .map_err(|_| EtlError::InvalidDateFormat(input.to_string()))
}

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("data source {0} not found")]
    SourceNotFound(String),
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDateFormat(String),
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),
    #[error("load failed: {0}")]
    LoadFailure(String),
}

/// Time source for watermarks and trailing windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sale(revenue: Decimal, quantity: i64) -> Sale {
        Sale {
            id: 0,
            product_id: 1,
            source_id: 1,
            date: day(2024, 1, 1),
            quantity,
            revenue,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn date_args_must_be_iso_calendar_dates() {
        assert_eq!(parse_date_arg("2024-01-02").unwrap(), day(2024, 1, 2));
        assert!(matches!(
            parse_date_arg("02/01/2024"),
            Err(EtlError::InvalidDateFormat(s)) if s == "02/01/2024"
        ));
        assert!(parse_date_arg("2024-02-30").is_err());
    }

    #[test]
    fn date_range_days_are_inclusive() {
        let range = DateRange::new(day(2024, 1, 30), day(2024, 2, 2));
        let days: Vec<_> = range.days().collect();
        assert_eq!(days.len(), 4);
        assert_eq!(days.last(), Some(&day(2024, 2, 2)));

        let inverted = DateRange::new(day(2024, 1, 3), day(2024, 1, 1));
        assert!(inverted.is_empty());
        assert_eq!(inverted.days().count(), 0);
    }

    #[test]
    fn trailing_window_spans_thirty_one_days() {
        let range = DateRange::trailing(day(2024, 3, 31), 30);
        assert_eq!(range.start, day(2024, 3, 1));
        assert_eq!(range.days().count(), 31);
    }

    #[test]
    fn daily_totals_follow_average_formula() {
        let sales = vec![sale(dec!(100), 1), sale(dec!(150), 2), sale(dec!(50), 4)];
        let totals = DailyTotals::from_sales(day(2024, 1, 1), &sales).unwrap();
        assert_eq!(totals.total_revenue, dec!(300));
        assert_eq!(totals.total_orders, 3);
        assert_eq!(totals.products_sold, 7);
        assert_eq!(totals.avg_order_value, dec!(100));
        assert!(DailyTotals::from_sales(day(2024, 1, 1), &[]).is_none());
        assert_eq!(average_order_value(dec!(10), 0), Decimal::ZERO);
        assert_eq!(average_order_value(dec!(10), 3), dec!(3.33));
        assert_eq!(average_order_value(dec!(4799.97), 2), dec!(2399.99));
    }

    #[test]
    fn missing_revenue_is_derived_from_price() {
        let new_sale = NewSale {
            product_id: 1,
            source_id: 1,
            date: day(2024, 1, 1),
            quantity: 3,
            revenue: None,
        };
        assert_eq!(new_sale.resolved_revenue(dec!(799.99)), dec!(2399.97));
        let explicit = NewSale {
            revenue: Some(dec!(10)),
            ..new_sale
        };
        assert_eq!(explicit.resolved_revenue(dec!(799.99)), dec!(10));
    }

    #[test]
    fn fixed_clock_advances_on_demand() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 2, 23, 0, 0).unwrap());
        assert_eq!(clock.today(), day(2024, 1, 2));
        clock.advance(Duration::hours(2));
        assert_eq!(clock.today(), day(2024, 1, 3));
    }
}
