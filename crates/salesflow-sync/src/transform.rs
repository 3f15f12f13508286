//! Cleaning and per-product-day aggregation of raw extractor output.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use salesflow_core::{AggregatedSale, RawSaleRecord, DATE_FORMAT};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

/// Record that survived cleaning, not yet aggregated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanRecord {
    pub sku: String,
    pub date: NaiveDate,
    pub product_name: String,
    pub category: String,
    pub price: Decimal,
    pub quantity: i64,
    pub revenue: Decimal,
}

/// Numeric coercion for untyped JSON: numbers and numeric strings, nothing else.
pub fn coerce_decimal(value: &JsonValue) -> Option<Decimal> {
    let text = match value {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.trim().to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Quantities must be whole numbers; `"3"`, `3` and `3.0` all coerce to 3.
pub fn coerce_quantity(value: &JsonValue) -> Option<i64> {
    let number = coerce_decimal(value)?;
    if !number.fract().is_zero() {
        return None;
    }
    i64::try_from(number.trunc()).ok()
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Drops a record with any missing or non-coercible field, a non-positive
/// quantity, or a non-positive price.
pub fn clean_record(raw: &RawSaleRecord) -> Option<CleanRecord> {
    let sku = non_blank(&raw.sku)?;
    let product_name = raw.product_name.clone()?;
    let category = raw.category.clone()?;
    let date = NaiveDate::parse_from_str(raw.date.as_deref()?.trim(), DATE_FORMAT).ok()?;
    let quantity = coerce_quantity(raw.quantity.as_ref()?)?;
    let price = coerce_decimal(raw.price.as_ref()?)?;
    let revenue = coerce_decimal(raw.revenue.as_ref()?)?;

    if quantity <= 0 || price <= Decimal::ZERO {
        return None;
    }

    Some(CleanRecord {
        sku,
        date,
        product_name,
        category,
        price,
        quantity,
        revenue,
    })
}

/// Collapses cleaned records to one row per `(sku, date)`, summing quantity
/// and revenue. Name, category and price are taken from the first record of
/// each group. Output is ordered by `(sku, date)`.
///
/// A group whose quantity or revenue sum overflows is dropped whole.
pub fn aggregate(records: impl IntoIterator<Item = CleanRecord>) -> Vec<AggregatedSale> {
    let mut groups: BTreeMap<(String, NaiveDate), Option<AggregatedSale>> = BTreeMap::new();
    for record in records {
        let key = (record.sku.clone(), record.date);
        match groups.get_mut(&key) {
            None => {
                groups.insert(
                    key,
                    Some(AggregatedSale {
                        sku: record.sku,
                        date: record.date,
                        product_name: record.product_name,
                        category: record.category,
                        price: record.price,
                        quantity: record.quantity,
                        revenue: record.revenue,
                    }),
                );
            }
            Some(slot) => {
                let Some(row) = slot.as_mut() else { continue };
                let summed = row
                    .quantity
                    .checked_add(record.quantity)
                    .zip(row.revenue.checked_add(record.revenue));
                match summed {
                    Some((quantity, revenue)) => {
                        row.quantity = quantity;
                        row.revenue = revenue;
                    }
                    None => {
                        warn!(sku = %record.sku, date = %record.date, "sales total overflows; dropping group");
                        *slot = None;
                    }
                }
            }
        }
    }
    groups.into_values().flatten().collect()
}

pub fn transform(raw: &[RawSaleRecord]) -> Vec<AggregatedSale> {
    if raw.is_empty() {
        return Vec::new();
    }
    let cleaned: Vec<CleanRecord> = raw.iter().filter_map(clean_record).collect();
    let dropped = raw.len() - cleaned.len();
    if dropped > 0 {
        debug!(dropped, "dropped invalid raw records");
    }
    let rows = aggregate(cleaned);
    info!(raw = raw.len(), dropped, rows = rows.len(), "transformed raw records");
    rows
}
