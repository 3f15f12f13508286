use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use salesflow_core::{
    average_order_value, DailyMetric, DailyTotals, DateRange, NewProduct, NewSale, NewSource,
    Product, Sale, Source,
};
use tokio::sync::Mutex;

use crate::{sort_grouped, GroupedRevenue, RevenueTotals, SaleListing, SalesStore, StoreError};

/// Process-local `SalesStore` with the same uniqueness rules as the database.
///
/// Used by tests and dry runs. A sale insert budget can be set to simulate the
/// store going away halfway through a load.
#[derive(Debug, Default)]
pub struct MemorySalesStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    sources: Vec<Source>,
    products: BTreeMap<String, Product>,
    sales: BTreeMap<(i64, NaiveDate, i64), Sale>,
    metrics: BTreeMap<NaiveDate, DailyMetric>,
    sale_insert_budget: Option<usize>,
}

/// Money columns are `NUMERIC(_, 2)`; PostgreSQL rounds half away from zero on insert.
fn to_column_scale(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn product_by_id(&self, id: i64) -> Option<&Product> {
        self.products.values().find(|p| p.id == id)
    }
}

impl MemorySalesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// After `remaining` more sale inserts every further insert fails.
    pub async fn fail_sale_inserts_after(&self, remaining: usize) {
        self.state.lock().await.sale_insert_budget = Some(remaining);
    }

    pub async fn sources(&self) -> Vec<Source> {
        self.state.lock().await.sources.clone()
    }

    pub async fn products(&self) -> Vec<Product> {
        self.state.lock().await.products.values().cloned().collect()
    }

    pub async fn sales(&self) -> Vec<Sale> {
        self.state.lock().await.sales.values().cloned().collect()
    }

    pub async fn daily_metrics(&self) -> Vec<DailyMetric> {
        self.state.lock().await.metrics.values().cloned().collect()
    }

    /// Writes a metric row directly, bypassing the recomputer.
    pub async fn put_daily_metric(&self, metric: DailyMetric) {
        self.state.lock().await.metrics.insert(metric.date, metric);
    }
}

#[async_trait]
impl SalesStore for MemorySalesStore {
    async fn source_by_name(&self, name: &str) -> Result<Option<Source>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sources.iter().find(|s| s.name == name).cloned())
    }

    async fn ensure_source(&self, source: &NewSource) -> Result<Source, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.sources.iter().find(|s| s.name == source.name) {
            return Ok(existing.clone());
        }
        let id = state.next_id();
        let created = Source {
            id,
            name: source.name.clone(),
            api_endpoint: source.api_endpoint.clone(),
            api_key: source.api_key.clone(),
            is_active: source.is_active,
            last_sync: None,
            created_at: Utc::now(),
        };
        state.sources.push(created.clone());
        Ok(created)
    }

    async fn set_watermark(&self, source_id: i64, at: DateTime<Utc>) -> Result<Source, StoreError> {
        let mut state = self.state.lock().await;
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == source_id)
            .ok_or_else(|| StoreError::Missing {
                entity: "source",
                key: source_id.to_string(),
            })?;
        source.last_sync = Some(source.last_sync.map_or(at, |prev| prev.max(at)));
        Ok(source.clone())
    }

    async fn get_or_create_product(
        &self,
        product: &NewProduct,
    ) -> Result<(Product, bool), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.products.get(&product.sku) {
            return Ok((existing.clone(), false));
        }
        let id = state.next_id();
        let now = Utc::now();
        let created = Product {
            id,
            sku: product.sku.clone(),
            name: product.name.clone(),
            category: product.category.clone(),
            price: to_column_scale(product.price),
            created_at: now,
            updated_at: now,
        };
        state.products.insert(product.sku.clone(), created.clone());
        Ok((created, true))
    }

    async fn get_or_create_sale(&self, sale: &NewSale) -> Result<(Sale, bool), StoreError> {
        let mut state = self.state.lock().await;
        let key = (sale.product_id, sale.date, sale.source_id);
        if let Some(existing) = state.sales.get(&key) {
            return Ok((existing.clone(), false));
        }
        let price = state
            .product_by_id(sale.product_id)
            .map(|p| p.price)
            .ok_or_else(|| StoreError::Missing {
                entity: "product",
                key: sale.product_id.to_string(),
            })?;
        if let Some(remaining) = state.sale_insert_budget.as_mut() {
            if *remaining == 0 {
                return Err(StoreError::Unavailable(
                    "sale insert budget exhausted".to_string(),
                ));
            }
            *remaining -= 1;
        }
        let id = state.next_id();
        let created = Sale {
            id,
            product_id: sale.product_id,
            source_id: sale.source_id,
            date: sale.date,
            quantity: sale.quantity,
            revenue: to_column_scale(sale.resolved_revenue(price)),
            created_at: Utc::now(),
        };
        state.sales.insert(key, created.clone());
        Ok((created, true))
    }

    async fn sales_between(&self, range: DateRange) -> Result<Vec<Sale>, StoreError> {
        let state = self.state.lock().await;
        let mut out: Vec<Sale> = state
            .sales
            .values()
            .filter(|s| range.contains(s.date))
            .cloned()
            .collect();
        out.sort_by_key(|s| (s.date, s.id));
        Ok(out)
    }

    async fn upsert_daily_metric(&self, totals: &DailyTotals) -> Result<DailyMetric, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let (id, created_at) = match state.metrics.get(&totals.date) {
            Some(existing) => (existing.id, existing.created_at),
            None => (state.next_id(), now),
        };
        let metric = DailyMetric {
            id,
            date: totals.date,
            total_revenue: totals.total_revenue,
            total_orders: totals.total_orders,
            avg_order_value: totals.avg_order_value,
            products_sold: totals.products_sold,
            created_at,
            updated_at: now,
        };
        state.metrics.insert(totals.date, metric.clone());
        Ok(metric)
    }

    async fn daily_metric(&self, date: NaiveDate) -> Result<Option<DailyMetric>, StoreError> {
        Ok(self.state.lock().await.metrics.get(&date).cloned())
    }

    async fn count_products(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.products.len() as i64)
    }

    async fn count_sales(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.sales.len() as i64)
    }

    async fn sales_in_range(&self, range: DateRange) -> Result<Vec<SaleListing>, StoreError> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        for sale in state.sales.values().filter(|s| range.contains(s.date)) {
            let Some(product) = state.product_by_id(sale.product_id) else {
                continue;
            };
            let source_name = state
                .sources
                .iter()
                .find(|s| s.id == sale.source_id)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            out.push(SaleListing {
                date: sale.date,
                sku: product.sku.clone(),
                product_name: product.name.clone(),
                category: product.category.clone(),
                source_name,
                quantity: sale.quantity,
                revenue: sale.revenue,
            });
        }
        out.sort_by(|a, b| {
            (a.date, &a.sku, &a.source_name).cmp(&(b.date, &b.sku, &b.source_name))
        });
        Ok(out)
    }

    async fn top_products(&self, limit: usize) -> Result<Vec<GroupedRevenue>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = group_sales(&state, |p| p.name.clone());
        rows.truncate(limit);
        Ok(rows)
    }

    async fn category_breakdown(&self) -> Result<Vec<GroupedRevenue>, StoreError> {
        let state = self.state.lock().await;
        Ok(group_sales(&state, |p| p.category.clone()))
    }

    async fn revenue_totals(&self) -> Result<RevenueTotals, StoreError> {
        let state = self.state.lock().await;
        let sale_count = state.sales.len() as i64;
        let total_revenue: Decimal = state.sales.values().map(|s| s.revenue).sum();
        Ok(RevenueTotals {
            sale_count,
            total_revenue,
            average_revenue: average_order_value(total_revenue, sale_count),
        })
    }
}

fn group_sales(state: &MemoryState, label: impl Fn(&Product) -> String) -> Vec<GroupedRevenue> {
    let mut groups: HashMap<String, (Decimal, i64)> = HashMap::new();
    for sale in state.sales.values() {
        let Some(product) = state.product_by_id(sale.product_id) else {
            continue;
        };
        let entry = groups.entry(label(product)).or_default();
        entry.0 += sale.revenue;
        entry.1 += sale.quantity;
    }
    let mut rows: Vec<GroupedRevenue> = groups
        .into_iter()
        .map(|(label, (total_revenue, total_quantity))| GroupedRevenue {
            label,
            total_revenue,
            total_quantity,
        })
        .collect();
    sort_grouped(&mut rows);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    async fn seeded() -> (MemorySalesStore, Source, Product) {
        let store = MemorySalesStore::new();
        let source = store
            .ensure_source(&NewSource {
                name: "mock_api".into(),
                api_endpoint: String::new(),
                api_key: String::new(),
                is_active: true,
            })
            .await
            .unwrap();
        let (product, _) = store
            .get_or_create_product(&NewProduct {
                sku: "PROD001".into(),
                name: "iPhone 14".into(),
                category: "Smartphones".into(),
                price: dec!(799.99),
            })
            .await
            .unwrap();
        (store, source, product)
    }

    #[tokio::test]
    async fn duplicate_sale_key_keeps_single_row() {
        let (store, source, product) = seeded().await;
        let first = NewSale {
            product_id: product.id,
            source_id: source.id,
            date: day(1),
            quantity: 2,
            revenue: Some(dec!(20)),
        };
        let second = NewSale {
            quantity: 9,
            revenue: Some(dec!(90)),
            ..first.clone()
        };

        let (a, created_a) = store.get_or_create_sale(&first).await.unwrap();
        let (b, created_b) = store.get_or_create_sale(&second).await.unwrap();

        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a, b);
        assert_eq!(b.quantity, 2);
        assert_eq!(store.count_sales().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn product_attributes_are_first_write_wins() {
        let (store, _source, product) = seeded().await;
        let (again, created) = store
            .get_or_create_product(&NewProduct {
                sku: "PROD001".into(),
                name: "Renamed".into(),
                category: "Other".into(),
                price: dec!(1),
            })
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again, product);
    }

    #[tokio::test]
    async fn sale_without_revenue_uses_product_price() {
        let (store, source, product) = seeded().await;
        let (sale, _) = store
            .get_or_create_sale(&NewSale {
                product_id: product.id,
                source_id: source.id,
                date: day(2),
                quantity: 2,
                revenue: None,
            })
            .await
            .unwrap();
        assert_eq!(sale.revenue, dec!(1599.98));
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let (store, source, _product) = seeded().await;
        let later = DateTime::parse_from_rfc3339("2024-01-05T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let earlier = DateTime::parse_from_rfc3339("2024-01-03T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        store.set_watermark(source.id, later).await.unwrap();
        let after = store.set_watermark(source.id, earlier).await.unwrap();
        assert_eq!(after.last_sync, Some(later));

        let err = store.set_watermark(999, later).await.unwrap_err();
        assert!(matches!(err, StoreError::Missing { entity: "source", .. }));
    }

    #[tokio::test]
    async fn reporting_queries_group_and_order() {
        let (store, source, iphone) = seeded().await;
        let (laptop, _) = store
            .get_or_create_product(&NewProduct {
                sku: "PROD003".into(),
                name: "MacBook Pro".into(),
                category: "Laptops".into(),
                price: dec!(1999.99),
            })
            .await
            .unwrap();
        for (product, date, quantity) in [(&iphone, day(2), 1), (&laptop, day(1), 2), (&iphone, day(1), 3)] {
            store
                .get_or_create_sale(&NewSale {
                    product_id: product.id,
                    source_id: source.id,
                    date,
                    quantity,
                    revenue: None,
                })
                .await
                .unwrap();
        }

        let listing = store
            .sales_in_range(DateRange::new(day(1), day(2)))
            .await
            .unwrap();
        assert_eq!(listing.len(), 3);
        assert_eq!(listing[0].date, day(1));
        assert_eq!(listing[0].sku, "PROD001");
        assert_eq!(listing[2].date, day(2));

        let top = store.top_products(1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].label, "MacBook Pro");
        assert_eq!(top[0].total_revenue, dec!(3999.98));

        let categories = store.category_breakdown().await.unwrap();
        assert_eq!(categories[1].label, "Smartphones");
        assert_eq!(categories[1].total_quantity, 4);

        let totals = store.revenue_totals().await.unwrap();
        assert_eq!(totals.sale_count, 3);
        assert_eq!(totals.total_revenue, dec!(7199.94));
        assert_eq!(totals.average_revenue, dec!(2399.98));
    }

    #[tokio::test]
    async fn money_is_stored_at_column_scale() {
        let (store, source, _) = seeded().await;
        let (product, _) = store
            .get_or_create_product(&NewProduct {
                sku: "PROD009".into(),
                name: "Cable".into(),
                category: "Accessories".into(),
                price: dec!(0.125),
            })
            .await
            .unwrap();
        assert_eq!(product.price, dec!(0.13));

        let (explicit, _) = store
            .get_or_create_sale(&NewSale {
                product_id: product.id,
                source_id: source.id,
                date: day(1),
                quantity: 1,
                revenue: Some(dec!(10.005)),
            })
            .await
            .unwrap();
        assert_eq!(explicit.revenue, dec!(10.01));

        let (derived, _) = store
            .get_or_create_sale(&NewSale {
                product_id: product.id,
                source_id: source.id,
                date: day(2),
                quantity: 3,
                revenue: None,
            })
            .await
            .unwrap();
        assert_eq!(derived.revenue, dec!(0.39));
    }

    #[tokio::test]
    async fn insert_budget_fails_after_limit() {
        let (store, source, product) = seeded().await;
        store.fail_sale_inserts_after(1).await;
        let base = NewSale {
            product_id: product.id,
            source_id: source.id,
            date: day(1),
            quantity: 1,
            revenue: None,
        };
        store.get_or_create_sale(&base).await.unwrap();
        let err = store
            .get_or_create_sale(&NewSale {
                date: day(2),
                ..base.clone()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        // existing keys are still readable
        let (_, created) = store.get_or_create_sale(&base).await.unwrap();
        assert!(!created);
    }
}
