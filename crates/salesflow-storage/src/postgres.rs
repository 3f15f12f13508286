use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use salesflow_core::{
    DailyMetric, DailyTotals, DateRange, NewProduct, NewSale, NewSource, Product, Sale, Source,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::{sort_grouped, GroupedRevenue, RevenueTotals, SaleListing, SalesStore, StoreError};

const SOURCE_COLUMNS: &str = "id, name, api_endpoint, api_key, is_active, last_sync, created_at";
const PRODUCT_COLUMNS: &str = "id, sku, name, category, price, created_at, updated_at";
const SALE_COLUMNS: &str = "id, product_id, source_id, date, quantity, revenue, created_at";
const METRIC_COLUMNS: &str =
    "id, date, total_revenue, total_orders, avg_order_value, products_sold, created_at, updated_at";

/// `SalesStore` over PostgreSQL. Uniqueness is enforced by table constraints
/// and every create-if-absent is a single `INSERT .. ON CONFLICT DO NOTHING`.
#[derive(Debug, Clone)]
pub struct PgSalesStore {
    pool: PgPool,
}

impl PgSalesStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn source_from_row(row: &PgRow) -> Result<Source, sqlx::Error> {
    Ok(Source {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        api_endpoint: row.try_get("api_endpoint")?,
        api_key: row.try_get("api_key")?,
        is_active: row.try_get("is_active")?,
        last_sync: row.try_get("last_sync")?,
        created_at: row.try_get("created_at")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<Product, sqlx::Error> {
    Ok(Product {
        id: row.try_get("id")?,
        sku: row.try_get("sku")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        price: row.try_get("price")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sale_from_row(row: &PgRow) -> Result<Sale, sqlx::Error> {
    Ok(Sale {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        source_id: row.try_get("source_id")?,
        date: row.try_get("date")?,
        quantity: row.try_get("quantity")?,
        revenue: row.try_get("revenue")?,
        created_at: row.try_get("created_at")?,
    })
}

fn metric_from_row(row: &PgRow) -> Result<DailyMetric, sqlx::Error> {
    Ok(DailyMetric {
        id: row.try_get("id")?,
        date: row.try_get("date")?,
        total_revenue: row.try_get("total_revenue")?,
        total_orders: row.try_get("total_orders")?,
        avg_order_value: row.try_get("avg_order_value")?,
        products_sold: row.try_get("products_sold")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn grouped_from_row(row: &PgRow) -> Result<GroupedRevenue, sqlx::Error> {
    Ok(GroupedRevenue {
        label: row.try_get("label")?,
        total_revenue: row.try_get("total_revenue")?,
        total_quantity: row.try_get("total_quantity")?,
    })
}

#[async_trait]
impl SalesStore for PgSalesStore {
    async fn source_by_name(&self, name: &str) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(source_from_row).transpose()?)
    }

    async fn ensure_source(&self, source: &NewSource) -> Result<Source, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sources (name, api_endpoint, api_key, is_active)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&source.name)
        .bind(&source.api_endpoint)
        .bind(&source.api_key)
        .bind(source.is_active)
        .execute(&self.pool)
        .await?;

        self.source_by_name(&source.name)
            .await?
            .ok_or_else(|| StoreError::Missing {
                entity: "source",
                key: source.name.clone(),
            })
    }

    async fn set_watermark(&self, source_id: i64, at: DateTime<Utc>) -> Result<Source, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sources
               SET last_sync = GREATEST(COALESCE(last_sync, $2), $2)
             WHERE id = $1
            RETURNING {SOURCE_COLUMNS}
            "#
        ))
        .bind(source_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(source_from_row(&row)?),
            None => Err(StoreError::Missing {
                entity: "source",
                key: source_id.to_string(),
            }),
        }
    }

    async fn get_or_create_product(
        &self,
        product: &NewProduct,
    ) -> Result<(Product, bool), StoreError> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO products (sku, name, category, price)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (sku) DO NOTHING
            RETURNING {PRODUCT_COLUMNS}
            "#
        ))
        .bind(&product.sku)
        .bind(&product.name)
        .bind(&product.category)
        .bind(product.price)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((product_from_row(&row)?, true));
        }

        let row = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE sku = $1"))
            .bind(&product.sku)
            .fetch_one(&self.pool)
            .await?;
        Ok((product_from_row(&row)?, false))
    }

    async fn get_or_create_sale(&self, sale: &NewSale) -> Result<(Sale, bool), StoreError> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO sales (product_id, source_id, date, quantity, revenue)
            SELECT p.id, $2, $3, $4, COALESCE($5, p.price * $4)
              FROM products p
             WHERE p.id = $1
            ON CONFLICT (product_id, date, source_id) DO NOTHING
            RETURNING {SALE_COLUMNS}
            "#
        ))
        .bind(sale.product_id)
        .bind(sale.source_id)
        .bind(sale.date)
        .bind(sale.quantity)
        .bind(sale.revenue)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((sale_from_row(&row)?, true));
        }

        let existing = sqlx::query(&format!(
            r#"
            SELECT {SALE_COLUMNS}
              FROM sales
             WHERE product_id = $1 AND date = $2 AND source_id = $3
            "#
        ))
        .bind(sale.product_id)
        .bind(sale.date)
        .bind(sale.source_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some(row) => Ok((sale_from_row(&row)?, false)),
            None => Err(StoreError::Missing {
                entity: "product",
                key: sale.product_id.to_string(),
            }),
        }
    }

    async fn sales_between(&self, range: DateRange) -> Result<Vec<Sale>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SALE_COLUMNS}
              FROM sales
             WHERE date >= $1 AND date <= $2
             ORDER BY date, id
            "#
        ))
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(sale_from_row).collect::<Result<_, _>>()?)
    }

    async fn upsert_daily_metric(&self, totals: &DailyTotals) -> Result<DailyMetric, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO daily_metrics (date, total_revenue, total_orders, avg_order_value, products_sold)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (date) DO UPDATE SET
                total_revenue = EXCLUDED.total_revenue,
                total_orders = EXCLUDED.total_orders,
                avg_order_value = EXCLUDED.avg_order_value,
                products_sold = EXCLUDED.products_sold,
                updated_at = now()
            RETURNING {METRIC_COLUMNS}
            "#
        ))
        .bind(totals.date)
        .bind(totals.total_revenue)
        .bind(totals.total_orders)
        .bind(totals.avg_order_value)
        .bind(totals.products_sold)
        .fetch_one(&self.pool)
        .await?;
        Ok(metric_from_row(&row)?)
    }

    async fn daily_metric(&self, date: NaiveDate) -> Result<Option<DailyMetric>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM daily_metrics WHERE date = $1"
        ))
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(metric_from_row).transpose()?)
    }

    async fn count_products(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_sales(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sales")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn sales_in_range(&self, range: DateRange) -> Result<Vec<SaleListing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.date, p.sku, p.name AS product_name, p.category,
                   src.name AS source_name, s.quantity, s.revenue
              FROM sales s
              JOIN products p ON p.id = s.product_id
              JOIN sources src ON src.id = s.source_id
             WHERE s.date >= $1 AND s.date <= $2
             ORDER BY s.date, p.sku, src.name
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SaleListing {
                date: row.try_get("date")?,
                sku: row.try_get("sku")?,
                product_name: row.try_get("product_name")?,
                category: row.try_get("category")?,
                source_name: row.try_get("source_name")?,
                quantity: row.try_get("quantity")?,
                revenue: row.try_get("revenue")?,
            });
        }
        Ok(out)
    }

    async fn top_products(&self, limit: usize) -> Result<Vec<GroupedRevenue>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.name AS label,
                   SUM(s.revenue) AS total_revenue,
                   SUM(s.quantity)::BIGINT AS total_quantity
              FROM sales s
              JOIN products p ON p.id = s.product_id
             GROUP BY p.name
             ORDER BY total_revenue DESC, label
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        let mut out = rows
            .iter()
            .map(grouped_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        sort_grouped(&mut out);
        Ok(out)
    }

    async fn category_breakdown(&self) -> Result<Vec<GroupedRevenue>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p.category AS label,
                   SUM(s.revenue) AS total_revenue,
                   SUM(s.quantity)::BIGINT AS total_quantity
              FROM sales s
              JOIN products p ON p.id = s.product_id
             GROUP BY p.category
             ORDER BY total_revenue DESC, label
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(grouped_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn revenue_totals(&self) -> Result<RevenueTotals, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS sale_count,
                   COALESCE(SUM(revenue), 0) AS total_revenue,
                   COALESCE(ROUND(AVG(revenue), 2), 0) AS average_revenue
              FROM sales
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(RevenueTotals {
            sale_count: row.try_get("sale_count")?,
            total_revenue: row.try_get("total_revenue")?,
            average_revenue: row.try_get("average_revenue")?,
        })
    }
}
