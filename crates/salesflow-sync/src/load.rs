//! Idempotent loading of aggregated rows, watermark advance, rollup trigger.

use chrono::{DateTime, Utc};
use salesflow_core::{AggregatedSale, Clock, DateRange, EtlError, NewSale, Source};
use salesflow_storage::{SalesStore, StoreError};
use serde::Serialize;
use tracing::info;

use crate::rollup::{recompute, RollupReport};

#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub rows: usize,
    pub created_products: usize,
    /// Sales actually inserted; rows whose key already existed are not counted.
    pub created_sales: usize,
    /// Watermark after the load, `None` when nothing was loaded.
    pub watermark: Option<DateTime<Utc>>,
    pub rollup: Option<RollupReport>,
}

impl LoadOutcome {
    fn empty() -> Self {
        Self {
            rows: 0,
            created_products: 0,
            created_sales: 0,
            watermark: None,
            rollup: None,
        }
    }
}

fn load_failure(err: StoreError) -> EtlError {
    EtlError::LoadFailure(err.to_string())
}

/// Writes `table` for `source` with create-if-absent semantics.
///
/// An empty table is a no-op. Otherwise the watermark moves to `clock.now()`
/// once after all rows and the trailing `rollup_window_days` window is
/// recomputed. A store failure aborts the load; rows written before it stay.
pub async fn load(
    store: &dyn SalesStore,
    source: &Source,
    table: &[AggregatedSale],
    clock: &dyn Clock,
    rollup_window_days: u32,
) -> Result<LoadOutcome, EtlError> {
    if table.is_empty() {
        info!(source = %source.name, "nothing to load");
        return Ok(LoadOutcome::empty());
    }

    let mut created_products = 0;
    let mut created_sales = 0;
    for row in table {
        let (product, product_created) = store
            .get_or_create_product(&row.new_product())
            .await
            .map_err(load_failure)?;
        if product_created {
            created_products += 1;
        }

        let (_sale, sale_created) = store
            .get_or_create_sale(&NewSale {
                product_id: product.id,
                source_id: source.id,
                date: row.date,
                quantity: row.quantity,
                revenue: Some(row.revenue),
            })
            .await
            .map_err(load_failure)?;
        if sale_created {
            created_sales += 1;
        }
    }

    let updated = store
        .set_watermark(source.id, clock.now())
        .await
        .map_err(load_failure)?;
    info!(
        source = %source.name,
        rows = table.len(),
        created_products,
        created_sales,
        "loaded sales"
    );

    let window = DateRange::trailing(clock.today(), rollup_window_days);
    let rollup = recompute(store, window.start, window.end)
        .await
        .map_err(load_failure)?;

    Ok(LoadOutcome {
        rows: table.len(),
        created_products,
        created_sales,
        watermark: updated.last_sync,
        rollup: Some(rollup),
    })
}
