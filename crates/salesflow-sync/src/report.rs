//! Plain-text summaries built from the reporting queries.

use chrono::NaiveDate;
use salesflow_core::{DateRange, DATE_FORMAT};
use salesflow_storage::{SalesStore, StoreError};

/// Markdown digest: totals, today's metric, top products, categories, and the
/// sales of the last `days` days.
pub async fn daily_report_markdown(
    store: &dyn SalesStore,
    today: NaiveDate,
    days: u32,
    top_n: usize,
) -> Result<String, StoreError> {
    let products = store.count_products().await?;
    let sales = store.count_sales().await?;
    let totals = store.revenue_totals().await?;
    let metric = store.daily_metric(today).await?;
    let top = store.top_products(top_n).await?;
    let categories = store.category_breakdown().await?;
    let recent = store.sales_in_range(DateRange::trailing(today, days)).await?;

    let mut lines = vec!["# SalesFlow Report".to_string(), String::new()];
    lines.push(format!("- Products: {products}"));
    lines.push(format!("- Sales rows: {sales}"));
    lines.push(format!("- Total revenue: {}", totals.total_revenue));
    lines.push(format!("- Average sale revenue: {}", totals.average_revenue));
    lines.push(String::new());

    lines.push(format!("## {}", today.format(DATE_FORMAT)));
    match metric {
        Some(m) => {
            lines.push(format!("- Revenue: {}", m.total_revenue));
            lines.push(format!("- Orders: {}", m.total_orders));
            lines.push(format!("- Average order value: {}", m.avg_order_value));
            lines.push(format!("- Units sold: {}", m.products_sold));
        }
        None => lines.push("- no metrics recorded".to_string()),
    }
    lines.push(String::new());

    lines.push(format!("## Top {top_n} products"));
    for (rank, row) in top.iter().enumerate() {
        lines.push(format!(
            "{}. {}: {} ({} units)",
            rank + 1,
            row.label,
            row.total_revenue,
            row.total_quantity
        ));
    }
    lines.push(String::new());

    lines.push("## Categories".to_string());
    for row in &categories {
        lines.push(format!(
            "- {}: {} ({} units)",
            row.label, row.total_revenue, row.total_quantity
        ));
    }
    lines.push(String::new());

    lines.push(format!("## Sales, last {days} days"));
    for sale in &recent {
        lines.push(format!(
            "- {} {} x{} = {} [{}]",
            sale.date.format(DATE_FORMAT),
            sale.product_name,
            sale.quantity,
            sale.revenue,
            sale.source_name
        ));
    }

    Ok(lines.join("\n"))
}
