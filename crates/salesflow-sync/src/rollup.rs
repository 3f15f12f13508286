//! Daily metric recomputation over a trailing window.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use salesflow_core::{DailyMetric, DailyTotals, DateRange, Sale};
use salesflow_storage::{SalesStore, StoreError};
use serde::Serialize;
use tracing::info;

/// What happened to a single day of the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "metric", rename_all = "snake_case")]
pub enum RollupOutcome {
    Recomputed(DailyMetric),
    /// No sales on this day. Any existing metric row is left as it was.
    SkippedNoData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayRollup {
    pub date: NaiveDate,
    pub outcome: RollupOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub window: DateRange,
    pub days: Vec<DayRollup>,
}

impl RollupReport {
    pub fn recomputed(&self) -> impl Iterator<Item = &DailyMetric> {
        self.days.iter().filter_map(|d| match &d.outcome {
            RollupOutcome::Recomputed(metric) => Some(metric),
            RollupOutcome::SkippedNoData => None,
        })
    }

    pub fn recomputed_count(&self) -> usize {
        self.recomputed().count()
    }

    pub fn skipped_count(&self) -> usize {
        self.days.len() - self.recomputed_count()
    }

    pub fn outcome_for(&self, date: NaiveDate) -> Option<&RollupOutcome> {
        self.days.iter().find(|d| d.date == date).map(|d| &d.outcome)
    }
}

/// Recomputes every day in `[window_start, window_end]` from the stored sales
/// and upserts one metric row per day that has sales.
pub async fn recompute(
    store: &dyn SalesStore,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> Result<RollupReport, StoreError> {
    let window = DateRange::new(window_start, window_end);
    if window.is_empty() {
        return Ok(RollupReport {
            window,
            days: Vec::new(),
        });
    }

    let mut by_day: BTreeMap<NaiveDate, Vec<Sale>> = BTreeMap::new();
    for sale in store.sales_between(window).await? {
        by_day.entry(sale.date).or_default().push(sale);
    }

    let mut days = Vec::new();
    for date in window.days() {
        let sales = by_day.remove(&date).unwrap_or_default();
        let outcome = match DailyTotals::from_sales(date, &sales) {
            Some(totals) => RollupOutcome::Recomputed(store.upsert_daily_metric(&totals).await?),
            None => RollupOutcome::SkippedNoData,
        };
        days.push(DayRollup { date, outcome });
    }

    let report = RollupReport { window, days };
    info!(
        %window,
        recomputed = report.recomputed_count(),
        skipped = report.skipped_count(),
        "daily metrics recomputed"
    );
    Ok(report)
}
