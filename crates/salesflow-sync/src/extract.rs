//! Date-range resolution against the watermark, then the extractor call.

use chrono::{Duration, NaiveDate};
use salesflow_adapters::Extractor;
use salesflow_core::{parse_date_arg, DateRange, EtlError, RawSaleRecord, Source};
use tracing::info;

/// Resolves the optional text bounds of a run.
///
/// Both inputs are validated before any default applies. A missing start
/// falls back to the watermark's calendar day, or `initial_lookback_days`
/// before the end for a source that never synced. A missing end is `today`.
pub fn resolve_range(
    source: &Source,
    start_date: Option<&str>,
    end_date: Option<&str>,
    today: NaiveDate,
    initial_lookback_days: u32,
) -> Result<DateRange, EtlError> {
    let start = start_date.map(parse_date_arg).transpose()?;
    let end = end_date.map(parse_date_arg).transpose()?.unwrap_or(today);
    let start = match (start, source.last_sync) {
        (Some(start), _) => start,
        (None, Some(watermark)) => watermark.date_naive(),
        (None, None) => end - Duration::days(i64::from(initial_lookback_days)),
    };
    Ok(DateRange::new(start, end))
}

pub async fn extract(
    extractor: &dyn Extractor,
    source: &Source,
    range: &DateRange,
) -> Result<Vec<RawSaleRecord>, EtlError> {
    info!(source = %source.name, extractor = extractor.kind(), %range, "extracting sales");
    if range.is_empty() {
        return Ok(Vec::new());
    }
    extractor
        .fetch(source, range)
        .await
        .map_err(|err| EtlError::ExtractionFailure(err.to_string()))
}
