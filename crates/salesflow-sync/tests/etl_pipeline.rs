use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use salesflow_adapters::{CatalogProduct, ExtractError, Extractor, SyntheticExtractor};
use salesflow_core::{DateRange, EtlError, FixedClock, NewSource, RawSaleRecord, Source};
use salesflow_storage::{MemorySalesStore, SalesStore};
use salesflow_sync::{EtlPipeline, PipelineSettings};

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

fn two_product_feed() -> SyntheticExtractor {
    SyntheticExtractor::new(vec![
        CatalogProduct::new("PROD001", "iPhone 14", "Smartphones", dec!(799.99)),
        CatalogProduct::new("PROD003", "MacBook Pro", "Laptops", dec!(1999.99)),
    ])
}

async fn seeded_store(is_active: bool) -> Arc<MemorySalesStore> {
    let store = Arc::new(MemorySalesStore::new());
    store
        .ensure_source(&NewSource {
            name: "mock_api".into(),
            api_endpoint: String::new(),
            api_key: String::new(),
            is_active,
        })
        .await
        .unwrap();
    store
}

fn pipeline(store: &Arc<MemorySalesStore>, clock: &Arc<FixedClock>) -> EtlPipeline {
    EtlPipeline::new(store.clone(), PipelineSettings::default())
        .with_clock(clock.clone())
        .with_extractor(Arc::new(two_product_feed()))
}

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap()))
}

#[tokio::test]
async fn mock_source_two_days_two_products() {
    let store = seeded_store(true).await;
    let clock = clock();

    let summary = pipeline(&store, &clock)
        .run("mock_api", Some("2024-01-01"), Some("2024-01-02"))
        .await
        .unwrap();

    assert_eq!(summary.range, DateRange::new(day(1), day(2)));
    assert_eq!(summary.raw_records, 4);
    assert_eq!(summary.created_products, 2);
    assert_eq!(summary.created_sales, 4);
    assert_eq!(store.products().await.len(), 2);
    assert_eq!(store.sales().await.len(), 4);

    let metrics = store.daily_metrics().await;
    assert_eq!(metrics.len(), 2);
    let sales = store.sales().await;
    for metric in &metrics {
        let day_sales: Vec<_> = sales.iter().filter(|s| s.date == metric.date).collect();
        let revenue: Decimal = day_sales.iter().map(|s| s.revenue).sum();
        let units: i64 = day_sales.iter().map(|s| s.quantity).sum();
        let expected_units = SyntheticExtractor::quantity_for("PROD001", metric.date)
            + SyntheticExtractor::quantity_for("PROD003", metric.date);

        assert_eq!(day_sales.len(), 2);
        assert_eq!(metric.total_orders, 2);
        assert_eq!(metric.total_revenue, revenue);
        assert_eq!(metric.products_sold, units);
        assert_eq!(metric.products_sold, expected_units);
    }
    assert_eq!(summary.metrics_recomputed, 2);

    let source = store.source_by_name("mock_api").await.unwrap().unwrap();
    assert_eq!(source.last_sync, Some(Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap()));
    assert_eq!(summary.watermark, source.last_sync);
}

#[tokio::test]
async fn rerunning_the_same_range_creates_nothing() {
    let store = seeded_store(true).await;
    let clock = clock();
    let pipeline = pipeline(&store, &clock);

    pipeline
        .run("mock_api", Some("2024-01-01"), Some("2024-01-02"))
        .await
        .unwrap();
    let sales = store.sales().await;
    let again = pipeline
        .run("mock_api", Some("2024-01-01"), Some("2024-01-02"))
        .await
        .unwrap();

    assert_eq!(again.created_sales, 0);
    assert_eq!(again.created_products, 0);
    assert_eq!(store.sales().await, sales);
}

#[tokio::test]
async fn default_range_starts_at_the_watermark() {
    let store = seeded_store(true).await;
    let clock = clock();
    let pipeline = pipeline(&store, &clock);
    pipeline
        .run("mock_api", Some("2024-01-01"), Some("2024-01-02"))
        .await
        .unwrap();

    clock.set(Utc.with_ymd_and_hms(2024, 1, 4, 6, 0, 0).unwrap());
    let summary = pipeline.run("mock_api", None, None).await.unwrap();

    assert_eq!(summary.range, DateRange::new(day(2), day(4)));
    assert_eq!(summary.created_sales, 4);
    assert_eq!(store.sales().await.len(), 8);
}

#[tokio::test]
async fn unknown_source_fails_without_writes() {
    let store = seeded_store(true).await;
    let err = pipeline(&store, &clock())
        .run("nope", Some("2024-01-01"), Some("2024-01-02"))
        .await
        .unwrap_err();

    assert!(matches!(err, EtlError::SourceNotFound(name) if name == "nope"));
    assert!(store.sales().await.is_empty());
}

#[tokio::test]
async fn malformed_date_fails_before_extraction() {
    let store = seeded_store(true).await;
    let err = pipeline(&store, &clock())
        .run("mock_api", Some("01/01/2024"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, EtlError::InvalidDateFormat(_)));
    assert!(store.sales().await.is_empty());
    assert_eq!(store.source_by_name("mock_api").await.unwrap().unwrap().last_sync, None);
}

#[tokio::test]
async fn inverted_range_loads_nothing() {
    let store = seeded_store(true).await;
    let summary = pipeline(&store, &clock())
        .run("mock_api", Some("2024-01-05"), Some("2024-01-01"))
        .await
        .unwrap();

    assert_eq!(summary.raw_records, 0);
    assert!(store.sales().await.is_empty());
    assert_eq!(summary.watermark, None);
}

#[tokio::test]
async fn inactive_source_still_runs_on_request() {
    let store = seeded_store(false).await;
    let summary = pipeline(&store, &clock())
        .run("mock_api", Some("2024-01-01"), Some("2024-01-01"))
        .await
        .unwrap();
    assert_eq!(summary.created_sales, 2);
}

struct BrokenFeed;

#[async_trait]
impl Extractor for BrokenFeed {
    fn kind(&self) -> &'static str {
        "broken"
    }

    async fn fetch(
        &self,
        source: &Source,
        _range: &DateRange,
    ) -> Result<Vec<RawSaleRecord>, ExtractError> {
        Err(ExtractError::Malformed {
            source_name: source.name.clone(),
            message: "upstream returned html".into(),
        })
    }
}

#[tokio::test]
async fn extractor_errors_surface_as_extraction_failure() {
    let store = seeded_store(true).await;
    let err = EtlPipeline::new(store.clone(), PipelineSettings::default())
        .with_clock(clock())
        .with_extractor(Arc::new(BrokenFeed))
        .run("mock_api", Some("2024-01-01"), Some("2024-01-02"))
        .await
        .unwrap_err();

    assert!(matches!(err, EtlError::ExtractionFailure(msg) if msg.contains("upstream returned html")));
    assert!(store.sales().await.is_empty());
}
