//! End-to-end pipeline scenarios: ingest → validate → aggregate.

mod support;

use feedgate::core::domain::{AdapterEvent, FeedCategory, FeedConfig, FeedId, FeedSource};
use feedgate::error::Error;
use feedgate::testkit::price_update;

use support::{build_pipeline, NOW};

fn feed() -> FeedId {
    FeedId::new(FeedCategory::Crypto, "BTC/USD").unwrap()
}

fn catalog_with_sources(exchanges: &[&str]) -> Vec<FeedConfig> {
    vec![FeedConfig {
        feed: feed(),
        sources: exchanges
            .iter()
            .map(|e| FeedSource {
                exchange: e.to_string(),
                symbol: "BTC/USD".to_string(),
                backup: false,
            })
            .collect(),
        decimals: 8,
    }]
}

#[tokio::test]
async fn test_happy_path_two_sources() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase"]), &[]);

    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "binance", "BTC/USD", 50_000.0, NOW - 50, 0.95,
    )));
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "coinbase", "BTC/USD", 50_010.0, NOW - 60, 0.95,
    )));

    let result = pipeline.manager.current_price(&feed()).await.unwrap();
    assert!((49_990.0..=50_020.0).contains(&result.price), "price {}", result.price);
    assert_eq!(result.sources, vec!["binance".to_string(), "coinbase".to_string()]);
    assert!(result.consensus_score > 0.95, "score {}", result.consensus_score);
    assert!(result.confidence > 0.9, "confidence {}", result.confidence);
}

#[tokio::test]
async fn test_outlier_is_trimmed_at_five_sources() {
    let exchanges = ["binance", "coinbase", "kraken", "okx", "bybit"];
    let pipeline = build_pipeline(catalog_with_sources(&exchanges), &[]);

    let prices = [49_990.0, 50_000.0, 50_005.0, 50_010.0, 60_000.0];
    for (exchange, price) in exchanges.iter().zip(prices) {
        pipeline.manager.ingest(AdapterEvent::Price(price_update(
            exchange, "BTC/USD", price, NOW - 50, 0.9,
        )));
    }

    let result = pipeline.manager.current_price(&feed()).await.unwrap();
    assert!(
        !result.sources.contains(&"bybit".to_string()),
        "outlier source kept: {:?}",
        result.sources
    );
    assert!((result.price - 50_000.0).abs() < 20.0, "price {}", result.price);
    assert!(result.consensus_score > 0.9, "score {}", result.consensus_score);
}

#[tokio::test]
async fn test_cross_source_dissenter_loses_influence() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase", "kraken"]), &[]);

    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "binance", "BTC/USD", 50_000.0, NOW - 100, 0.9,
    )));
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "coinbase", "BTC/USD", 40_000.0, NOW - 120, 0.9,
    )));
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "kraken", "BTC/USD", 40_050.0, NOW - 140, 0.9,
    )));

    let result = pipeline.manager.current_price(&feed()).await.unwrap();
    // Two agreeing sources out-weigh the dissenter.
    assert!(result.price < 45_000.0, "price {}", result.price);
    assert!(!result.sources.is_empty());
}

#[tokio::test]
async fn test_stale_update_is_excluded_from_consensus() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase", "kraken"]), &[]);

    // 2.5 s old: past the validator's max age.
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "binance", "BTC/USD", 50_000.0, NOW - 2_500, 0.95,
    )));
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "coinbase", "BTC/USD", 50_010.0, NOW - 100, 0.95,
    )));
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "kraken", "BTC/USD", 50_020.0, NOW - 120, 0.95,
    )));

    let result = pipeline.manager.current_price(&feed()).await.unwrap();
    assert!(!result.sources.contains(&"binance".to_string()), "stale source kept");
    assert_eq!(result.sources.len(), 2);
}

#[tokio::test]
async fn test_no_data_surfaces_insufficient_data() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase"]), &[]);
    let result = pipeline.manager.current_price(&feed()).await;
    assert!(matches!(result, Err(Error::InsufficientData { .. })));
}

#[tokio::test]
async fn test_unknown_feed_is_rejected() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase"]), &[]);
    let unknown = FeedId::new(FeedCategory::Crypto, "DOGE/USD").unwrap();
    let result = pipeline.manager.current_price(&unknown).await;
    assert!(matches!(result, Err(Error::UnknownFeed(_))));
}

#[tokio::test]
async fn test_cold_start_falls_back_to_weighted_mean() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase"]), &[]);

    // Only one source has delivered: below min_sources, but data exists.
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "binance", "BTC/USD", 50_000.0, NOW - 50, 0.95,
    )));

    let result = pipeline.manager.current_price(&feed()).await.unwrap();
    assert!((result.price - 50_000.0).abs() < 1e-9);
    assert_eq!(result.sources, vec!["binance".to_string()]);
    assert!((result.consensus_score - 0.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_thin_data_after_consensus_fails_loudly() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase"]), &[]);

    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "binance", "BTC/USD", 50_000.0, NOW - 50, 0.95,
    )));
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "coinbase", "BTC/USD", 50_010.0, NOW - 60, 0.95,
    )));
    assert!(pipeline.manager.current_price(&feed()).await.is_ok());

    // Later, only one source is still delivering. With a consensus on
    // record the fallback no longer applies.
    pipeline.clock.advance(2_000);
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "binance",
        "BTC/USD",
        50_050.0,
        pipeline.clock.now_ms() - 50,
        0.95,
    )));

    let result = pipeline.manager.current_price(&feed()).await;
    assert!(matches!(result, Err(Error::InsufficientSources { got: 1, .. })), "{result:?}");
}

#[tokio::test]
async fn test_broken_updates_never_reach_history() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase"]), &[]);

    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "binance", "BTC/USD", -5.0, NOW - 50, 0.95,
    )));
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "binance", "BTC/USD", f64::NAN, NOW - 50, 0.95,
    )));

    let stats = pipeline.manager.stats();
    assert_eq!(stats.updates_total, 2);
    assert_eq!(stats.rejected_total, 2);
    assert!(matches!(
        pipeline.manager.current_price(&feed()).await,
        Err(Error::InsufficientData { .. })
    ));
}

#[tokio::test]
async fn test_volume_window_answers_ranged_queries() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase"]), &[]);

    for (volume, ts) in [(100.0, NOW - 3_000), (250.0, NOW - 2_000), (400.0, NOW - 1_000)] {
        pipeline.manager.ingest(AdapterEvent::Volume {
            symbol: "BTC/USD".into(),
            source: "binance".into(),
            volume,
            timestamp_ms: ts,
        });
    }

    let total = pipeline.manager.volume_between(&feed(), NOW - 2_500, NOW).unwrap();
    assert!((total - 650.0).abs() < 1e-9);

    let all = pipeline.manager.volume_between(&feed(), NOW - 10_000, NOW).unwrap();
    assert!((all - 750.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_data_freshness_tracks_arrivals() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase"]), &[]);
    assert!(pipeline.manager.data_freshness_ms(&feed()).is_none());

    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "binance", "BTC/USD", 50_000.0, NOW - 50, 0.95,
    )));
    assert_eq!(pipeline.manager.data_freshness_ms(&feed()), Some(0));

    pipeline.clock.advance(1_200);
    assert_eq!(pipeline.manager.data_freshness_ms(&feed()), Some(1_200));
}

#[tokio::test]
async fn test_history_window_stays_bounded() {
    let pipeline = build_pipeline(catalog_with_sources(&["binance", "coinbase"]), &[]);

    for i in 0..200 {
        pipeline.clock.advance(10);
        let now = pipeline.clock.now_ms();
        pipeline.manager.ingest(AdapterEvent::Price(price_update(
            "binance",
            "BTC/USD",
            50_000.0 + i as f64,
            now - 5,
            0.95,
        )));
    }

    // The bounded history is observable through aggregation still
    // working and the process not growing: spot-check via a query.
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "coinbase",
        "BTC/USD",
        50_199.0,
        pipeline.clock.now_ms() - 5,
        0.95,
    )));
    let result = pipeline.manager.current_price(&feed()).await.unwrap();
    assert!(result.price > 50_000.0);
}

#[tokio::test]
async fn test_batched_query_reports_per_feed_results() {
    let mut catalog = catalog_with_sources(&["binance", "coinbase"]);
    catalog.push(FeedConfig {
        feed: FeedId::new(FeedCategory::Crypto, "ETH/USD").unwrap(),
        sources: vec![
            FeedSource { exchange: "binance".into(), symbol: "ETH/USD".into(), backup: false },
            FeedSource { exchange: "coinbase".into(), symbol: "ETH/USD".into(), backup: false },
        ],
        decimals: 8,
    });
    let pipeline = build_pipeline(catalog, &[]);

    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "binance", "BTC/USD", 50_000.0, NOW - 50, 0.95,
    )));
    pipeline.manager.ingest(AdapterEvent::Price(price_update(
        "coinbase", "BTC/USD", 50_010.0, NOW - 50, 0.95,
    )));

    let eth = FeedId::new(FeedCategory::Crypto, "ETH/USD").unwrap();
    let results = pipeline.manager.current_prices(&[feed(), eth.clone()]).await;
    assert_eq!(results.len(), 2);
    let by_feed: std::collections::HashMap<_, _> =
        results.into_iter().map(|(f, r)| (f, r)).collect();
    assert!(by_feed[&feed()].is_ok());
    assert!(by_feed[&eth].is_err(), "feed without data must fail, not vanish");
}
