//! Orchestrator lifecycle: exactly-once bring-up, idempotent
//! subscriptions, reconnect cooldown.

mod support;

use tokio_test::assert_ok;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use feedgate::core::domain::{FeedCategory, FeedConfig, FeedId, FeedSource};
use feedgate::core::exchange::ExchangeAdapter;
use feedgate::core::orchestrator::WebSocketOrchestrator;
use feedgate::core::service::ManualClock;
use feedgate::testkit::MockAdapter;

use support::NOW;

fn feed(name: &str) -> FeedId {
    FeedId::new(FeedCategory::Crypto, name).unwrap()
}

fn config(name: &str, sources: &[(&str, &str)]) -> FeedConfig {
    FeedConfig {
        feed: feed(name),
        sources: sources
            .iter()
            .map(|(exchange, symbol)| FeedSource {
                exchange: exchange.to_string(),
                symbol: symbol.to_string(),
                backup: false,
            })
            .collect(),
        decimals: 8,
    }
}

struct Setup {
    orchestrator: WebSocketOrchestrator,
    adapters: HashMap<String, Arc<MockAdapter>>,
    clock: Arc<ManualClock>,
}

fn setup(catalog: Vec<FeedConfig>, exchanges: &[&str]) -> Setup {
    let clock = ManualClock::new(NOW);
    let mut mocks = HashMap::new();
    let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
    for exchange in exchanges {
        let mock = MockAdapter::new(*exchange);
        adapters.insert(exchange.to_string(), Arc::clone(&mock) as Arc<dyn ExchangeAdapter>);
        mocks.insert(exchange.to_string(), mock);
    }
    let orchestrator = WebSocketOrchestrator::with_clock(catalog, adapters, clock.as_clock());
    Setup { orchestrator, adapters: mocks, clock }
}

#[tokio::test]
async fn test_initialize_connects_once_and_batches_subscriptions() {
    let catalog = vec![
        config("BTC/USD", &[("binance", "BTCUSDT"), ("coinbase", "BTC-USD")]),
        config("ETH/USD", &[("binance", "ETHUSDT")]),
    ];
    let setup = setup(catalog, &["binance", "coinbase"]);

    assert_ok!(setup.orchestrator.initialize().await);

    let binance = &setup.adapters["binance"];
    assert_eq!(binance.connect_calls.load(Ordering::SeqCst), 1);
    // One batched subscribe covering the union of both feeds.
    let calls = binance.subscribe_calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    drop(calls);

    let status = setup.orchestrator.connection_status().await;
    assert!(status["binance"].connected);
    assert_eq!(status["binance"].subscribed_count, 2);
    assert_eq!(status["binance"].required_count, 2);
    assert_eq!(status["coinbase"].required_count, 1);
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let catalog = vec![config("BTC/USD", &[("binance", "BTCUSDT")])];
    let setup = setup(catalog, &["binance"]);

    setup.orchestrator.initialize().await.unwrap();
    setup.orchestrator.initialize().await.unwrap();

    assert_eq!(setup.adapters["binance"].connect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_one_exchange_failing_does_not_block_others() {
    let catalog = vec![config("BTC/USD", &[("binance", "BTCUSDT"), ("coinbase", "BTC-USD")])];
    let setup = setup(catalog, &["binance", "coinbase"]);
    setup.adapters["binance"].set_fail_connect(true);

    setup.orchestrator.initialize().await.unwrap();

    let status = setup.orchestrator.connection_status().await;
    assert!(!status["binance"].connected);
    assert!(status["coinbase"].connected);
    assert_eq!(status["coinbase"].subscribed_count, 1);
}

#[tokio::test]
async fn test_subscribe_to_feed_is_idempotent() {
    let catalog = vec![config("BTC/USD", &[("binance", "BTCUSDT")])];
    let setup = setup(catalog, &["binance"]);
    setup.orchestrator.initialize().await.unwrap();

    let btc = feed("BTC/USD");
    assert_ok!(setup.orchestrator.subscribe_to_feed(&btc).await);
    assert_ok!(setup.orchestrator.subscribe_to_feed(&btc).await);

    // Initialize already covered the symbol; repeats add nothing.
    assert_eq!(setup.adapters["binance"].subscribe_calls.lock().len(), 1);
    let status = setup.orchestrator.connection_status().await;
    assert_eq!(status["binance"].subscribed_count, 1);
    assert_eq!(status["binance"].required_count, 1);
}

#[tokio::test]
async fn test_subscribed_is_subset_of_required() {
    let catalog = vec![
        config("BTC/USD", &[("binance", "BTCUSDT")]),
        config("ETH/USD", &[("binance", "ETHUSDT")]),
    ];
    let setup = setup(catalog, &["binance"]);
    setup.orchestrator.initialize().await.unwrap();

    let status = setup.orchestrator.connection_status().await;
    assert!(status["binance"].subscribed_count <= status["binance"].required_count);
}

#[tokio::test]
async fn test_reconnect_skipped_while_connected() {
    let catalog = vec![config("BTC/USD", &[("binance", "BTCUSDT")])];
    let setup = setup(catalog, &["binance"]);
    setup.orchestrator.initialize().await.unwrap();

    assert!(!setup.orchestrator.reconnect_exchange("binance").await);
    assert_eq!(setup.adapters["binance"].connect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reconnect_cooldown() {
    let catalog = vec![config("BTC/USD", &[("binance", "BTCUSDT")])];
    let setup = setup(catalog, &["binance"]);
    setup.orchestrator.initialize().await.unwrap();

    // Drop the link without telling the orchestrator.
    setup.adapters["binance"].set_connected(false);

    // 5 s after the initialize attempt: still cooling down.
    setup.clock.advance(5_000);
    assert!(!setup.orchestrator.reconnect_exchange("binance").await);
    assert_eq!(setup.adapters["binance"].connect_calls.load(Ordering::SeqCst), 1);

    // Past the 10 s cooldown the reconnect goes through and
    // resubscribes the required set.
    setup.clock.advance(5_001);
    assert!(setup.orchestrator.reconnect_exchange("binance").await);
    assert_eq!(setup.adapters["binance"].connect_calls.load(Ordering::SeqCst), 2);
    assert_eq!(setup.adapters["binance"].subscribe_calls.lock().len(), 2);

    // A successful connect still recorded the attempt time.
    setup.adapters["binance"].set_connected(false);
    assert!(!setup.orchestrator.reconnect_exchange("binance").await);
}

#[tokio::test]
async fn test_reconnect_unknown_exchange_is_false() {
    let catalog = vec![config("BTC/USD", &[("binance", "BTCUSDT")])];
    let setup = setup(catalog, &["binance"]);
    assert!(!setup.orchestrator.reconnect_exchange("bitfinex").await);
}

#[tokio::test]
async fn test_cleanup_disconnects_everything() {
    let catalog = vec![config("BTC/USD", &[("binance", "BTCUSDT"), ("coinbase", "BTC-USD")])];
    let setup = setup(catalog, &["binance", "coinbase"]);
    setup.orchestrator.initialize().await.unwrap();

    setup.orchestrator.cleanup().await;

    assert!(!setup.adapters["binance"].is_connected());
    assert!(!setup.adapters["coinbase"].is_connected());
}

#[tokio::test]
async fn test_backup_sources_are_not_subscribed_at_bring_up() {
    let catalog = vec![FeedConfig {
        feed: feed("BTC/USD"),
        sources: vec![
            FeedSource { exchange: "binance".into(), symbol: "BTCUSDT".into(), backup: false },
            FeedSource { exchange: "kraken".into(), symbol: "XBT/USD".into(), backup: true },
        ],
        decimals: 8,
    }];
    let setup = setup(catalog, &["binance", "kraken"]);
    setup.orchestrator.initialize().await.unwrap();

    assert!(setup.adapters["kraken"].subscribe_calls.lock().is_empty());
    let status = setup.orchestrator.connection_status().await;
    assert_eq!(status["kraken"].required_count, 0);
}
