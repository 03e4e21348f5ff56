//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use feedgate::core::aggregator::{AggregatorConfig, ConsensusAggregator};
use feedgate::core::domain::{FeedConfig, HealthEvent};
use feedgate::core::failover::{FailoverConfig, FailoverController, SubscriptionPort};
use feedgate::core::manager::{DataManager, ManagerConfig};
use feedgate::core::service::{EventBus, ManualClock};
use feedgate::core::validator::{Validator, ValidatorConfig};
use feedgate::error::Result;

pub const NOW: i64 = 1_700_000_000_000;

/// Subscription port that records calls instead of touching sockets.
pub struct RecordingPort {
    pub connected: Mutex<HashSet<String>>,
    pub subscribes: Mutex<Vec<(String, Vec<String>)>>,
    pub unsubscribes: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingPort {
    pub fn new(connected: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            connected: Mutex::new(connected.iter().map(|s| s.to_string()).collect()),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_connected(&self, exchange: &str, connected: bool) {
        let mut set = self.connected.lock();
        if connected {
            set.insert(exchange.to_string());
        } else {
            set.remove(exchange);
        }
    }

    pub fn subscribe_count(&self, exchange: &str) -> usize {
        self.subscribes.lock().iter().filter(|(e, _)| e == exchange).count()
    }

    pub fn unsubscribe_count(&self, exchange: &str) -> usize {
        self.unsubscribes.lock().iter().filter(|(e, _)| e == exchange).count()
    }
}

#[async_trait]
impl SubscriptionPort for RecordingPort {
    async fn subscribe(&self, exchange: &str, symbols: &[String]) -> Result<()> {
        self.subscribes.lock().push((exchange.to_string(), symbols.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&self, exchange: &str, symbols: &[String]) -> Result<()> {
        self.unsubscribes.lock().push((exchange.to_string(), symbols.to_vec()));
        Ok(())
    }

    fn is_connected(&self, exchange: &str) -> bool {
        self.connected.lock().contains(exchange)
    }

    fn latency_ms(&self, _exchange: &str) -> f64 {
        10.0
    }
}

/// A fully wired pipeline over mock transports.
pub struct Pipeline {
    pub manager: Arc<DataManager>,
    pub failover: Arc<FailoverController>,
    pub port: Arc<RecordingPort>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<ManualClock>,
    pub health_tx: mpsc::UnboundedSender<HealthEvent>,
}

pub fn build_pipeline(catalog: Vec<FeedConfig>, connected: &[&str]) -> Pipeline {
    let clock = ManualClock::new(NOW);
    let port = RecordingPort::new(connected);
    let bus = Arc::new(EventBus::default());
    let failover = Arc::new(FailoverController::with_clock(
        Arc::clone(&port) as Arc<dyn SubscriptionPort>,
        Arc::clone(&bus),
        FailoverConfig::default(),
        clock.as_clock(),
    ));
    for entry in &catalog {
        failover.register_feed(entry);
    }

    let validator = Arc::new(Validator::with_clock(ValidatorConfig::default(), clock.as_clock()));
    let aggregator =
        Arc::new(ConsensusAggregator::with_clock(AggregatorConfig::default(), clock.as_clock()));
    let (health_tx, _health_rx) = mpsc::unbounded_channel();
    let manager = Arc::new(DataManager::with_clock(
        catalog,
        validator,
        aggregator,
        Arc::clone(&failover),
        health_tx.clone(),
        ManagerConfig::default(),
        clock.as_clock(),
    ));

    Pipeline { manager, failover, port, bus, clock, health_tx }
}
