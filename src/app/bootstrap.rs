//! Build and run the whole pipeline.
//!
//! Wiring order: adapters feed one mpsc channel into the data manager;
//! the manager forwards health events to the failover controller, which
//! acts back on subscriptions only through the orchestrator's port. The
//! scheduler owns every periodic task so one `shutdown` call stops all
//! background work deterministically.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::app::config::Config;
use crate::core::aggregator::ConsensusAggregator;
use crate::core::domain::FeedConfig;
use crate::core::exchange::{build_adapter, ExchangeAdapter, SymbolMap};
use crate::core::failover::{FailoverController, SubscriptionPort};
use crate::core::manager::DataManager;
use crate::core::orchestrator::WebSocketOrchestrator;
use crate::core::service::{system_clock, EventBus, Scheduler};
use crate::core::validator::Validator;
use crate::error::Result;

/// Cadence of the cross-source window and cache sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct App {
    pub orchestrator: Arc<WebSocketOrchestrator>,
    pub manager: Arc<DataManager>,
    pub failover: Arc<FailoverController>,
    pub aggregator: Arc<ConsensusAggregator>,
    pub bus: Arc<EventBus>,
    scheduler: Scheduler,
    listen: String,
    config_path: PathBuf,
    loops: Vec<JoinHandle<()>>,
}

impl App {
    /// Wire every component and bring the exchange connections up.
    pub async fn build(config: &Config, config_path: impl Into<PathBuf>) -> Result<Self> {
        let catalog = config.catalog()?;
        let clock = system_clock();

        let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = mpsc::unbounded_channel();

        // One adapter per exchange referenced anywhere in the catalog.
        let exchanges: BTreeSet<String> = catalog
            .iter()
            .flat_map(|c| c.sources.iter().map(|s| s.exchange.clone()))
            .collect();
        let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
        for exchange in &exchanges {
            let adapter = build_adapter(
                exchange,
                symbol_map_for(&catalog, exchange),
                config.adapter_tuning(),
                adapter_tx.clone(),
                clock.clone(),
            )?;
            adapters.insert(exchange.clone(), adapter);
        }
        info!(exchanges = adapters.len(), feeds = catalog.len(), "Pipeline configured");

        let orchestrator = Arc::new(WebSocketOrchestrator::new(catalog.clone(), adapters.clone()));
        let bus = Arc::new(EventBus::default());
        let failover = Arc::new(FailoverController::new(
            Arc::clone(&orchestrator) as Arc<dyn SubscriptionPort>,
            Arc::clone(&bus),
            config.failover_config(),
        ));
        for entry in &catalog {
            failover.register_feed(entry);
        }

        let validator = Arc::new(Validator::new(config.validator_config()));
        let aggregator = Arc::new(ConsensusAggregator::new(config.aggregator_config()));
        let manager = Arc::new(DataManager::new(
            catalog,
            validator,
            Arc::clone(&aggregator),
            Arc::clone(&failover),
            health_tx,
            config.manager_config(),
        ));

        let mut loops = Vec::new();
        loops.push(manager.spawn_ingest(adapter_rx));
        loops.push(Arc::clone(&failover).run(health_rx));
        loops.push(spawn_event_log(bus.subscribe()));

        orchestrator.initialize().await?;
        for adapter in adapters.values() {
            if let Err(e) = manager.add_data_source(Arc::clone(adapter)).await {
                warn!(exchange = adapter.exchange_id(), error = %e, "Data source not ready at startup");
            }
        }

        let scheduler = Scheduler::new();
        {
            let failover = Arc::clone(&failover);
            scheduler.every(
                Duration::from_millis(config.oracle.health_check_interval_ms),
                "health-probes",
                move || {
                    let failover = Arc::clone(&failover);
                    async move { failover.probe_all().await }
                },
            );
        }
        {
            let manager = Arc::clone(&manager);
            scheduler.every(SWEEP_INTERVAL, "window-sweep", move || {
                let manager = Arc::clone(&manager);
                async move { manager.sweep_windows() }
            });
        }
        if config.oracle.weight_update_interval_secs > 0 {
            let aggregator = Arc::clone(&aggregator);
            scheduler.every(
                Duration::from_secs(config.oracle.weight_update_interval_secs),
                "weight-update",
                move || {
                    let aggregator = Arc::clone(&aggregator);
                    async move { aggregator.optimize_weights() }
                },
            );
        }

        Ok(Self {
            orchestrator,
            manager,
            failover,
            aggregator,
            bus,
            scheduler,
            listen: config.server.listen.clone(),
            config_path: config_path.into(),
            loops,
        })
    }

    /// Serve the HTTP API until `shutdown` resolves, then tear down.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = TcpListener::bind(&self.listen).await?;
        let state = Arc::new(ApiState::new(Arc::clone(&self.manager)));

        self.spawn_reload_handler();

        let served = api::serve(state, listener, shutdown).await;
        self.teardown().await;
        served
    }

    /// Re-read the catalog from the config file and subscribe any new
    /// feeds. Existing feeds are re-registered in place.
    pub async fn reload_catalog(&self) -> Result<()> {
        let config = Config::load(&self.config_path)?;
        let catalog = config.catalog()?;
        info!(feeds = catalog.len(), "Reloading feed catalog");

        self.manager.update_catalog(catalog.clone());
        for entry in &catalog {
            self.failover.register_feed(entry);
            if let Err(e) = self.orchestrator.register_feed(entry.clone()).await {
                warn!(feed = %entry.feed, error = %e, "Subscribe after reload failed");
            }
        }
        Ok(())
    }

    async fn teardown(&self) {
        info!("Shutting down");
        self.scheduler.shutdown();
        self.orchestrator.cleanup().await;
        for task in &self.loops {
            task.abort();
        }
    }

    #[cfg(unix)]
    fn spawn_reload_handler(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let orchestrator = Arc::clone(&self.orchestrator);
        let failover = Arc::clone(&self.failover);
        let manager = Arc::clone(&self.manager);
        let config_path = self.config_path.clone();
        tokio::spawn(async move {
            let Ok(mut hangup) = signal(SignalKind::hangup()) else {
                warn!("SIGHUP handler unavailable; catalog reload disabled");
                return;
            };
            while hangup.recv().await.is_some() {
                match Config::load(&config_path).and_then(|c| c.catalog()) {
                    Ok(catalog) => {
                        info!(feeds = catalog.len(), "SIGHUP: reloading feed catalog");
                        manager.update_catalog(catalog.clone());
                        for entry in &catalog {
                            failover.register_feed(entry);
                            if let Err(e) = orchestrator.register_feed(entry.clone()).await {
                                warn!(feed = %entry.feed, error = %e, "Subscribe after reload failed");
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "SIGHUP: reload failed, keeping old catalog"),
                }
            }
        });
    }

    #[cfg(not(unix))]
    fn spawn_reload_handler(&self) {}
}

/// Surface failover lifecycle events in the log stream.
fn spawn_event_log(
    mut events: tokio::sync::broadcast::Receiver<crate::core::domain::OracleEvent>,
) -> JoinHandle<()> {
    use crate::core::domain::OracleEvent;
    use tokio::sync::broadcast::error::RecvError;

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(OracleEvent::SourceUnhealthy { source }) => {
                    warn!(source = %source, "Source unhealthy");
                }
                Ok(OracleEvent::FailoverCompleted { feed, active }) => {
                    info!(feed = %feed, active = ?active, "Failover completed");
                }
                Ok(OracleEvent::FailoverFailed { feed }) => {
                    error!(feed = %feed, "Failover failed: feed has no healthy source");
                }
                Ok(OracleEvent::SourceRecovered { feed, source, deactivated_backups }) => {
                    info!(feed = %feed, source = %source, deactivated = ?deactivated_backups, "Source recovered");
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event log lagged behind the bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Canonical ↔ native pairs for one exchange across the catalog.
fn symbol_map_for(catalog: &[FeedConfig], exchange: &str) -> SymbolMap {
    SymbolMap::new(catalog.iter().flat_map(|config| {
        config
            .sources
            .iter()
            .filter(|s| s.exchange == exchange)
            .map(|s| (config.feed.name.clone(), s.symbol.clone()))
    }))
}
