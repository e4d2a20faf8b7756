//! Lifecycle controller: owns the monitoring core and drives startup and
//! graceful shutdown.
//!
//! State machine: `Stopped → Starting → Running → Stopping → Stopped`.
//! The final `Stopped` is terminal; the shutdown token is one-shot.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::core::broadcaster::{Broadcaster, PriceSink};
use crate::core::feeds::{BalanceSource, BinanceKlineSource, PriceSource, SolanaRpcBalanceSource};
use crate::core::market_state::MarketState;
use crate::core::monitor::{MonitorSettings, UpstreamMonitor};
use crate::core::registry::ConnectionRegistry;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// The monitoring and broadcast core, constructed once per process.
pub struct Gateway {
    config: GatewayConfig,
    state: Arc<MarketState>,
    registry: Arc<ConnectionRegistry>,
    monitor: Arc<UpstreamMonitor>,
    broadcaster: Arc<Broadcaster>,
    lifecycle: watch::Sender<LifecycleState>,
    shutdown: CancellationToken,
    /// Broadcaster and stream sessions; drained before `Stopped`
    tasks: TaskTracker,
}

impl Gateway {
    /// Build the core around the given upstream sources.
    pub fn new(
        config: GatewayConfig,
        balance_source: Arc<dyn BalanceSource>,
        price_source: Arc<dyn PriceSource>,
    ) -> Self {
        let state = Arc::new(MarketState::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let monitor = Arc::new(UpstreamMonitor::new(
            Arc::clone(&state),
            balance_source,
            price_source,
            MonitorSettings::from(&config),
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&state),
            Arc::clone(&registry),
            config.instruments.clone(),
            config.broadcast_interval(),
        ));
        let (lifecycle, _) = watch::channel(LifecycleState::Stopped);

        Self {
            config,
            state,
            registry,
            monitor,
            broadcaster,
            lifecycle,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Build the core with the HTTP upstream sources named in `config`.
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        let price_source = BinanceKlineSource::new(
            config.price_feed.base_url.clone(),
            config.price_feed.kline_interval.clone(),
            config.fetch_timeout(),
        )?;
        let balance_source = SolanaRpcBalanceSource::new(
            config.balance_feed.rpc_url.clone(),
            config.balance_feed.wallets.clone(),
            config.fetch_timeout(),
        )?;

        Ok(Self::new(config, Arc::new(balance_source), Arc::new(price_source)))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn market_state(&self) -> &Arc<MarketState> {
        &self.state
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<UpstreamMonitor> {
        &self.monitor
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Cancelled when the gateway enters `Stopping`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Tracker for tasks that must finish before `serve` returns
    pub fn task_tracker(&self) -> TaskTracker {
        self.tasks.clone()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    /// Start both pollers and the broadcaster. No-op unless `Stopped` and
    /// never shut down before. Returns whether anything was started.
    pub fn start(&self) -> bool {
        self.begin_starting() && self.launch()
    }

    fn begin_starting(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.lifecycle.send_if_modified(|state| {
            if *state == LifecycleState::Stopped {
                *state = LifecycleState::Starting;
                true
            } else {
                false
            }
        })
    }

    fn launch(&self) -> bool {
        info!(instruments = ?self.config.instruments, "Gateway starting");

        self.monitor.start_balance_monitoring();
        let sink: Arc<dyn PriceSink> = self.broadcaster.clone();
        self.monitor.start_price_monitoring(Some(sink));
        self.tasks.spawn(Arc::clone(&self.broadcaster).run(self.shutdown.clone()));

        let running = self.lifecycle.send_if_modified(|state| {
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        });
        if !running || self.shutdown.is_cancelled() {
            // A stop landed while starting; its monitor stops may have run first
            self.monitor.stop_balance_monitoring();
            self.monitor.stop_price_monitoring();
            warn!("Gateway stopped while starting");
            return false;
        }

        info!("Gateway running");
        true
    }

    /// Stop the pollers and signal every stream session and the broadcaster
    /// to finish. Returns whether a transition happened.
    pub fn begin_stopping(&self) -> bool {
        let stopping = self.lifecycle.send_if_modified(|state| {
            if matches!(*state, LifecycleState::Running | LifecycleState::Starting) {
                *state = LifecycleState::Stopping;
                true
            } else {
                false
            }
        });
        if !stopping {
            return false;
        }

        info!("Gateway stopping");
        self.monitor.stop_balance_monitoring();
        self.monitor.stop_price_monitoring();
        self.shutdown.cancel();
        true
    }

    /// Start the core and serve `app` on `listener` until `signal` resolves.
    ///
    /// Returns once in-flight requests have completed, every stream session
    /// has ended and the listening socket is closed.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, app: Router, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let address = listener.local_addr()?;
        self.start();
        info!(address = %address, "Server is running");

        let gateway = Arc::clone(&self);
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                gateway.begin_stopping();
            })
            .await;

        // The server can also end on an accept error; make sure the pollers stop
        if let Err(e) = &served {
            warn!(error = %e, "Server ended with error");
            self.begin_stopping();
        }

        // Upgraded stream sessions are not tracked by the HTTP server
        self.tasks.close();
        self.tasks.wait().await;

        self.lifecycle.send_replace(LifecycleState::Stopped);
        info!(address = %address, "Server closed");

        Ok(served?)
    }
}
