//! Upstream monitor: background polling of the balance and price feeds.
//!
//! # Architecture
//! - One loop per feed, spawned on start and cancelled on stop
//! - `MonitorState` flags make start and stop idempotent
//! - Fetches are awaited before the next tick (no pipelining) and bounded
//!   by the configured timeout
//! - A failed fetch is logged and the cached value kept; after
//!   `stale_after_failures` consecutive failures the feed is reported stale

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::core::broadcaster::PriceSink;
use crate::core::feeds::{BalanceSource, PriceSource};
use crate::core::market_state::{Feed, MarketState};
use crate::core::types::Instrument;
use crate::error::{AppError, Result};

/// Which monitors are currently running
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorState {
    pub balance_running: bool,
    pub price_running: bool,
}

/// Timing and scope of the polling loops
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub instruments: Vec<Instrument>,
    pub balance_interval: Duration,
    pub price_interval: Duration,
    pub fetch_timeout: Duration,
    pub stale_after_failures: u32,
}

impl From<&GatewayConfig> for MonitorSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            instruments: config.instruments.clone(),
            balance_interval: config.balance_interval(),
            price_interval: config.price_interval(),
            fetch_timeout: config.fetch_timeout(),
            stale_after_failures: config.stale_after_failures,
        }
    }
}

struct MonitorTask {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

pub struct UpstreamMonitor {
    state: Arc<MarketState>,
    balance_source: Arc<dyn BalanceSource>,
    price_source: Arc<dyn PriceSource>,
    settings: MonitorSettings,
    balance_running: AtomicBool,
    price_running: AtomicBool,
    balance_task: Mutex<Option<MonitorTask>>,
    price_task: Mutex<Option<MonitorTask>>,
}

impl UpstreamMonitor {
    pub fn new(
        state: Arc<MarketState>,
        balance_source: Arc<dyn BalanceSource>,
        price_source: Arc<dyn PriceSource>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            state,
            balance_source,
            price_source,
            settings,
            balance_running: AtomicBool::new(false),
            price_running: AtomicBool::new(false),
            balance_task: Mutex::new(None),
            price_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MonitorState {
        MonitorState {
            balance_running: self.balance_running.load(Ordering::Acquire),
            price_running: self.price_running.load(Ordering::Acquire),
        }
    }

    /// Start polling balances. Returns `false` if already running.
    pub fn start_balance_monitoring(&self) -> bool {
        let mut slot = self.balance_task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("Balance monitoring already running");
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_balance_loop(
            Arc::clone(&self.state),
            Arc::clone(&self.balance_source),
            self.settings.clone(),
            token.clone(),
        ));
        *slot = Some(MonitorTask { token, _handle: handle });
        self.balance_running.store(true, Ordering::Release);

        info!(
            interval_ms = self.settings.balance_interval.as_millis() as u64,
            "Balance monitoring started"
        );
        true
    }

    /// Stop polling balances. Returns `false` if it was not running.
    pub fn stop_balance_monitoring(&self) -> bool {
        let task = self
            .balance_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                task.token.cancel();
                self.balance_running.store(false, Ordering::Release);
                info!("Balance monitoring stopped");
                true
            }
            None => false,
        }
    }

    /// Start polling prices, signalling `sink` after every snapshot write.
    /// Returns `false` if already running.
    pub fn start_price_monitoring(&self, sink: Option<Arc<dyn PriceSink>>) -> bool {
        let mut slot = self.price_task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("Price monitoring already running");
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_price_loop(
            Arc::clone(&self.state),
            Arc::clone(&self.price_source),
            sink,
            self.settings.clone(),
            token.clone(),
        ));
        *slot = Some(MonitorTask { token, _handle: handle });
        self.price_running.store(true, Ordering::Release);

        info!(
            interval_ms = self.settings.price_interval.as_millis() as u64,
            instruments = ?self.settings.instruments,
            "Price monitoring started"
        );
        true
    }

    /// Stop polling prices. Returns `false` if it was not running.
    pub fn stop_price_monitoring(&self) -> bool {
        let task = self
            .price_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                task.token.cancel();
                self.price_running.store(false, Ordering::Release);
                info!("Price monitoring stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for UpstreamMonitor {
    fn drop(&mut self) {
        self.stop_balance_monitoring();
        self.stop_price_monitoring();
    }
}

// =============================================================================
// Polling loops
// =============================================================================

async fn fetch_with_timeout<T>(timeout: Duration, fetch: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| AppError::Timeout(timeout.as_millis() as u64))?
}

fn note_success(state: &MarketState, feed: Feed, stale_after: u32) {
    let previous_failures = state.record_success(feed);
    if previous_failures >= stale_after {
        info!(feed = %feed, failures = previous_failures, "Feed recovered");
    }
}

fn note_failure(state: &MarketState, feed: Feed, stale_after: u32, error: &AppError) {
    let failures = state.record_failure(feed);
    if failures == stale_after {
        warn!(
            feed = %feed,
            failures = failures,
            error = %error,
            "Feed is stale, serving last cached value"
        );
    } else {
        warn!(
            feed = %feed,
            failures = failures,
            error = %error,
            "Upstream fetch failed, keeping cached value"
        );
    }
}

async fn run_balance_loop(
    state: Arc<MarketState>,
    source: Arc<dyn BalanceSource>,
    settings: MonitorSettings,
    token: CancellationToken,
) {
    let mut ticker = interval(settings.balance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = fetch_with_timeout(settings.fetch_timeout, source.fetch()) => result,
        };

        match result {
            Ok(snapshot) => {
                debug!(
                    wallets = snapshot.wallets.len(),
                    total_sol = snapshot.total_sol(),
                    "Balances refreshed"
                );
                state.write_balances(snapshot);
                note_success(&state, Feed::Balances, settings.stale_after_failures);
            }
            Err(e) => note_failure(&state, Feed::Balances, settings.stale_after_failures, &e),
        }
    }

    debug!("Balance loop exited");
}

async fn run_price_loop(
    state: Arc<MarketState>,
    source: Arc<dyn PriceSource>,
    sink: Option<Arc<dyn PriceSink>>,
    settings: MonitorSettings,
    token: CancellationToken,
) {
    let mut ticker = interval(settings.price_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'poll: loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for instrument in &settings.instruments {
            let feed = Feed::Price(*instrument);
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => break 'poll,
                result = fetch_with_timeout(settings.fetch_timeout, source.fetch(*instrument)) => result,
            };

            match result {
                Ok(snapshot) => {
                    let snapshot = state.write(snapshot);
                    note_success(&state, feed, settings.stale_after_failures);
                    if let Some(sink) = &sink {
                        sink.snapshot_updated(&snapshot);
                    }
                }
                Err(e) => note_failure(&state, feed, settings.stale_after_failures, &e),
            }
        }
    }

    debug!("Price loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BalanceSnapshot, Kline, MarketSnapshot, WalletBalance};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    /// Stub price feed with a switchable failure mode
    struct StubPriceSource {
        calls: AtomicUsize,
        failing: AtomicBool,
        delay: Duration,
    }

    impl StubPriceSource {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self { delay, ..Self::new() }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PriceSource for StubPriceSource {
        async fn fetch(&self, instrument: Instrument) -> Result<MarketSnapshot> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(AppError::Upstream("feed down".into()));
            }
            let price = 100.0 + n as f64;
            Ok(MarketSnapshot::new(
                instrument,
                Kline {
                    open_time: 0,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 1.0,
                    close_time: 0,
                },
            ))
        }
    }

    struct StubBalanceSource {
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl StubBalanceSource {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl BalanceSource for StubBalanceSource {
        async fn fetch(&self) -> Result<BalanceSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(AppError::Upstream("rpc down".into()));
            }
            Ok(BalanceSnapshot::new(vec![WalletBalance::from_lamports(
                "wallet",
                2_000_000_000,
            )]))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        updates: AtomicUsize,
    }

    impl PriceSink for RecordingSink {
        fn snapshot_updated(&self, _snapshot: &Arc<MarketSnapshot>) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            instruments: vec![Instrument::Sol],
            balance_interval: Duration::from_secs(1),
            price_interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_millis(500),
            stale_after_failures: 3,
        }
    }

    fn monitor(
        price: Arc<StubPriceSource>,
        balance: Arc<StubBalanceSource>,
    ) -> (Arc<MarketState>, UpstreamMonitor) {
        let state = Arc::new(MarketState::new());
        let monitor = UpstreamMonitor::new(Arc::clone(&state), balance, price, settings());
        (state, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_runs_one_balance_loop() {
        let balance = Arc::new(StubBalanceSource::new());
        let (_state, monitor) = monitor(Arc::new(StubPriceSource::new()), Arc::clone(&balance));

        assert!(monitor.start_balance_monitoring());
        assert!(!monitor.start_balance_monitoring());
        assert!(monitor.state().balance_running);

        // Ticks at 0s, 1s, 2s, 3s
        sleep(Duration::from_millis(3_500)).await;
        assert_eq!(balance.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_runs_one_price_loop() {
        let price = Arc::new(StubPriceSource::new());
        let (_state, monitor) = monitor(Arc::clone(&price), Arc::new(StubBalanceSource::new()));

        assert!(monitor.start_price_monitoring(None));
        assert!(!monitor.start_price_monitoring(None));

        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(price.calls(), 3);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let (_state, monitor) = monitor(
            Arc::new(StubPriceSource::new()),
            Arc::new(StubBalanceSource::new()),
        );
        assert!(!monitor.stop_balance_monitoring());
        assert!(!monitor.stop_price_monitoring());
        assert_eq!(monitor.state(), MonitorState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_further_fetches() {
        let balance = Arc::new(StubBalanceSource::new());
        let (_state, monitor) = monitor(Arc::new(StubPriceSource::new()), Arc::clone(&balance));

        monitor.start_balance_monitoring();
        sleep(Duration::from_millis(1_500)).await;
        let before = balance.calls.load(Ordering::SeqCst);
        assert_eq!(before, 2);

        assert!(monitor.stop_balance_monitoring());
        assert!(!monitor.state().balance_running);
        assert!(!monitor.stop_balance_monitoring());

        sleep(Duration::from_secs(5)).await;
        assert_eq!(balance.calls.load(Ordering::SeqCst), before);

        // Restart after stop is allowed
        assert!(monitor.start_balance_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_failure_keeps_stale_snapshot() {
        let price = Arc::new(StubPriceSource::new());
        let (state, monitor) = monitor(Arc::clone(&price), Arc::new(StubBalanceSource::new()));

        monitor.start_price_monitoring(None);
        sleep(Duration::from_millis(100)).await;
        let first = state.read(Instrument::Sol).expect("first poll should populate");
        assert_eq!(first.price, 101.0);

        price.failing.store(true, Ordering::SeqCst);
        sleep(Duration::from_millis(3_000)).await;

        // Loop kept running and the cached snapshot survived
        assert_eq!(price.calls(), 4);
        let cached = state.read(Instrument::Sol).unwrap();
        assert_eq!(cached.price, 101.0);
        assert_eq!(cached.updated_at_ms, first.updated_at_ms);
        assert_eq!(state.failures(Feed::Price(Instrument::Sol)), 3);

        price.failing.store(false, Ordering::SeqCst);
        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(state.read(Instrument::Sol).unwrap().price, 105.0);
        assert_eq!(state.failures(Feed::Price(Instrument::Sol)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_balance_failure_keeps_previous_value() {
        let balance = Arc::new(StubBalanceSource::new());
        let (state, monitor) = monitor(Arc::new(StubPriceSource::new()), Arc::clone(&balance));

        monitor.start_balance_monitoring();
        sleep(Duration::from_millis(100)).await;
        assert!(state.read_balances().is_some());

        balance.failing.store(true, Ordering::SeqCst);
        sleep(Duration::from_millis(2_000)).await;

        assert!(state.read_balances().is_some());
        assert_eq!(state.failures(Feed::Balances), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_signalled_on_each_successful_fetch() {
        let price = Arc::new(StubPriceSource::new());
        let (_state, monitor) = monitor(Arc::clone(&price), Arc::new(StubBalanceSource::new()));
        let sink = Arc::new(RecordingSink::default());

        monitor.start_price_monitoring(Some(sink.clone() as Arc<dyn PriceSink>));
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(sink.updates.load(Ordering::SeqCst), 2);

        price.failing.store(true, Ordering::SeqCst);
        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(sink.updates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out() {
        let price = Arc::new(StubPriceSource::slow(Duration::from_secs(10)));
        let (state, monitor) = monitor(Arc::clone(&price), Arc::new(StubBalanceSource::new()));

        monitor.start_price_monitoring(None);
        sleep(Duration::from_millis(2_000)).await;

        assert!(state.read(Instrument::Sol).is_none());
        assert!(state.failures(Feed::Price(Instrument::Sol)) >= 1);
        // The loop did not hang on the first fetch
        assert!(price.calls() >= 2);
    }

    #[tokio::test]
    async fn test_fetch_with_timeout_maps_error() {
        let result: Result<()> = fetch_with_timeout(Duration::from_millis(10), async {
            sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AppError::Timeout(10))));
    }
}
