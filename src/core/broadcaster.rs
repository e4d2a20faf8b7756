//! Broadcaster: pushes the latest snapshots to every subscriber on a fixed cadence.
//!
//! # Architecture
//! - One shared `tokio::time::interval` for all connections
//! - Each tick copies the registry membership, then emits per connection
//! - Emission is `try_send`: a closed or saturated connection is counted and
//!   skipped, never aborting the tick for the others
//! - Ticks with no snapshot available emit nothing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::market_state::MarketState;
use crate::core::registry::{ConnectionRegistry, EmitError};
use crate::core::types::{Instrument, MarketSnapshot, StreamEvent};

/// Default broadcast cadence
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// Notified by the price monitor after each successful snapshot write.
pub trait PriceSink: Send + Sync {
    fn snapshot_updated(&self, snapshot: &Arc<MarketSnapshot>);
}

/// Outcome of a single tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// No snapshot was available, nothing was emitted
    pub skipped: bool,
    /// Connections in the membership snapshot
    pub recipients: usize,
    /// Events queued successfully
    pub emitted: usize,
    /// Events dropped because the connection buffer was full
    pub dropped: usize,
    /// Events not delivered because the connection had closed
    pub failed: usize,
}

pub struct Broadcaster {
    state: Arc<MarketState>,
    registry: Arc<ConnectionRegistry>,
    instruments: Vec<Instrument>,
    cadence: Duration,
    updates_seen: AtomicU64,
    ticks: AtomicU64,
}

impl Broadcaster {
    pub fn new(
        state: Arc<MarketState>,
        registry: Arc<ConnectionRegistry>,
        instruments: Vec<Instrument>,
        cadence: Duration,
    ) -> Self {
        Self {
            state,
            registry,
            instruments,
            cadence,
            updates_seen: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    /// Events for every tracked instrument that currently has a snapshot
    pub fn latest_events(&self) -> Vec<StreamEvent> {
        self.instruments
            .iter()
            .filter_map(|instrument| self.state.read(*instrument))
            .map(StreamEvent::price)
            .collect()
    }

    /// Emit the current snapshots to every registered connection once.
    pub fn tick(&self) -> TickReport {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let events = self.latest_events();
        if events.is_empty() {
            return TickReport {
                skipped: true,
                ..Default::default()
            };
        }

        let recipients = self.registry.snapshot();
        let mut report = TickReport {
            recipients: recipients.len(),
            ..Default::default()
        };

        for connection in &recipients {
            for event in &events {
                match connection.emit(event.clone()) {
                    Ok(()) => report.emitted += 1,
                    Err(EmitError::Full) => {
                        report.dropped += 1;
                        debug!(
                            connection_id = %connection.id(),
                            event = event.event_name(),
                            "Subscriber lagging, tick dropped"
                        );
                    }
                    Err(EmitError::Closed) => {
                        report.failed += 1;
                        debug!(
                            connection_id = %connection.id(),
                            event = event.event_name(),
                            "Subscriber closed before emit"
                        );
                    }
                }
            }
        }

        report
    }

    /// Tick until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(cadence_ms = self.cadence.as_millis() as u64, "Broadcaster started");

        let mut ticker = interval(self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick();
                    if !report.skipped && (report.failed > 0 || report.dropped > 0) {
                        debug!(
                            recipients = report.recipients,
                            emitted = report.emitted,
                            dropped = report.dropped,
                            failed = report.failed,
                            "Broadcast tick"
                        );
                    }
                }
            }
        }

        info!(ticks = self.ticks.load(Ordering::Relaxed), "Broadcaster stopped");
    }

    /// Snapshot updates reported by the price monitor
    pub fn updates_seen(&self) -> u64 {
        self.updates_seen.load(Ordering::Relaxed)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl PriceSink for Broadcaster {
    fn snapshot_updated(&self, snapshot: &Arc<MarketSnapshot>) {
        self.updates_seen.fetch_add(1, Ordering::Relaxed);
        debug!(
            instrument = %snapshot.instrument,
            price = snapshot.price,
            subscribers = self.registry.len(),
            "Snapshot ready for broadcast"
        );
    }
}
