//! Shared market state: latest snapshot per feed.
//!
//! Single writer (the upstream monitor), many readers (broadcaster ticks,
//! new stream sessions, HTTP handlers). Values are stored as `Arc`s and a
//! write swaps the pointer, so a lock is only ever held for a clone or an
//! insert, never across I/O.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;

use crate::core::types::{BalanceSnapshot, Instrument, MarketSnapshot};

/// Identifies one polled upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    Balances,
    Price(Instrument),
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feed::Balances => write!(f, "balances"),
            Feed::Price(instrument) => write!(f, "price:{}", instrument),
        }
    }
}

/// Process-wide cache of the most recent upstream results.
#[derive(Debug, Default)]
pub struct MarketState {
    prices: RwLock<HashMap<Instrument, Arc<MarketSnapshot>>>,
    balances: RwLock<Option<Arc<BalanceSnapshot>>>,
    /// Consecutive failed polls per feed
    failures: DashMap<Feed, u32>,
}

impl MarketState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored snapshot for the snapshot's instrument.
    pub fn write(&self, snapshot: MarketSnapshot) -> Arc<MarketSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.instrument, Arc::clone(&snapshot));
        snapshot
    }

    /// Last written snapshot, or `None` before the first successful poll.
    pub fn read(&self, instrument: Instrument) -> Option<Arc<MarketSnapshot>> {
        self.prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&instrument)
            .cloned()
    }

    /// All current price snapshots
    pub fn prices(&self) -> Vec<Arc<MarketSnapshot>> {
        self.prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn write_balances(&self, snapshot: BalanceSnapshot) -> Arc<BalanceSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.balances.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&snapshot));
        snapshot
    }

    pub fn read_balances(&self) -> Option<Arc<BalanceSnapshot>> {
        self.balances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the snapshot for `instrument` is absent or older than `max_age_ms`.
    pub fn is_stale(&self, instrument: Instrument, now_ms: u64, max_age_ms: u64) -> bool {
        match self.read(instrument) {
            Some(snapshot) => snapshot.age_ms(now_ms) > max_age_ms,
            None => true,
        }
    }

    /// Count a failed poll; returns the consecutive failure count.
    pub fn record_failure(&self, feed: Feed) -> u32 {
        let mut count = self.failures.entry(feed).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset the failure count; returns the count it had before.
    pub fn record_success(&self, feed: Feed) -> u32 {
        self.failures.remove(&feed).map(|(_, count)| count).unwrap_or(0)
    }

    pub fn failures(&self, feed: Feed) -> u32 {
        self.failures.get(&feed).map(|count| *count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Kline, WalletBalance};
    use std::thread;

    fn snapshot(instrument: Instrument, price: f64, updated_at_ms: u64) -> MarketSnapshot {
        MarketSnapshot {
            instrument,
            price,
            kline: Kline {
                open_time: updated_at_ms,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: price * 10.0,
                close_time: updated_at_ms,
            },
            updated_at_ms,
        }
    }

    #[test]
    fn test_read_before_write_is_absent() {
        let state = MarketState::new();
        assert!(state.read(Instrument::Sol).is_none());
        assert!(state.read_balances().is_none());
        assert!(state.prices().is_empty());
    }

    #[test]
    fn test_write_replaces_per_instrument() {
        let state = MarketState::new();
        state.write(snapshot(Instrument::Sol, 100.0, 1));
        state.write(snapshot(Instrument::Btc, 65_000.0, 1));
        state.write(snapshot(Instrument::Sol, 101.0, 2));

        assert_eq!(state.read(Instrument::Sol).unwrap().price, 101.0);
        assert_eq!(state.read(Instrument::Btc).unwrap().price, 65_000.0);
        assert_eq!(state.prices().len(), 2);
    }

    #[test]
    fn test_reader_keeps_old_snapshot_after_replace() {
        let state = MarketState::new();
        state.write(snapshot(Instrument::Sol, 100.0, 1));
        let held = state.read(Instrument::Sol).unwrap();

        state.write(snapshot(Instrument::Sol, 200.0, 2));

        // A held snapshot is never mutated in place
        assert_eq!(held.price, 100.0);
        assert_eq!(state.read(Instrument::Sol).unwrap().price, 200.0);
    }

    #[test]
    fn test_concurrent_reads_never_tear() {
        let state = Arc::new(MarketState::new());
        state.write(snapshot(Instrument::Sol, 0.0, 0));

        let writer = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                for i in 1..=5_000u64 {
                    state.write(snapshot(Instrument::Sol, i as f64, i));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        let s = state.read(Instrument::Sol).unwrap();
                        // Every field must come from the same write
                        assert_eq!(s.price, s.updated_at_ms as f64);
                        assert_eq!(s.kline.close, s.price);
                        assert_eq!(s.kline.volume, s.price * 10.0);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(state.read(Instrument::Sol).unwrap().price, 5_000.0);
    }

    #[test]
    fn test_staleness() {
        let state = MarketState::new();
        assert!(state.is_stale(Instrument::Sol, 10_000, 5_000));

        state.write(snapshot(Instrument::Sol, 100.0, 10_000));
        assert!(!state.is_stale(Instrument::Sol, 14_000, 5_000));
        assert!(state.is_stale(Instrument::Sol, 16_000, 5_000));
    }

    #[test]
    fn test_failure_counters() {
        let state = MarketState::new();
        let feed = Feed::Price(Instrument::Sol);

        assert_eq!(state.record_failure(feed), 1);
        assert_eq!(state.record_failure(feed), 2);
        assert_eq!(state.failures(Feed::Balances), 0);

        assert_eq!(state.record_success(feed), 2);
        assert_eq!(state.failures(feed), 0);
        assert_eq!(state.record_success(feed), 0);
    }

    #[test]
    fn test_balances_roundtrip() {
        let state = MarketState::new();
        state.write_balances(BalanceSnapshot::new(vec![WalletBalance::from_lamports(
            "wallet", 1_000_000_000,
        )]));
        let balances = state.read_balances().unwrap();
        assert_eq!(balances.wallets.len(), 1);
        assert!((balances.total_sol() - 1.0).abs() < 1e-9);
    }
}
