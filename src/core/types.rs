//! Core data types for the monitoring and broadcast pipeline.
//!
//! Snapshots are immutable once built. They are shared as `Arc`s and
//! replaced whole, which is what lets readers never observe a half-written
//! value.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Lamports per SOL
pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

// =============================================================================
// Instrument
// =============================================================================

/// A tracked price feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Instrument {
    Sol,
    Btc,
    Eth,
}

impl Instrument {
    /// Upstream trading symbol quoted in USDT
    pub fn symbol(&self) -> &'static str {
        match self {
            Instrument::Sol => "SOLUSDT",
            Instrument::Btc => "BTCUSDT",
            Instrument::Eth => "ETHUSDT",
        }
    }

    /// Name of the stream event carrying this instrument's snapshots
    pub fn event_name(&self) -> &'static str {
        match self {
            Instrument::Sol => "sol",
            Instrument::Btc => "btc",
            Instrument::Eth => "eth",
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instrument::Sol => write!(f, "SOL"),
            Instrument::Btc => write!(f, "BTC"),
            Instrument::Eth => write!(f, "ETH"),
        }
    }
}

// =============================================================================
// Price Snapshot
// =============================================================================

/// One OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// Candle open time (ms since epoch)
    pub open_time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Candle close time (ms since epoch)
    pub close_time: u64,
}

/// Latest known price data for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub instrument: Instrument,
    /// Last traded price (close of the latest candle)
    pub price: f64,
    pub kline: Kline,
    /// When the gateway received this snapshot (ms since epoch)
    pub updated_at_ms: u64,
}

impl MarketSnapshot {
    /// Build a snapshot from the latest candle, stamped with the current time
    pub fn new(instrument: Instrument, kline: Kline) -> Self {
        Self {
            instrument,
            price: kline.close,
            kline,
            updated_at_ms: current_time_ms(),
        }
    }

    /// Age of the snapshot relative to `now_ms`
    #[inline]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.updated_at_ms)
    }
}

// =============================================================================
// Balance Snapshot
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub address: String,
    pub lamports: u64,
    pub sol: f64,
}

impl WalletBalance {
    pub fn from_lamports(address: impl Into<String>, lamports: u64) -> Self {
        Self {
            address: address.into(),
            lamports,
            sol: lamports as f64 / LAMPORTS_PER_SOL,
        }
    }
}

/// Latest known balances of every tracked wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub wallets: Vec<WalletBalance>,
    pub updated_at_ms: u64,
}

impl BalanceSnapshot {
    pub fn new(wallets: Vec<WalletBalance>) -> Self {
        Self {
            wallets,
            updated_at_ms: current_time_ms(),
        }
    }

    pub fn total_sol(&self) -> f64 {
        self.wallets.iter().map(|w| w.sol).sum()
    }
}

// =============================================================================
// Stream Event (wire contract for subscribers)
// =============================================================================

/// Events pushed to streaming subscribers.
///
/// Serialized as `{"event": "sol", "data": { ...MarketSnapshot }}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StreamEvent {
    #[serde(rename = "sol")]
    Sol(Arc<MarketSnapshot>),
    #[serde(rename = "btc")]
    Btc(Arc<MarketSnapshot>),
    #[serde(rename = "eth")]
    Eth(Arc<MarketSnapshot>),
}

impl StreamEvent {
    /// Wrap a snapshot in the variant for its instrument
    pub fn price(snapshot: Arc<MarketSnapshot>) -> Self {
        match snapshot.instrument {
            Instrument::Sol => StreamEvent::Sol(snapshot),
            Instrument::Btc => StreamEvent::Btc(snapshot),
            Instrument::Eth => StreamEvent::Eth(snapshot),
        }
    }

    pub fn snapshot(&self) -> &Arc<MarketSnapshot> {
        match self {
            StreamEvent::Sol(s) | StreamEvent::Btc(s) | StreamEvent::Eth(s) => s,
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.snapshot().instrument.event_name()
    }
}

// =============================================================================
// Utility
// =============================================================================

/// Get current time in milliseconds since epoch.
#[inline]
pub fn current_time_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kline(close: f64) -> Kline {
        Kline {
            open_time: 1_700_000_000_000,
            open: 99.0,
            high: 101.0,
            low: 98.5,
            close,
            volume: 1234.5,
            close_time: 1_700_000_059_999,
        }
    }

    #[test]
    fn test_instrument_serializes_uppercase() {
        let json = serde_json::to_string(&Instrument::Sol).unwrap();
        assert_eq!(json, "\"SOL\"");
        let parsed: Instrument = serde_json::from_str("\"ETH\"").unwrap();
        assert_eq!(parsed, Instrument::Eth);
    }

    #[test]
    fn test_snapshot_price_is_close() {
        let snapshot = MarketSnapshot::new(Instrument::Sol, sample_kline(100.0));
        assert_eq!(snapshot.price, 100.0);
        assert!(snapshot.updated_at_ms > 1_704_067_200_000);
    }

    #[test]
    fn test_snapshot_age_saturates() {
        let mut snapshot = MarketSnapshot::new(Instrument::Sol, sample_kline(100.0));
        snapshot.updated_at_ms = 10_000;
        assert_eq!(snapshot.age_ms(12_500), 2_500);
        assert_eq!(snapshot.age_ms(5_000), 0);
    }

    #[test]
    fn test_stream_event_wire_format() {
        let snapshot = Arc::new(MarketSnapshot::new(Instrument::Sol, sample_kline(100.0)));
        let event = StreamEvent::price(snapshot);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "sol");
        assert_eq!(value["data"]["instrument"], "SOL");
        assert_eq!(value["data"]["price"], 100.0);
    }

    #[test]
    fn test_stream_event_tagged_by_instrument() {
        let snapshot = Arc::new(MarketSnapshot::new(Instrument::Btc, sample_kline(65_000.0)));
        let event = StreamEvent::price(snapshot);
        assert!(matches!(event, StreamEvent::Btc(_)));
        assert_eq!(event.event_name(), "btc");
    }

    #[test]
    fn test_wallet_balance_from_lamports() {
        let balance = WalletBalance::from_lamports("wallet", 2_500_000_000);
        assert!((balance.sol - 2.5).abs() < f64::EPSILON);

        let snapshot = BalanceSnapshot::new(vec![
            balance,
            WalletBalance::from_lamports("other", 500_000_000),
        ]);
        assert!((snapshot.total_sol() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_current_time_ms() {
        // Should be after 2024-01-01
        assert!(current_time_ms() > 1_704_067_200_000);
    }
}
