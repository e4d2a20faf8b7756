//! Core module - market state, upstream polling, connection registry,
//! broadcasting and lifecycle
//!
//! This module uses **explicit re-exports** instead of glob exports
//! (`pub use module::*`) so the public API only changes on purpose.
//!
//! ## Usage
//! Prefer importing from `crate::core`:
//! ```ignore
//! use crate::core::{Gateway, MarketState, ConnectionRegistry};
//! ```

pub mod broadcaster;
pub mod feeds;
pub mod lifecycle;
pub mod market_state;
pub mod monitor;
pub mod registry;
pub mod types;

// Explicit re-exports for types module
pub use types::{
    current_time_ms, BalanceSnapshot, Instrument, Kline, MarketSnapshot, StreamEvent,
    WalletBalance, LAMPORTS_PER_SOL,
};

// Explicit re-exports for market_state module
pub use market_state::{Feed, MarketState};

// Explicit re-exports for feeds module
pub use feeds::{BalanceSource, BinanceKlineSource, PriceSource, SolanaRpcBalanceSource};

// Explicit re-exports for registry module
pub use registry::{Connection, ConnectionId, ConnectionRegistry, EmitError, CONNECTION_CHANNEL_CAPACITY};

// Explicit re-exports for broadcaster module
pub use broadcaster::{Broadcaster, PriceSink, TickReport, DEFAULT_BROADCAST_INTERVAL};

// Explicit re-exports for monitor module
pub use monitor::{MonitorSettings, MonitorState, UpstreamMonitor};

// Explicit re-exports for lifecycle module
pub use lifecycle::{Gateway, LifecycleState};
