//! SOL Gateway
//!
//! Market-data gateway:
//! - Polls wallet balances and kline prices from upstream HTTP APIs
//! - Caches the latest snapshots in shared market state
//! - Streams snapshots to WebSocket subscribers on a fixed cadence
//! - Shuts down gracefully on SIGINT/SIGTERM

pub mod config;
pub mod core;
pub mod error;
pub mod server;

pub use error::AppError;
