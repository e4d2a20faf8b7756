//! Upstream data sources polled by the monitor.
//!
//! # Architecture
//! - `PriceSource`: latest candle per instrument (`BinanceKlineSource`)
//! - `BalanceSource`: tracked wallet balances (`SolanaRpcBalanceSource`)
//!
//! Both are traits so the monitor can be driven by stubs in tests. Every HTTP
//! call goes through a client built with the configured fetch timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::types::{BalanceSnapshot, Instrument, Kline, MarketSnapshot, WalletBalance};
use crate::error::{AppError, Result};

/// Source of price snapshots
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self, instrument: Instrument) -> Result<MarketSnapshot>;
}

/// Source of wallet balances
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch(&self) -> Result<BalanceSnapshot>;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

// =============================================================================
// Binance klines
// =============================================================================

/// Fetches the latest candle from a Binance-compatible `/api/v3/klines` endpoint.
#[derive(Debug, Clone)]
pub struct BinanceKlineSource {
    client: reqwest::Client,
    base_url: String,
    interval: String,
}

impl BinanceKlineSource {
    pub fn new(base_url: impl Into<String>, interval: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            interval: interval.into(),
        })
    }
}

#[async_trait]
impl PriceSource for BinanceKlineSource {
    async fn fetch(&self, instrument: Instrument) -> Result<MarketSnapshot> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", instrument.symbol()),
                ("interval", self.interval.as_str()),
                ("limit", "1"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Upstream(format!(
                "kline API error for {}: {}",
                instrument.symbol(),
                response.status()
            )));
        }

        let rows: Vec<Vec<Value>> = response.json().await?;
        let row = rows.last().ok_or_else(|| {
            AppError::Upstream(format!("empty kline response for {}", instrument.symbol()))
        })?;

        Ok(MarketSnapshot::new(instrument, parse_kline_row(row)?))
    }
}

/// Parse one `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]` row.
fn parse_kline_row(row: &[Value]) -> Result<Kline> {
    if row.len() < 7 {
        return Err(AppError::Upstream(format!(
            "kline row has {} fields, expected at least 7",
            row.len()
        )));
    }

    Ok(Kline {
        open_time: as_u64(&row[0], "open_time")?,
        open: as_f64(&row[1], "open")?,
        high: as_f64(&row[2], "high")?,
        low: as_f64(&row[3], "low")?,
        close: as_f64(&row[4], "close")?,
        volume: as_f64(&row[5], "volume")?,
        close_time: as_u64(&row[6], "close_time")?,
    })
}

// Binance sends prices as strings and times as numbers; accept either.
fn as_f64(value: &Value, field: &str) -> Result<f64> {
    match value {
        Value::String(s) => s
            .parse()
            .map_err(|e| AppError::Upstream(format!("invalid kline {}: {}", field, e))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| AppError::Upstream(format!("invalid kline {}", field))),
        other => Err(AppError::Upstream(format!("invalid kline {}: {}", field, other))),
    }
}

fn as_u64(value: &Value, field: &str) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| AppError::Upstream(format!("invalid kline {}", field))),
        Value::String(s) => s
            .parse()
            .map_err(|e| AppError::Upstream(format!("invalid kline {}: {}", field, e))),
        other => Err(AppError::Upstream(format!("invalid kline {}: {}", field, other))),
    }
}

// =============================================================================
// Solana RPC balances
// =============================================================================

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<RpcBalanceResult>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcBalanceResult {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Reads SOL balances of the configured wallets via JSON-RPC `getBalance`.
#[derive(Debug, Clone)]
pub struct SolanaRpcBalanceSource {
    client: reqwest::Client,
    rpc_url: String,
    wallets: Vec<String>,
}

impl SolanaRpcBalanceSource {
    pub fn new(rpc_url: impl Into<String>, wallets: Vec<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            rpc_url: rpc_url.into(),
            wallets,
        })
    }

    async fn get_balance(&self, address: &str) -> Result<u64> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getBalance",
            "params": [address],
        });

        let response = self.client.post(&self.rpc_url).json(&body).send().await?;

        if !response.status().is_success() {
            return Err(AppError::Upstream(format!(
                "balance RPC error for {}: {}",
                address,
                response.status()
            )));
        }

        let rpc: RpcResponse = response.json().await?;
        match (rpc.result, rpc.error) {
            (_, Some(err)) => Err(AppError::Upstream(format!(
                "balance RPC error {} for {}: {}",
                err.code, address, err.message
            ))),
            (Some(result), None) => Ok(result.value),
            (None, None) => Err(AppError::Upstream(format!(
                "balance RPC returned no result for {}",
                address
            ))),
        }
    }
}

#[async_trait]
impl BalanceSource for SolanaRpcBalanceSource {
    async fn fetch(&self) -> Result<BalanceSnapshot> {
        let mut wallets = Vec::with_capacity(self.wallets.len());
        for address in &self.wallets {
            let lamports = self.get_balance(address).await?;
            wallets.push(WalletBalance::from_lamports(address.clone(), lamports));
        }
        Ok(BalanceSnapshot::new(wallets))
    }
}
