// src/types.rs
use serde::{Deserialize, Serialize};
use std::fmt;

pub type AssetId = i64;

pub const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceVenue {
    Spot,
    LinearFutures,
    InverseFutures,
}

impl SourceVenue {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceVenue::Spot => "spot",
            SourceVenue::LinearFutures => "linear_futures",
            SourceVenue::InverseFutures => "inverse_futures",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spot" => Some(SourceVenue::Spot),
            "linear_futures" | "linear" => Some(SourceVenue::LinearFutures),
            "inverse_futures" | "inverse" => Some(SourceVenue::InverseFutures),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Active,
    Delisted,
}

/// One tradable instrument. Owned by ingestion; the index core only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub name: String,   // underlying, e.g. "BTC"
    pub symbol: String, // exchange symbol, e.g. "BTCUSDT"
    pub venue: SourceVenue,
    pub status: AssetStatus,
    pub pair: Option<String>,
    pub contract_type: Option<String>, // "perpetual" | "current_quarter" ...
    #[serde(default)]
    pub categories: Vec<String>,
}

impl Asset {
    pub fn is_active(&self) -> bool {
        self.status == AssetStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub asset_id: AssetId,
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceSample {
    /// Flat sample, handy when only a close is known.
    pub fn at(asset_id: AssetId, ts_ms: i64, price: f64) -> Self {
        Self { asset_id, ts_ms, open: price, high: price, low: price, close: price, volume: 0.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketCapSample {
    pub asset_id: AssetId,
    pub ts_ms: i64,
    pub market_cap: f64,
}

/// Closest samples around a target timestamp, each independently optional.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriceBracket {
    pub before: Option<PriceSample>, // at-or-before
    pub after: Option<PriceSample>,  // at-or-after
}

/// Half-open valuation window `[start_ms, end_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstituentAllocation {
    pub asset_id: AssetId,
    pub weight: f64,
    pub start: PriceSample,
    pub end: PriceSample,
    pub amount: f64, // contracts held per unit of index
}

/// One rebalancing event ("Rebalance").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasketSnapshot {
    pub index_id: String,
    pub category: Option<String>,
    pub ts_ms: i64,
    /// Index value at `ts_ms`; equals the previous snapshot's `close_price`.
    pub reference_price: f64,
    /// Index value at the end of the period.
    pub close_price: f64,
    pub constituents: Vec<ConstituentAllocation>,
    pub spread: Option<f64>,
}

impl BasketSnapshot {
    pub fn asset_ids(&self) -> Vec<AssetId> {
        self.constituents.iter().map(|c| c.asset_id).collect()
    }

    pub fn weight_sum(&self) -> f64 {
        self.constituents.iter().map(|c| c.weight).sum()
    }
}

/// One OHLC bar of the synthetic index ("ETF price").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedCandle {
    pub index_id: String,
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRewardEvent {
    pub index_id: String,
    pub ts_ms: i64,
    pub reward: f64,
    pub n_priced: usize, // constituents that had a funding rate
}

/// Exchange-native candle update from a live feed, keyed by candle open time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveTick {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    NotStarted,
    Processing,
    Success,
    ErrorNoData,
    Error,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::NotStarted => "not_started",
            ProcessingState::Processing => "processing",
            ProcessingState::Success => "success",
            ProcessingState::ErrorNoData => "error_no_data",
            ProcessingState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => ProcessingState::Processing,
            "success" => ProcessingState::Success,
            "error_no_data" => ProcessingState::ErrorNoData,
            "error" => ProcessingState::Error,
            _ => ProcessingState::NotStarted,
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Jobs that are guarded by the single-flight status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Rebalance,
    Synthesis,
    Funding,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Rebalance => "rebalance",
            JobKind::Synthesis => "synthesis",
            JobKind::Funding => "funding",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[inline]
pub fn floor_to(ts_ms: i64, step_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(step_ms)
}
