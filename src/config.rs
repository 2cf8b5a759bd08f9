// src/config.rs
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::index::weights::DEFAULT_MIN_WEIGHT;
use crate::types::{SourceVenue, MINUTE_MS};

#[derive(Debug, Clone, Deserialize)]
pub struct IndexServiceConfig {
    #[serde(default = "d_database_url")]         pub database_url: String,
    #[serde(default = "d_db_connections")]       pub db_max_connections: u32,
    #[serde(default = "d_log_level")]            pub log_level: String,
    #[serde(default)]                            pub rebalance: RebalanceConfig,
    #[serde(default)]                            pub synthesis: SynthesisConfig,
    #[serde(default)]                            pub pool: PoolConfig,
    #[serde(default)]                            pub live: LiveConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebalanceConfig {
    /// First period start when an index has no snapshot yet.
    #[serde(default = "d_inception")]            pub inception: DateTime<Utc>,
    #[serde(default = "d_initial_price")]        pub initial_price: f64,
    #[serde(default = "d_min_weight")]           pub min_weight: f64,
    #[serde(default = "d_venue")]                pub venue: SourceVenue,
    #[serde(default = "d_pair_suffix")]          pub pair_suffix: String,
    #[serde(default)]                            pub blacklist: Vec<String>,
    #[serde(default = "d_cap_lookback_days")]    pub market_cap_lookback_days: u32,
    #[serde(default = "d_true")]                 pub require_spot_companion: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "d_step_ms")]              pub step_ms: i64,
    #[serde(default = "d_flush_batch")]          pub flush_batch: usize,
    #[serde(default = "d_max_in_flight")]        pub max_in_flight: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "d_min_workers")]          pub min_workers: usize,
    #[serde(default = "d_max_workers")]          pub max_workers: usize,
    #[serde(default = "d_monitor_ms")]           pub monitor_interval_ms: u64,
    /// 1-minute load average per core under which the pool may grow.
    #[serde(default = "d_load_per_core")]        pub load_per_core_threshold: f64,
    /// Free/total memory ratio required to grow.
    #[serde(default = "d_free_mem")]             pub free_mem_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveWeighting {
    /// WeightEngine runs again on every completed timestamp.
    Recompute,
    /// Weights stay as of the last rebalance.
    Frozen,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "d_reconnect_ms")]         pub reconnect_delay_ms: u64,
    #[serde(default = "d_max_reconnects")]       pub max_reconnects: usize,
    #[serde(default = "d_step_ms")]              pub interval_ms: i64,
    #[serde(default = "d_weighting")]            pub weighting: LiveWeighting,
    #[serde(default = "d_ws_url")]               pub ws_url_template: String,
    #[serde(default = "d_tick_buffer")]          pub tick_buffer: usize,
}

fn d_database_url() -> String { "sqlite://data/index.db".into() }
fn d_db_connections() -> u32 { 8 }
fn d_log_level() -> String { "info".into() }
fn d_inception() -> DateTime<Utc> { DateTime::from_timestamp(1_609_459_200, 0).unwrap_or_default() } // 2021-01-01
fn d_initial_price() -> f64 { 1000.0 }
fn d_min_weight() -> f64 { DEFAULT_MIN_WEIGHT }
fn d_venue() -> SourceVenue { SourceVenue::LinearFutures }
fn d_pair_suffix() -> String { "USDT".into() }
fn d_cap_lookback_days() -> u32 { 7 }
fn d_true() -> bool { true }
fn d_step_ms() -> i64 { MINUTE_MS }
fn d_flush_batch() -> usize { 10_000 }
fn d_max_in_flight() -> usize { 50_000 }
fn d_min_workers() -> usize { 2 }
fn d_max_workers() -> usize { std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4).max(2) }
fn d_monitor_ms() -> u64 { 5_000 }
fn d_load_per_core() -> f64 { 0.75 }
fn d_free_mem() -> f64 { 0.2 }
fn d_reconnect_ms() -> u64 { 5_000 }
fn d_max_reconnects() -> usize { 3 }
fn d_weighting() -> LiveWeighting { LiveWeighting::Recompute }
fn d_ws_url() -> String { "wss://fstream.binance.com/ws/{symbol}@kline_1m".into() }
fn d_tick_buffer() -> usize { 4096 }

#[inline]
pub fn ms(d: u64) -> Duration { Duration::from_millis(d) }

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            inception: d_inception(),
            initial_price: d_initial_price(),
            min_weight: d_min_weight(),
            venue: d_venue(),
            pair_suffix: d_pair_suffix(),
            blacklist: Vec::new(),
            market_cap_lookback_days: d_cap_lookback_days(),
            require_spot_companion: true,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self { step_ms: d_step_ms(), flush_batch: d_flush_batch(), max_in_flight: d_max_in_flight() }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: d_min_workers(),
            max_workers: d_max_workers(),
            monitor_interval_ms: d_monitor_ms(),
            load_per_core_threshold: d_load_per_core(),
            free_mem_threshold: d_free_mem(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: d_reconnect_ms(),
            max_reconnects: d_max_reconnects(),
            interval_ms: d_step_ms(),
            weighting: d_weighting(),
            ws_url_template: d_ws_url(),
            tick_buffer: d_tick_buffer(),
        }
    }
}

impl Default for IndexServiceConfig {
    fn default() -> Self {
        Self {
            database_url: d_database_url(),
            db_max_connections: d_db_connections(),
            log_level: d_log_level(),
            rebalance: RebalanceConfig::default(),
            synthesis: SynthesisConfig::default(),
            pool: PoolConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl RebalanceConfig {
    pub fn inception_ms(&self) -> i64 {
        self.inception.timestamp_millis()
    }

    pub fn lookback_ms(&self) -> i64 {
        self.market_cap_lookback_days as i64 * 86_400_000
    }

    pub fn is_blacklisted(&self, name: &str, symbol: &str) -> bool {
        self.blacklist
            .iter()
            .any(|b| b.eq_ignore_ascii_case(name) || b.eq_ignore_ascii_case(symbol))
    }
}

impl IndexServiceConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(s).context("failed to parse index config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read a TOML file (missing file means defaults) and apply `.env` / environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        if let Ok(url) = std::env::var("INDEX_DATABASE_URL") {
            cfg.database_url = url;
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let p = &self.pool;
        if p.min_workers == 0 || p.max_workers < p.min_workers {
            anyhow::bail!("pool: need 1 <= min_workers <= max_workers (got {}..{})", p.min_workers, p.max_workers);
        }
        if self.synthesis.step_ms <= 0 || self.live.interval_ms <= 0 {
            anyhow::bail!("step/interval must be positive");
        }
        if self.synthesis.flush_batch == 0 || self.synthesis.max_in_flight == 0 {
            anyhow::bail!("synthesis: flush_batch and max_in_flight must be > 0");
        }
        let r = &self.rebalance;
        if !(r.initial_price.is_finite() && r.initial_price > 0.0) {
            anyhow::bail!("rebalance.initial_price must be positive");
        }
        if !(r.min_weight > 0.0 && r.min_weight < 1.0) {
            anyhow::bail!("rebalance.min_weight must be in (0, 1)");
        }
        Ok(())
    }
}
