// src/store/sqlite.rs
use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;

use super::{BasketSnapshotStore, FundingRewardStore, ProcessingStatusStore, SynthesizedCandleStore};
use crate::providers::{AssetUniverse, FundingRateStore, MarketCapStore, PriceSeriesStore};
use crate::types::{
    Asset, AssetId, AssetStatus, BasketSnapshot, ConstituentAllocation, FundingRewardEvent, JobKind,
    MarketCapSample, PriceBracket, PriceSample, ProcessingState, SourceVenue, SynthesizedCandle,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct PriceRow {
    asset_id: i64,
    ts_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl From<PriceRow> for PriceSample {
    fn from(r: PriceRow) -> Self {
        PriceSample {
            asset_id: r.asset_id,
            ts_ms: r.ts_ms,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.volume,
        }
    }
}

#[derive(FromRow)]
struct AssetRow {
    id: i64,
    name: String,
    symbol: String,
    venue: String,
    status: String,
    pair: Option<String>,
    contract_type: Option<String>,
    categories: String,
}

#[derive(FromRow)]
struct SnapshotRow {
    index_id: String,
    category: String,
    ts_ms: i64,
    reference_price: f64,
    close_price: f64,
    constituents: String,
    spread: Option<f64>,
}

impl SnapshotRow {
    fn into_snapshot(self) -> anyhow::Result<BasketSnapshot> {
        let constituents: Vec<ConstituentAllocation> = serde_json::from_str(&self.constituents)
            .with_context(|| format!("corrupt constituents for {} @{}", self.index_id, self.ts_ms))?;
        Ok(BasketSnapshot {
            index_id: self.index_id,
            category: (!self.category.is_empty()).then_some(self.category),
            ts_ms: self.ts_ms,
            reference_price: self.reference_price,
            close_price: self.close_price,
            constituents,
            spread: self.spread,
        })
    }
}

#[derive(FromRow)]
struct CandleRow {
    index_id: String,
    ts_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

impl From<CandleRow> for SynthesizedCandle {
    fn from(r: CandleRow) -> Self {
        SynthesizedCandle { index_id: r.index_id, ts_ms: r.ts_ms, open: r.open, high: r.high, low: r.low, close: r.close }
    }
}

const PRICE_COLS: &str = "asset_id, ts_ms, open, high, low, close, volume";

impl SqliteStore {
    /// Open (creating if needed) and migrate.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("bad database url {database_url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            // in-memory databases vanish with their last connection
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to open {database_url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(database_url, "sqlite store ready");
        Ok(store)
    }

    /// Private in-memory database; a single connection so every query sees the same data.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.context("migrations failed")?;
        Ok(())
    }

    // ---- ingestion-side writers ----

    pub async fn upsert_asset(&self, a: &Asset) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO assets (id, name, symbol, venue, status, pair, contract_type, categories)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                symbol = excluded.symbol,
                venue = excluded.venue,
                status = excluded.status,
                pair = excluded.pair,
                contract_type = excluded.contract_type,
                categories = excluded.categories",
        )
        .bind(a.id)
        .bind(&a.name)
        .bind(&a.symbol)
        .bind(a.venue.as_str())
        .bind(match a.status {
            AssetStatus::Active => "active",
            AssetStatus::Delisted => "delisted",
        })
        .bind(&a.pair)
        .bind(&a.contract_type)
        .bind(a.categories.join(","))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_price_samples(&self, samples: &[PriceSample]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for s in samples {
            sqlx::query(
                "INSERT OR IGNORE INTO price_samples (asset_id, ts_ms, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(s.asset_id)
            .bind(s.ts_ms)
            .bind(s.open)
            .bind(s.high)
            .bind(s.low)
            .bind(s.close)
            .bind(s.volume)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_market_cap(&self, s: &MarketCapSample) -> anyhow::Result<()> {
        sqlx::query("INSERT OR IGNORE INTO market_caps (asset_id, ts_ms, market_cap) VALUES (?1, ?2, ?3)")
            .bind(s.asset_id)
            .bind(s.ts_ms)
            .bind(s.market_cap)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_funding_rate(&self, asset_id: AssetId, ts_ms: i64, rate: f64) -> anyhow::Result<()> {
        sqlx::query("INSERT OR IGNORE INTO funding_rates (asset_id, ts_ms, rate) VALUES (?1, ?2, ?3)")
            .bind(asset_id)
            .bind(ts_ms)
            .bind(rate)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PriceSeriesStore for SqliteStore {
    async fn bracket(&self, asset_id: AssetId, ts_ms: i64) -> anyhow::Result<PriceBracket> {
        let before = sqlx::query_as::<_, PriceRow>(&format!(
            "SELECT {PRICE_COLS} FROM price_samples WHERE asset_id = ?1 AND ts_ms <= ?2 ORDER BY ts_ms DESC LIMIT 1"
        ))
        .bind(asset_id)
        .bind(ts_ms)
        .fetch_optional(&self.pool)
        .await?;
        let after = sqlx::query_as::<_, PriceRow>(&format!(
            "SELECT {PRICE_COLS} FROM price_samples WHERE asset_id = ?1 AND ts_ms >= ?2 ORDER BY ts_ms ASC LIMIT 1"
        ))
        .bind(asset_id)
        .bind(ts_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(PriceBracket { before: before.map(Into::into), after: after.map(Into::into) })
    }

    async fn span(&self, asset_id: AssetId) -> anyhow::Result<Option<(i64, i64)>> {
        let row: (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT MIN(ts_ms), MAX(ts_ms) FROM price_samples WHERE asset_id = ?1")
                .bind(asset_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(match row {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        })
    }
}

#[async_trait]
impl MarketCapStore for SqliteStore {
    async fn latest_before(&self, asset_id: AssetId, ts_ms: i64) -> anyhow::Result<Option<MarketCapSample>> {
        let row: Option<(i64, f64)> = sqlx::query_as(
            "SELECT ts_ms, market_cap FROM market_caps WHERE asset_id = ?1 AND ts_ms <= ?2 ORDER BY ts_ms DESC LIMIT 1",
        )
        .bind(asset_id)
        .bind(ts_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(ts_ms, market_cap)| MarketCapSample { asset_id, ts_ms, market_cap }))
    }
}

#[async_trait]
impl AssetUniverse for SqliteStore {
    async fn assets(&self) -> anyhow::Result<Vec<Asset>> {
        let rows = sqlx::query_as::<_, AssetRow>(
            "SELECT id, name, symbol, venue, status, pair, contract_type, categories FROM assets ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let Some(venue) = SourceVenue::parse(&r.venue) else {
                tracing::debug!(asset_id = r.id, venue = %r.venue, "skipping asset on unknown venue");
                continue;
            };
            out.push(Asset {
                id: r.id,
                name: r.name,
                symbol: r.symbol,
                venue,
                status: if r.status.eq_ignore_ascii_case("active") { AssetStatus::Active } else { AssetStatus::Delisted },
                pair: r.pair,
                contract_type: r.contract_type,
                categories: r
                    .categories
                    .split(',')
                    .map(|c| c.trim().to_ascii_lowercase())
                    .filter(|c| !c.is_empty())
                    .collect(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl FundingRateStore for SqliteStore {
    async fn rate_at(&self, asset_id: AssetId, ts_ms: i64) -> anyhow::Result<Option<f64>> {
        let rate: Option<f64> = sqlx::query_scalar(
            "SELECT rate FROM funding_rates WHERE asset_id = ?1 AND ts_ms <= ?2 ORDER BY ts_ms DESC LIMIT 1",
        )
        .bind(asset_id)
        .bind(ts_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rate)
    }
}

#[async_trait]
impl BasketSnapshotStore for SqliteStore {
    async fn latest(&self, index_id: &str, category: Option<&str>) -> anyhow::Result<Option<BasketSnapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT index_id, category, ts_ms, reference_price, close_price, constituents, spread
             FROM basket_snapshots WHERE index_id = ?1 AND category = ?2
             ORDER BY ts_ms DESC LIMIT 1",
        )
        .bind(index_id)
        .bind(category.unwrap_or(""))
        .fetch_optional(&self.pool)
        .await?;
        row.map(SnapshotRow::into_snapshot).transpose()
    }

    async fn insert(&self, s: &BasketSnapshot) -> anyhow::Result<()> {
        let constituents = serde_json::to_string(&s.constituents)?;
        sqlx::query(
            "INSERT INTO basket_snapshots (index_id, category, ts_ms, reference_price, close_price, constituents, spread)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&s.index_id)
        .bind(s.category.as_deref().unwrap_or(""))
        .bind(s.ts_ms)
        .bind(s.reference_price)
        .bind(s.close_price)
        .bind(constituents)
        .bind(s.spread)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert snapshot {} @{}", s.index_id, s.ts_ms))?;
        Ok(())
    }

    async fn list_by_index(&self, index_id: &str) -> anyhow::Result<Vec<BasketSnapshot>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT index_id, category, ts_ms, reference_price, close_price, constituents, spread
             FROM basket_snapshots WHERE index_id = ?1 ORDER BY ts_ms ASC",
        )
        .bind(index_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    async fn annotate_spread(
        &self,
        index_id: &str,
        category: Option<&str>,
        ts_ms: i64,
        spread: f64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE basket_snapshots SET spread = ?1 WHERE index_id = ?2 AND category = ?3 AND ts_ms = ?4",
        )
        .bind(spread)
        .bind(index_id)
        .bind(category.unwrap_or(""))
        .bind(ts_ms)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl SynthesizedCandleStore for SqliteStore {
    async fn latest(&self, index_id: &str) -> anyhow::Result<Option<SynthesizedCandle>> {
        let row = sqlx::query_as::<_, CandleRow>(
            "SELECT index_id, ts_ms, open, high, low, close FROM synthesized_candles
             WHERE index_id = ?1 ORDER BY ts_ms DESC LIMIT 1",
        )
        .bind(index_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_batch_ignore_conflicts(&self, candles: &[SynthesizedCandle]) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for c in candles {
            let res = sqlx::query(
                "INSERT INTO synthesized_candles (index_id, ts_ms, open, high, low, close)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(index_id, ts_ms) DO NOTHING",
            )
            .bind(&c.index_id)
            .bind(c.ts_ms)
            .bind(c.open)
            .bind(c.high)
            .bind(c.low)
            .bind(c.close)
            .execute(&mut *tx)
            .await?;
            written += res.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn range(&self, index_id: &str, from_ms: i64, to_ms: i64) -> anyhow::Result<Vec<SynthesizedCandle>> {
        let rows = sqlx::query_as::<_, CandleRow>(
            "SELECT index_id, ts_ms, open, high, low, close FROM synthesized_candles
             WHERE index_id = ?1 AND ts_ms >= ?2 AND ts_ms < ?3 ORDER BY ts_ms ASC",
        )
        .bind(index_id)
        .bind(from_ms)
        .bind(to_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl ProcessingStatusStore for SqliteStore {
    async fn get(&self, index_id: &str, job: JobKind) -> anyhow::Result<ProcessingState> {
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM processing_status WHERE index_id = ?1 AND job = ?2")
                .bind(index_id)
                .bind(job.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(state.map(|s| ProcessingState::parse(&s)).unwrap_or(ProcessingState::NotStarted))
    }

    async fn set(&self, index_id: &str, job: JobKind, state: ProcessingState) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO processing_status (index_id, job, state, updated_at_ms) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(index_id, job) DO UPDATE SET state = excluded.state, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(index_id)
        .bind(job.as_str())
        .bind(state.as_str())
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_begin(&self, index_id: &str, job: JobKind) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "INSERT INTO processing_status (index_id, job, state, updated_at_ms) VALUES (?1, ?2, 'processing', ?3)
             ON CONFLICT(index_id, job) DO UPDATE SET state = 'processing', updated_at_ms = excluded.updated_at_ms
             WHERE processing_status.state != 'processing'",
        )
        .bind(index_id)
        .bind(job.as_str())
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn reset_in_flight(&self) -> anyhow::Result<u64> {
        let res = sqlx::query("UPDATE processing_status SET state = 'error', updated_at_ms = ?1 WHERE state = 'processing'")
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl FundingRewardStore for SqliteStore {
    async fn insert_ignore(&self, e: &FundingRewardEvent) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO funding_rewards (index_id, ts_ms, reward, n_priced) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&e.index_id)
        .bind(e.ts_ms)
        .bind(e.reward)
        .bind(e.n_priced as i64)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list(&self, index_id: &str) -> anyhow::Result<Vec<FundingRewardEvent>> {
        let rows: Vec<(String, i64, f64, i64)> = sqlx::query_as(
            "SELECT index_id, ts_ms, reward, n_priced FROM funding_rewards WHERE index_id = ?1 ORDER BY ts_ms ASC",
        )
        .bind(index_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(index_id, ts_ms, reward, n)| FundingRewardEvent { index_id, ts_ms, reward, n_priced: n.max(0) as usize })
            .collect())
    }
}
