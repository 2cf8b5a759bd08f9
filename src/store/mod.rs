// src/store/mod.rs
//! Persistence owned by the index core. The read side (prices, caps, assets,
//! funding rates) lives in `providers`; both are implemented by the SQLite and
//! in-memory stores here.
use async_trait::async_trait;

use crate::providers::{AssetUniverse, FundingRateStore, MarketCapStore, PriceSeriesStore};
use crate::types::{BasketSnapshot, FundingRewardEvent, JobKind, ProcessingState, SynthesizedCandle};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait BasketSnapshotStore: Send + Sync {
    async fn latest(&self, index_id: &str, category: Option<&str>) -> anyhow::Result<Option<BasketSnapshot>>;
    async fn insert(&self, snapshot: &BasketSnapshot) -> anyhow::Result<()>;
    /// All snapshots of an index in timestamp order.
    async fn list_by_index(&self, index_id: &str) -> anyhow::Result<Vec<BasketSnapshot>>;
    async fn annotate_spread(
        &self,
        index_id: &str,
        category: Option<&str>,
        ts_ms: i64,
        spread: f64,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait SynthesizedCandleStore: Send + Sync {
    async fn latest(&self, index_id: &str) -> anyhow::Result<Option<SynthesizedCandle>>;
    /// Insert, silently skipping rows whose (index, ts) already exists.
    /// Returns the number of rows actually written.
    async fn insert_batch_ignore_conflicts(&self, candles: &[SynthesizedCandle]) -> anyhow::Result<u64>;
    async fn range(&self, index_id: &str, from_ms: i64, to_ms: i64) -> anyhow::Result<Vec<SynthesizedCandle>>;
}

#[async_trait]
pub trait ProcessingStatusStore: Send + Sync {
    async fn get(&self, index_id: &str, job: JobKind) -> anyhow::Result<ProcessingState>;
    async fn set(&self, index_id: &str, job: JobKind, state: ProcessingState) -> anyhow::Result<()>;
    /// Atomically move to `Processing`. Returns false if a run is already in flight.
    async fn try_begin(&self, index_id: &str, job: JobKind) -> anyhow::Result<bool>;
    /// Mark every `Processing` row as `Error`; for use at start-up only.
    async fn reset_in_flight(&self) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait FundingRewardStore: Send + Sync {
    async fn insert_ignore(&self, event: &FundingRewardEvent) -> anyhow::Result<bool>;
    async fn list(&self, index_id: &str) -> anyhow::Result<Vec<FundingRewardEvent>>;
}

/// Everything a full index cycle reads or writes, in one backend.
pub trait IndexStore:
    AssetUniverse
    + PriceSeriesStore
    + MarketCapStore
    + FundingRateStore
    + BasketSnapshotStore
    + SynthesizedCandleStore
    + ProcessingStatusStore
    + FundingRewardStore
    + 'static
{
}

impl<T> IndexStore for T where
    T: AssetUniverse
        + PriceSeriesStore
        + MarketCapStore
        + FundingRateStore
        + BasketSnapshotStore
        + SynthesizedCandleStore
        + ProcessingStatusStore
        + FundingRewardStore
        + 'static
{
}
