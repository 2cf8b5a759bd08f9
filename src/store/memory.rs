// src/store/memory.rs
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use super::{BasketSnapshotStore, FundingRewardStore, ProcessingStatusStore, SynthesizedCandleStore};
use crate::providers::{AssetUniverse, FundingRateStore, MarketCapStore, PriceSeriesStore};
use crate::types::{
    Asset, AssetId, BasketSnapshot, FundingRewardEvent, JobKind, MarketCapSample, PriceBracket, PriceSample,
    ProcessingState, SynthesizedCandle,
};

type Series<T> = HashMap<AssetId, BTreeMap<i64, T>>;

/// Everything in process memory. Same semantics as [`super::SqliteStore`].
#[derive(Default)]
pub struct MemoryStore {
    assets: RwLock<Vec<Asset>>,
    prices: RwLock<Series<PriceSample>>,
    caps: RwLock<Series<f64>>,
    funding: RwLock<Series<f64>>,
    snapshots: RwLock<Vec<BasketSnapshot>>,
    candles: RwLock<HashMap<String, BTreeMap<i64, SynthesizedCandle>>>,
    status: Mutex<HashMap<(String, JobKind), ProcessingState>>,
    rewards: RwLock<BTreeMap<(String, i64), FundingRewardEvent>>,
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("memory store lock poisoned")
}

fn latest_at_or_before<T: Copy>(series: &Series<T>, asset_id: AssetId, ts_ms: i64) -> Option<(i64, T)> {
    series.get(&asset_id)?.range(..=ts_ms).next_back().map(|(ts, v)| (*ts, *v))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_asset(&self, asset: Asset) {
        if let Ok(mut g) = self.assets.write() {
            g.retain(|a| a.id != asset.id);
            g.push(asset);
        }
    }

    pub fn add_prices(&self, samples: impl IntoIterator<Item = PriceSample>) {
        if let Ok(mut g) = self.prices.write() {
            for s in samples {
                g.entry(s.asset_id).or_default().entry(s.ts_ms).or_insert(s);
            }
        }
    }

    pub fn add_market_cap(&self, asset_id: AssetId, ts_ms: i64, market_cap: f64) {
        if let Ok(mut g) = self.caps.write() {
            g.entry(asset_id).or_default().insert(ts_ms, market_cap);
        }
    }

    pub fn add_funding_rate(&self, asset_id: AssetId, ts_ms: i64, rate: f64) {
        if let Ok(mut g) = self.funding.write() {
            g.entry(asset_id).or_default().insert(ts_ms, rate);
        }
    }

    pub fn candle_count(&self, index_id: &str) -> usize {
        self.candles.read().map(|g| g.get(index_id).map_or(0, BTreeMap::len)).unwrap_or(0)
    }
}

#[async_trait]
impl PriceSeriesStore for MemoryStore {
    async fn bracket(&self, asset_id: AssetId, ts_ms: i64) -> anyhow::Result<PriceBracket> {
        let g = self.prices.read().map_err(poisoned)?;
        let Some(series) = g.get(&asset_id) else {
            return Ok(PriceBracket::default());
        };
        Ok(PriceBracket {
            before: series.range(..=ts_ms).next_back().map(|(_, s)| *s),
            after: series.range(ts_ms..).next().map(|(_, s)| *s),
        })
    }

    async fn span(&self, asset_id: AssetId) -> anyhow::Result<Option<(i64, i64)>> {
        let g = self.prices.read().map_err(poisoned)?;
        Ok(g.get(&asset_id).and_then(|s| Some((*s.keys().next()?, *s.keys().next_back()?))))
    }
}

#[async_trait]
impl MarketCapStore for MemoryStore {
    async fn latest_before(&self, asset_id: AssetId, ts_ms: i64) -> anyhow::Result<Option<MarketCapSample>> {
        let g = self.caps.read().map_err(poisoned)?;
        Ok(latest_at_or_before(&g, asset_id, ts_ms).map(|(ts_ms, market_cap)| MarketCapSample {
            asset_id,
            ts_ms,
            market_cap,
        }))
    }
}

#[async_trait]
impl AssetUniverse for MemoryStore {
    async fn assets(&self) -> anyhow::Result<Vec<Asset>> {
        Ok(self.assets.read().map_err(poisoned)?.clone())
    }
}

#[async_trait]
impl FundingRateStore for MemoryStore {
    async fn rate_at(&self, asset_id: AssetId, ts_ms: i64) -> anyhow::Result<Option<f64>> {
        let g = self.funding.read().map_err(poisoned)?;
        Ok(latest_at_or_before(&g, asset_id, ts_ms).map(|(_, r)| r))
    }
}

#[async_trait]
impl BasketSnapshotStore for MemoryStore {
    async fn latest(&self, index_id: &str, category: Option<&str>) -> anyhow::Result<Option<BasketSnapshot>> {
        let g = self.snapshots.read().map_err(poisoned)?;
        Ok(g.iter()
            .filter(|s| s.index_id == index_id && s.category.as_deref() == category)
            .max_by_key(|s| s.ts_ms)
            .cloned())
    }

    async fn insert(&self, snapshot: &BasketSnapshot) -> anyhow::Result<()> {
        let mut g = self.snapshots.write().map_err(poisoned)?;
        let dup = g.iter().any(|s| {
            s.index_id == snapshot.index_id && s.category == snapshot.category && s.ts_ms == snapshot.ts_ms
        });
        if dup {
            anyhow::bail!("snapshot {} @{} already exists", snapshot.index_id, snapshot.ts_ms);
        }
        g.push(snapshot.clone());
        Ok(())
    }

    async fn list_by_index(&self, index_id: &str) -> anyhow::Result<Vec<BasketSnapshot>> {
        let g = self.snapshots.read().map_err(poisoned)?;
        let mut out: Vec<BasketSnapshot> = g.iter().filter(|s| s.index_id == index_id).cloned().collect();
        out.sort_by_key(|s| s.ts_ms);
        Ok(out)
    }

    async fn annotate_spread(
        &self,
        index_id: &str,
        category: Option<&str>,
        ts_ms: i64,
        spread: f64,
    ) -> anyhow::Result<bool> {
        let mut g = self.snapshots.write().map_err(poisoned)?;
        match g
            .iter_mut()
            .find(|s| s.index_id == index_id && s.category.as_deref() == category && s.ts_ms == ts_ms)
        {
            Some(s) => {
                s.spread = Some(spread);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl SynthesizedCandleStore for MemoryStore {
    async fn latest(&self, index_id: &str) -> anyhow::Result<Option<SynthesizedCandle>> {
        let g = self.candles.read().map_err(poisoned)?;
        Ok(g.get(index_id).and_then(|m| m.values().next_back().cloned()))
    }

    async fn insert_batch_ignore_conflicts(&self, candles: &[SynthesizedCandle]) -> anyhow::Result<u64> {
        let mut g = self.candles.write().map_err(poisoned)?;
        let mut written = 0;
        for c in candles {
            let series = g.entry(c.index_id.clone()).or_default();
            if let std::collections::btree_map::Entry::Vacant(v) = series.entry(c.ts_ms) {
                v.insert(c.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn range(&self, index_id: &str, from_ms: i64, to_ms: i64) -> anyhow::Result<Vec<SynthesizedCandle>> {
        let g = self.candles.read().map_err(poisoned)?;
        Ok(g.get(index_id)
            .map(|m| m.range(from_ms..to_ms).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ProcessingStatusStore for MemoryStore {
    async fn get(&self, index_id: &str, job: JobKind) -> anyhow::Result<ProcessingState> {
        let g = self.status.lock().map_err(poisoned)?;
        Ok(g.get(&(index_id.to_string(), job)).copied().unwrap_or(ProcessingState::NotStarted))
    }

    async fn set(&self, index_id: &str, job: JobKind, state: ProcessingState) -> anyhow::Result<()> {
        self.status.lock().map_err(poisoned)?.insert((index_id.to_string(), job), state);
        Ok(())
    }

    async fn try_begin(&self, index_id: &str, job: JobKind) -> anyhow::Result<bool> {
        let mut g = self.status.lock().map_err(poisoned)?;
        let slot = g.entry((index_id.to_string(), job)).or_insert(ProcessingState::NotStarted);
        if *slot == ProcessingState::Processing {
            return Ok(false);
        }
        *slot = ProcessingState::Processing;
        Ok(true)
    }

    async fn reset_in_flight(&self) -> anyhow::Result<u64> {
        let mut g = self.status.lock().map_err(poisoned)?;
        let mut n = 0;
        for state in g.values_mut().filter(|s| **s == ProcessingState::Processing) {
            *state = ProcessingState::Error;
            n += 1;
        }
        Ok(n)
    }
}

#[async_trait]
impl FundingRewardStore for MemoryStore {
    async fn insert_ignore(&self, event: &FundingRewardEvent) -> anyhow::Result<bool> {
        let mut g = self.rewards.write().map_err(poisoned)?;
        let key = (event.index_id.clone(), event.ts_ms);
        if g.contains_key(&key) {
            return Ok(false);
        }
        g.insert(key, event.clone());
        Ok(true)
    }

    async fn list(&self, index_id: &str) -> anyhow::Result<Vec<FundingRewardEvent>> {
        let g = self.rewards.read().map_err(poisoned)?;
        Ok(g.values().filter(|e| e.index_id == index_id).cloned().collect())
    }
}
