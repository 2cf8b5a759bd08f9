// src/service.rs
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::IndexServiceConfig;
use crate::funding::FundingRewardEngine;
use crate::index::id::IndexSpec;
use crate::index::rebalance::{RebalanceEngine, RebalanceReport};
use crate::index::weights::WeightEngine;
use crate::index::{IndexError, Result};
use crate::live::{LiveAggregator, LiveSummary};
use crate::providers::{AssetUniverse, MarketCapStore, TickSource};
use crate::publishing::Publisher;
use crate::store::{BasketSnapshotStore, IndexStore, ProcessingStatusStore, SynthesizedCandleStore};
use crate::synthesis::{SynthesisReport, SynthesisScheduler};
use crate::types::{AssetId, FundingRewardEvent, JobKind, ProcessingState};

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub rebalance: RebalanceReport,
    pub synthesis: Option<SynthesisReport>,
    pub funding: usize,
}

/// Owns one store and the engines built on it.
pub struct IndexService<S: IndexStore> {
    cfg: IndexServiceConfig,
    store: Arc<S>,
    rebalance: RebalanceEngine,
    synthesis: SynthesisScheduler,
    funding: FundingRewardEngine,
    sinks: Vec<Arc<dyn Publisher>>,
}

impl<S: IndexStore> IndexService<S> {
    pub fn new(cfg: IndexServiceConfig, store: Arc<S>, sinks: Vec<Arc<dyn Publisher>>) -> Self {
        let rebalance = RebalanceEngine::from_store(cfg.rebalance.clone(), Arc::clone(&store));
        let synthesis = sinks
            .iter()
            .fold(SynthesisScheduler::from_store(&cfg, Arc::clone(&store)), |s, p| s.with_sink(Arc::clone(p)));
        let funding = sinks
            .iter()
            .fold(FundingRewardEngine::from_store(Arc::clone(&store)), |f, p| f.with_sink(Arc::clone(p)));
        Self { cfg, store, rebalance, synthesis, funding, sinks }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Clear `Processing` rows left behind by a previous process.
    pub async fn recover(&self) -> Result<u64> {
        let n = self.store.reset_in_flight().await?;
        if n > 0 {
            tracing::warn!(n, "reset stale in-flight jobs");
        }
        Ok(n)
    }

    pub async fn rebalance(&self, index_id: &str) -> Result<RebalanceReport> {
        self.rebalance.generate_basket(index_id).await
    }

    pub async fn synthesize(&self, index_id: &str) -> Result<SynthesisReport> {
        self.synthesis.synthesize(index_id).await
    }

    pub async fn funding(&self, index_id: &str) -> Result<Vec<FundingRewardEvent>> {
        self.funding.compute_missing(index_id).await
    }

    pub async fn status(&self, index_id: &str) -> Result<Vec<(JobKind, ProcessingState)>> {
        let mut out = Vec::with_capacity(3);
        for job in [JobKind::Rebalance, JobKind::Synthesis, JobKind::Funding] {
            out.push((job, ProcessingStatusStore::get(self.store.as_ref(), index_id, job).await?));
        }
        Ok(out)
    }

    /// Rebalance, then backfill, then funding. Synthesis is skipped while
    /// there is still no basket for the index.
    pub async fn run_cycle(&self, index_id: &str) -> Result<CycleReport> {
        let rebalance = self.rebalance(index_id).await?;
        let synthesis = match self.synthesize(index_id).await {
            Ok(r) => Some(r),
            Err(IndexError::NoBasket(_)) => {
                tracing::warn!(index_id, "no basket yet, synthesis skipped");
                None
            }
            Err(e) => return Err(e),
        };
        let funding = self.funding(index_id).await?.len();
        Ok(CycleReport { rebalance, synthesis, funding })
    }

    /// Stream the live tail of the latest basket until `shutdown` fires.
    pub async fn live(
        &self,
        index_id: &str,
        source: Arc<dyn TickSource>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<LiveSummary> {
        let category = IndexSpec::parse(index_id)?.category;
        let snapshot = BasketSnapshotStore::latest(self.store.as_ref(), index_id, category.as_deref())
            .await?
            .ok_or_else(|| IndexError::NoBasket(index_id.to_string()))?;

        let symbols: HashMap<AssetId, String> =
            self.store.assets().await?.into_iter().map(|a| (a.id, a.symbol)).collect();
        let feeds: Vec<(AssetId, String)> = snapshot
            .constituents
            .iter()
            .filter_map(|c| symbols.get(&c.asset_id).map(|s| (c.asset_id, s.clone())))
            .collect();

        let last = SynthesizedCandleStore::latest(self.store.as_ref(), index_id).await?;
        let baseline = last.map_or(snapshot.close_price, |c| c.close);

        let caps: Arc<dyn MarketCapStore> = self.store.clone();
        let weights = WeightEngine::new(caps, self.cfg.rebalance.min_weight);
        let agg = self
            .sinks
            .iter()
            .fold(LiveAggregator::new(self.cfg.live.clone(), source, weights), |a, p| a.with_sink(Arc::clone(p)));
        agg.run(&snapshot, feeds, baseline, shutdown).await
    }
}
