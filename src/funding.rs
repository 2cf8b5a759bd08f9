// src/funding.rs
use std::collections::HashSet;
use std::sync::Arc;

use crate::index::{IndexError, Result};
use crate::providers::FundingRateStore;
use crate::publishing::Publisher;
use crate::store::{BasketSnapshotStore, FundingRewardStore, ProcessingStatusStore};
use crate::types::{BasketSnapshot, FundingRewardEvent, JobKind, ProcessingState};

/// Funding carried by one unit of the index at each rebalance: the sum of
/// contract amount times the funding rate in force at the snapshot.
pub struct FundingRewardEngine {
    rates: Arc<dyn FundingRateStore>,
    snapshots: Arc<dyn BasketSnapshotStore>,
    rewards: Arc<dyn FundingRewardStore>,
    status: Arc<dyn ProcessingStatusStore>,
    sinks: Vec<Arc<dyn Publisher>>,
}

impl FundingRewardEngine {
    pub fn new(
        rates: Arc<dyn FundingRateStore>,
        snapshots: Arc<dyn BasketSnapshotStore>,
        rewards: Arc<dyn FundingRewardStore>,
        status: Arc<dyn ProcessingStatusStore>,
    ) -> Self {
        Self { rates, snapshots, rewards, status, sinks: Vec::new() }
    }

    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: FundingRateStore + BasketSnapshotStore + FundingRewardStore + ProcessingStatusStore + 'static,
    {
        Self::new(store.clone(), store.clone(), store.clone(), store)
    }

    pub fn with_sink(mut self, sink: Arc<dyn Publisher>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Reward for one snapshot. A constituent without a rate adds nothing.
    pub async fn reward_for(&self, snapshot: &BasketSnapshot) -> Result<FundingRewardEvent> {
        let mut reward = 0.0;
        let mut n_priced = 0;
        for c in &snapshot.constituents {
            match self.rates.rate_at(c.asset_id, snapshot.ts_ms).await? {
                Some(rate) if rate.is_finite() => {
                    reward += c.amount * rate;
                    n_priced += 1;
                }
                _ => tracing::debug!(asset_id = c.asset_id, ts_ms = snapshot.ts_ms, "no funding rate"),
            }
        }
        Ok(FundingRewardEvent { index_id: snapshot.index_id.clone(), ts_ms: snapshot.ts_ms, reward, n_priced })
    }

    /// Compute, persist and publish every reward not yet stored. Returns the new events.
    pub async fn compute_missing(&self, index_id: &str) -> Result<Vec<FundingRewardEvent>> {
        if !self.status.try_begin(index_id, JobKind::Funding).await? {
            return Err(IndexError::ConcurrentRun { index_id: index_id.to_string(), job: JobKind::Funding });
        }
        let res = self.run(index_id).await;
        let state = if res.is_ok() { ProcessingState::Success } else { ProcessingState::Error };
        if let Err(e) = self.status.set(index_id, JobKind::Funding, state).await {
            tracing::error!(index_id, "failed to record funding state {state}: {e:#}");
        }
        res
    }

    async fn run(&self, index_id: &str) -> Result<Vec<FundingRewardEvent>> {
        let done: HashSet<i64> = self.rewards.list(index_id).await?.into_iter().map(|e| e.ts_ms).collect();
        let mut out = Vec::new();
        for snap in self.snapshots.list_by_index(index_id).await? {
            if done.contains(&snap.ts_ms) {
                continue;
            }
            let event = self.reward_for(&snap).await?;
            if !self.rewards.insert_ignore(&event).await? {
                continue;
            }
            for sink in &self.sinks {
                if let Err(e) = sink.publish_funding(event.clone()).await {
                    tracing::warn!("publish_funding failed: {e:?}");
                }
            }
            out.push(event);
        }
        tracing::info!(index_id, new = out.len(), "funding rewards computed");
        Ok(out)
    }
}
