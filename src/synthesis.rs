// src/synthesis.rs
//! Minute-by-minute backfill of the synthetic index series.
//!
//! The per-minute work that does not depend on the running price (bracket
//! lookups, weights, contract amounts) runs on a [`WorkerPool`]. Results come
//! back in any order; a reorder buffer hands them to a single fold loop which
//! alone owns the running close and applies the step function in timestamp order.
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{IndexServiceConfig, PoolConfig, SynthesisConfig};
use crate::index::id::IndexSpec;
use crate::index::rebalance::reference_price;
use crate::index::step::{fold_step, StepLeg};
use crate::index::weights::WeightEngine;
use crate::index::{IndexError, Result};
use crate::pool::{LoadProbe, PoolError, ScalingPolicy, TaskHandler, WorkerPool};
use crate::providers::{MarketCapStore, PriceSeriesStore};
use crate::publishing::{publish_candles, Publisher};
use crate::store::{BasketSnapshotStore, ProcessingStatusStore, SynthesizedCandleStore};
use crate::types::{floor_to, AssetId, ConstituentAllocation, JobKind, ProcessingState, SynthesizedCandle, TimeWindow};

/// One minute of work for the pool.
#[derive(Debug, Clone)]
pub struct MinuteRequest {
    pub constituent_ids: Arc<[AssetId]>,
    pub window: TimeWindow,
    /// Running index price when the task was submitted; only used for amounts.
    pub price: f64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MinuteResponse {
    Allocations { ts_ms: i64, allocations: Vec<ConstituentAllocation> },
    Error { ts_ms: i64, message: String },
}

/// Fetch brackets, weight and size every constituent for one window.
pub struct MinuteAllocator {
    prices: Arc<dyn PriceSeriesStore>,
    weights: WeightEngine,
}

impl MinuteAllocator {
    pub fn new(prices: Arc<dyn PriceSeriesStore>, weights: WeightEngine) -> Self {
        Self { prices, weights }
    }

    async fn allocate(&self, req: &MinuteRequest) -> Result<Vec<ConstituentAllocation>> {
        let mut priced = Vec::with_capacity(req.constituent_ids.len());
        for &asset_id in req.constituent_ids.iter() {
            match self.prices.window_samples(asset_id, req.window).await? {
                (Some(s), Some(e)) => priced.push((asset_id, s, e)),
                _ => tracing::trace!(asset_id, ts_ms = req.ts_ms, "no bracket"),
            }
        }
        if priced.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<AssetId> = priced.iter().map(|(id, _, _)| *id).collect();
        let weights = self.weights.compute_weights(&ids, req.window).await?;
        Ok(priced
            .into_iter()
            .zip(weights)
            .map(|((asset_id, start, end), w)| ConstituentAllocation {
                asset_id,
                weight: w.weight,
                start,
                end,
                amount: reference_price(&start, &end).map_or(0.0, |px| req.price * w.weight / px),
            })
            .collect())
    }
}

#[async_trait]
impl TaskHandler for MinuteAllocator {
    type Request = MinuteRequest;
    type Response = MinuteResponse;

    async fn handle(&self, req: MinuteRequest) -> anyhow::Result<MinuteResponse> {
        Ok(match self.allocate(&req).await {
            Ok(allocations) => MinuteResponse::Allocations { ts_ms: req.ts_ms, allocations },
            Err(e) => MinuteResponse::Error { ts_ms: req.ts_ms, message: e.to_string() },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisReport {
    pub from_ms: i64,
    pub to_ms: i64,
    /// Steps folded, valid or not.
    pub steps: usize,
    pub persisted: u64,
    /// Steps whose task failed or crashed; folded as flat candles.
    pub failed: usize,
    /// Steps whose candle was NaN and skipped.
    pub invalid: usize,
    pub last_close: f64,
}

pub struct SynthesisScheduler {
    cfg: SynthesisConfig,
    pool_cfg: PoolConfig,
    initial_price: f64,
    prices: Arc<dyn PriceSeriesStore>,
    snapshots: Arc<dyn BasketSnapshotStore>,
    candles: Arc<dyn SynthesizedCandleStore>,
    status: Arc<dyn ProcessingStatusStore>,
    weights: WeightEngine,
    sinks: Vec<Arc<dyn Publisher>>,
    scaling: Option<(Arc<dyn ScalingPolicy>, Arc<dyn LoadProbe>)>,
}

impl SynthesisScheduler {
    pub fn new(
        cfg: &IndexServiceConfig,
        prices: Arc<dyn PriceSeriesStore>,
        caps: Arc<dyn MarketCapStore>,
        snapshots: Arc<dyn BasketSnapshotStore>,
        candles: Arc<dyn SynthesizedCandleStore>,
        status: Arc<dyn ProcessingStatusStore>,
    ) -> Self {
        Self {
            cfg: cfg.synthesis.clone(),
            pool_cfg: cfg.pool.clone(),
            initial_price: cfg.rebalance.initial_price,
            prices,
            snapshots,
            candles,
            status,
            weights: WeightEngine::new(caps, cfg.rebalance.min_weight),
            sinks: Vec::new(),
            scaling: None,
        }
    }

    pub fn from_store<S>(cfg: &IndexServiceConfig, store: Arc<S>) -> Self
    where
        S: PriceSeriesStore
            + MarketCapStore
            + BasketSnapshotStore
            + SynthesizedCandleStore
            + ProcessingStatusStore
            + 'static,
    {
        Self::new(cfg, store.clone(), store.clone(), store.clone(), store.clone(), store)
    }

    pub fn with_sink(mut self, sink: Arc<dyn Publisher>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Replace the OS-driven scaling of each run's pool.
    pub fn with_scaling(mut self, policy: Arc<dyn ScalingPolicy>, probe: Arc<dyn LoadProbe>) -> Self {
        self.scaling = Some((policy, probe));
        self
    }

    /// Backfill every missing minute for the index's latest basket. Safe to
    /// re-run: it resumes after the last stored candle and skips existing rows.
    pub async fn synthesize(&self, index_id: &str) -> Result<SynthesisReport> {
        if !self.status.try_begin(index_id, JobKind::Synthesis).await? {
            return Err(IndexError::ConcurrentRun { index_id: index_id.to_string(), job: JobKind::Synthesis });
        }

        let res = self.run(index_id).await;
        let state = match &res {
            Ok(Some(_)) => ProcessingState::Success,
            Ok(None) | Err(IndexError::NoBasket(_)) => ProcessingState::ErrorNoData,
            Err(_) => ProcessingState::Error,
        };
        if let Err(e) = self.status.set(index_id, JobKind::Synthesis, state).await {
            tracing::error!(index_id, "failed to record synthesis state {state}: {e:#}");
        }

        match res {
            Ok(Some(report)) => {
                tracing::info!(
                    index_id,
                    steps = report.steps,
                    persisted = report.persisted,
                    failed = report.failed,
                    invalid = report.invalid,
                    last_close = report.last_close,
                    "synthesis finished"
                );
                Ok(report)
            }
            Ok(None) => {
                tracing::warn!(index_id, "no price samples for any constituent");
                Ok(SynthesisReport { last_close: self.initial_price, ..Default::default() })
            }
            Err(e) => {
                tracing::warn!(index_id, "synthesis failed: {e}");
                Err(e)
            }
        }
    }

    /// `None` when no constituent has any price data.
    async fn run(&self, index_id: &str) -> Result<Option<SynthesisReport>> {
        let category = IndexSpec::parse(index_id).ok().and_then(|s| s.category);
        let snapshot = self
            .snapshots
            .latest(index_id, category.as_deref())
            .await?
            .ok_or_else(|| IndexError::NoBasket(index_id.to_string()))?;
        let ids: Arc<[AssetId]> = snapshot.asset_ids().into();

        let mut earliest = i64::MAX;
        let mut latest = i64::MIN;
        for &id in ids.iter() {
            if let Some((first, last)) = self.prices.span(id).await? {
                earliest = earliest.min(first);
                latest = latest.max(last);
            }
        }
        if earliest > latest {
            return Ok(None);
        }

        let step = self.cfg.step_ms;
        let last = self.candles.latest(index_id).await?;
        let from_ms = match &last {
            Some(c) => floor_to(earliest, step).max(c.ts_ms + step),
            None => floor_to(earliest, step),
        };
        let to_ms = floor_to(latest, step);
        let baseline = last.as_ref().map_or(self.initial_price, |c| c.close);

        let mut report = SynthesisReport { from_ms, to_ms, last_close: baseline, ..Default::default() };
        if from_ms >= to_ms {
            tracing::info!(index_id, "synthesized series already up to date");
            return Ok(Some(report));
        }
        let total = ((to_ms - from_ms) / step) as usize;
        tracing::info!(index_id, from_ms, to_ms, total, n = ids.len(), baseline, "synthesis started");

        let handler = MinuteAllocator::new(Arc::clone(&self.prices), self.weights.clone());
        let pool = match &self.scaling {
            Some((policy, probe)) => WorkerPool::with_policy(handler, &self.pool_cfg, Arc::clone(policy), Arc::clone(probe)),
            None => WorkerPool::new(handler, &self.pool_cfg),
        };

        let res = self.fold_all(index_id, &pool, ids, from_ms, total, &mut report).await;
        pool.shutdown().await;
        res.map(|()| Some(report))
    }

    async fn fold_all(
        &self,
        index_id: &str,
        pool: &WorkerPool<MinuteAllocator>,
        ids: Arc<[AssetId]>,
        from_ms: i64,
        total: usize,
        report: &mut SynthesisReport,
    ) -> Result<()> {
        let step = self.cfg.step_ms;
        let window = self.cfg.max_in_flight.max(1);
        let mut inflight = FuturesUnordered::new();
        let mut reorder: BTreeMap<usize, Vec<StepLeg>> = BTreeMap::new();
        let mut batch: Vec<SynthesizedCandle> = Vec::with_capacity(self.cfg.flush_batch.min(total));
        let (mut next_submit, mut next_fold) = (0usize, 0usize);
        let mut close = report.last_close;

        while next_fold < total {
            while next_submit < total && next_submit - next_fold < window {
                let ts_ms = from_ms + next_submit as i64 * step;
                let req = MinuteRequest {
                    constituent_ids: Arc::clone(&ids),
                    window: TimeWindow::new(ts_ms, ts_ms + step),
                    price: close,
                    ts_ms,
                };
                let i = next_submit;
                inflight.push(pool.submit(req).map(move |r| (i, r)));
                next_submit += 1;
            }

            let Some((i, outcome)) = inflight.next().await else { break };
            let legs = match outcome {
                Ok(MinuteResponse::Allocations { allocations, .. }) => allocations.iter().map(StepLeg::from).collect(),
                Ok(MinuteResponse::Error { ts_ms, message }) => {
                    tracing::warn!(index_id, ts_ms, "minute task failed: {message}");
                    report.failed += 1;
                    Vec::new()
                }
                Err(PoolError::Closed) => return Err(IndexError::WorkerFault(PoolError::Closed.to_string())),
                Err(e) => {
                    let fault = IndexError::WorkerFault(e.to_string());
                    tracing::warn!(index_id, ts_ms = from_ms + i as i64 * step, "{fault}");
                    report.failed += 1;
                    Vec::new()
                }
            };
            reorder.insert(i, legs);

            while let Some(legs) = reorder.remove(&next_fold) {
                let ts_ms = from_ms + next_fold as i64 * step;
                let (next_close, candle) = fold_step(index_id, close, ts_ms, &legs);
                close = next_close;
                match candle {
                    Some(c) => batch.push(c),
                    None => report.invalid += 1,
                }
                next_fold += 1;
                report.steps += 1;

                if batch.len() >= self.cfg.flush_batch {
                    report.persisted += self.flush(index_id, &mut batch).await?;
                }
            }
        }

        report.persisted += self.flush(index_id, &mut batch).await?;
        report.last_close = close;
        #[cfg(feature = "metrics")]
        {
            let m = &crate::metrics::SYNTHESIS_STEPS;
            m.with_label_values(&["failed"]).inc_by(report.failed as u64);
            m.with_label_values(&["invalid"]).inc_by(report.invalid as u64);
            m.with_label_values(&["ok"]).inc_by(report.steps.saturating_sub(report.failed + report.invalid) as u64);
        }
        Ok(())
    }

    /// Persist, then publish in order. Returns rows actually written.
    async fn flush(&self, index_id: &str, batch: &mut Vec<SynthesizedCandle>) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        let written = self.candles.insert_batch_ignore_conflicts(batch).await?;
        #[cfg(feature = "metrics")]
        crate::metrics::CANDLES_PERSISTED.inc_by(written);
        tracing::info!(
            index_id,
            rows = batch.len(),
            written,
            first_ts = batch[0].ts_ms,
            last_ts = batch[batch.len() - 1].ts_ms,
            "flushed candle batch"
        );
        publish_candles(&self.sinks, batch).await;
        batch.clear();
        Ok(written)
    }
}
