// src/index/rebalance.rs
//! Periodic basket construction. Each period selects its top-N constituents as
//! of the period start, weights them by market cap and prices the period with
//! the same step function as minute synthesis, chaining closes from one
//! snapshot to the next.
use chrono::Utc;
use ordered_float::OrderedFloat;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RebalanceConfig;
use crate::providers::{AssetUniverse, MarketCapStore, PriceSeriesStore};
use crate::store::{BasketSnapshotStore, ProcessingStatusStore};
use crate::types::{Asset, BasketSnapshot, ConstituentAllocation, JobKind, PriceSample, ProcessingState, SourceVenue, TimeWindow};

use super::id::IndexSpec;
use super::step::{step_price, StepLeg};
use super::weights::WeightEngine;
use super::{IndexError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalanceReport {
    pub periods: usize,
    pub written: usize,
    pub skipped: usize,
    pub last_close: f64,
}

pub struct RebalanceEngine {
    cfg: RebalanceConfig,
    universe: Arc<dyn AssetUniverse>,
    prices: Arc<dyn PriceSeriesStore>,
    caps: Arc<dyn MarketCapStore>,
    snapshots: Arc<dyn BasketSnapshotStore>,
    status: Arc<dyn ProcessingStatusStore>,
    weights: WeightEngine,
}

/// First usable price among start close, end open, end close, start open.
pub fn reference_price(start: &PriceSample, end: &PriceSample) -> Option<f64> {
    [start.close, end.open, end.close, start.open]
        .into_iter()
        .find(|p| p.is_finite() && *p != 0.0)
}

impl RebalanceEngine {
    pub fn new(
        cfg: RebalanceConfig,
        universe: Arc<dyn AssetUniverse>,
        prices: Arc<dyn PriceSeriesStore>,
        caps: Arc<dyn MarketCapStore>,
        snapshots: Arc<dyn BasketSnapshotStore>,
        status: Arc<dyn ProcessingStatusStore>,
    ) -> Self {
        let weights = WeightEngine::new(Arc::clone(&caps), cfg.min_weight);
        Self { cfg, universe, prices, caps, snapshots, status, weights }
    }

    /// Wire every collaborator to one store.
    pub fn from_store<S>(cfg: RebalanceConfig, store: Arc<S>) -> Self
    where
        S: AssetUniverse + PriceSeriesStore + MarketCapStore + BasketSnapshotStore + ProcessingStatusStore + 'static,
    {
        Self::new(cfg, store.clone(), store.clone(), store.clone(), store.clone(), store)
    }

    pub async fn generate_basket(&self, index_id: &str) -> Result<RebalanceReport> {
        self.generate_basket_until(index_id, Utc::now().timestamp_millis()).await
    }

    /// Build every period whose end is at or before `now_ms`. Rejected outright
    /// while another rebalance of the same index is in flight.
    pub async fn generate_basket_until(&self, index_id: &str, now_ms: i64) -> Result<RebalanceReport> {
        let spec = IndexSpec::parse(index_id)?;
        if !self.status.try_begin(index_id, JobKind::Rebalance).await? {
            return Err(IndexError::ConcurrentRun { index_id: index_id.to_string(), job: JobKind::Rebalance });
        }
        tracing::info!(index = %spec, "rebalance started");

        let res = self.run(&spec, now_ms).await;
        let state = match &res {
            Ok(r) if r.periods > 0 && r.written == 0 => ProcessingState::ErrorNoData,
            Ok(_) => ProcessingState::Success,
            Err(_) => ProcessingState::Error,
        };
        if let Err(e) = self.status.set(index_id, JobKind::Rebalance, state).await {
            tracing::error!(index_id, "failed to record rebalance state {state}: {e:#}");
        }
        match &res {
            Ok(r) => tracing::info!(index_id, %state, periods = r.periods, written = r.written, skipped = r.skipped, "rebalance finished"),
            Err(e) => tracing::warn!(index_id, "rebalance failed: {e}"),
        }
        res
    }

    async fn run(&self, spec: &IndexSpec, now_ms: i64) -> Result<RebalanceReport> {
        let category = spec.category.as_deref();
        let (mut start, mut prev_close) = match self.snapshots.latest(&spec.id, category).await? {
            Some(prior) => {
                let next = spec
                    .interval
                    .advance(prior.ts_ms)
                    .ok_or(IndexError::NumericDegeneracy("rebalance period overflow"))?;
                (next, prior.close_price)
            }
            None => (self.cfg.inception_ms(), self.cfg.initial_price),
        };

        let candidates = self.candidates(spec).await?;
        let mut report = RebalanceReport { last_close: prev_close, ..Default::default() };

        while let Some(end) = spec.interval.advance(start) {
            if end > now_ms {
                break;
            }
            report.periods += 1;
            let window = TimeWindow::new(start, end);

            match self.price_period(spec, &candidates, window, prev_close).await? {
                Some(snapshot) => {
                    self.snapshots.insert(&snapshot).await?;
                    #[cfg(feature = "metrics")]
                    crate::metrics::SNAPSHOTS_WRITTEN.inc();
                    tracing::info!(
                        index_id = %spec.id,
                        ts_ms = start,
                        n = snapshot.constituents.len(),
                        weight_sum = snapshot.weight_sum(),
                        reference = snapshot.reference_price,
                        close = snapshot.close_price,
                        "snapshot written"
                    );
                    prev_close = snapshot.close_price;
                    report.written += 1;
                }
                None => report.skipped += 1,
            }
            start = end;
        }

        report.last_close = prev_close;
        Ok(report)
    }

    /// Assets that pass every static filter; market caps are checked per period.
    async fn candidates(&self, spec: &IndexSpec) -> Result<Vec<Asset>> {
        let all = self.universe.assets().await?;
        let spot_names: HashSet<String> = all
            .iter()
            .filter(|a| a.venue == SourceVenue::Spot && a.is_active())
            .map(|a| a.name.to_ascii_uppercase())
            .collect();

        let out: Vec<Asset> = all
            .into_iter()
            .filter(|a| a.venue == self.cfg.venue && a.is_active())
            .filter(|a| a.symbol.to_ascii_uppercase().ends_with(&self.cfg.pair_suffix.to_ascii_uppercase()))
            .filter(|a| !self.cfg.is_blacklisted(&a.name, &a.symbol))
            .filter(|a| match &spec.category {
                Some(cat) => a.categories.iter().any(|c| c.eq_ignore_ascii_case(cat)),
                None => true,
            })
            .filter(|a| !self.cfg.require_spot_companion || spot_names.contains(&a.name.to_ascii_uppercase()))
            .collect();

        tracing::debug!(index_id = %spec.id, n = out.len(), "eligible candidates");
        Ok(out)
    }

    /// Top-N by market cap as of `as_of_ms`, one asset per underlying.
    async fn select(&self, spec: &IndexSpec, candidates: &[Asset], as_of_ms: i64) -> Result<Vec<Asset>> {
        let oldest = as_of_ms - self.cfg.lookback_ms();
        let mut ranked = Vec::with_capacity(candidates.len());
        for a in candidates {
            match self.caps.latest_before(a.id, as_of_ms).await? {
                Some(s) if s.ts_ms >= oldest && s.market_cap.is_finite() && s.market_cap > 0.0 => {
                    ranked.push((OrderedFloat(s.market_cap), a));
                }
                _ => tracing::debug!(asset_id = a.id, as_of_ms, "no market cap in lookback"),
            }
        }
        ranked.sort_by(|x, y| y.0.cmp(&x.0).then_with(|| x.1.id.cmp(&y.1.id)));

        let mut seen = HashSet::new();
        Ok(ranked
            .into_iter()
            .filter(|(_, a)| seen.insert(a.name.to_ascii_uppercase()))
            .take(spec.basket_size)
            .map(|(_, a)| a.clone())
            .collect())
    }

    /// Snapshot for one period, or `None` if nothing could be priced.
    async fn price_period(
        &self,
        spec: &IndexSpec,
        candidates: &[Asset],
        window: TimeWindow,
        prev_close: f64,
    ) -> Result<Option<BasketSnapshot>> {
        let selected = self.select(spec, candidates, window.start_ms).await?;

        let mut priced = Vec::with_capacity(selected.len());
        for a in &selected {
            match self.prices.window_samples(a.id, window).await? {
                (Some(s), Some(e)) => priced.push((a.id, s, e)),
                _ => tracing::debug!("{}", IndexError::MissingData(a.id)),
            }
        }
        if priced.is_empty() {
            tracing::debug!(index_id = %spec.id, ts_ms = window.start_ms, "no priceable asset, period skipped");
            return Ok(None);
        }

        let ids: Vec<_> = priced.iter().map(|(id, _, _)| *id).collect();
        let weights = self.weights.compute_weights(&ids, window).await?;

        let constituents: Vec<ConstituentAllocation> = priced
            .iter()
            .zip(&weights)
            .map(|((asset_id, start, end), w)| {
                let amount = match reference_price(start, end) {
                    Some(px) => prev_close * w.weight / px,
                    None => {
                        tracing::debug!(asset_id, "{}", IndexError::NumericDegeneracy("no usable reference price"));
                        0.0
                    }
                };
                ConstituentAllocation { asset_id: *asset_id, weight: w.weight, start: *start, end: *end, amount }
            })
            .collect();

        let legs: Vec<StepLeg> = constituents.iter().map(StepLeg::from).collect();
        let (candle, stats) = step_price(prev_close, &legs);
        let close = match candle.ohlc() {
            Some(o) if o.close.is_finite() && o.close > 0.0 => o.close,
            other => {
                tracing::warn!(index_id = %spec.id, ts_ms = window.start_ms, close = ?other.map(|o| o.close), "non-positive period close, not persisted");
                return Ok(None);
            }
        };
        tracing::debug!(index_id = %spec.id, ts_ms = window.start_ms, used = stats.n_used, dropped = stats.n_dropped, "period priced");

        Ok(Some(BasketSnapshot {
            index_id: spec.id.clone(),
            category: spec.category.clone(),
            ts_ms: window.start_ms,
            reference_price: prev_close,
            close_price: close,
            constituents,
            spread: None,
        }))
    }
}
