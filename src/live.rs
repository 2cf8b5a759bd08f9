// src/live.rs
//! Live tail of the synthetic index.
//!
//! One supervised feed per constituent pushes exchange candles into a channel.
//! [`LiveBook`] groups them by candle-open timestamp; once a timestamp has a
//! tick from every required constituent it is priced with the same step
//! function as the historical backfill and sent to the sinks. A later complete
//! timestamp finalizes the previous one and its close becomes the new baseline.
use backon::{ConstantBuilder, Retryable};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::{ms, LiveConfig, LiveWeighting};
use crate::index::step::{fold_step, StepLeg};
use crate::index::weights::WeightEngine;
use crate::index::Result;
use crate::providers::TickSource;
use crate::publishing::Publisher;
use crate::types::{AssetId, BasketSnapshot, LiveTick, PriceSample, SynthesizedCandle, TimeWindow};

#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    /// The previous timestamp is closed; its last candle is final.
    Finalized(SynthesizedCandle),
    /// Every required constituent has a tick for `ts_ms`.
    Ready { ts_ms: i64, baseline: f64, ticks: HashMap<AssetId, LiveTick> },
}

/// Incomplete timestamps kept while a connected feed stays silent.
pub const DEFAULT_MAX_PENDING: usize = 256;

/// Per-timestamp tick buffer. Owns the live baseline.
#[derive(Debug)]
pub struct LiveBook {
    required: HashSet<AssetId>,
    pending: BTreeMap<i64, HashMap<AssetId, LiveTick>>,
    max_pending: usize,
    baseline: f64,
    current_ts: Option<i64>,
    current_candle: Option<SynthesizedCandle>,
    late_drops: u64,
    pruned: u64,
}

impl LiveBook {
    pub fn new(required: impl IntoIterator<Item = AssetId>, baseline: f64) -> Self {
        Self {
            required: required.into_iter().collect(),
            pending: BTreeMap::new(),
            max_pending: DEFAULT_MAX_PENDING,
            baseline,
            current_ts: None,
            current_candle: None,
            late_drops: 0,
            pruned: 0,
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    pub fn late_drops(&self) -> u64 {
        self.late_drops
    }

    pub fn required(&self) -> usize {
        self.required.len()
    }

    /// Incomplete timestamps evicted to keep the buffer bounded.
    pub fn pruned(&self) -> u64 {
        self.pruned
    }

    /// Last-write-wins per (asset, ts). Ticks before the current timestamp are dropped.
    pub fn apply(&mut self, asset_id: AssetId, tick: LiveTick) -> Vec<BookEvent> {
        if !self.required.contains(&asset_id) {
            return Vec::new();
        }
        if self.current_ts.is_some_and(|cur| tick.ts_ms < cur) {
            self.late_drops += 1;
            tracing::debug!(asset_id, ts_ms = tick.ts_ms, "late tick dropped");
            return Vec::new();
        }
        self.pending.entry(tick.ts_ms).or_default().insert(asset_id, tick);
        self.prune();
        self.check(tick.ts_ms)
    }

    /// Drop the oldest incomplete timestamps beyond `max_pending`. The current
    /// timestamp is never evicted.
    fn prune(&mut self) {
        while self.pending.len() > self.max_pending {
            let Some(oldest) = self.pending.keys().copied().find(|ts| Some(*ts) != self.current_ts) else {
                break;
            };
            self.pending.remove(&oldest);
            self.pruned += 1;
            tracing::debug!(ts_ms = oldest, "incomplete timestamp evicted");
        }
    }

    /// Stop waiting for `asset_id`. May complete a pending timestamp.
    pub fn abandon(&mut self, asset_id: AssetId) -> Vec<BookEvent> {
        if !self.required.remove(&asset_id) {
            return Vec::new();
        }
        let newest_complete = self
            .pending
            .keys()
            .rev()
            .copied()
            .find(|ts| self.is_complete(*ts));
        match newest_complete {
            Some(ts) => self.check(ts),
            None => Vec::new(),
        }
    }

    /// Remember the candle priced for the current timestamp.
    pub fn record(&mut self, candle: SynthesizedCandle) {
        if self.current_ts == Some(candle.ts_ms) {
            self.current_candle = Some(candle);
        }
    }

    fn is_complete(&self, ts_ms: i64) -> bool {
        !self.required.is_empty()
            && self
                .pending
                .get(&ts_ms)
                .is_some_and(|m| self.required.iter().all(|a| m.contains_key(a)))
    }

    fn check(&mut self, ts_ms: i64) -> Vec<BookEvent> {
        if !self.is_complete(ts_ms) {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(2);
        if self.current_ts != Some(ts_ms) {
            if let Some(done) = self.current_candle.take() {
                self.baseline = done.close;
                out.push(BookEvent::Finalized(done));
            }
            self.current_ts = Some(ts_ms);
            self.pending = self.pending.split_off(&ts_ms);
        }
        let ticks = self.pending.get(&ts_ms).cloned().unwrap_or_default();
        out.push(BookEvent::Ready { ts_ms, baseline: self.baseline, ticks });
        out
    }
}

#[derive(Debug)]
enum FeedEvent {
    Tick { asset_id: AssetId, tick: LiveTick },
    Abandoned(AssetId),
}

#[derive(thiserror::Error, Debug)]
#[error("{err:#}")]
struct FeedFault {
    delivered: bool,
    err: anyhow::Error,
}

/// Consume one subscription until it fails or closes. `Ok` means the
/// aggregator is gone and the feed should stop.
async fn feed_once(
    source: &dyn TickSource,
    asset_id: AssetId,
    symbol: &str,
    tx: &mpsc::Sender<FeedEvent>,
) -> std::result::Result<(), FeedFault> {
    let mut stream = source
        .subscribe(symbol)
        .await
        .map_err(|err| FeedFault { delivered: false, err })?;
    let mut delivered = false;
    while let Some(item) = stream.next().await {
        match item {
            Ok(tick) => {
                delivered = true;
                if tx.send(FeedEvent::Tick { asset_id, tick }).await.is_err() {
                    return Ok(());
                }
            }
            Err(err) => return Err(FeedFault { delivered, err }),
        }
    }
    Err(FeedFault { delivered, err: anyhow::anyhow!("{symbol} feed closed") })
}

async fn supervise_feed(
    source: Arc<dyn TickSource>,
    asset_id: AssetId,
    symbol: String,
    cfg: LiveConfig,
    tx: mpsc::Sender<FeedEvent>,
) {
    let (src, sym, chan) = (source.as_ref(), symbol.as_str(), &tx);
    loop {
        let res = (move || feed_once(src, asset_id, sym, chan))
            .retry(
                ConstantBuilder::default()
                    .with_delay(ms(cfg.reconnect_delay_ms))
                    .with_max_times(cfg.max_reconnects),
            )
            .when(|f: &FeedFault| !f.delivered)
            .notify(|f: &FeedFault, after| {
                #[cfg(feature = "metrics")]
                crate::metrics::FEED_RECONNECTS.with_label_values(&[sym]).inc();
                tracing::warn!(symbol = sym, asset_id, "feed error: {f}; reconnecting in {after:?}");
            })
            .await;

        match res {
            Ok(()) => return,
            // it was live before failing, so start over with a full retry budget
            Err(f) if f.delivered => {
                tracing::warn!(symbol = sym, asset_id, "feed dropped: {f}; reconnecting");
                tokio::time::sleep(ms(cfg.reconnect_delay_ms)).await;
            }
            Err(f) => {
                tracing::error!(symbol = sym, asset_id, retries = cfg.max_reconnects, "feed abandoned: {f}");
                let _ = tx.send(FeedEvent::Abandoned(asset_id)).await;
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSummary {
    pub partials: u64,
    pub finalized: u64,
    pub invalid: u64,
    pub late_drops: u64,
    pub pruned: u64,
    pub abandoned: usize,
}

pub struct LiveAggregator {
    cfg: LiveConfig,
    source: Arc<dyn TickSource>,
    weights: WeightEngine,
    sinks: Vec<Arc<dyn Publisher>>,
}

impl LiveAggregator {
    pub fn new(cfg: LiveConfig, source: Arc<dyn TickSource>, weights: WeightEngine) -> Self {
        Self { cfg, source, weights, sinks: Vec::new() }
    }

    pub fn with_sink(mut self, sink: Arc<dyn Publisher>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Run until `shutdown` flips to true (or its sender is dropped), or until
    /// every feed has been abandoned.
    pub async fn run(
        &self,
        snapshot: &BasketSnapshot,
        feeds: Vec<(AssetId, String)>,
        baseline: f64,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<LiveSummary> {
        let index_id = snapshot.index_id.as_str();
        let ids = snapshot.asset_ids();
        let frozen: HashMap<AssetId, f64> = snapshot.constituents.iter().map(|c| (c.asset_id, c.weight)).collect();

        let (tx, mut rx) = mpsc::channel(self.cfg.tick_buffer.max(1));
        let mut tasks = JoinSet::new();
        let mut required = Vec::with_capacity(feeds.len());
        for (asset_id, symbol) in feeds {
            if !frozen.contains_key(&asset_id) {
                tracing::warn!(index_id, asset_id, "feed for non-constituent ignored");
                continue;
            }
            required.push(asset_id);
            tasks.spawn(supervise_feed(Arc::clone(&self.source), asset_id, symbol, self.cfg.clone(), tx.clone()));
        }
        drop(tx);
        if required.len() < ids.len() {
            tracing::warn!(index_id, fed = required.len(), constituents = ids.len(), "running with missing feeds");
        }

        let mut book = LiveBook::new(required, baseline);
        let mut summary = LiveSummary::default();
        tracing::info!(index_id, feeds = book.required(), baseline, weighting = ?self.cfg.weighting, "live aggregation started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let events = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                ev = rx.recv() => match ev {
                    Some(FeedEvent::Tick { asset_id, tick }) => book.apply(asset_id, tick),
                    Some(FeedEvent::Abandoned(asset_id)) => {
                        summary.abandoned += 1;
                        book.abandon(asset_id)
                    }
                    None => {
                        tracing::warn!(index_id, "all feeds gone");
                        break;
                    }
                },
            };

            for ev in events {
                match ev {
                    BookEvent::Finalized(candle) => {
                        summary.finalized += 1;
                        self.publish(candle, true).await;
                    }
                    BookEvent::Ready { ts_ms, baseline, ticks } => {
                        let weights = self.weights_for(ts_ms, &ids, &frozen).await;
                        let legs = self.legs(&ids, &weights, &ticks, ts_ms);
                        match fold_step(index_id, baseline, ts_ms, &legs) {
                            (_, Some(candle)) => {
                                book.record(candle.clone());
                                summary.partials += 1;
                                self.publish(candle, false).await;
                            }
                            (_, None) => summary.invalid += 1,
                        }
                    }
                }
            }
        }

        tasks.shutdown().await;
        summary.late_drops = book.late_drops();
        summary.pruned = book.pruned();
        tracing::info!(index_id, partials = summary.partials, finalized = summary.finalized, abandoned = summary.abandoned, "live aggregation stopped");
        Ok(summary)
    }

    async fn weights_for(&self, ts_ms: i64, ids: &[AssetId], frozen: &HashMap<AssetId, f64>) -> HashMap<AssetId, f64> {
        if self.cfg.weighting == LiveWeighting::Recompute {
            let window = TimeWindow::new(ts_ms, ts_ms + self.cfg.interval_ms);
            match self.weights.compute_weights(ids, window).await {
                Ok(w) => return w.into_iter().map(|w| (w.asset_id, w.weight)).collect(),
                Err(e) => tracing::warn!(ts_ms, "weight recompute failed, using rebalance weights: {e}"),
            }
        }
        frozen.clone()
    }

    /// Start is the candle open at `ts`, end is its close one interval later.
    fn legs(
        &self,
        ids: &[AssetId],
        weights: &HashMap<AssetId, f64>,
        ticks: &HashMap<AssetId, LiveTick>,
        ts_ms: i64,
    ) -> Vec<StepLeg> {
        ids.iter()
            .map(|id| {
                let tick = ticks.get(id);
                StepLeg {
                    weight: weights.get(id).copied().unwrap_or(0.0),
                    start: tick.map(|t| PriceSample::at(*id, ts_ms, t.open)),
                    end: tick.map(|t| PriceSample {
                        asset_id: *id,
                        ts_ms: ts_ms + self.cfg.interval_ms,
                        open: t.open,
                        high: t.high,
                        low: t.low,
                        close: t.close,
                        volume: t.volume,
                    }),
                }
            })
            .collect()
    }

    async fn publish(&self, candle: SynthesizedCandle, is_final: bool) {
        for sink in &self.sinks {
            if let Err(e) = sink.publish_live_candle(candle.clone(), is_final).await {
                tracing::warn!("publish_live_candle failed: {e:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts_ms: i64, open: f64, close: f64) -> LiveTick {
        LiveTick { open, high: open.max(close), low: open.min(close), close, volume: 1.0, ts_ms }
    }

    fn candle(ts_ms: i64, close: f64) -> SynthesizedCandle {
        SynthesizedCandle { index_id: "x".into(), ts_ms, open: 100.0, high: close, low: 100.0, close }
    }

    #[test]
    fn waits_for_every_constituent() {
        let mut book = LiveBook::new([1, 2], 100.0);
        assert!(book.apply(1, tick(0, 10.0, 11.0)).is_empty());
        let ev = book.apply(2, tick(0, 20.0, 20.0));
        assert_eq!(ev.len(), 1);
        match &ev[0] {
            BookEvent::Ready { ts_ms, baseline, ticks } => {
                assert_eq!(*ts_ms, 0);
                assert_eq!(*baseline, 100.0);
                assert_eq!(ticks.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn last_write_wins_and_reemits_current() {
        let mut book = LiveBook::new([1, 2], 100.0);
        book.apply(1, tick(0, 10.0, 11.0));
        book.apply(2, tick(0, 20.0, 20.0));
        book.record(candle(0, 105.0));
        let ev = book.apply(1, tick(0, 10.0, 12.0));
        match &ev[..] {
            [BookEvent::Ready { ts_ms: 0, baseline, ticks }] => {
                assert_eq!(*baseline, 100.0);
                assert_eq!(ticks[&1].close, 12.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn newer_complete_timestamp_finalizes_previous() {
        let mut book = LiveBook::new([1], 100.0);
        book.apply(1, tick(0, 10.0, 11.0));
        book.record(candle(0, 110.0));
        let ev = book.apply(1, tick(60_000, 11.0, 11.0));
        assert_eq!(ev.len(), 2);
        assert_eq!(ev[0], BookEvent::Finalized(candle(0, 110.0)));
        match &ev[1] {
            BookEvent::Ready { ts_ms, baseline, .. } => {
                assert_eq!(*ts_ms, 60_000);
                assert_eq!(*baseline, 110.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(book.baseline(), 110.0);
    }

    #[test]
    fn late_ticks_are_dropped() {
        let mut book = LiveBook::new([1], 100.0);
        book.apply(1, tick(60_000, 10.0, 11.0));
        assert!(book.apply(1, tick(0, 10.0, 50.0)).is_empty());
        assert_eq!(book.late_drops(), 1);
    }

    #[test]
    fn abandoning_a_feed_completes_pending_timestamp() {
        let mut book = LiveBook::new([1, 2], 100.0);
        book.apply(1, tick(0, 10.0, 11.0));
        let ev = book.abandon(2);
        assert!(matches!(&ev[..], [BookEvent::Ready { ts_ms: 0, .. }]));
        assert_eq!(book.required(), 1);
        assert!(book.abandon(2).is_empty());
    }

    #[test]
    fn silent_feed_does_not_grow_the_buffer() {
        let mut book = LiveBook::new([1, 2], 100.0).with_max_pending(3);
        for i in 0..10 {
            assert!(book.apply(1, tick(i * 60_000, 10.0, 10.0)).is_empty());
        }
        assert_eq!(book.pending.len(), 3);
        assert_eq!(book.pruned(), 7);
        // the newest timestamps survive and still complete
        let ev = book.apply(2, tick(9 * 60_000, 20.0, 20.0));
        assert!(matches!(&ev[..], [BookEvent::Ready { ts_ms: 540_000, .. }]));
    }

    #[test]
    fn current_timestamp_is_never_evicted() {
        let mut book = LiveBook::new([1, 2], 100.0).with_max_pending(2);
        book.apply(1, tick(0, 10.0, 10.0));
        book.apply(2, tick(0, 20.0, 20.0));
        for i in 1..5 {
            book.apply(1, tick(i * 60_000, 10.0, 10.0));
        }
        assert!(book.pending.contains_key(&0));
        assert_eq!(book.pending.len(), 2);
        // a re-update of the current timestamp still re-emits
        assert!(matches!(&book.apply(2, tick(0, 20.0, 21.0))[..], [BookEvent::Ready { ts_ms: 0, .. }]));
    }

    #[test]
    fn unknown_assets_are_ignored() {
        let mut book = LiveBook::new([1], 100.0);
        assert!(book.apply(9, tick(0, 1.0, 2.0)).is_empty());
    }
}
