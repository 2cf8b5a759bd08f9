use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cryptoindex::config::{LiveConfig, LiveWeighting};
use cryptoindex::index::weights::WeightEngine;
use cryptoindex::live::LiveAggregator;
use cryptoindex::providers::TickSource;
use cryptoindex::publishing::{BroadcastPublisher, IndexEvent};
use cryptoindex::store::MemoryStore;
use cryptoindex::types::{BasketSnapshot, ConstituentAllocation, LiveTick, PriceSample, SynthesizedCandle};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, watch};

/// Replays fixed ticks per symbol then stays open; unknown symbols fail to connect.
struct ScriptedSource {
    ticks: HashMap<String, Vec<LiveTick>>,
    connects: AtomicUsize,
}

#[async_trait]
impl TickSource for ScriptedSource {
    async fn subscribe(&self, symbol: &str) -> anyhow::Result<BoxStream<'static, anyhow::Result<LiveTick>>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let Some(ticks) = self.ticks.get(symbol).cloned() else {
            anyhow::bail!("no route to {symbol}");
        };
        Ok(stream::iter(ticks.into_iter().map(Ok)).chain(stream::pending()).boxed())
    }
}

/// Every connection delivers exactly one candle, one minute after the previous
/// connection's, and then closes.
struct OneShotSource {
    next_ts: Mutex<HashMap<String, i64>>,
    connects: Arc<AtomicUsize>,
}

#[async_trait]
impl TickSource for OneShotSource {
    async fn subscribe(&self, symbol: &str) -> anyhow::Result<BoxStream<'static, anyhow::Result<LiveTick>>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let ts_ms = {
            let mut next = self.next_ts.lock().unwrap();
            let ts = next.entry(symbol.to_string()).or_insert(0);
            let out = *ts;
            *ts += 60_000;
            out
        };
        Ok(stream::iter([Ok(tick(ts_ms, 10.0, 10.0))]).boxed())
    }
}

fn tick(ts_ms: i64, open: f64, close: f64) -> LiveTick {
    LiveTick { open, high: open.max(close), low: open.min(close), close, volume: 1.0, ts_ms }
}

fn snapshot() -> BasketSnapshot {
    let alloc = |asset_id| ConstituentAllocation {
        asset_id,
        weight: 0.5,
        start: PriceSample::at(asset_id, 0, 1.0),
        end: PriceSample::at(asset_id, 1, 1.0),
        amount: 1.0,
    };
    BasketSnapshot {
        index_id: "top2-daily".into(),
        category: None,
        ts_ms: 0,
        reference_price: 100.0,
        close_price: 100.0,
        constituents: vec![alloc(1), alloc(2)],
        spread: None,
    }
}

fn live_cfg(weighting: LiveWeighting) -> LiveConfig {
    LiveConfig { reconnect_delay_ms: 10, max_reconnects: 2, weighting, ..LiveConfig::default() }
}

async fn next_live(rx: &mut broadcast::Receiver<IndexEvent>) -> (SynthesizedCandle, bool) {
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        if let IndexEvent::LiveCandle { candle, is_final } = ev {
            return (candle, is_final);
        }
    }
}

fn start(
    source: ScriptedSource,
    weighting: LiveWeighting,
    caps: Arc<MemoryStore>,
) -> (broadcast::Receiver<IndexEvent>, watch::Sender<bool>, tokio::task::JoinHandle<cryptoindex::live::LiveSummary>) {
    let sink = BroadcastPublisher::new(64);
    let rx = sink.subscribe();
    let (stop_tx, stop_rx) = watch::channel(false);
    let agg = LiveAggregator::new(live_cfg(weighting), Arc::new(source), WeightEngine::new(caps, 0.0025))
        .with_sink(Arc::new(sink));
    let handle = tokio::spawn(async move {
        let feeds = vec![(1, "AAAUSDT".to_string()), (2, "BBBUSDT".to_string())];
        agg.run(&snapshot(), feeds, 100.0, stop_rx).await.unwrap()
    });
    (rx, stop_tx, handle)
}

#[tokio::test]
async fn complete_timestamps_are_priced_and_finalized() {
    let source = ScriptedSource {
        ticks: HashMap::from([
            ("AAAUSDT".to_string(), vec![tick(0, 10.0, 11.0), tick(60_000, 11.0, 11.0)]),
            ("BBBUSDT".to_string(), vec![tick(0, 20.0, 20.0), tick(60_000, 20.0, 22.0)]),
        ]),
        connects: AtomicUsize::new(0),
    };
    let (mut rx, stop, handle) = start(source, LiveWeighting::Frozen, Arc::new(MemoryStore::new()));

    let (c0, final0) = next_live(&mut rx).await;
    assert_eq!((c0.ts_ms, final0), (0, false));
    assert!((c0.close - 105.0).abs() < 1e-9);
    assert_eq!(c0.open, 100.0);

    let (f0, is_final) = next_live(&mut rx).await;
    assert!(is_final);
    assert_eq!(f0, c0);

    let (c1, final1) = next_live(&mut rx).await;
    assert_eq!((c1.ts_ms, final1), (60_000, false));
    assert_eq!(c1.open, c0.close);
    assert!((c1.close - 105.0 * 1.05).abs() < 1e-9);

    stop.send(true).unwrap();
    let summary = handle.await.unwrap();
    assert_eq!(summary.partials, 2);
    assert_eq!(summary.finalized, 1);
    assert_eq!(summary.abandoned, 0);
}

#[tokio::test]
async fn abandoned_feed_degrades_instead_of_stalling() {
    let source = ScriptedSource {
        ticks: HashMap::from([("AAAUSDT".to_string(), vec![tick(0, 10.0, 11.0)])]),
        connects: AtomicUsize::new(0),
    };
    let (mut rx, stop, handle) = start(source, LiveWeighting::Frozen, Arc::new(MemoryStore::new()));

    // BBB never connects; once it is abandoned its weight simply drops out
    let (c0, _) = next_live(&mut rx).await;
    assert_eq!(c0.ts_ms, 0);
    assert!((c0.close - 105.0).abs() < 1e-9);

    stop.send(true).unwrap();
    let summary = handle.await.unwrap();
    assert_eq!(summary.abandoned, 1);
}

#[tokio::test]
async fn recompute_weighting_uses_current_market_caps() {
    let caps = Arc::new(MemoryStore::new());
    caps.add_market_cap(1, 0, 3e9);
    caps.add_market_cap(2, 0, 1e9);
    let source = ScriptedSource {
        ticks: HashMap::from([
            ("AAAUSDT".to_string(), vec![tick(0, 10.0, 11.0)]),
            ("BBBUSDT".to_string(), vec![tick(0, 20.0, 20.0)]),
        ]),
        connects: AtomicUsize::new(0),
    };
    let (mut rx, stop, handle) = start(source, LiveWeighting::Recompute, caps);

    let (c0, _) = next_live(&mut rx).await;
    assert!((c0.close - 107.5).abs() < 1e-9);

    stop.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn feeds_that_deliver_keep_reconnecting_past_the_retry_limit() {
    let connects = Arc::new(AtomicUsize::new(0));
    let source = OneShotSource { next_ts: Mutex::new(HashMap::new()), connects: connects.clone() };
    let sink = BroadcastPublisher::new(256);
    let mut rx = sink.subscribe();
    let (stop_tx, stop_rx) = watch::channel(false);
    let cfg = LiveConfig { reconnect_delay_ms: 5, max_reconnects: 1, ..LiveConfig::default() };
    let agg = LiveAggregator::new(cfg, Arc::new(source), WeightEngine::new(Arc::new(MemoryStore::new()), 0.0025))
        .with_sink(Arc::new(sink));
    let handle = tokio::spawn(async move {
        let feeds = vec![(1, "AAAUSDT".to_string()), (2, "BBBUSDT".to_string())];
        agg.run(&snapshot(), feeds, 100.0, stop_rx).await.unwrap()
    });

    let mut finalized = Vec::new();
    while finalized.len() < 3 {
        let (candle, is_final) = next_live(&mut rx).await;
        if is_final {
            finalized.push(candle.ts_ms);
        }
    }
    assert_eq!(finalized, vec![0, 60_000, 120_000]);

    stop_tx.send(true).unwrap();
    let summary = handle.await.unwrap();
    assert_eq!(summary.abandoned, 0);
    assert!(summary.finalized >= 3);
    // two feeds, each well past its single allowed retry
    assert!(connects.load(Ordering::SeqCst) >= 8);
}
