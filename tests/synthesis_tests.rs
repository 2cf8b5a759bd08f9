use std::sync::Arc;

use cryptoindex::config::IndexServiceConfig;
use cryptoindex::index::IndexError;
use cryptoindex::pool::{FixedLoadProbe, LoadScalingPolicy};
use cryptoindex::publishing::{BroadcastPublisher, IndexEvent};
use cryptoindex::store::{BasketSnapshotStore, MemoryStore, ProcessingStatusStore, SqliteStore, SynthesizedCandleStore};
use cryptoindex::synthesis::SynthesisScheduler;
use cryptoindex::types::{BasketSnapshot, ConstituentAllocation, JobKind, PriceSample, ProcessingState, SynthesizedCandle};

const T0: i64 = 1_717_200_000_000; // 2024-06-01
const MIN: i64 = 60_000;
const INDEX: &str = "top2-daily";

fn cfg() -> IndexServiceConfig {
    let mut cfg = IndexServiceConfig::default();
    cfg.rebalance.initial_price = 100.0;
    cfg.synthesis.flush_batch = 3;
    cfg.synthesis.max_in_flight = 4;
    cfg.pool.min_workers = 2;
    cfg.pool.max_workers = 4;
    cfg.pool.monitor_interval_ms = 0;
    cfg
}

fn alloc(asset_id: i64) -> ConstituentAllocation {
    ConstituentAllocation {
        asset_id,
        weight: 0.5,
        start: PriceSample::at(asset_id, T0, 1.0),
        end: PriceSample::at(asset_id, T0 + MIN, 1.0),
        amount: 1.0,
    }
}

fn snapshot() -> BasketSnapshot {
    BasketSnapshot {
        index_id: INDEX.into(),
        category: None,
        ts_ms: T0,
        reference_price: 100.0,
        close_price: 100.0,
        constituents: vec![alloc(1), alloc(2)],
        spread: None,
    }
}

/// Asset 1 climbs by one each minute, asset 2 is flat. Equal caps.
fn seed_memory(minutes: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_market_cap(1, T0, 1e9);
    store.add_market_cap(2, T0, 1e9);
    store.add_prices((0..=minutes).map(|i| PriceSample::at(1, T0 + i * MIN, 10.0 + i as f64)));
    store.add_prices((0..=minutes).map(|i| PriceSample::at(2, T0 + i * MIN, 20.0)));
    store
}

fn expected_closes(from_minute: i64, to_minute: i64, mut close: f64) -> Vec<f64> {
    let mut out = Vec::new();
    for i in from_minute..to_minute {
        let r = (11.0 + i as f64) / (10.0 + i as f64) - 1.0;
        close *= 1.0 + 0.5 * r;
        out.push(close);
    }
    out
}

fn assert_continuous(candles: &[SynthesizedCandle]) {
    for pair in candles.windows(2) {
        assert_eq!(pair[1].open, pair[0].close, "gap at {}", pair[1].ts_ms);
        assert_eq!(pair[1].ts_ms - pair[0].ts_ms, MIN);
    }
}

#[tokio::test]
async fn backfills_every_minute_in_order() {
    let store = seed_memory(10);
    store.insert(&snapshot()).await.unwrap();
    let sched = SynthesisScheduler::from_store(&cfg(), store.clone());

    let report = sched.synthesize(INDEX).await.unwrap();
    assert_eq!(report.steps, 10);
    assert_eq!(report.persisted, 10);
    assert_eq!(report.failed, 0);
    assert_eq!((report.from_ms, report.to_ms), (T0, T0 + 10 * MIN));

    let candles = store.range(INDEX, T0, T0 + 10 * MIN).await.unwrap();
    assert_eq!(candles.len(), 10);
    assert_eq!(candles[0].open, 100.0);
    assert_continuous(&candles);
    for (c, want) in candles.iter().zip(expected_closes(0, 10, 100.0)) {
        assert!((c.close - want).abs() < 1e-9, "ts {} close {} want {}", c.ts_ms, c.close, want);
        assert!(c.high >= c.low);
    }
    assert!((report.last_close - candles[9].close).abs() < 1e-12);

    let state = ProcessingStatusStore::get(store.as_ref(), INDEX, JobKind::Synthesis).await.unwrap();
    assert_eq!(state, ProcessingState::Success);
}

#[tokio::test]
async fn rerun_is_idempotent_and_resumes_from_last_candle() {
    let store = seed_memory(5);
    store.insert(&snapshot()).await.unwrap();
    let sched = SynthesisScheduler::from_store(&cfg(), store.clone());

    let first = sched.synthesize(INDEX).await.unwrap();
    assert_eq!(first.persisted, 5);
    let before = store.range(INDEX, T0, i64::MAX).await.unwrap();

    let again = sched.synthesize(INDEX).await.unwrap();
    assert_eq!(again.steps, 0);
    assert_eq!(again.persisted, 0);
    assert_eq!(store.range(INDEX, T0, i64::MAX).await.unwrap(), before);

    // replaying an existing row writes nothing
    assert_eq!(store.insert_batch_ignore_conflicts(&before[..1]).await.unwrap(), 0);

    store.add_prices((6..=8).map(|i| PriceSample::at(1, T0 + i * MIN, 10.0 + i as f64)));
    store.add_prices((6..=8).map(|i| PriceSample::at(2, T0 + i * MIN, 20.0)));
    let resumed = sched.synthesize(INDEX).await.unwrap();
    assert_eq!(resumed.steps, 3);
    assert_eq!(resumed.from_ms, T0 + 5 * MIN);

    let all = store.range(INDEX, T0, i64::MAX).await.unwrap();
    assert_eq!(all.len(), 8);
    assert_eq!(&all[..5], &before[..]);
    assert_continuous(&all);
    let want = expected_closes(0, 8, 100.0);
    assert!((all[7].close - want[7]).abs() < 1e-9);
}

#[tokio::test]
async fn missing_basket_is_no_data() {
    let store = seed_memory(3);
    let sched = SynthesisScheduler::from_store(&cfg(), store.clone());
    let err = sched.synthesize(INDEX).await.unwrap_err();
    assert!(matches!(err, IndexError::NoBasket(_)));
    let state = ProcessingStatusStore::get(store.as_ref(), INDEX, JobKind::Synthesis).await.unwrap();
    assert_eq!(state, ProcessingState::ErrorNoData);
}

#[tokio::test]
async fn concurrent_run_is_rejected() {
    let store = seed_memory(3);
    store.insert(&snapshot()).await.unwrap();
    store.set(INDEX, JobKind::Synthesis, ProcessingState::Processing).await.unwrap();
    let sched = SynthesisScheduler::from_store(&cfg(), store.clone());
    let err = sched.synthesize(INDEX).await.unwrap_err();
    assert!(matches!(err, IndexError::ConcurrentRun { job: JobKind::Synthesis, .. }));
    assert_eq!(store.candle_count(INDEX), 0);
}

#[tokio::test]
async fn missing_constituent_data_drops_out_without_renormalising() {
    let store = Arc::new(MemoryStore::new());
    store.add_market_cap(1, T0, 1e9);
    store.add_market_cap(2, T0, 1e9);
    // asset 2 only has a single sample: every one of its legs has no elapsed time
    store.add_prices([PriceSample::at(1, T0, 10.0), PriceSample::at(1, T0 + MIN, 11.0)]);
    store.add_prices([PriceSample::at(2, T0, 20.0)]);
    store.insert(&snapshot()).await.unwrap();

    let report = SynthesisScheduler::from_store(&cfg(), store.clone()).synthesize(INDEX).await.unwrap();
    assert_eq!(report.steps, 1);
    let c = &store.range(INDEX, T0, T0 + MIN).await.unwrap()[0];
    assert!((c.close - 105.0).abs() < 1e-9);
}

#[tokio::test]
async fn sinks_see_flushed_candles_in_order() {
    let store = seed_memory(7);
    store.insert(&snapshot()).await.unwrap();
    let sink = BroadcastPublisher::new(64);
    let mut rx = sink.subscribe();
    let probe = Arc::new(FixedLoadProbe::new(0.0, 1.0));
    let policy = Arc::new(LoadScalingPolicy { load_per_core_threshold: 0.75, free_mem_threshold: 0.2 });
    let sched = SynthesisScheduler::from_store(&cfg(), store.clone())
        .with_sink(Arc::new(sink))
        .with_scaling(policy, probe);

    sched.synthesize(INDEX).await.unwrap();
    let mut seen = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let IndexEvent::Candle(c) = ev {
            seen.push(c.ts_ms);
        }
    }
    assert_eq!(seen, (0..7).map(|i| T0 + i * MIN).collect::<Vec<_>>());
}

#[tokio::test]
async fn sqlite_backfill_matches_memory() {
    let sqlite = Arc::new(SqliteStore::in_memory().await.unwrap());
    let mem = seed_memory(6);
    for id in [1, 2] {
        let cap = cryptoindex::providers::MarketCapStore::latest_before(mem.as_ref(), id, T0).await.unwrap().unwrap();
        sqlite.insert_market_cap(&cap).await.unwrap();
    }
    let mut samples = Vec::new();
    for i in 0..=6 {
        samples.push(PriceSample::at(1, T0 + i * MIN, 10.0 + i as f64));
        samples.push(PriceSample::at(2, T0 + i * MIN, 20.0));
    }
    sqlite.insert_price_samples(&samples).await.unwrap();
    BasketSnapshotStore::insert(sqlite.as_ref(), &snapshot()).await.unwrap();
    BasketSnapshotStore::insert(mem.as_ref(), &snapshot()).await.unwrap();

    let a = SynthesisScheduler::from_store(&cfg(), sqlite.clone()).synthesize(INDEX).await.unwrap();
    let b = SynthesisScheduler::from_store(&cfg(), mem.clone()).synthesize(INDEX).await.unwrap();
    assert_eq!(a.persisted, 6);
    assert_eq!(a.steps, b.steps);
    assert!((a.last_close - b.last_close).abs() < 1e-12);

    let rows = SynthesizedCandleStore::range(sqlite.as_ref(), INDEX, T0, i64::MAX).await.unwrap();
    assert_continuous(&rows);
    let again = SynthesisScheduler::from_store(&cfg(), sqlite.clone()).synthesize(INDEX).await.unwrap();
    assert_eq!(again.persisted, 0);
    assert_eq!(SynthesizedCandleStore::range(sqlite.as_ref(), INDEX, T0, i64::MAX).await.unwrap(), rows);
}
