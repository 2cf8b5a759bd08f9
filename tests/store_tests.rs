use cryptoindex::providers::{AssetUniverse, FundingRateStore, PriceSeriesStore};
use cryptoindex::store::{
    BasketSnapshotStore, FundingRewardStore, MemoryStore, ProcessingStatusStore, SqliteStore, SynthesizedCandleStore,
};
use cryptoindex::types::{
    Asset, AssetStatus, BasketSnapshot, ConstituentAllocation, FundingRewardEvent, JobKind, PriceSample,
    ProcessingState, SourceVenue, SynthesizedCandle, TimeWindow,
};

fn snapshot(category: Option<&str>, ts_ms: i64, close: f64) -> BasketSnapshot {
    BasketSnapshot {
        index_id: "top1-weekly".into(),
        category: category.map(str::to_string),
        ts_ms,
        reference_price: 100.0,
        close_price: close,
        constituents: vec![ConstituentAllocation {
            asset_id: 1,
            weight: 1.0,
            start: PriceSample::at(1, ts_ms, 10.0),
            end: PriceSample::at(1, ts_ms + 1, 11.0),
            amount: 10.0,
        }],
        spread: None,
    }
}

fn candle(ts_ms: i64, close: f64) -> SynthesizedCandle {
    SynthesizedCandle { index_id: "top1-weekly".into(), ts_ms, open: 1.0, high: close.max(1.0), low: 1.0, close }
}

#[tokio::test]
async fn sqlite_status_guard_is_single_flight() {
    let store = SqliteStore::in_memory().await.unwrap();
    assert_eq!(store.get("x", JobKind::Rebalance).await.unwrap(), ProcessingState::NotStarted);
    assert!(store.try_begin("x", JobKind::Rebalance).await.unwrap());
    assert!(!store.try_begin("x", JobKind::Rebalance).await.unwrap());
    // other jobs are independent
    assert!(store.try_begin("x", JobKind::Synthesis).await.unwrap());

    store.set("x", JobKind::Rebalance, ProcessingState::Success).await.unwrap();
    assert!(store.try_begin("x", JobKind::Rebalance).await.unwrap());

    assert_eq!(store.reset_in_flight().await.unwrap(), 2);
    assert_eq!(store.get("x", JobKind::Synthesis).await.unwrap(), ProcessingState::Error);
}

#[tokio::test]
async fn memory_status_guard_matches_sqlite() {
    let store = MemoryStore::new();
    assert!(store.try_begin("x", JobKind::Funding).await.unwrap());
    assert!(!store.try_begin("x", JobKind::Funding).await.unwrap());
    assert_eq!(store.reset_in_flight().await.unwrap(), 1);
    assert!(store.try_begin("x", JobKind::Funding).await.unwrap());
}

#[tokio::test]
async fn sqlite_snapshots_are_scoped_by_category() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert(&snapshot(None, 0, 101.0)).await.unwrap();
    store.insert(&snapshot(None, 10, 102.0)).await.unwrap();
    store.insert(&snapshot(Some("defi"), 20, 99.0)).await.unwrap();
    assert!(store.insert(&snapshot(None, 10, 1.0)).await.is_err());

    let plain = BasketSnapshotStore::latest(&store, "top1-weekly", None).await.unwrap().unwrap();
    assert_eq!(plain.ts_ms, 10);
    assert_eq!(plain.close_price, 102.0);
    assert_eq!(plain.constituents[0].amount, 10.0);
    let defi = BasketSnapshotStore::latest(&store, "top1-weekly", Some("defi")).await.unwrap().unwrap();
    assert_eq!(defi.category.as_deref(), Some("defi"));

    assert_eq!(store.list_by_index("top1-weekly").await.unwrap().len(), 3);
    assert!(store.annotate_spread("top1-weekly", None, 10, 0.0004).await.unwrap());
    assert!(!store.annotate_spread("top1-weekly", None, 11, 0.0004).await.unwrap());
    let plain = BasketSnapshotStore::latest(&store, "top1-weekly", None).await.unwrap().unwrap();
    assert_eq!(plain.spread, Some(0.0004));
}

#[tokio::test]
async fn sqlite_candle_batches_skip_conflicts() {
    let store = SqliteStore::in_memory().await.unwrap();
    let batch = vec![candle(0, 2.0), candle(60_000, 3.0)];
    assert_eq!(store.insert_batch_ignore_conflicts(&batch).await.unwrap(), 2);
    let overlap = vec![candle(60_000, 999.0), candle(120_000, 4.0)];
    assert_eq!(store.insert_batch_ignore_conflicts(&overlap).await.unwrap(), 1);

    let rows = store.range("top1-weekly", 0, i64::MAX).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1].close, 3.0);
    let last = SynthesizedCandleStore::latest(&store, "top1-weekly").await.unwrap().unwrap();
    assert_eq!(last.ts_ms, 120_000);
}

#[tokio::test]
async fn sqlite_brackets_and_window_fallbacks() {
    let store = SqliteStore::in_memory().await.unwrap();
    store
        .insert_price_samples(&[PriceSample::at(1, 100, 1.0), PriceSample::at(1, 200, 2.0), PriceSample::at(1, 300, 3.0)])
        .await
        .unwrap();

    let b = store.bracket(1, 250).await.unwrap();
    assert_eq!(b.before.map(|s| s.ts_ms), Some(200));
    assert_eq!(b.after.map(|s| s.ts_ms), Some(300));
    let exact = store.bracket(1, 200).await.unwrap();
    assert_eq!((exact.before.unwrap().ts_ms, exact.after.unwrap().ts_ms), (200, 200));
    assert_eq!(store.span(1).await.unwrap(), Some((100, 300)));
    assert_eq!(store.span(2).await.unwrap(), None);

    // start before any data falls forward; end past the data falls back
    let (s, e) = store.window_samples(1, TimeWindow::new(0, 1_000)).await.unwrap();
    assert_eq!((s.unwrap().ts_ms, e.unwrap().ts_ms), (100, 300));
    let (s, e) = store.window_samples(9, TimeWindow::new(0, 1_000)).await.unwrap();
    assert!(s.is_none() && e.is_none());
}

#[tokio::test]
async fn sqlite_assets_funding_and_rewards() {
    let store = SqliteStore::in_memory().await.unwrap();
    store
        .upsert_asset(&Asset {
            id: 7,
            name: "ETH".into(),
            symbol: "ETHUSDT".into(),
            venue: SourceVenue::LinearFutures,
            status: AssetStatus::Active,
            pair: Some("ETHUSDT".into()),
            contract_type: Some("perpetual".into()),
            categories: vec!["layer1".into(), "smart-contracts".into()],
        })
        .await
        .unwrap();
    let assets = store.assets_on(SourceVenue::LinearFutures).await.unwrap();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].categories, vec!["layer1".to_string(), "smart-contracts".to_string()]);
    assert!(store.assets_on(SourceVenue::Spot).await.unwrap().is_empty());

    store.insert_funding_rate(7, 1_000, 0.0001).await.unwrap();
    assert_eq!(store.rate_at(7, 999).await.unwrap(), None);
    assert_eq!(store.rate_at(7, 5_000).await.unwrap(), Some(0.0001));

    let ev = FundingRewardEvent { index_id: "top1-weekly".into(), ts_ms: 0, reward: 0.5, n_priced: 1 };
    assert!(store.insert_ignore(&ev).await.unwrap());
    assert!(!store.insert_ignore(&ev).await.unwrap());
    assert_eq!(store.list("top1-weekly").await.unwrap(), vec![ev]);
}
