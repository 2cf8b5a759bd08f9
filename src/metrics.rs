// src/metrics.rs
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec, IntGauge};

pub static CANDLES_PERSISTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("index_candles_persisted_total", "Synthesized candles written").unwrap()
});

pub static SYNTHESIS_STEPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "index_synthesis_steps_total", "Synthesis steps folded", &["outcome"] // ok|failed|invalid
    ).unwrap()
});

pub static SNAPSHOTS_WRITTEN: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("index_snapshots_written_total", "Basket snapshots persisted").unwrap()
});

pub static POOL_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("index_pool_workers", "Live worker tasks").unwrap()
});

pub static FEED_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "index_feed_reconnects_total", "Live feed reconnect attempts", &["symbol"]
    ).unwrap()
});
