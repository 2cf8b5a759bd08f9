// src/lib.rs
pub mod types;
pub mod config;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod publishing;
pub mod providers;
pub mod store;
pub mod index;
pub mod pool;
pub mod synthesis;
pub mod live;
pub mod funding;
pub mod service;
