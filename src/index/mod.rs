// src/index/mod.rs
use crate::types::{AssetId, JobKind};

pub mod id;
pub mod rebalance;
pub mod step;
pub mod weights;

#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("missing data for asset {0}")]
    MissingData(AssetId),
    #[error("no basket snapshot for index {0}")]
    NoBasket(String),
    #[error("{job} already in progress for index {index_id}")]
    ConcurrentRun { index_id: String, job: JobKind },
    #[error("worker fault: {0}")]
    WorkerFault(String),
    #[error("numeric degeneracy: {0}")]
    NumericDegeneracy(&'static str),
    #[error("invalid index id: {0}")]
    InvalidIndexId(String),
    #[error("store: {0:#}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, IndexError>;
