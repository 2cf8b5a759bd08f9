// src/providers/mod.rs
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::types::{Asset, AssetId, LiveTick, MarketCapSample, PriceBracket, PriceSample, SourceVenue, TimeWindow};

pub mod ws;

#[async_trait]
pub trait PriceSeriesStore: Send + Sync {
    /// Closest samples at-or-before and at-or-after `ts_ms`.
    async fn bracket(&self, asset_id: AssetId, ts_ms: i64) -> anyhow::Result<PriceBracket>;

    /// Timestamps of the first and last stored sample.
    async fn span(&self, asset_id: AssetId) -> anyhow::Result<Option<(i64, i64)>>;

    /// Start and end samples for a window. Each side prefers the sample at-or-before
    /// the boundary and falls back to the one after it.
    async fn window_samples(
        &self,
        asset_id: AssetId,
        window: TimeWindow,
    ) -> anyhow::Result<(Option<PriceSample>, Option<PriceSample>)> {
        let start = self.bracket(asset_id, window.start_ms).await?;
        let end = self.bracket(asset_id, window.end_ms).await?;
        Ok((start.before.or(start.after), end.before.or(end.after)))
    }
}

#[async_trait]
pub trait MarketCapStore: Send + Sync {
    async fn latest_before(&self, asset_id: AssetId, ts_ms: i64) -> anyhow::Result<Option<MarketCapSample>>;
}

#[async_trait]
pub trait AssetUniverse: Send + Sync {
    async fn assets(&self) -> anyhow::Result<Vec<Asset>>;

    async fn assets_on(&self, venue: SourceVenue) -> anyhow::Result<Vec<Asset>> {
        Ok(self.assets().await?.into_iter().filter(|a| a.venue == venue).collect())
    }
}

#[async_trait]
pub trait FundingRateStore: Send + Sync {
    /// Latest funding rate at-or-before `ts_ms`.
    async fn rate_at(&self, asset_id: AssetId, ts_ms: i64) -> anyhow::Result<Option<f64>>;
}

/// Live candle feed for one exchange symbol. Stream items map to the tick/error
/// callbacks; the end of the stream is the close notification.
#[async_trait]
pub trait TickSource: Send + Sync {
    async fn subscribe(&self, symbol: &str) -> anyhow::Result<BoxStream<'static, anyhow::Result<LiveTick>>>;
}
