// src/publishing.rs
use tokio::sync::broadcast;

use crate::types::{FundingRewardEvent, SynthesizedCandle};

#[async_trait::async_trait]
pub trait Publisher: Send + Sync + 'static {
    /// Finalized historical candle, delivered in timestamp order per index.
    async fn publish_candle(&self, candle: SynthesizedCandle) -> anyhow::Result<()>;
    /// Live candle; may be re-sent for the same timestamp while it is still open.
    async fn publish_live_candle(&self, candle: SynthesizedCandle, is_final: bool) -> anyhow::Result<()>;
    async fn publish_funding(&self, event: FundingRewardEvent) -> anyhow::Result<()>;
}

/// Writes everything to the tracing log.
pub struct LogPublisher;

#[async_trait::async_trait]
impl Publisher for LogPublisher {
    async fn publish_candle(&self, c: SynthesizedCandle) -> anyhow::Result<()> {
        tracing::debug!(index_id = %c.index_id, ts_ms = c.ts_ms, open = c.open, high = c.high, low = c.low, close = c.close, "[CANDLE]");
        Ok(())
    }
    async fn publish_live_candle(&self, c: SynthesizedCandle, is_final: bool) -> anyhow::Result<()> {
        tracing::info!(index_id = %c.index_id, ts_ms = c.ts_ms, close = c.close, is_final, "[LIVE]");
        Ok(())
    }
    async fn publish_funding(&self, e: FundingRewardEvent) -> anyhow::Result<()> {
        tracing::info!(index_id = %e.index_id, ts_ms = e.ts_ms, reward = e.reward, n_priced = e.n_priced, "[FUNDING]");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexEvent {
    Candle(SynthesizedCandle),
    LiveCandle { candle: SynthesizedCandle, is_final: bool },
    Funding(FundingRewardEvent),
}

/// Fan-out to any number of in-process listeners. Sending with no live
/// receiver is not an error; slow receivers lag and lose the oldest events.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<IndexEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.tx.subscribe()
    }

    fn send(&self, ev: IndexEvent) {
        let _ = self.tx.send(ev);
    }
}

#[async_trait::async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish_candle(&self, candle: SynthesizedCandle) -> anyhow::Result<()> {
        self.send(IndexEvent::Candle(candle));
        Ok(())
    }
    async fn publish_live_candle(&self, candle: SynthesizedCandle, is_final: bool) -> anyhow::Result<()> {
        self.send(IndexEvent::LiveCandle { candle, is_final });
        Ok(())
    }
    async fn publish_funding(&self, event: FundingRewardEvent) -> anyhow::Result<()> {
        self.send(IndexEvent::Funding(event));
        Ok(())
    }
}

/// Publish to each sink in turn; a failing sink is logged and skipped.
pub async fn publish_candles(sinks: &[std::sync::Arc<dyn Publisher>], candles: &[SynthesizedCandle]) {
    for sink in sinks {
        for c in candles {
            if let Err(e) = sink.publish_candle(c.clone()).await {
                tracing::warn!("publish_candle failed: {e:?}");
                break;
            }
        }
    }
}
