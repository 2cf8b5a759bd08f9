// src/providers/ws.rs
use anyhow::Context;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;

use super::TickSource;
use crate::types::LiveTick;

/// JSON candle stream. One connection per symbol; `{symbol}` in the template is
/// replaced by the lower-cased exchange symbol. Frames are either a flat candle
/// or a kline envelope (`{"e":"kline","k":{...}}`) with string-encoded numbers.
pub struct WsTickSource {
    pub url_template: String,
}

#[derive(Debug, Deserialize)]
struct WsCandle {
    #[serde(alias = "t")]
    ts_ms: i64,
    #[serde(alias = "o", deserialize_with = "num_or_str")]
    open: f64,
    #[serde(alias = "h", deserialize_with = "num_or_str")]
    high: f64,
    #[serde(alias = "l", deserialize_with = "num_or_str")]
    low: f64,
    #[serde(alias = "c", deserialize_with = "num_or_str")]
    close: f64,
    #[serde(alias = "v", default, deserialize_with = "num_or_str")]
    volume: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WsFrame {
    Kline { k: WsCandle },
    Flat(WsCandle),
}

fn num_or_str<'de, D: serde::Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl WsTickSource {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self { url_template: url_template.into() }
    }

    pub fn url_for(&self, symbol: &str) -> String {
        self.url_template.replace("{symbol}", &symbol.to_ascii_lowercase())
    }
}

fn parse_tick(text: &str) -> Option<LiveTick> {
    match serde_json::from_str::<WsFrame>(text) {
        Ok(WsFrame::Kline { k: c } | WsFrame::Flat(c)) => Some(LiveTick {
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            ts_ms: c.ts_ms,
        }),
        Err(e) => {
            tracing::debug!(error = %e, "unparseable candle frame");
            None
        }
    }
}

#[async_trait::async_trait]
impl TickSource for WsTickSource {
    async fn subscribe(&self, symbol: &str) -> anyhow::Result<BoxStream<'static, anyhow::Result<LiveTick>>> {
        let url = self.url_for(symbol);
        let (ws, _resp) = tokio_tungstenite::connect_async(&url)
            .await
            .with_context(|| format!("websocket connect failed: {url}"))?;
        let (_write, read) = ws.split();

        let ticks = read.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => parse_tick(&text).map(Ok),
                Ok(_) => None,
                Err(e) => Some(Err(anyhow::anyhow!("websocket read error: {e}"))),
            }
        });
        Ok(ticks.boxed())
    }
}
