// src/index/weights.rs
use std::sync::Arc;

use crate::providers::MarketCapStore;
use crate::types::{AssetId, TimeWindow};

use super::Result;

pub const DEFAULT_MIN_WEIGHT: f64 = 0.0025;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetWeight {
    pub asset_id: AssetId,
    pub weight: f64,
}

/// Market-cap weighting with a minimum-weight floor.
#[derive(Clone)]
pub struct WeightEngine {
    pub min_weight: f64,
    caps: Arc<dyn MarketCapStore>,
}

impl WeightEngine {
    pub fn new(caps: Arc<dyn MarketCapStore>, min_weight: f64) -> Self {
        Self { min_weight, caps }
    }

    /// Weights for `asset_ids` valued at the end of `window`.
    ///
    /// Each asset uses its most recent cap at-or-before the window end; a sample
    /// inside the window always wins over an older one since it is more recent.
    /// Assets without any cap count as zero and end up on the floor.
    pub async fn compute_weights(&self, asset_ids: &[AssetId], window: TimeWindow) -> Result<Vec<AssetWeight>> {
        let mut caps = Vec::with_capacity(asset_ids.len());
        for &asset_id in asset_ids {
            let cap = match self.caps.latest_before(asset_id, window.end_ms).await? {
                Some(s) if s.market_cap.is_finite() && s.market_cap > 0.0 => {
                    if s.ts_ms < window.start_ms {
                        tracing::debug!(asset_id, cap_ts = s.ts_ms, "market cap predates valuation window");
                    }
                    s.market_cap
                }
                Some(_) | None => {
                    tracing::debug!(asset_id, "no usable market cap, flooring");
                    0.0
                }
            };
            caps.push((asset_id, cap));
        }
        Ok(floor_weights(&caps, self.min_weight))
    }
}

/// Normalise caps into weights, pinning anything below `min_weight` to the floor
/// and splitting what is left over the unpinned assets by their share of the
/// unpinned cap only.
///
/// An asset without a cap is always pinned, even with a zero floor.
/// Pinning repeats until no unpinned weight falls under the floor. When so many
/// assets are pinned that the floor alone exceeds 1, every asset sits on the
/// floor and the weights no longer sum to 1; this is left as is.
pub fn floor_weights(caps: &[(AssetId, f64)], min_weight: f64) -> Vec<AssetWeight> {
    let n = caps.len();
    let mut pinned = vec![false; n];

    loop {
        let free_cap: f64 = caps
            .iter()
            .zip(&pinned)
            .filter(|(_, p)| !**p)
            .map(|((_, c), _)| *c)
            .sum();
        let fixed_total = pinned.iter().filter(|p| **p).count() as f64 * min_weight;
        let remaining = 1.0 - fixed_total;

        let mut changed = false;
        for (i, (_, cap)) in caps.iter().enumerate() {
            if pinned[i] {
                continue;
            }
            let w = if free_cap > 0.0 { remaining * cap / free_cap } else { 0.0 };
            if w < min_weight || *cap <= 0.0 {
                pinned[i] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let free_cap: f64 = caps.iter().zip(&pinned).filter(|(_, p)| !**p).map(|((_, c), _)| *c).sum();
    let remaining = 1.0 - pinned.iter().filter(|p| **p).count() as f64 * min_weight;

    caps.iter()
        .zip(&pinned)
        .map(|(&(asset_id, cap), &is_pinned)| AssetWeight {
            asset_id,
            weight: if is_pinned || free_cap <= 0.0 { min_weight } else { remaining * cap / free_cap },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum(ws: &[AssetWeight]) -> f64 {
        ws.iter().map(|w| w.weight).sum()
    }

    #[test]
    fn plain_proportional_weights() {
        let ws = floor_weights(&[(1, 300.0), (2, 100.0)], DEFAULT_MIN_WEIGHT);
        assert!((ws[0].weight - 0.75).abs() < 1e-12);
        assert!((ws[1].weight - 0.25).abs() < 1e-12);
    }

    #[test]
    fn small_caps_are_pinned_and_rest_split_by_remaining_cap() {
        // raw share of asset 3 is 1/1001, below the floor
        let ws = floor_weights(&[(1, 600.0), (2, 400.0), (3, 1.0)], DEFAULT_MIN_WEIGHT);
        assert_eq!(ws[2].weight, DEFAULT_MIN_WEIGHT);
        let rest = 1.0 - DEFAULT_MIN_WEIGHT;
        assert!((ws[0].weight - rest * 0.6).abs() < 1e-12);
        assert!((ws[1].weight - rest * 0.4).abs() < 1e-12);
        assert!((sum(&ws) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_cap_is_floored_and_dilutes_others() {
        let ws = floor_weights(&[(1, 50.0), (2, 50.0), (3, 0.0)], DEFAULT_MIN_WEIGHT);
        assert_eq!(ws[2].weight, DEFAULT_MIN_WEIGHT);
        assert!((ws[0].weight - (1.0 - DEFAULT_MIN_WEIGHT) / 2.0).abs() < 1e-12);
        assert!((sum(&ws) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn redistribution_never_leaves_a_weight_under_the_floor() {
        // 0.00251 raw share would drop under the floor after the second pass
        let mut caps: Vec<(AssetId, f64)> = (0..20).map(|i| (i, 0.0)).collect();
        caps.push((100, 2.51));
        caps.push((101, 997.49));
        let ws = floor_weights(&caps, DEFAULT_MIN_WEIGHT);
        assert!(ws.iter().all(|w| w.weight >= DEFAULT_MIN_WEIGHT));
        assert!((sum(&ws) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn normalization_holds_for_many_positive_caps() {
        let caps: Vec<(AssetId, f64)> = (1..=50).map(|i| (i, (i * i) as f64 * 1.7e6)).collect();
        let ws = floor_weights(&caps, DEFAULT_MIN_WEIGHT);
        assert!((sum(&ws) - 1.0).abs() < 1e-9);
        assert!(ws.iter().all(|w| w.weight >= DEFAULT_MIN_WEIGHT));
    }

    #[test]
    fn floor_can_exceed_one_when_everything_lacks_data() {
        let caps: Vec<(AssetId, f64)> = (0..500).map(|i| (i, 0.0)).collect();
        let ws = floor_weights(&caps, DEFAULT_MIN_WEIGHT);
        assert!(ws.iter().all(|w| w.weight == DEFAULT_MIN_WEIGHT));
        assert!((sum(&ws) - 1.25).abs() < 1e-9);
    }

    #[test]
    fn zero_floor_never_produces_nan() {
        let ws = floor_weights(&[(1, 0.0), (2, 0.0)], 0.0);
        assert!(ws.iter().all(|w| w.weight == 0.0));

        let ws = floor_weights(&[(1, 30.0), (2, 0.0), (3, 10.0)], 0.0);
        assert!(ws.iter().all(|w| w.weight.is_finite()));
        assert_eq!(ws[1].weight, 0.0);
        assert!((ws[0].weight - 0.75).abs() < 1e-12);
        assert!((sum(&ws) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(floor_weights(&[], DEFAULT_MIN_WEIGHT).is_empty());
    }
}
