// src/index/step.rs
//! Single-step index pricing. Every synthetic candle, historical or live, is
//! produced by [`step_price`] from the previous close and one leg per constituent.

use crate::types::{ConstituentAllocation, PriceSample, SynthesizedCandle};

/// One constituent's contribution to a step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLeg {
    pub weight: f64,
    pub start: Option<PriceSample>,
    pub end: Option<PriceSample>,
}

impl From<&ConstituentAllocation> for StepLeg {
    fn from(a: &ConstituentAllocation) -> Self {
        Self { weight: a.weight, start: Some(a.start), end: Some(a.end) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Ohlc {
    pub fn flat(px: f64) -> Self {
        Self { open: px, high: px, low: px, close: px }
    }

    fn is_nan(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }
}

/// Result of one step. `Invalid` replaces any NaN output and must not be persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepCandle {
    Priced(Ohlc),
    Invalid,
}

impl StepCandle {
    pub fn ohlc(&self) -> Option<Ohlc> {
        match self {
            StepCandle::Priced(o) => Some(*o),
            StepCandle::Invalid => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub n_used: usize,
    pub n_dropped: usize,
}

/// Per-leg simple return, or `None` when the leg cannot be priced.
fn leg_return(leg: &StepLeg) -> Option<f64> {
    let (start, end) = (leg.start?, leg.end?);
    if start.ts_ms == end.ts_ms {
        return None;
    }
    if !start.close.is_finite() || start.close == 0.0 || !end.close.is_finite() {
        return None;
    }
    Some(end.close / start.close - 1.0)
}

/// Blend constituent returns into one candle seeded by `previous_close`.
///
/// Dropped legs are not renormalised away: the remaining weights keep their
/// original values, so a dropout shrinks the total contribution.
pub fn step_price(previous_close: f64, legs: &[StepLeg]) -> (StepCandle, StepStats) {
    let mut stats = StepStats::default();
    let mut weighted_return_sum = 0.0;
    for leg in legs {
        match leg_return(leg) {
            Some(r) => {
                weighted_return_sum += leg.weight * r;
                stats.n_used += 1;
            }
            None => stats.n_dropped += 1,
        }
    }

    let ohlc = if stats.n_used == 0 {
        Ohlc::flat(previous_close)
    } else {
        let open = previous_close;
        let close = previous_close * (1.0 + weighted_return_sum);
        Ohlc { open, high: open.max(close), low: open.min(close), close }
    };

    // f64::max/min swallow a single NaN, so check the inputs as well
    if ohlc.is_nan() || weighted_return_sum.is_nan() || previous_close.is_nan() {
        return (StepCandle::Invalid, stats);
    }
    (StepCandle::Priced(ohlc), stats)
}

/// Fold one step into the running close. Returns the close to carry forward and
/// the candle to persist; an invalid step leaves the running close untouched.
pub fn fold_step(
    index_id: &str,
    previous_close: f64,
    ts_ms: i64,
    legs: &[StepLeg],
) -> (f64, Option<SynthesizedCandle>) {
    match step_price(previous_close, legs).0 {
        StepCandle::Priced(o) => (
            o.close,
            Some(SynthesizedCandle {
                index_id: index_id.to_string(),
                ts_ms,
                open: o.open,
                high: o.high,
                low: o.low,
                close: o.close,
            }),
        ),
        StepCandle::Invalid => {
            tracing::warn!(index_id, ts_ms, "step produced NaN, skipping candle");
            (previous_close, None)
        }
    }
}

/// Fold a chronologically ordered sequence of steps into a candle series.
pub fn fold_series<I>(index_id: &str, initial_close: f64, steps: I) -> (Vec<SynthesizedCandle>, f64)
where
    I: IntoIterator<Item = (i64, Vec<StepLeg>)>,
{
    steps.into_iter().fold((Vec::new(), initial_close), |(mut out, close), (ts_ms, legs)| {
        let (next, candle) = fold_step(index_id, close, ts_ms, &legs);
        out.extend(candle);
        (out, next)
    })
}
