// src/index/id.rs
use chrono::{DateTime, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::IndexError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceInterval {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RebalanceInterval {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "yearly" | "annual" => Some(Self::Yearly),
            _ => None,
        }
    }

    /// Next period boundary after `ts_ms`. Months and years follow the UTC calendar,
    /// so a Jan 31 start lands on the last day of February.
    pub fn advance(&self, ts_ms: i64) -> Option<i64> {
        let t: DateTime<Utc> = Utc.timestamp_millis_opt(ts_ms).single()?;
        let next = match self {
            Self::Hourly => t.checked_add_signed(Duration::hours(1))?,
            Self::Daily => t.checked_add_signed(Duration::days(1))?,
            Self::Weekly => t.checked_add_signed(Duration::weeks(1))?,
            Self::Monthly => t.checked_add_months(Months::new(1))?,
            Self::Yearly => t.checked_add_months(Months::new(12))?,
        };
        Some(next.timestamp_millis())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

/// Parsed form of an index identifier such as `top20-monthly` or `top10_weekly_defi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub id: String,
    pub basket_size: usize,
    pub interval: RebalanceInterval,
    pub category: Option<String>,
}

impl IndexSpec {
    pub fn parse(id: &str) -> Result<Self, IndexError> {
        let mut basket_size = None;
        let mut interval = None;
        let mut rest = Vec::new();

        for token in id.split(['-', '_']).filter(|t| !t.is_empty()) {
            let lower = token.to_ascii_lowercase();
            if basket_size.is_none() {
                if let Some(n) = lower.strip_prefix("top") {
                    if let Ok(n) = n.parse::<usize>() {
                        basket_size = Some(n);
                        continue;
                    }
                }
            }
            if interval.is_none() {
                if let Some(iv) = RebalanceInterval::parse(&lower) {
                    interval = Some(iv);
                    continue;
                }
            }
            rest.push(lower);
        }

        let basket_size = basket_size
            .filter(|n| *n > 0)
            .ok_or_else(|| IndexError::InvalidIndexId(format!("{id}: missing top<N> prefix")))?;
        let interval = interval
            .ok_or_else(|| IndexError::InvalidIndexId(format!("{id}: missing rebalance interval")))?;
        let category = if rest.is_empty() { None } else { Some(rest.join("-")) };

        Ok(Self { id: id.to_string(), basket_size, interval, category })
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (top {} {}", self.id, self.basket_size, self.interval.as_str())?;
        if let Some(c) = &self.category {
            write!(f, " {c}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(y: i32, m: u32, d: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn parses_plain_ids() {
        let s = IndexSpec::parse("top20-monthly").unwrap();
        assert_eq!(s.basket_size, 20);
        assert_eq!(s.interval, RebalanceInterval::Monthly);
        assert_eq!(s.category, None);

        let s = IndexSpec::parse("TOP10_WEEKLY").unwrap();
        assert_eq!(s.basket_size, 10);
        assert_eq!(s.interval, RebalanceInterval::Weekly);
    }

    #[test]
    fn leftover_tokens_become_category() {
        let s = IndexSpec::parse("top5-daily-defi").unwrap();
        assert_eq!(s.category.as_deref(), Some("defi"));
        let s = IndexSpec::parse("layer-top3-hourly-one").unwrap();
        assert_eq!(s.category.as_deref(), Some("layer-one"));
        assert_eq!(s.to_string(), "layer-top3-hourly-one (top 3 hourly layer-one)");
        assert_eq!(IndexSpec::parse("top20-monthly").unwrap().to_string(), "top20-monthly (top 20 monthly)");
    }

    #[test]
    fn rejects_ids_without_size_or_interval() {
        assert!(IndexSpec::parse("monthly").is_err());
        assert!(IndexSpec::parse("top20").is_err());
        assert!(IndexSpec::parse("top0-daily").is_err());
        assert!(IndexSpec::parse("").is_err());
    }

    #[test]
    fn calendar_advance() {
        let jan31 = ms(2024, 1, 31);
        assert_eq!(RebalanceInterval::Monthly.advance(jan31), Some(ms(2024, 2, 29)));
        assert_eq!(RebalanceInterval::Yearly.advance(ms(2023, 3, 1)), Some(ms(2024, 3, 1)));
        assert_eq!(RebalanceInterval::Weekly.advance(ms(2024, 1, 1)), Some(ms(2024, 1, 8)));
        assert_eq!(RebalanceInterval::Hourly.advance(0), Some(3_600_000));
    }
}
