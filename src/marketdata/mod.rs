//! Market data types and the rolling-window bar cache

pub mod cache;

pub use cache::{BarWindowCache, FetchMeta};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Bar granularity. Keys cached bars together with contract and bucket ts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarSize {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "1d")]
    Day1,
}

impl BarSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarSize::Min1 => "1m",
            BarSize::Min5 => "5m",
            BarSize::Min30 => "30m",
            BarSize::Hour1 => "1h",
            BarSize::Day1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(BarSize::Min1),
            "5m" => Some(BarSize::Min5),
            "30m" => Some(BarSize::Min30),
            "1h" => Some(BarSize::Hour1),
            "1d" => Some(BarSize::Day1),
            _ => None,
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            BarSize::Min1 => 60,
            BarSize::Min5 => 300,
            BarSize::Min30 => 1800,
            BarSize::Hour1 => 3600,
            BarSize::Day1 => 86400,
        }
    }

    /// Floor an instant onto this granularity's bucket boundary.
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.seconds();
        let t = ts.timestamp();
        DateTime::from_timestamp(t - t.rem_euclid(secs), 0).unwrap_or(ts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WhatToShow {
    #[default]
    Trades,
    Midpoint,
    Bid,
    Ask,
}

impl WhatToShow {
    pub fn as_str(&self) -> &'static str {
        match self {
            WhatToShow::Trades => "TRADES",
            WhatToShow::Midpoint => "MIDPOINT",
            WhatToShow::Bid => "BID",
            WhatToShow::Ask => "ASK",
        }
    }
}

/// OHLCV sample over one contiguous bucket, UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Volume-weighted average price when the gateway provides it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wap: Option<f64>,
}

impl Bar {
    /// Scalar under a price basis: close/high/low/avg.
    pub fn basis(&self, basis: crate::models::PriceBasis) -> f64 {
        match basis {
            crate::models::PriceBasis::Close => self.close,
            crate::models::PriceBasis::High => self.high,
            crate::models::PriceBasis::Low => self.low,
            crate::models::PriceBasis::Avg => self
                .wap
                .unwrap_or((self.open + self.high + self.low + self.close) / 4.0),
        }
    }

    /// Dollar turnover proxy for AMOUNT_RATIO.
    pub fn amount(&self) -> f64 {
        self.volume * self.wap.unwrap_or(self.close)
    }

    pub fn mid(&self) -> f64 {
        (self.high + self.low) / 2.0
    }
}

/// One per-contract bar request produced by condition preparation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRequest {
    pub contract: String,
    pub bar_size: BarSize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub what_to_show: WhatToShow,
    pub use_rth: bool,
    pub include_partial_bar: bool,
}

impl BarRequest {
    pub fn span(&self) -> ChronoDuration {
        self.end - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceBasis;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            ts: DateTime::from_timestamp(ts, 0).unwrap(),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 1000.0,
            wap: None,
        }
    }

    #[test]
    fn floor_lands_on_bucket_boundary() {
        let ts = DateTime::from_timestamp(3_661, 0).unwrap();
        assert_eq!(BarSize::Min1.floor(ts).timestamp(), 3_660);
        assert_eq!(BarSize::Hour1.floor(ts).timestamp(), 3_600);
    }

    #[test]
    fn basis_extraction() {
        let b = bar(0, 60.0);
        assert_eq!(b.basis(PriceBasis::Close), 60.0);
        assert_eq!(b.basis(PriceBasis::High), 61.0);
        assert_eq!(b.basis(PriceBasis::Low), 58.0);
        // No wap: avg falls back to OHLC mean.
        assert!((b.basis(PriceBasis::Avg) - 59.5).abs() < 1e-9);
    }
}
