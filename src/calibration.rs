//! Fill level calibration.
//!
//! Pure functions mapping a raw level sensor register value to a fill
//! percentage and a coarse fill bucket. Independent of the bus and the
//! store, so the whole mapping is testable without hardware.

use serde::{Deserialize, Serialize};

/// Convert a raw register value to a fill percentage.
///
/// The result is clamped to `[0, 100]`: negative raw values map to 0, values
/// beyond the capacity map to 100. A capacity of 0 yields 0 rather than a
/// division fault; that misconfiguration is reported at config load.
pub fn fill_percent(raw: i64, capacity: u32) -> u8 {
    if capacity == 0 || raw <= 0 {
        return 0;
    }

    let percent = (i128::from(raw) * 100) / i128::from(capacity);
    percent.min(100) as u8
}

/// Coarse fill bucket shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillLevel {
    /// Below 20%
    Low,
    /// 20% up to but not including 50%
    Medium,
    /// 50% and above
    High,
}

impl FillLevel {
    /// Bucket a percentage. Boundaries are inclusive on the lower edge of
    /// each bucket.
    pub fn from_percent(percent: u8) -> Self {
        match percent {
            p if p >= 50 => FillLevel::High,
            p if p >= 20 => FillLevel::Medium,
            _ => FillLevel::Low,
        }
    }

    /// String name used in the JSON API.
    pub fn as_str(&self) -> &'static str {
        match self {
            FillLevel::Low => "low",
            FillLevel::Medium => "medium",
            FillLevel::High => "high",
        }
    }
}

impl std::fmt::Display for FillLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
