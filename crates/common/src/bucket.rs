//! Time buckets and artifact fingerprints.
//!
//! A chart artifact is identified by symbol, market, timeframe and the time bucket
//! "now" falls into. Every name derived from it (task key, file name, storage key,
//! CDN URL) comes from the same [`ArtifactKey`], computed once per request, so
//! independent processes agree on them bit for bit.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Wall clock used for bucketing and task expiry.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The process clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Chart timeframe. Known timeframes get calendar buckets, everything else
/// falls back to second resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Daily,
    Hourly,
    Weekly,
    Other(String),
}

impl Timeframe {
    pub fn parse(s: &str) -> Self {
        match s {
            "1d" => Self::Daily,
            "1h" => Self::Hourly,
            "1wk" => Self::Weekly,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Daily => "1d",
            Self::Hourly => "1h",
            Self::Weekly => "1wk",
            Self::Other(s) => s,
        }
    }

    /// Whether requests in the same bucket can share one artifact.
    pub fn is_bucketed(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Bucket suffix for the given local wall-clock instant.
    pub fn bucket_suffix(&self, at: NaiveDateTime) -> String {
        match self {
            Self::Daily => format!("1d_{}", at.format("%Y%m%d")),
            Self::Hourly => format!("1h_{}_{:02}", at.format("%Y%m%d"), at.hour()),
            Self::Weekly => {
                let week = at.date().iso_week();
                format!("1wk_{}_{:02}", week.year(), week.week())
            }
            Self::Other(tf) => format!("{}_{}", tf, at.format("%Y%m%d_%H%M%S")),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fingerprint of one chart artifact in one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    stem: String,
}

impl ArtifactKey {
    /// Key for `(symbol, market, timeframe)` at a local wall-clock instant.
    pub fn at(symbol: &str, market: &str, timeframe: &Timeframe, local: NaiveDateTime) -> Self {
        Self {
            stem: format!("{}_{}_{}", symbol, market, timeframe.bucket_suffix(local)),
        }
    }

    /// Key for `(symbol, market, timeframe)` at a UTC instant, bucketed in the
    /// host's local time zone.
    pub fn for_instant(
        symbol: &str,
        market: &str,
        timeframe: &Timeframe,
        now: DateTime<Utc>,
    ) -> Self {
        Self::at(
            symbol,
            market,
            timeframe,
            now.with_timezone(&Local).naive_local(),
        )
    }

    /// Deduplication key used by the task coordinator.
    pub fn task_key(&self) -> &str {
        &self.stem
    }

    /// `{stem}.png`
    pub fn file_name(&self) -> String {
        format!("{}.png", self.stem)
    }

    /// Object storage key of the screenshot.
    pub fn screenshot_key(&self) -> String {
        format!("screenshots/{}", self.file_name())
    }

    /// Object storage key of the companion JSON data file.
    pub fn data_key(&self) -> String {
        format!("data/{}.json", self.stem)
    }

    /// Public CDN URL of the companion JSON data file.
    pub fn data_cdn_url(&self, cdn_base_url: &str) -> String {
        format!("{}/{}", cdn_base_url.trim_end_matches('/'), self.data_key())
    }

    /// Public CDN URL of the screenshot.
    pub fn cdn_url(&self, cdn_base_url: &str, result_path: &str) -> String {
        let base = cdn_base_url.trim_end_matches('/');
        let path = result_path.trim_matches('/');
        if path.is_empty() {
            format!("{}/{}", base, self.file_name())
        } else {
            format!("{}/{}/{}", base, path, self.file_name())
        }
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_daily_file_name() {
        let key = ArtifactKey::at("NVDA", "us", &Timeframe::Daily, at(2025, 1, 1, 9, 30, 0));
        assert_eq!(key.file_name(), "NVDA_us_1d_20250101.png");
        assert_eq!(key.task_key(), "NVDA_us_1d_20250101");
        assert_eq!(key.screenshot_key(), "screenshots/NVDA_us_1d_20250101.png");
        assert_eq!(key.data_key(), "data/NVDA_us_1d_20250101.json");
    }

    #[test]
    fn test_hourly_key_stable_within_hour() {
        let a = ArtifactKey::at("AAPL", "us", &Timeframe::Hourly, at(2025, 3, 4, 10, 15, 0));
        let b = ArtifactKey::at("AAPL", "us", &Timeframe::Hourly, at(2025, 3, 4, 10, 16, 59));
        assert_eq!(a, b);
        assert_eq!(a.task_key(), "AAPL_us_1h_20250304_10");

        let next = ArtifactKey::at("AAPL", "us", &Timeframe::Hourly, at(2025, 3, 4, 11, 0, 0));
        assert_ne!(a, next);
    }

    #[test]
    fn test_hourly_pads_hour() {
        let key = ArtifactKey::at("700", "hk", &Timeframe::Hourly, at(2025, 3, 4, 9, 0, 0));
        assert_eq!(key.file_name(), "700_hk_1h_20250304_09.png");
    }

    #[test]
    fn test_daily_changes_across_midnight() {
        let before = ArtifactKey::at("NVDA", "us", &Timeframe::Daily, at(2024, 12, 31, 23, 59, 59));
        let after = ArtifactKey::at("NVDA", "us", &Timeframe::Daily, at(2025, 1, 1, 0, 0, 1));
        assert_ne!(before, after);
        assert_eq!(before.task_key(), "NVDA_us_1d_20241231");
        assert_eq!(after.task_key(), "NVDA_us_1d_20250101");
    }

    #[test]
    fn test_weekly_uses_iso_year_and_week() {
        // 2024-12-30 is Monday of ISO week 1 of 2025
        let key = ArtifactKey::at("TSLA", "us", &Timeframe::Weekly, at(2024, 12, 30, 12, 0, 0));
        assert_eq!(key.task_key(), "TSLA_us_1wk_2025_01");

        let same_week = ArtifactKey::at("TSLA", "us", &Timeframe::Weekly, at(2025, 1, 5, 23, 0, 0));
        assert_eq!(key, same_week);
    }

    #[test]
    fn test_unknown_timeframe_uses_seconds() {
        let tf = Timeframe::parse("5m");
        assert!(!tf.is_bucketed());
        let a = ArtifactKey::at("NVDA", "us", &tf, at(2025, 1, 1, 10, 0, 0));
        let b = ArtifactKey::at("NVDA", "us", &tf, at(2025, 1, 1, 10, 0, 1));
        assert_eq!(a.task_key(), "NVDA_us_5m_20250101_100000");
        assert_ne!(a, b);
    }

    #[test]
    fn test_timeframe_round_trip_names() {
        for name in ["1d", "1h", "1wk", "15m"] {
            assert_eq!(Timeframe::parse(name).as_str(), name);
        }
    }

    #[test]
    fn test_cdn_url_joins_segments() {
        let key = ArtifactKey::at("NVDA", "us", &Timeframe::Daily, at(2025, 1, 1, 0, 0, 0));
        assert_eq!(
            key.cdn_url("https://cdn.example.com/", "/charts/"),
            "https://cdn.example.com/charts/NVDA_us_1d_20250101.png"
        );
        assert_eq!(
            key.cdn_url("https://cdn.example.com", ""),
            "https://cdn.example.com/NVDA_us_1d_20250101.png"
        );
        assert_eq!(
            key.data_cdn_url("https://cdn.example.com/"),
            "https://cdn.example.com/data/NVDA_us_1d_20250101.json"
        );
    }
}
