use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bucket::Timeframe;

/// One chart artifact to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRequest {
    pub symbol: String,
    pub market: String,
    pub timeframe: Timeframe,
}

impl ArtifactRequest {
    pub fn new(symbol: impl Into<String>, market: impl Into<String>, timeframe: &str) -> Self {
        Self {
            symbol: symbol.into(),
            market: market.into(),
            timeframe: Timeframe::parse(timeframe),
        }
    }
}

impl std::fmt::Display for ArtifactRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}:{}", self.symbol, self.market, self.timeframe)
    }
}

/// What the store reports after a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub url: String,
    pub key: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// How an [`ArtifactResult`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// Already present on the CDN, nothing was captured.
    Cached,
    /// Produced by a concurrent request for the same key.
    Joined,
    /// Captured and uploaded by this request.
    Captured,
}

/// Result of a screenshot request.
///
/// `key`, `size`, `completed_at` and `data_url` are only known when this
/// request did the upload itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactResult {
    pub url: String,
    pub key: Option<String>,
    pub size: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
    /// CDN URL of the panel data uploaded with the screenshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    pub source: ArtifactSource,
}

impl ArtifactResult {
    pub fn cached(url: String) -> Self {
        Self {
            url,
            key: None,
            size: None,
            completed_at: None,
            data_url: None,
            source: ArtifactSource::Cached,
        }
    }

    pub fn joined(url: String) -> Self {
        Self {
            source: ArtifactSource::Joined,
            ..Self::cached(url)
        }
    }

    /// The CDN URL is returned, not the bucket URL from the upload.
    pub fn captured(url: String, upload: UploadResult) -> Self {
        Self {
            url,
            key: Some(upload.key),
            size: Some(upload.size),
            completed_at: Some(upload.uploaded_at),
            data_url: None,
            source: ArtifactSource::Captured,
        }
    }

    pub fn with_data_url(mut self, data_url: Option<String>) -> Self {
        self.data_url = data_url;
        self
    }
}

/// Session counts of one pooled browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleStats {
    pub index: usize,
    pub id: String,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub closed: bool,
    pub healthy: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_size: usize,
    /// Handles with at least one free slot.
    pub available: usize,
    /// Handles with at least one active session.
    pub in_use: usize,
    pub active_sessions: usize,
    pub closed: bool,
    pub handles: Vec<HandleStats>,
}

/// Lifecycle state of a deduplicated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub joins: u64,
    pub captures: u64,
    pub failures: u64,
    pub pool: PoolStats,
    pub tasks: CoordinatorStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_result_has_unknown_metadata() {
        let result = ArtifactResult::cached("https://cdn.example.com/a.png".to_string());
        assert_eq!(result.source, ArtifactSource::Cached);
        assert!(result.key.is_none());
        assert!(result.size.is_none());
        assert!(result.completed_at.is_none());
    }

    #[test]
    fn test_captured_result_keeps_cdn_url() {
        let upload = UploadResult {
            url: "https://bucket.s3.us-east-1.amazonaws.com/screenshots/a.png".to_string(),
            key: "screenshots/a.png".to_string(),
            size: 1024,
            uploaded_at: Utc::now(),
        };
        let result = ArtifactResult::captured("https://cdn.example.com/a.png".to_string(), upload);
        assert_eq!(result.url, "https://cdn.example.com/a.png");
        assert_eq!(result.key.as_deref(), Some("screenshots/a.png"));
        assert_eq!(result.size, Some(1024));
        assert!(result.data_url.is_none());

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("data_url").is_none());

        let with_data = result.with_data_url(Some("https://cdn.example.com/data/a.json".to_string()));
        let json = serde_json::to_value(&with_data).unwrap();
        assert_eq!(json["data_url"], "https://cdn.example.com/data/a.json");
        assert_eq!(json["source"], "captured");
    }

    #[test]
    fn test_request_display() {
        let request = ArtifactRequest::new("700", "hk", "1h");
        assert_eq!(request.to_string(), "700.hk:1h");
        assert_eq!(request.timeframe, Timeframe::Hourly);
    }
}
