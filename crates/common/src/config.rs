use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Placeholder values shipped in sample configs; treated as "not configured".
const PLACEHOLDER_JWT: &str = "your_jwt_access_token_here";
const PLACEHOLDER_SIDEBAR: &str = "your_sidebar_sheet_here";

/// Browser pool and Chrome launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Number of Chrome processes kept in the pool.
    pub pool_size: usize,
    /// Concurrent sessions (tabs) allowed per Chrome process.
    pub max_sessions_per_browser: usize,
    pub headless: bool,
    /// Path to browser binary. If None, uses Chrome/Chromium auto-detection.
    pub browser_path: Option<PathBuf>,
    pub renderer_processes: u32,
    pub webgl_contexts: u32,
    /// V8 old-space ceiling in megabytes.
    pub memory_limit_mb: u32,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub lang: String,
    pub accept_language: String,
    /// User-Agent override applied to every new session. None keeps Chrome's own.
    pub user_agent: Option<String>,
    #[serde(with = "humantime_serde")]
    pub acquire_poll_interval: Duration,
    /// Upper bound on a single acquire. None waits until cancelled.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// headless_chrome closes the browser after this much CDP silence.
    #[serde(with = "humantime_serde")]
    pub idle_browser_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            max_sessions_per_browser: 20,
            headless: true,
            browser_path: None,
            renderer_processes: 16,
            webgl_contexts: 8,
            memory_limit_mb: 2048,
            viewport_width: 1920,
            viewport_height: 1080,
            lang: "zh-CN".to_string(),
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8".to_string(),
            user_agent: None,
            acquire_poll_interval: Duration::from_millis(100),
            acquire_timeout: None,
            health_check_interval: Duration::from_secs(60),
            idle_browser_timeout: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// The third-party chart site being captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartSiteConfig {
    pub base_url: String,
    /// Seeded into `localStorage.jwt_access_token` once per browser.
    pub jwt_access_token: String,
    /// Seeded into `localStorage.sidebarSheet` once per browser.
    pub sidebar_sheet: String,
}

impl Default for ChartSiteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://mafit.fun".to_string(),
            jwt_access_token: String::new(),
            sidebar_sheet: String::new(),
        }
    }
}

impl ChartSiteConfig {
    /// True when both auth values are set to something other than the sample placeholders.
    pub fn has_session_state(&self) -> bool {
        !self.jwt_access_token.is_empty()
            && self.jwt_access_token != PLACEHOLDER_JWT
            && !self.sidebar_sheet.is_empty()
            && self.sidebar_sheet != PLACEHOLDER_SIDEBAR
    }
}

/// Refresh-and-capture timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(with = "humantime_serde")]
    pub navigation_timeout: Duration,
    /// Delay between clicking refresh and the first loading probe.
    #[serde(with = "humantime_serde")]
    pub refresh_start_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub refresh_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub refresh_poll_interval: Duration,
    /// Pause after loading finished, lets async chart rendering settle.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// CSS selectors tried in order when looking for the refresh control.
    pub refresh_selectors: Vec<String>,
    /// A candidate control must carry one of these labels.
    pub refresh_labels: Vec<String>,
    /// Directory for screenshots before upload. None uses the OS temp dir.
    pub temp_dir: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(60),
            refresh_start_delay: Duration::from_secs(1),
            refresh_timeout: Duration::from_secs(30),
            refresh_poll_interval: Duration::from_millis(500),
            settle_delay: Duration::from_secs(1),
            refresh_selectors: vec![
                "#\\:rk\\:".to_string(),
                "button[class*='refresh']".to_string(),
                "button[class*='Refresh']".to_string(),
                "button".to_string(),
            ],
            refresh_labels: vec!["刷新".to_string(), "Refresh".to_string()],
            temp_dir: None,
        }
    }
}

/// Task coordinator lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// A running record older than this is considered abandoned.
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,
    /// How long terminal records stay visible to trailing joiners.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Ceiling on how long a duplicate request waits for the in-flight one.
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            join_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// S3 bucket receiving the screenshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub region: String,
    pub bucket: String,
    /// Prefix prepended to every object key.
    pub key_prefix: String,
    /// Custom endpoint (MinIO, R2, ...). None talks to AWS.
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    #[serde(with = "humantime_serde")]
    pub upload_timeout: Option<Duration>,
}

impl StoreConfig {
    pub fn upload_timeout(&self) -> Duration {
        self.upload_timeout.unwrap_or(Duration::from_secs(120))
    }
}

/// CDN in front of the bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdnConfig {
    pub base_url: String,
    pub result_path: String,
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            result_path: "screenshots".to_string(),
            head_timeout: Duration::from_secs(10),
        }
    }
}

/// Chart data service queried for the JSON panel data published next to
/// each screenshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelDataConfig {
    /// None skips the data file entirely.
    pub base_url: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for PanelDataConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Label attached to metrics.
    pub name: String,
    pub browser: BrowserConfig,
    pub site: ChartSiteConfig,
    pub capture: CaptureConfig,
    pub tasks: TaskConfig,
    pub store: StoreConfig,
    pub cdn: CdnConfig,
    pub panel_data: PanelDataConfig,
    /// Reject timeframes without a calendar bucket instead of keying them per second.
    pub strict_timeframes: bool,
    pub metrics_port: Option<u16>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "chart-snap".to_string(),
            browser: BrowserConfig::default(),
            site: ChartSiteConfig::default(),
            capture: CaptureConfig::default(),
            tasks: TaskConfig::default(),
            store: StoreConfig::default(),
            cdn: CdnConfig::default(),
            panel_data: PanelDataConfig::default(),
            strict_timeframes: false,
            metrics_port: None,
        }
    }
}

impl ServiceConfig {
    /// Checks the invariants the pool and coordinator rely on.
    pub fn validate(&self) -> Result<()> {
        if self.browser.pool_size == 0 {
            return Err(config_error("browser.pool_size must be at least 1"));
        }
        if self.browser.max_sessions_per_browser == 0 {
            return Err(config_error(
                "browser.max_sessions_per_browser must be at least 1",
            ));
        }
        if self.browser.acquire_poll_interval.is_zero() {
            return Err(config_error("browser.acquire_poll_interval must be positive"));
        }
        if self.capture.refresh_poll_interval.is_zero() {
            return Err(config_error("capture.refresh_poll_interval must be positive"));
        }
        if self.tasks.sweep_interval.is_zero() {
            return Err(config_error("tasks.sweep_interval must be positive"));
        }
        url::Url::parse(&self.site.base_url)
            .map_err(|e| config_error(format!("site.base_url is not a URL: {}", e)))?;
        if self.cdn.base_url.is_empty() {
            return Err(config_error("cdn.base_url is required"));
        }
        if let Some(base_url) = &self.panel_data.base_url {
            url::Url::parse(base_url)
                .map_err(|e| config_error(format!("panel_data.base_url is not a URL: {}", e)))?;
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ServiceConfig {
        ServiceConfig {
            cdn: CdnConfig {
                base_url: "https://cdn.example.com".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = ServiceConfig::default();
        assert_eq!(config.browser.pool_size, 1);
        assert_eq!(config.browser.max_sessions_per_browser, 20);
        assert_eq!(config.browser.acquire_poll_interval, Duration::from_millis(100));
        assert_eq!(config.tasks.task_timeout, Duration::from_secs(300));
        assert_eq!(config.tasks.retention, Duration::from_secs(1800));
        assert_eq!(config.capture.refresh_timeout, Duration::from_secs(30));
        assert_eq!(config.capture.refresh_poll_interval, Duration::from_millis(500));
        assert_eq!(config.cdn.head_timeout, Duration::from_secs(10));
        assert_eq!(config.store.upload_timeout(), Duration::from_secs(120));
        assert_eq!(config.panel_data.base_url, None);
        assert_eq!(config.panel_data.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.browser.pool_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));

        let mut config = valid();
        config.cdn.base_url.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.site.base_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.panel_data.base_url = Some("charts service".to_string());
        assert!(config.validate().is_err());
        config.panel_data.base_url = Some("http://localhost:8080".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_state_ignores_placeholders() {
        let mut site = ChartSiteConfig::default();
        assert!(!site.has_session_state());

        site.jwt_access_token = PLACEHOLDER_JWT.to_string();
        site.sidebar_sheet = "open".to_string();
        assert!(!site.has_session_state());

        site.jwt_access_token = "eyJhbGciOi".to_string();
        assert!(site.has_session_state());
    }

    #[test]
    fn test_durations_deserialize_from_humantime() {
        let json = r#"{
            "task_timeout": "5m",
            "retention": "30m",
            "sweep_interval": "1m",
            "join_timeout": "90s"
        }"#;
        let tasks: TaskConfig = serde_json::from_str(json).unwrap();
        assert_eq!(tasks.join_timeout, Duration::from_secs(90));
        assert_eq!(tasks.sweep_interval, Duration::from_secs(60));
    }
}
