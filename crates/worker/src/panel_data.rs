//! Chart data service client.
//!
//! The JSON panel behind a chart is fetched after each capture and
//! published next to the screenshot under `data/`.

use async_trait::async_trait;
use chart_snap_common::{Error, PanelDataConfig, Result};
use tracing::{debug, info};

/// Source of the panel data for a chart.
#[async_trait]
pub trait PanelDataSource: Send + Sync {
    /// `symbol` is already formatted for its market (`700.HK`).
    async fn fetch(&self, symbol: &str, duration: &str) -> Result<serde_json::Value>;
}

/// `GET {base}/kline/panel/{symbol}/{duration}` against the chart data service.
pub struct HttpPanelDataClient {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

impl HttpPanelDataClient {
    /// Returns None when no base URL is configured.
    pub fn from_config(config: &PanelDataConfig) -> Result<Option<Self>> {
        config
            .base_url
            .as_deref()
            .map(|base_url| Self::new(base_url, config))
            .transpose()
    }

    pub fn new(base_url: &str, config: &PanelDataConfig) -> Result<Self> {
        let base_url = reqwest::Url::parse(base_url).map_err(|e| Error::Config {
            message: format!("panel_data.base_url is not a URL: {}", e),
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client, base_url })
    }

    fn panel_url(&self, symbol: &str, duration: &str) -> Result<reqwest::Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config {
                message: format!("panel_data.base_url {} cannot carry a path", self.base_url),
            })?
            .pop_if_empty()
            .extend(["kline", "panel", symbol, duration]);
        Ok(url)
    }
}

#[async_trait]
impl PanelDataSource for HttpPanelDataClient {
    async fn fetch(&self, symbol: &str, duration: &str) -> Result<serde_json::Value> {
        let url = self.panel_url(symbol, duration)?;
        let failed = |message: String| Error::PanelDataFailed {
            symbol: symbol.to_string(),
            message,
        };
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;

        if status != reqwest::StatusCode::OK {
            return Err(failed(format!(
                "status {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        let data: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| failed(format!("response is not JSON: {}", e)))?;
        info!(symbol, duration, size = body.len(), "Panel data retrieved");
        Ok(data)
    }
}
