use chart_snap_common::{
    chart_url, check_cancellation, ArtifactKey, ArtifactRequest, CancellationExt,
    CancellationToken, CaptureConfig, CaptureStage, ChartSiteConfig, Error, Result,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::renderer::{PageControl, RenderSession, Renderer};

/// The refresh control is disabled while the chart reloads its data.
const LOADING_PROBE: &str = "this.disabled === true";

/// Drives one chart page from navigation to a PNG on disk.
#[derive(Debug, Clone)]
pub struct ChartCapturer {
    base_url: String,
    config: CaptureConfig,
    temp_dir: PathBuf,
}

impl ChartCapturer {
    pub fn new(site: &ChartSiteConfig, config: &CaptureConfig) -> Self {
        Self {
            base_url: site.base_url.clone(),
            config: config.clone(),
            temp_dir: config.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
        }
    }

    /// Unique scratch path for the screenshot of `key`.
    pub fn temp_path(&self, key: &ArtifactKey) -> PathBuf {
        self.temp_dir.join(format!(
            "{}_{}",
            uuid::Uuid::new_v4().simple(),
            key.file_name()
        ))
    }

    /// Capture the chart for `request` into `output`. Returns the PNG size.
    pub async fn capture(
        &self,
        renderer: &dyn Renderer,
        request: &ArtifactRequest,
        key: &ArtifactKey,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let url = chart_url(
            &self.base_url,
            &request.symbol,
            &request.market,
            request.timeframe.as_str(),
        )?;

        let session = renderer
            .open_session()
            .await
            .map_err(|e| Error::capture(key.task_key(), CaptureStage::Session, e))?;

        let result = self.run(session.as_ref(), key, &url, output, cancel).await;
        session.close().await;
        result
    }

    async fn run(
        &self,
        session: &dyn RenderSession,
        key: &ArtifactKey,
        url: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let task_key = key.task_key();

        info!(task_key = %task_key, "Navigating to {}", url);
        async {
            session
                .navigate(url)
                .await
                .map_err(|e| Error::capture(task_key, CaptureStage::Navigate, e))
        }
        .with_cancellation::<Error>(cancel, "navigate")
        .await?;

        if let Err(e) = session.wait_loaded().await {
            warn!(task_key = %task_key, "Page load wait failed, continuing anyway: {}", e);
        }

        match session.current_url().await {
            Ok(current) if current.contains("/login") => {
                return Err(Error::capture(
                    task_key,
                    CaptureStage::Auth,
                    format!("redirected to login page ({})", current),
                ));
            }
            Ok(current) => debug!(task_key = %task_key, "Current page URL: {}", current),
            Err(e) => warn!(task_key = %task_key, "Could not read current URL: {}", e),
        }

        self.refresh_and_wait(session, task_key, cancel).await?;

        let size = async {
            session
                .screenshot(output)
                .await
                .map_err(|e| Error::capture(task_key, CaptureStage::Screenshot, e))
        }
        .with_cancellation::<Error>(cancel, "screenshot")
        .await?;

        info!(task_key = %task_key, "Screenshot saved: {} ({} bytes)", output.display(), size);
        Ok(size)
    }

    /// Click the refresh control and wait for the chart to finish reloading.
    ///
    /// Only cancellation is an error here. A missing control, a failed click or
    /// an unreadable indicator is logged and the capture goes ahead.
    async fn refresh_and_wait(
        &self,
        session: &dyn RenderSession,
        task_key: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let control: Box<dyn PageControl> = match session
            .find_control(&self.config.refresh_selectors, &self.config.refresh_labels)
            .await
        {
            Ok(Some(control)) => control,
            Ok(None) => {
                warn!(task_key = %task_key, "Refresh control not found, capturing without refresh");
                return Ok(());
            }
            Err(e) => {
                warn!(task_key = %task_key, "Refresh control lookup failed, capturing without refresh: {}", e);
                return Ok(());
            }
        };

        if let Ok(text) = control.text().await {
            debug!(task_key = %task_key, "Found refresh control: {:?}", text.trim());
        }

        if let Err(e) = control.click().await {
            warn!(task_key = %task_key, "Failed to click refresh control: {}", e);
            return Ok(());
        }

        pause(self.config.refresh_start_delay, cancel, "refresh start").await?;

        let started = tokio::time::Instant::now();
        loop {
            check_cancellation(cancel, "refresh wait")?;

            let loading = match control.eval_boolean(LOADING_PROBE).await {
                Ok(loading) => loading,
                Err(e) => {
                    debug!(task_key = %task_key, "Loading indicator unreadable, treating as idle: {}", e);
                    false
                }
            };

            if !loading {
                info!(task_key = %task_key, "Chart data loaded in {:?}", started.elapsed());
                pause(self.config.settle_delay, cancel, "settle").await?;
                return Ok(());
            }

            if started.elapsed() >= self.config.refresh_timeout {
                warn!(
                    task_key = %task_key,
                    "Chart still loading after {:?}, capturing anyway",
                    self.config.refresh_timeout
                );
                return Ok(());
            }

            pause(self.config.refresh_poll_interval, cancel, "refresh poll").await?;
        }
    }
}

async fn pause(duration: Duration, cancel: &CancellationToken, context: &str) -> Result<()> {
    async {
        tokio::time::sleep(duration).await;
        Ok::<(), Error>(())
    }
    .with_cancellation(cancel, context)
    .await
}
