use chart_snap_common::{
    chart_url, format_symbol_for_market, ArtifactKey, ArtifactRequest, ArtifactResult,
    ArtifactSource, CancellationExt, CancellationToken, Clock, Error, Result, ServiceConfig,
    ServiceStats, SystemClock, UploadResult,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::browser_pool::BrowserPool;
use crate::capture::ChartCapturer;
use crate::chrome::ChromeRendererFactory;
use crate::metrics::Metrics;
use crate::panel_data::{HttpPanelDataClient, PanelDataSource};
use crate::store::{ArtifactStore, ExistenceOracle, HttpExistenceOracle, S3ArtifactStore};
use crate::task_coordinator::{TaskCoordinator, TaskTicket};

/// Marks the task failed unless it was explicitly completed, including when
/// the capture unwinds. Holds the execution's ticket, so an execution that was
/// superseded after expiring cannot finish its successor.
struct TaskGuard<'a> {
    coordinator: &'a TaskCoordinator,
    ticket: TaskTicket,
    finished: bool,
}

impl<'a> TaskGuard<'a> {
    fn new(coordinator: &'a TaskCoordinator, ticket: TaskTicket) -> Self {
        Self {
            coordinator,
            ticket,
            finished: false,
        }
    }

    fn complete(mut self) {
        self.finished = true;
        self.coordinator.complete(&self.ticket);
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if std::thread::panicking() {
            error!(task_key = %self.ticket.key(), "Capture panicked, marking task failed");
        }
        self.coordinator.fail(&self.ticket);
    }
}

/// Cache check, deduplication, capture and upload for chart screenshots.
///
/// Cloning is cheap; clones share the pool and the coordinator.
#[derive(Clone)]
pub struct ScreenshotService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: ServiceConfig,
    pool: BrowserPool,
    coordinator: TaskCoordinator,
    capturer: ChartCapturer,
    oracle: Arc<dyn ExistenceOracle>,
    store: Arc<dyn ArtifactStore>,
    /// None publishes screenshots without a data file.
    panel_data: Option<Arc<dyn PanelDataSource>>,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    /// Cancels detached captures on close. Callers' tokens never reach them.
    shutdown: CancellationToken,
}

/// Screenshot plus the CDN URL of its data file, if one was published.
type Execution = (UploadResult, Option<String>);

impl ScreenshotService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServiceConfig,
        pool: BrowserPool,
        coordinator: TaskCoordinator,
        oracle: Arc<dyn ExistenceOracle>,
        store: Arc<dyn ArtifactStore>,
        panel_data: Option<Arc<dyn PanelDataSource>>,
        metrics: Metrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capturer = ChartCapturer::new(&config.site, &config.capture);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                pool,
                coordinator,
                capturer,
                oracle,
                store,
                panel_data,
                metrics,
                clock,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Build the production service: Chrome pool, S3 store and CDN `HEAD` checks.
    pub async fn launch(config: ServiceConfig) -> Result<Self> {
        config.validate()?;

        let metrics = Metrics::new(&config.name).map_err(|e| Error::Config {
            message: format!("failed to register metrics: {}", e),
        })?;
        let oracle = Arc::new(HttpExistenceOracle::new(&config.cdn)?);
        let panel_data = HttpPanelDataClient::from_config(&config.panel_data)?
            .map(|client| Arc::new(client) as Arc<dyn PanelDataSource>);
        let factory = Arc::new(ChromeRendererFactory::new(&config));
        let pool = BrowserPool::new(factory, &config.browser).await?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let coordinator = TaskCoordinator::new(&config.tasks, clock.clone());
        let store = match S3ArtifactStore::new(&config.store).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        info!(
            "Screenshot service '{}' ready (CDN: {})",
            config.name, config.cdn.base_url
        );
        Ok(Self::new(
            config,
            pool,
            coordinator,
            oracle,
            store,
            panel_data,
            metrics,
            clock,
        ))
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn coordinator(&self) -> &TaskCoordinator {
        &self.inner.coordinator
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.inner.pool
    }

    /// Return the CDN URL of the chart for `request`, capturing it if needed.
    ///
    /// Cancelling `cancel` only abandons this caller; a capture it started
    /// keeps running for the requests joined on it.
    pub async fn screenshot(
        &self,
        request: &ArtifactRequest,
        cancel: &CancellationToken,
    ) -> Result<ArtifactResult> {
        let started = Instant::now();
        let metrics = &self.inner.metrics;
        metrics.record_request();

        let result = self.resolve(request, cancel).await;
        match &result {
            Ok(artifact) => {
                match artifact.source {
                    ArtifactSource::Cached => metrics.record_cache_hit(),
                    ArtifactSource::Joined => metrics.record_join(),
                    ArtifactSource::Captured => metrics.record_capture(),
                }
                info!(
                    source = ?artifact.source,
                    "{} -> {} ({}ms)",
                    request,
                    artifact.url,
                    started.elapsed().as_millis()
                );
            }
            Err(e) => {
                metrics.record_failure(e.code());
                warn!(
                    code = e.code(),
                    "{} failed after {}ms: {}",
                    request,
                    started.elapsed().as_millis(),
                    e
                );
            }
        }

        self.refresh_gauges().await;
        result
    }

    /// Daily chart first, then the hourly one.
    pub async fn capture_pair(
        &self,
        symbol: &str,
        market: &str,
        cancel: &CancellationToken,
    ) -> Result<(ArtifactResult, ArtifactResult)> {
        let daily = self
            .screenshot(&ArtifactRequest::new(symbol, market, "1d"), cancel)
            .await?;
        let hourly = self
            .screenshot(&ArtifactRequest::new(symbol, market, "1h"), cancel)
            .await?;
        Ok((daily, hourly))
    }

    /// Upload a JSON data file for `request` under `data/{stem}.json`.
    pub async fn upload_json(
        &self,
        request: &ArtifactRequest,
        local_path: &Path,
    ) -> Result<UploadResult> {
        let key = self.key_for(request);
        self.inner
            .store
            .upload_json(local_path, &key.data_key())
            .await
    }

    pub async fn stats(&self) -> ServiceStats {
        let metrics = &self.inner.metrics;
        ServiceStats {
            requests: metrics.counter(&metrics.requests_total),
            cache_hits: metrics.counter(&metrics.cache_hits_total),
            joins: metrics.counter(&metrics.joins_total),
            captures: metrics.counter(&metrics.captures_total),
            failures: metrics.failures(),
            pool: self.inner.pool.stats().await,
            tasks: self.inner.coordinator.stats(),
        }
    }

    /// Stop detached captures and close every browser.
    pub async fn close(&self) {
        info!("Closing screenshot service");
        self.inner.shutdown.cancel();
        self.inner.pool.close().await;
    }

    fn key_for(&self, request: &ArtifactRequest) -> ArtifactKey {
        ArtifactKey::for_instant(
            &request.symbol,
            &request.market,
            &request.timeframe,
            self.inner.clock.now(),
        )
    }

    async fn resolve(
        &self,
        request: &ArtifactRequest,
        cancel: &CancellationToken,
    ) -> Result<ArtifactResult> {
        let inner = &self.inner;

        chart_url(
            &inner.config.site.base_url,
            &request.symbol,
            &request.market,
            request.timeframe.as_str(),
        )?;
        if !request.timeframe.is_bucketed() {
            if inner.config.strict_timeframes {
                return Err(Error::InvalidRequest {
                    message: format!("unsupported timeframe '{}'", request.timeframe),
                });
            }
            warn!(
                "Timeframe '{}' has no calendar bucket, keying {} per second",
                request.timeframe, request
            );
        }

        // Key and URL come from the same instant so they name the same bucket.
        let key = self.key_for(request);
        let url = key.cdn_url(&inner.config.cdn.base_url, &inner.config.cdn.result_path);

        if self.exists(&url, cancel).await? {
            debug!(task_key = %key, "Artifact already on CDN");
            return Ok(ArtifactResult::cached(url));
        }

        match inner.coordinator.try_start(key.task_key()) {
            Ok(ticket) => self.capture_detached(request, key, url, ticket, cancel).await,
            Err(Error::TaskAlreadyRunning { .. }) => self.join(&key, url, cancel).await,
            Err(Error::TaskAlreadyCompleted { .. }) => {
                if self.exists(&url, cancel).await? {
                    Ok(ArtifactResult::joined(url))
                } else {
                    Err(Error::ArtifactMissing {
                        key: key.task_key().to_string(),
                        reason: "task completed but the artifact is not on the CDN".to_string(),
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, url: &str, cancel: &CancellationToken) -> Result<bool> {
        let oracle = &self.inner.oracle;
        async move { Ok::<_, Error>(oracle.exists(url).await) }
            .with_cancellation::<Error>(cancel, "existence check")
            .await
    }

    /// Wait for the execution that owns `key`, then look for its artifact.
    async fn join(
        &self,
        key: &ArtifactKey,
        url: String,
        cancel: &CancellationToken,
    ) -> Result<ArtifactResult> {
        let inner = &self.inner;
        debug!(task_key = %key, "Capture already running, joining");

        let waited = inner
            .coordinator
            .wait_for(key.task_key(), inner.config.tasks.join_timeout)
            .with_cancellation::<Error>(cancel, "join capture")
            .await;

        let timed_out = match waited {
            Ok(()) => None,
            Err(e @ Error::WaitTimeout { .. }) => Some(e),
            // Swept or abandoned in the meantime; the CDN has the final say.
            Err(Error::TaskNotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        if self.exists(&url, cancel).await? {
            return Ok(ArtifactResult::joined(url));
        }
        Err(timed_out.unwrap_or_else(|| Error::ArtifactMissing {
            key: key.task_key().to_string(),
            reason: "joined execution produced no artifact".to_string(),
        }))
    }

    /// Run the capture as its own task so joiners are unaffected by this
    /// caller going away.
    async fn capture_detached(
        &self,
        request: &ArtifactRequest,
        key: ArtifactKey,
        url: String,
        ticket: TaskTicket,
        cancel: &CancellationToken,
    ) -> Result<ArtifactResult> {
        let service = self.clone();
        let request = request.clone();
        let handle = tokio::spawn(async move { service.execute(&request, &key, ticket).await });

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Caller cancelled, capture continues in the background");
                return Err(Error::Cancelled);
            }
            joined = handle => joined,
        };

        match joined {
            Ok(execution) => {
                let (upload, data_url) = execution?;
                Ok(ArtifactResult::captured(url, upload).with_data_url(data_url))
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(Error::Cancelled),
        }
    }

    async fn execute(
        &self,
        request: &ArtifactRequest,
        key: &ArtifactKey,
        ticket: TaskTicket,
    ) -> Result<Execution> {
        let inner = &self.inner;
        let guard = TaskGuard::new(&inner.coordinator, ticket);

        let lease = inner.pool.acquire(&inner.shutdown).await?;
        debug!(task_key = %key, handle = %lease.handle_id(), "Acquired browser session");

        let output = inner.capturer.temp_path(key);
        let captured = inner
            .capturer
            .capture(
                lease.renderer().as_ref(),
                request,
                key,
                &output,
                &inner.shutdown,
            )
            .await;
        inner.pool.release(lease);

        let uploaded = match captured {
            Ok(size) => {
                debug!(task_key = %key, size, "Captured {}", output.display());
                inner.store.upload(&output, &key.screenshot_key()).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_file(&output).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", output.display(), e);
            }
        }

        let upload = uploaded?;
        let data_url = self.publish_panel_data(request, key).await;
        guard.complete();
        Ok((upload, data_url))
    }

    /// Fetch the chart's panel data and upload it under `data/`. A failure
    /// only costs the data URL, the screenshot stands.
    async fn publish_panel_data(
        &self,
        request: &ArtifactRequest,
        key: &ArtifactKey,
    ) -> Option<String> {
        let inner = &self.inner;
        let source = inner.panel_data.as_ref()?;
        let symbol = format_symbol_for_market(&request.symbol, &request.market);

        let fetched = source
            .fetch(&symbol, request.timeframe.as_str())
            .with_cancellation::<Error>(&inner.shutdown, "panel data")
            .await;
        let data = match fetched {
            Ok(data) => data,
            Err(e) => {
                warn!(task_key = %key, "Continuing without panel data: {}", e);
                return None;
            }
        };

        let path = inner.capturer.temp_path(key).with_extension("json");
        let written = match serde_json::to_vec(&data) {
            Ok(bytes) => tokio::fs::write(&path, bytes).await,
            Err(e) => Err(e.into()),
        };
        let uploaded = match written {
            Ok(()) => inner.store.upload_json(&path, &key.data_key()).await,
            Err(e) => Err(Error::Io(e)),
        };
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", path.display(), e);
            }
        }

        match uploaded {
            Ok(upload) => {
                info!(task_key = %key, json_key = %upload.key, "Panel data uploaded");
                Some(key.data_cdn_url(&inner.config.cdn.base_url))
            }
            Err(e) => {
                warn!(task_key = %key, "Panel data upload failed: {}", e);
                None
            }
        }
    }

    async fn refresh_gauges(&self) {
        let inner = &self.inner;
        inner.metrics.update_pool(&inner.pool.stats().await);
        inner.metrics.update_tasks(&inner.coordinator.stats());
    }
}
