pub mod browser_pool;
pub mod capture;
pub mod chrome;
pub mod metrics;
pub mod panel_data;
pub mod renderer;
pub mod service;
pub mod store;
pub mod task_coordinator;

#[cfg(test)]
mod testing;

pub use browser_pool::{BrowserPool, HandleLease};
pub use capture::ChartCapturer;
pub use chrome::{ChromeRenderer, ChromeRendererFactory};
pub use metrics::Metrics;
pub use panel_data::{HttpPanelDataClient, PanelDataSource};
pub use renderer::{PageControl, RenderSession, Renderer, RendererFactory};
pub use service::ScreenshotService;
pub use store::{
    ArtifactStore, ExistenceOracle, HttpExistenceOracle, MemoryArtifactStore, S3ArtifactStore,
};
pub use task_coordinator::{DoneSignal, TaskCoordinator, TaskTicket};

use chart_snap_common::{
    parse_symbol_market, ArtifactRequest, ArtifactResult, CancellationToken, Error, Result,
    ServiceConfig,
};
use tokio::signal;
use tracing::{error, info, warn};

/// Timeframes captured when a batch argument does not name one.
pub const DEFAULT_TIMEFRAMES: [&str; 2] = ["1d", "1h"];

/// Parse a `SYMBOL.MARKET[:TIMEFRAME]` argument.
///
/// Without a timeframe both the daily and the hourly chart are requested.
pub fn parse_batch_arg(arg: &str) -> Result<Vec<ArtifactRequest>> {
    let (target, timeframe) = match arg.split_once(':') {
        Some((target, timeframe)) if !timeframe.is_empty() => (target, Some(timeframe)),
        Some(_) => {
            return Err(Error::InvalidRequest {
                message: format!("empty timeframe in {:?}", arg),
            })
        }
        None => (arg, None),
    };
    let (symbol, market) = parse_symbol_market(target)?;

    Ok(match timeframe {
        Some(tf) => vec![ArtifactRequest::new(symbol, market, tf)],
        None => DEFAULT_TIMEFRAMES
            .iter()
            .map(|tf| ArtifactRequest::new(symbol.clone(), market.clone(), tf))
            .collect(),
    })
}

/// Capture every request with a Chrome-backed service.
///
/// Requests run concurrently; the outcomes come back in request order. The
/// pool is closed before returning.
///
/// # Example
///
/// ```rust,ignore
/// use chart_snap_common::{ArtifactRequest, CancellationToken, ServiceConfig};
/// use chart_snap_worker::run_batch;
///
/// let config = ServiceConfig { /* cdn, store, site */ ..Default::default() };
/// let requests = vec![ArtifactRequest::new("NVDA", "us", "1d")];
/// let results = run_batch(config, requests, CancellationToken::new()).await?;
/// ```
pub async fn run_batch(
    config: ServiceConfig,
    requests: Vec<ArtifactRequest>,
    cancel: CancellationToken,
) -> Result<Vec<(ArtifactRequest, Result<ArtifactResult>)>> {
    let metrics_port = config.metrics_port;
    let service = ScreenshotService::launch(config).await?;

    let metrics_handle = metrics_port.map(|port| {
        let metrics = service.metrics().clone();
        tokio::spawn(async move {
            if let Err(e) = metrics.start_server(port).await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    info!("Running batch of {} request(s)", requests.len());
    let results = run_requests(&service, requests, &cancel).await;

    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed == 0 {
        info!("Batch finished, all {} request(s) succeeded", results.len());
    } else {
        warn!("Batch finished with {}/{} failure(s)", failed, results.len());
    }

    service.close().await;
    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    Ok(results)
}

async fn run_requests(
    service: &ScreenshotService,
    requests: Vec<ArtifactRequest>,
    cancel: &CancellationToken,
) -> Vec<(ArtifactRequest, Result<ArtifactResult>)> {
    let handles: Vec<_> = requests
        .into_iter()
        .map(|request| {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = service.screenshot(&request, &cancel).await;
                (request, result)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok((request, result)) => {
                match &result {
                    Ok(artifact) => match &artifact.data_url {
                        Some(data_url) => {
                            info!("{}: {} (data: {})", request, artifact.url, data_url)
                        }
                        None => info!("{}: {}", request, artifact.url),
                    },
                    Err(e) => error!("{}: {}", request, e),
                }
                results.push((request, result));
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => error!("Batch request task was aborted: {}", e),
        }
    }
    results
}

/// Resolves on Ctrl+C or SIGTERM and cancels `token`.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C signal");
        },
        _ = terminate => {
            warn!("Received SIGTERM signal");
        },
    }

    info!("Cancelling all active operations...");
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chart_snap_common::Timeframe;

    #[test]
    fn test_parse_batch_arg_defaults_to_daily_and_hourly() {
        let requests = parse_batch_arg("NVDA.us").unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].timeframe, Timeframe::Daily);
        assert_eq!(requests[1].timeframe, Timeframe::Hourly);
        assert!(requests.iter().all(|r| r.symbol == "NVDA" && r.market == "us"));
    }

    #[test]
    fn test_parse_batch_arg_with_timeframe() {
        let requests = parse_batch_arg("BRK.B.us:1wk").unwrap();
        assert_eq!(requests, vec![ArtifactRequest::new("BRK.B", "us", "1wk")]);
    }

    #[test]
    fn test_parse_batch_arg_rejects_garbage() {
        assert!(parse_batch_arg("NVDA").is_err());
        assert!(parse_batch_arg("NVDA.us:").is_err());
        assert!(parse_batch_arg(".us:1d").is_err());
    }
}
