// Batch capture binary.
//
// Usage: chart-snap-worker NVDA.us 700.hk:1h ...
// Configuration comes from CHART_SNAP_* environment variables.

use anyhow::{bail, Result};
use chart_snap_common::{CancellationToken, ServiceConfig};
use chart_snap_worker::{parse_batch_arg, run_batch, shutdown_signal};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let level = env::var("CHART_SNAP_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut requests = Vec::new();
    for arg in env::args().skip(1) {
        requests.extend(parse_batch_arg(&arg)?);
    }
    if requests.is_empty() {
        bail!("usage: chart-snap-worker SYMBOL.MARKET[:TIMEFRAME]...");
    }

    let config = load_config_from_env()?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let results = run_batch(config, requests, cancel).await?;
    for (request, result) in &results {
        match result {
            Ok(artifact) => match &artifact.data_url {
                Some(data_url) => println!("{}\t{}\t{}", request, artifact.url, data_url),
                None => println!("{}\t{}", request, artifact.url),
            },
            Err(e) => eprintln!("{}\t{}", request, e),
        }
    }

    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed > 0 {
        bail!("{} of {} capture(s) failed", failed, results.len());
    }
    Ok(())
}

fn load_config_from_env() -> Result<ServiceConfig> {
    let mut config = ServiceConfig::default();

    if let Ok(name) = env::var("CHART_SNAP_NAME") {
        config.name = name;
    }

    // Browser pool
    config.browser.pool_size = env::var("CHART_SNAP_POOL_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(config.browser.pool_size);
    config.browser.max_sessions_per_browser = env::var("CHART_SNAP_MAX_SESSIONS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(config.browser.max_sessions_per_browser);
    config.browser.headless = env::var("CHART_SNAP_HEADLESS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(true);
    // Custom browser path (e.g. /usr/bin/chromium). Unset uses auto-detection.
    config.browser.browser_path = env::var("CHART_SNAP_BROWSER_PATH").ok().map(PathBuf::from);
    config.browser.user_agent = env::var("CHART_SNAP_USER_AGENT").ok();

    // Chart site
    if let Ok(url) = env::var("CHART_SNAP_SITE_URL") {
        config.site.base_url = url;
    }
    config.site.jwt_access_token = env::var("CHART_SNAP_JWT_ACCESS_TOKEN").unwrap_or_default();
    config.site.sidebar_sheet = env::var("CHART_SNAP_SIDEBAR_SHEET").unwrap_or_default();

    config.capture.temp_dir = env::var("CHART_SNAP_TEMP_DIR").ok().map(PathBuf::from);
    config.strict_timeframes = env::var("CHART_SNAP_STRICT_TIMEFRAMES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    // Storage
    config.store.bucket = env::var("CHART_SNAP_S3_BUCKET").unwrap_or_default();
    config.store.region = env::var("CHART_SNAP_S3_REGION")
        .or_else(|_| env::var("AWS_REGION"))
        .unwrap_or_default();
    config.store.key_prefix = env::var("CHART_SNAP_S3_PREFIX").unwrap_or_default();
    config.store.endpoint = env::var("CHART_SNAP_S3_ENDPOINT").ok();
    config.store.access_key_id = env::var("CHART_SNAP_S3_ACCESS_KEY_ID").ok();
    config.store.secret_access_key = env::var("CHART_SNAP_S3_SECRET_ACCESS_KEY").ok();

    config.cdn.base_url = env::var("CHART_SNAP_CDN_URL").unwrap_or_default();
    if let Ok(path) = env::var("CHART_SNAP_RESULT_PATH") {
        config.cdn.result_path = path;
    }

    // Chart data service; unset skips the data files.
    config.panel_data.base_url = env::var("CHART_SNAP_DATA_URL").ok();
    config.panel_data.timeout = env::var("CHART_SNAP_DATA_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(config.panel_data.timeout);

    config.metrics_port = env::var("CHART_SNAP_METRICS_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok());

    config.validate()?;
    Ok(config)
}
