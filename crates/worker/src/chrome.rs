//! Headless Chrome implementation of the renderer traits.
//!
//! Every CDP call blocks, so each one runs on the blocking pool and is raced
//! against a hard timeout. A timed-out call closes its tab to abort it.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chart_snap_common::{
    BrowserConfig, ChartLaunchArgs, ChartSiteConfig, HeaderOverride, LaunchArgsMiddleware,
    ServiceConfig, SessionInitMiddleware,
};
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::renderer::{PageControl, RenderSession, Renderer, RendererFactory};

const CONTROL_MARKER_ATTR: &str = "data-chart-snap-control";

/// Check if an error indicates the browser process is dead.
pub(crate) fn is_dead_browser_error(error_msg: &str) -> bool {
    error_msg.contains("connection is closed") || error_msg.contains("No such process")
}

/// Run a blocking CDP call for `tab` with a hard timeout.
///
/// Dead-browser errors flip `healthy` so the pool stops leasing the handle.
async fn run_blocking<T, F>(
    tab: &Arc<Tab>,
    healthy: &AtomicBool,
    what: &str,
    timeout: Duration,
    f: F,
) -> Result<T>
where
    F: FnOnce(Arc<Tab>) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let tab_clone = tab.clone();
    let handle = tokio::task::spawn_blocking(move || f(tab_clone));

    let result = tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            warn!("{} hard timeout after {:?} - closing tab to abort", what, timeout);
            let _ = tab.close(false);
            Err(anyhow!("{} timed out after {:?}", what, timeout))
        }
        joined = handle => {
            joined
                .map_err(|e| anyhow!("{} task failed: {}", what, e))
                .and_then(|r| r)
        }
    };

    if let Err(e) = &result {
        let msg = e.to_string();
        if is_dead_browser_error(&msg) {
            warn!("Browser connection lost during {}: {}", what, msg);
            healthy.store(false, Ordering::SeqCst);
        }
    }
    result
}

/// Launches one Chrome process per pool slot and seeds its session state.
pub struct ChromeRendererFactory {
    browser: BrowserConfig,
    site: ChartSiteConfig,
    navigation_timeout: Duration,
    launch_middlewares: Vec<Box<dyn LaunchArgsMiddleware>>,
    session_middlewares: Vec<Box<dyn SessionInitMiddleware>>,
}

impl ChromeRendererFactory {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            browser: config.browser.clone(),
            site: config.site.clone(),
            navigation_timeout: config.capture.navigation_timeout,
            launch_middlewares: vec![Box::new(ChartLaunchArgs)],
            session_middlewares: vec![Box::new(HeaderOverride::new(&config.browser))],
        }
    }

    pub fn with_launch_middleware(mut self, middleware: Box<dyn LaunchArgsMiddleware>) -> Self {
        self.launch_middlewares.push(middleware);
        self
    }

    pub fn with_session_middleware(mut self, middleware: Box<dyn SessionInitMiddleware>) -> Self {
        self.session_middlewares.push(middleware);
        self
    }

    fn launch_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        info!(
            "Applying {} launch args middleware(s)",
            self.launch_middlewares.len()
        );
        for middleware in &self.launch_middlewares {
            debug!("  - Applying middleware: {}", middleware.name());
            middleware.apply_args(&mut args, &self.browser);
        }
        args
    }

    /// Pre-flight check: verify browser binary exists and log useful diagnostics
    fn verify_browser_binary(binary_path: &Path) {
        use std::os::unix::fs::PermissionsExt;

        if !binary_path.exists() {
            warn!(
                "Browser binary not found at '{}'. headless_chrome will attempt auto-detection.",
                binary_path.display()
            );
            return;
        }

        match std::fs::metadata(binary_path) {
            Ok(metadata) => {
                let mode = metadata.permissions().mode();
                if mode & 0o111 == 0 {
                    warn!(
                        "Browser binary '{}' exists but is NOT executable (mode: {:o})",
                        binary_path.display(),
                        mode
                    );
                } else {
                    info!(
                        "Browser binary verified: '{}' (mode: {:o})",
                        binary_path.display(),
                        mode
                    );
                }
            }
            Err(e) => {
                warn!(
                    "Cannot read metadata for browser binary '{}': {}",
                    binary_path.display(),
                    e
                );
            }
        }

        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            info!(
                "Running as non-root user (uid: {}). If Chrome fails to start, \
                 check the container security context.",
                uid
            );
        }
    }
}

fn launch(config: &BrowserConfig, args: &[OsString]) -> Result<Browser> {
    let arg_refs: Vec<&OsStr> = args.iter().map(OsString::as_os_str).collect();

    let mut launch_builder = LaunchOptions::default_builder();
    launch_builder
        .headless(config.headless)
        .sandbox(false)
        .window_size(Some((config.viewport_width, config.viewport_height)))
        .idle_browser_timeout(config.idle_browser_timeout)
        .args(arg_refs);

    if let Some(ref browser_path) = config.browser_path {
        launch_builder.path(Some(browser_path.clone()));
    }

    let options = launch_builder
        .build()
        .map_err(|e| anyhow!("Failed to build launch options: {}", e))?;

    Browser::new(options)
}

/// Navigate once to the chart site and seed the auth state into localStorage.
fn seed_local_storage(browser: &Browser, site: &ChartSiteConfig) -> Result<()> {
    let tab = browser.new_tab()?;
    tab.navigate_to(&site.base_url)?;
    tab.wait_until_navigated()?;

    let script = format!(
        "localStorage.setItem('jwt_access_token', {}); localStorage.setItem('sidebarSheet', {});",
        serde_json::to_string(&site.jwt_access_token)?,
        serde_json::to_string(&site.sidebar_sheet)?,
    );
    tab.evaluate(&script, false)?;

    if let Err(e) = tab.close(false) {
        debug!("Failed to close bootstrap tab: {}", e);
    }
    Ok(())
}

#[async_trait]
impl RendererFactory for ChromeRendererFactory {
    async fn create(&self, index: usize) -> Result<Arc<dyn Renderer>> {
        let id = format!("chrome-{}-{}", index, uuid::Uuid::new_v4());
        info!(handle = %id, "Launching Chrome process");

        let args = self.launch_args();
        let binary = self
            .browser
            .browser_path
            .as_deref()
            .unwrap_or_else(|| Path::new("chromium"));
        Self::verify_browser_binary(binary);

        let browser_config = self.browser.clone();
        let site = self.site.clone();
        let seed = self.site.has_session_state();
        if !seed {
            warn!(handle = %id, "JWT access token or sidebar sheet not configured, skipping localStorage setup");
        }

        let browser = tokio::task::spawn_blocking(move || -> Result<Browser> {
            let browser = launch(&browser_config, &args).map_err(|e| {
                tracing::error!(
                    "Browser failed to launch: {}. Check that the binary exists, \
                     --no-sandbox is set when running in a container, and shared libraries are installed.",
                    e
                );
                e
            })?;
            if seed {
                seed_local_storage(&browser, &site)?;
            }
            Ok(browser)
        })
        .await
        .map_err(|e| anyhow!("launch task failed: {}", e))??;

        info!(handle = %id, "Chrome process ready");

        Ok(Arc::new(ChromeRenderer {
            id,
            browser: std::sync::Mutex::new(Some(Arc::new(browser))),
            healthy: Arc::new(AtomicBool::new(true)),
            session_middlewares: self.session_middlewares.clone(),
            navigation_timeout: self.navigation_timeout,
        }))
    }
}

pub struct ChromeRenderer {
    id: String,
    browser: std::sync::Mutex<Option<Arc<Browser>>>,
    healthy: Arc<AtomicBool>,
    session_middlewares: Vec<Box<dyn SessionInitMiddleware>>,
    navigation_timeout: Duration,
}

impl ChromeRenderer {
    fn browser(&self) -> Result<Arc<Browser>> {
        self.browser
            .lock()
            .map_err(|_| anyhow!("browser handle lock poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("browser {} is closed", self.id))
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn open_session(&self) -> Result<Box<dyn RenderSession>> {
        let browser = self.browser()?;
        let middlewares = self.session_middlewares.clone();
        let id = self.id.clone();

        let tab = tokio::task::spawn_blocking(move || -> Result<Arc<Tab>> {
            let tab = browser.new_tab()?;
            for middleware in &middlewares {
                if let Err(e) = middleware.apply(&tab) {
                    warn!(
                        handle = %id,
                        "Failed to apply session middleware '{}': {}",
                        middleware.name(),
                        e
                    );
                }
            }
            Ok(tab)
        })
        .await
        .map_err(|e| anyhow!("new tab task failed: {}", e))?;

        let tab = tab.map_err(|e| {
            if is_dead_browser_error(&e.to_string()) {
                warn!(handle = %self.id, "Browser connection lost while opening tab: {}", e);
                self.healthy.store(false, Ordering::SeqCst);
            }
            e
        })?;

        Ok(Box::new(ChromeSession {
            tab,
            healthy: self.healthy.clone(),
            navigation_timeout: self.navigation_timeout,
        }))
    }

    async fn close(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        let browser = match self.browser.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(browser) = browser {
            info!(handle = %self.id, "Closing Chrome process");
            // Dropping the last reference kills the process, which blocks.
            let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
        }
    }
}

pub struct ChromeSession {
    tab: Arc<Tab>,
    healthy: Arc<AtomicBool>,
    navigation_timeout: Duration,
}

#[async_trait]
impl RenderSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        run_blocking(
            &self.tab,
            &self.healthy,
            "navigate",
            self.navigation_timeout,
            move |tab| tab.navigate_to(&url).map(|_| ()),
        )
        .await
    }

    async fn wait_loaded(&self) -> Result<()> {
        run_blocking(
            &self.tab,
            &self.healthy,
            "wait_loaded",
            self.navigation_timeout,
            |tab| tab.wait_until_navigated().map(|_| ()),
        )
        .await
    }

    async fn current_url(&self) -> Result<String> {
        run_blocking(
            &self.tab,
            &self.healthy,
            "current_url",
            self.navigation_timeout,
            |tab| {
                let href = tab
                    .evaluate("window.location.href", false)?
                    .value
                    .and_then(|v| v.as_str().map(str::to_string));
                Ok(href.unwrap_or_else(|| tab.get_url()))
            },
        )
        .await
    }

    async fn find_control(
        &self,
        selectors: &[String],
        labels: &[String],
    ) -> Result<Option<Box<dyn PageControl>>> {
        let marker = uuid::Uuid::new_v4().to_string();
        let script = format!(
            r#"(function(selectors, labels, attr, marker) {{
                for (const selector of selectors) {{
                    let nodes;
                    try {{ nodes = document.querySelectorAll(selector); }} catch (e) {{ continue; }}
                    for (const el of nodes) {{
                        const text = (el.innerText || el.textContent || '') + ' ' +
                            (el.getAttribute('aria-label') || '') + ' ' + (el.getAttribute('title') || '');
                        if (labels.some(l => text.includes(l))) {{
                            el.setAttribute(attr, marker);
                            return true;
                        }}
                    }}
                }}
                return false;
            }})({}, {}, {}, {})"#,
            serde_json::to_string(selectors)?,
            serde_json::to_string(labels)?,
            serde_json::to_string(CONTROL_MARKER_ATTR)?,
            serde_json::to_string(&marker)?,
        );

        let found = run_blocking(
            &self.tab,
            &self.healthy,
            "find_control",
            self.navigation_timeout,
            move |tab| {
                Ok(tab
                    .evaluate(&script, false)?
                    .value
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false))
            },
        )
        .await?;

        if !found {
            return Ok(None);
        }

        Ok(Some(Box::new(ChromeControl {
            tab: self.tab.clone(),
            healthy: self.healthy.clone(),
            selector: format!("[{}=\"{}\"]", CONTROL_MARKER_ATTR, marker),
            timeout: self.navigation_timeout,
        })))
    }

    async fn screenshot(&self, path: &Path) -> Result<u64> {
        let png = run_blocking(
            &self.tab,
            &self.healthy,
            "screenshot",
            self.navigation_timeout,
            |tab| tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true),
        )
        .await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &png).await?;
        Ok(png.len() as u64)
    }

    async fn close(&self) {
        let tab = self.tab.clone();
        let closed = tokio::task::spawn_blocking(move || tab.close(false)).await;
        match closed {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("Failed to close tab: {}", e),
            Err(e) => debug!("Tab close task failed: {}", e),
        }
    }
}

/// An element tagged by [`ChromeSession::find_control`], re-located by its marker.
struct ChromeControl {
    tab: Arc<Tab>,
    healthy: Arc<AtomicBool>,
    selector: String,
    timeout: Duration,
}

impl ChromeControl {
    fn element_script(&self, body: &str) -> Result<String> {
        Ok(format!(
            "(function() {{ const el = document.querySelector({}); if (!el) return null; return (function() {{ {} }}).call(el); }})()",
            serde_json::to_string(&self.selector)?,
            body
        ))
    }
}

#[async_trait]
impl PageControl for ChromeControl {
    async fn text(&self) -> Result<String> {
        let script = self.element_script("return this.innerText || this.textContent || '';")?;
        run_blocking(&self.tab, &self.healthy, "control_text", self.timeout, move |tab| {
            Ok(tab
                .evaluate(&script, false)?
                .value
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default())
        })
        .await
    }

    async fn click(&self) -> Result<()> {
        let selector = self.selector.clone();
        run_blocking(&self.tab, &self.healthy, "click", self.timeout, move |tab| {
            tab.find_element(&selector)?.click()?;
            Ok(())
        })
        .await
    }

    async fn eval_boolean(&self, expression: &str) -> Result<bool> {
        let script = self.element_script(&format!("return ({});", expression))?;
        run_blocking(&self.tab, &self.healthy, "eval_boolean", self.timeout, move |tab| {
            Ok(tab
                .evaluate(&script, false)?
                .value
                .and_then(|v| v.as_bool())
                .unwrap_or(false))
        })
        .await
    }
}
