use anyhow::Result;
use std::ffi::OsString;
use std::fmt::Debug;

use crate::config::BrowserConfig;

/// Middleware for modifying Chrome launch arguments
///
/// Runs once per pooled browser, before the process is spawned. Implementations
/// push extra flags; flags already present are left alone.
///
/// # Example
///
/// ```rust
/// use chart_snap_common::browser_middleware::LaunchArgsMiddleware;
/// use chart_snap_common::config::BrowserConfig;
/// use std::ffi::OsString;
///
/// #[derive(Debug, Clone)]
/// struct DisableWebRtc;
///
/// impl LaunchArgsMiddleware for DisableWebRtc {
///     fn apply_args(&self, args: &mut Vec<OsString>, _config: &BrowserConfig) {
///         args.push(OsString::from("--disable-webrtc"));
///     }
///
///     fn name(&self) -> &str {
///         "disable_webrtc"
///     }
///
///     fn clone_box(&self) -> Box<dyn LaunchArgsMiddleware> {
///         Box::new(self.clone())
///     }
/// }
/// ```
pub trait LaunchArgsMiddleware: Debug + Send + Sync {
    fn apply_args(&self, args: &mut Vec<OsString>, config: &BrowserConfig);

    /// Identifier used in logs
    fn name(&self) -> &str;

    fn clone_box(&self) -> Box<dyn LaunchArgsMiddleware>;
}

impl Clone for Box<dyn LaunchArgsMiddleware> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Middleware run on every new tab, before navigation.
///
/// Called for each capture session, so keep it to a few CDP calls.
pub trait SessionInitMiddleware: Debug + Send + Sync {
    /// Errors are logged and the session is used as is.
    fn apply(&self, tab: &headless_chrome::browser::tab::Tab) -> Result<()>;

    fn name(&self) -> &str;

    fn clone_box(&self) -> Box<dyn SessionInitMiddleware>;
}

impl Clone for Box<dyn SessionInitMiddleware> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Chrome flags tuned for rendering chart pages in a container.
///
/// Memory and renderer limits come from [`BrowserConfig`]; the rest is fixed:
/// - Container compatibility (`--no-sandbox`, `--disable-dev-shm-usage`)
/// - Locale pinned to the configured language
/// - Background services, sync and extensions switched off
/// - GPU rasterization and hardware video decode enabled for canvas-heavy charts
#[derive(Debug, Clone)]
pub struct ChartLaunchArgs;

impl ChartLaunchArgs {
    const FIXED: &'static [&'static str] = &[
        "--no-sandbox",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-plugins",
        "--disable-background-networking",
        "--disable-default-apps",
        "--disable-sync",
        "--disable-translate",
        "--metrics-recording-only",
        "--no-first-run",
        "--mute-audio",
        "--font-render-hinting=medium",
        "--enable-font-antialiasing",
        "--disable-background-timer-throttling",
        "--disable-renderer-backgrounding",
        "--enable-features=VaapiVideoDecoder,VaapiVideoEncoder",
        "--ignore-gpu-blocklist",
        "--enable-gpu-rasterization",
        "--enable-zero-copy",
        "--memory-pressure-off",
        "--aggressive-cache-discard",
    ];
}

impl LaunchArgsMiddleware for ChartLaunchArgs {
    fn apply_args(&self, args: &mut Vec<OsString>, config: &BrowserConfig) {
        args.extend(Self::FIXED.iter().map(OsString::from));

        args.push(format!("--lang={}", config.lang).into());
        args.push(format!("--accept-lang={}", config.accept_language).into());
        args.push(
            format!(
                "--window-size={},{}",
                config.viewport_width, config.viewport_height
            )
            .into(),
        );
        args.push(format!("--js-flags=--max-old-space-size={}", config.memory_limit_mb).into());
        args.push(format!("--renderer-process-limit={}", config.renderer_processes).into());
        args.push(format!("--max-active-webgl-contexts={}", config.webgl_contexts).into());
    }

    fn name(&self) -> &str {
        "chart_launch_args"
    }

    fn clone_box(&self) -> Box<dyn LaunchArgsMiddleware> {
        Box::new(self.clone())
    }
}

/// Sets the User-Agent and `Accept-Language` header of every session.
///
/// Without a configured user agent the browser's own string is reused with
/// "HeadlessChrome" replaced by "Chrome", detected once and cached.
#[derive(Debug)]
pub struct HeaderOverride {
    pub user_agent: Option<String>,
    pub accept_language: String,
    detected_user_agent: std::sync::Mutex<Option<String>>,
}

impl HeaderOverride {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            accept_language: config.accept_language.clone(),
            detected_user_agent: std::sync::Mutex::new(None),
        }
    }

    fn resolve_user_agent(&self, tab: &headless_chrome::browser::tab::Tab) -> Result<String> {
        if let Some(ua) = &self.user_agent {
            return Ok(ua.clone());
        }

        let mut cached = self
            .detected_user_agent
            .lock()
            .map_err(|_| anyhow::anyhow!("user agent cache poisoned"))?;
        if let Some(ua) = cached.as_ref() {
            return Ok(ua.clone());
        }

        let original = tab
            .evaluate("navigator.userAgent", false)
            .map_err(|e| anyhow::anyhow!("Failed to evaluate navigator.userAgent: {}", e))?
            .value
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| anyhow::anyhow!("navigator.userAgent is not a string"))?;

        let corrected = original.replace("HeadlessChrome", "Chrome");
        tracing::debug!("Detected User-Agent: {}", corrected);
        *cached = Some(corrected.clone());
        Ok(corrected)
    }
}

impl Clone for HeaderOverride {
    fn clone(&self) -> Self {
        let cached = self
            .detected_user_agent
            .lock()
            .map(|ua| ua.clone())
            .unwrap_or(None);

        Self {
            user_agent: self.user_agent.clone(),
            accept_language: self.accept_language.clone(),
            detected_user_agent: std::sync::Mutex::new(cached),
        }
    }
}

impl SessionInitMiddleware for HeaderOverride {
    fn apply(&self, tab: &headless_chrome::browser::tab::Tab) -> Result<()> {
        use headless_chrome::protocol::cdp::Network;

        let user_agent = self.resolve_user_agent(tab)?;

        tab.call_method(Network::SetUserAgentOverride {
            user_agent: user_agent.clone(),
            accept_language: Some(self.accept_language.clone()),
            platform: None,
            user_agent_metadata: None,
        })?;

        tracing::debug!(
            "Applied header override: ua={}, accept-language={}",
            user_agent,
            self.accept_language
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "header_override"
    }

    fn clone_box(&self) -> Box<dyn SessionInitMiddleware> {
        Box::new(self.clone())
    }
}
