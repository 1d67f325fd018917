//! Scripted in-process renderer used by the unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chart_snap_common::Clock;
use chrono::{DateTime, TimeZone, Utc};

use crate::panel_data::PanelDataSource;
use crate::renderer::{PageControl, RenderSession, Renderer, RendererFactory};

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }

    pub fn rewind(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now -= chrono::Duration::from_std(by).unwrap();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Panel data source answering every request with the same rows.
#[derive(Default)]
pub struct FakePanelData {
    fail: bool,
    requests: Mutex<Vec<(String, String)>>,
}

impl FakePanelData {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn rows() -> serde_json::Value {
        serde_json::json!([{ "close": 412.2, "volume": 1200 }])
    }

    /// `(symbol, duration)` pairs fetched so far.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PanelDataSource for FakePanelData {
    async fn fetch(
        &self,
        symbol: &str,
        duration: &str,
    ) -> chart_snap_common::Result<serde_json::Value> {
        self.requests
            .lock()
            .unwrap()
            .push((symbol.to_string(), duration.to_string()));
        if self.fail {
            return Err(chart_snap_common::Error::PanelDataFailed {
                symbol: symbol.to_string(),
                message: "status 502 Bad Gateway".to_string(),
            });
        }
        Ok(Self::rows())
    }
}

/// How a fake page behaves.
#[derive(Debug, Clone)]
pub struct FakeScript {
    pub navigate_error: Option<String>,
    pub wait_loaded_error: Option<String>,
    /// URL reported after navigation. None reports the navigated URL.
    pub landing_url: Option<String>,
    pub control: Option<FakeControlScript>,
    pub screenshot_error: Option<String>,
    pub screenshot_bytes: Vec<u8>,
    /// Time spent inside `navigate`, to keep captures in flight.
    pub navigate_delay: Duration,
    pub panic_on_navigate: bool,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            navigate_error: None,
            wait_loaded_error: None,
            landing_url: None,
            control: Some(FakeControlScript::default()),
            screenshot_error: None,
            screenshot_bytes: b"\x89PNG fake chart".to_vec(),
            navigate_delay: Duration::ZERO,
            panic_on_navigate: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeControlScript {
    /// Number of loading probes answering `true` before the control reports idle.
    pub loading_polls: usize,
    /// Every loading probe fails.
    pub eval_error: bool,
    pub click_error: bool,
}

pub struct FakeFactory {
    script: FakeScript,
    fail_at: Option<usize>,
    created: Mutex<Vec<Arc<FakeRenderer>>>,
}

impl FakeFactory {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            fail_at: None,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Make `create(index)` fail for this index.
    pub fn fail_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn renderers(&self) -> Vec<Arc<FakeRenderer>> {
        self.created.lock().unwrap().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.renderers().iter().map(|r| r.sessions_opened()).sum()
    }
}

#[async_trait]
impl RendererFactory for FakeFactory {
    async fn create(&self, index: usize) -> Result<Arc<dyn Renderer>> {
        if self.fail_at == Some(index) {
            return Err(anyhow!("chrome exited with status 127"));
        }
        let count = self.created.lock().unwrap().len();
        let renderer = Arc::new(FakeRenderer {
            id: format!("fake-{}-{}", index, count),
            script: self.script.clone(),
            healthy: AtomicBool::new(true),
            close_calls: AtomicUsize::new(0),
            sessions_opened: AtomicUsize::new(0),
            probes: Arc::new(AtomicUsize::new(0)),
            clicks: Arc::new(AtomicUsize::new(0)),
        });
        self.created.lock().unwrap().push(renderer.clone());
        Ok(renderer)
    }
}

pub struct FakeRenderer {
    id: String,
    script: FakeScript,
    healthy: AtomicBool,
    close_calls: AtomicUsize,
    sessions_opened: AtomicUsize,
    probes: Arc<AtomicUsize>,
    clicks: Arc<AtomicUsize>,
}

impl FakeRenderer {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn clicks(&self) -> usize {
        self.clicks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn open_session(&self) -> Result<Box<dyn RenderSession>> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            script: self.script.clone(),
            url: Mutex::new(String::from("about:blank")),
            probes: self.probes.clone(),
            clicks: self.clicks.clone(),
        }))
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeSession {
    script: FakeScript,
    url: Mutex<String>,
    probes: Arc<AtomicUsize>,
    clicks: Arc<AtomicUsize>,
}

#[async_trait]
impl RenderSession for FakeSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        if !self.script.navigate_delay.is_zero() {
            tokio::time::sleep(self.script.navigate_delay).await;
        }
        if self.script.panic_on_navigate {
            panic!("renderer crashed while navigating to {}", url);
        }
        if let Some(err) = &self.script.navigate_error {
            return Err(anyhow!("{}", err));
        }
        *self.url.lock().unwrap() = self
            .script
            .landing_url
            .clone()
            .unwrap_or_else(|| url.to_string());
        Ok(())
    }

    async fn wait_loaded(&self) -> Result<()> {
        match &self.script.wait_loaded_error {
            Some(err) => Err(anyhow!("{}", err)),
            None => Ok(()),
        }
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn find_control(
        &self,
        _selectors: &[String],
        labels: &[String],
    ) -> Result<Option<Box<dyn PageControl>>> {
        Ok(self.script.control.clone().map(|script| {
            Box::new(FakeControl {
                script,
                label: labels.first().cloned().unwrap_or_default(),
                probes: self.probes.clone(),
                clicks: self.clicks.clone(),
            }) as Box<dyn PageControl>
        }))
    }

    async fn screenshot(&self, path: &Path) -> Result<u64> {
        if let Some(err) = &self.script.screenshot_error {
            return Err(anyhow!("{}", err));
        }
        tokio::fs::write(path, &self.script.screenshot_bytes).await?;
        Ok(self.script.screenshot_bytes.len() as u64)
    }

    async fn close(&self) {}
}

struct FakeControl {
    script: FakeControlScript,
    label: String,
    probes: Arc<AtomicUsize>,
    clicks: Arc<AtomicUsize>,
}

#[async_trait]
impl PageControl for FakeControl {
    async fn text(&self) -> Result<String> {
        Ok(self.label.clone())
    }

    async fn click(&self) -> Result<()> {
        self.clicks.fetch_add(1, Ordering::SeqCst);
        if self.script.click_error {
            return Err(anyhow!("element is not clickable"));
        }
        Ok(())
    }

    async fn eval_boolean(&self, _expression: &str) -> Result<bool> {
        let seen = self.probes.fetch_add(1, Ordering::SeqCst);
        if self.script.eval_error {
            return Err(anyhow!("Execution context was destroyed"));
        }
        Ok(seen < self.script.loading_polls)
    }
}
