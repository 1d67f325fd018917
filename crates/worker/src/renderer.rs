//! Renderer capability used by the pool and the capture workflow.
//!
//! The Chrome implementation lives in [`crate::chrome`]; tests drive the same
//! workflow through scripted fakes.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// One long-lived browser process.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Stable identifier used in logs and stats.
    fn id(&self) -> &str;

    /// False once the process is known to be gone. Unhealthy handles are never leased.
    fn is_healthy(&self) -> bool;

    /// Open a fresh page (tab) on this renderer.
    async fn open_session(&self) -> Result<Box<dyn RenderSession>>;

    /// Terminate the process. Called exactly once by the pool.
    async fn close(&self);
}

/// A page opened on a [`Renderer`].
#[async_trait]
pub trait RenderSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Wait for the load event of the current navigation.
    async fn wait_loaded(&self) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// First element matching one of `selectors` (tried in order) whose text
    /// contains one of `labels`.
    async fn find_control(
        &self,
        selectors: &[String],
        labels: &[String],
    ) -> Result<Option<Box<dyn PageControl>>>;

    /// Write a PNG of the viewport to `path`, returning its size in bytes.
    async fn screenshot(&self, path: &Path) -> Result<u64>;

    async fn close(&self);
}

/// An element located by [`RenderSession::find_control`].
#[async_trait]
pub trait PageControl: Send + Sync {
    async fn text(&self) -> Result<String>;

    async fn click(&self) -> Result<()>;

    /// Evaluate a boolean JS expression with `this` bound to the element.
    async fn eval_boolean(&self, expression: &str) -> Result<bool>;
}

/// Creates renderers for the pool, at startup and when replacing unhealthy ones.
#[async_trait]
pub trait RendererFactory: Send + Sync {
    async fn create(&self, index: usize) -> Result<Arc<dyn Renderer>>;
}
