use chart_snap_common::{
    check_cancellation, BrowserConfig, CancellationToken, Error, HandleStats, PoolStats, Result,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::renderer::{Renderer, RendererFactory};

/// Fixed-size pool of renderers, each serving up to `max_sessions` concurrent sessions.
///
/// Acquisition scans handles in order under the read lock and reserves a slot on
/// the first one with spare capacity; when every handle is saturated it sleeps
/// for the poll interval and scans again.
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: RwLock<PoolState>,
    factory: Arc<dyn RendererFactory>,
    max_sessions: usize,
    poll_interval: Duration,
    acquire_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

struct PoolState {
    handles: Vec<Arc<RendererHandle>>,
    closed: bool,
}

/// One pooled renderer and its session counter.
pub struct RendererHandle {
    index: usize,
    renderer: Arc<dyn Renderer>,
    max_sessions: usize,
    state: std::sync::Mutex<HandleState>,
}

#[derive(Default)]
struct HandleState {
    /// No new sessions once set.
    closed: bool,
    /// Renderer process has been shut down.
    shut_down: bool,
    active_sessions: usize,
}

impl RendererHandle {
    fn new(index: usize, renderer: Arc<dyn Renderer>, max_sessions: usize) -> Self {
        Self {
            index,
            renderer,
            max_sessions,
            state: std::sync::Mutex::new(HandleState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> &str {
        self.renderer.id()
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().active_sessions
    }

    /// Reserve a session slot if the handle is open, healthy and below its cap.
    fn try_reserve(&self) -> bool {
        let mut state = self.lock();
        if state.closed || state.active_sessions >= self.max_sessions {
            return false;
        }
        if !self.renderer.is_healthy() {
            return false;
        }
        state.active_sessions += 1;
        true
    }

    /// Give a slot back. Never goes below zero.
    pub fn release_session(&self) {
        let mut state = self.lock();
        state.active_sessions = state.active_sessions.saturating_sub(1);
    }

    /// Stop handing out sessions if none are active. Returns whether the handle is retired.
    fn retire_if_idle(&self) -> bool {
        let mut state = self.lock();
        if state.active_sessions > 0 {
            return false;
        }
        state.closed = true;
        true
    }

    /// Close the handle and shut its renderer down. Only the first call reaches the renderer.
    async fn close(&self) {
        let first = {
            let mut state = self.lock();
            state.closed = true;
            !std::mem::replace(&mut state.shut_down, true)
        };
        if first {
            self.renderer.close().await;
        }
    }

    fn stats(&self) -> HandleStats {
        let state = self.lock();
        HandleStats {
            index: self.index,
            id: self.renderer.id().to_string(),
            active_sessions: state.active_sessions,
            max_sessions: self.max_sessions,
            closed: state.closed,
            healthy: self.renderer.is_healthy(),
        }
    }
}

/// A reserved session slot. The slot is given back when the lease is dropped.
pub struct HandleLease {
    handle: Arc<RendererHandle>,
}

impl HandleLease {
    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        self.handle.renderer()
    }

    pub fn handle_id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle_index(&self) -> usize {
        self.handle.index()
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.handle.release_session();
        debug!(handle = %self.handle.id(), "Released browser session");
    }
}

impl BrowserPool {
    /// Launch `pool_size` renderers through `factory`.
    ///
    /// If any launch fails, the renderers already created are closed and
    /// [`Error::HandleCreationFailed`] is returned.
    pub async fn new(factory: Arc<dyn RendererFactory>, config: &BrowserConfig) -> Result<Self> {
        info!(
            "Creating browser pool: {} handle(s), {} session(s) each",
            config.pool_size, config.max_sessions_per_browser
        );

        let mut handles: Vec<Arc<RendererHandle>> = Vec::with_capacity(config.pool_size);
        for index in 0..config.pool_size {
            match factory.create(index).await {
                Ok(renderer) => {
                    info!(handle = %renderer.id(), "Browser handle {} created", index);
                    handles.push(Arc::new(RendererHandle::new(
                        index,
                        renderer,
                        config.max_sessions_per_browser,
                    )));
                }
                Err(e) => {
                    error!("Failed to create browser handle {}: {}", index, e);
                    for handle in &handles {
                        handle.close().await;
                    }
                    return Err(Error::HandleCreationFailed {
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }

        let inner = Arc::new(PoolInner {
            state: RwLock::new(PoolState {
                handles,
                closed: false,
            }),
            factory,
            max_sessions: config.max_sessions_per_browser,
            poll_interval: config.acquire_poll_interval,
            acquire_timeout: config.acquire_timeout,
            shutdown: CancellationToken::new(),
        });

        Self::start_health_monitor(Arc::downgrade(&inner), config.health_check_interval);

        Ok(Self { inner })
    }

    /// Reserve a session slot, polling while every handle is saturated.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<HandleLease> {
        let started = tokio::time::Instant::now();

        loop {
            check_cancellation(cancel, "pool acquire")?;

            {
                let state = self.inner.state.read().await;
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                for handle in state.handles.iter() {
                    if handle.try_reserve() {
                        debug!(
                            handle = %handle.id(),
                            "Acquired browser session ({}/{})",
                            handle.active_sessions(),
                            handle.max_sessions
                        );
                        return Ok(HandleLease {
                            handle: handle.clone(),
                        });
                    }
                }
            }

            let waited = started.elapsed();
            if let Some(timeout) = self.inner.acquire_timeout {
                if waited >= timeout {
                    warn!("No browser session available after {:?}", waited);
                    return Err(Error::PoolExhaustedTimeout { waited });
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Pool acquire cancelled after {:?}", waited);
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(self.inner.poll_interval) => {}
            }
        }
    }

    /// Explicit counterpart of dropping the lease.
    pub fn release(&self, lease: HandleLease) {
        lease.release();
    }

    /// Close the pool and every handle. Safe to call more than once.
    pub async fn close(&self) {
        let handles = {
            let mut state = self.inner.state.write().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.handles.clone()
        };

        info!("Closing browser pool ({} handle(s))", handles.len());
        self.inner.shutdown.cancel();

        for handle in handles {
            handle.close().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.read().await.closed
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.read().await;
        let handles: Vec<HandleStats> = state.handles.iter().map(|h| h.stats()).collect();

        PoolStats {
            pool_size: handles.len(),
            available: handles
                .iter()
                .filter(|h| !h.closed && h.healthy && h.active_sessions < h.max_sessions)
                .count(),
            in_use: handles.iter().filter(|h| h.active_sessions > 0).count(),
            active_sessions: handles.iter().map(|h| h.active_sessions).sum(),
            closed: state.closed,
            handles,
        }
    }

    /// Replace unhealthy, idle handles with fresh renderers from the factory.
    ///
    /// Returns the number of handles replaced.
    pub async fn replace_unhealthy(&self) -> usize {
        Self::replace_unhealthy_handles(&self.inner).await
    }

    async fn replace_unhealthy_handles(inner: &PoolInner) -> usize {
        let candidates: Vec<(usize, Arc<RendererHandle>)> = {
            let state = inner.state.read().await;
            if state.closed {
                return 0;
            }
            state
                .handles
                .iter()
                .enumerate()
                .filter(|(_, h)| !h.renderer.is_healthy())
                .map(|(slot, h)| (slot, h.clone()))
                .collect()
        };

        let mut replaced = 0;
        for (slot, old) in candidates {
            if !old.retire_if_idle() {
                debug!(handle = %old.id(), "Unhealthy handle still has active sessions, retrying later");
                continue;
            }

            warn!(handle = %old.id(), "Replacing unhealthy browser handle {}", old.index);
            let renderer = match inner.factory.create(old.index).await {
                Ok(renderer) => renderer,
                Err(e) => {
                    error!("Failed to recreate browser handle {}: {}", old.index, e);
                    old.close().await;
                    continue;
                }
            };
            let fresh = Arc::new(RendererHandle::new(old.index, renderer, inner.max_sessions));

            let swapped = {
                let mut state = inner.state.write().await;
                if !state.closed && Arc::ptr_eq(&state.handles[slot], &old) {
                    state.handles[slot] = fresh.clone();
                    true
                } else {
                    false
                }
            };

            old.close().await;
            if swapped {
                info!(handle = %fresh.id(), "Browser handle {} replaced", old.index);
                replaced += 1;
            } else {
                fresh.close().await;
            }
        }
        replaced
    }

    fn start_health_monitor(inner: Weak<PoolInner>, interval: Duration) {
        let shutdown = match inner.upgrade() {
            Some(inner) => inner.shutdown.clone(),
            None => return,
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(pool) = inner.upgrade() else {
                    break;
                };
                let replaced = Self::replace_unhealthy_handles(&pool).await;
                if replaced > 0 {
                    info!("Health monitor replaced {} browser handle(s)", replaced);
                }
            }
            debug!("Browser pool health monitor stopped");
        });
    }
}
