//! # chart-snap
//!
//! Deduplicated screenshots of stock chart pages, rendered by a pool of
//! headless Chrome processes and served from S3 behind a CDN.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chart_snap::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig {
//!         cdn: CdnConfig {
//!             base_url: "https://cdn.example.com".to_string(),
//!             ..Default::default()
//!         },
//!         store: StoreConfig {
//!             region: "us-east-1".to_string(),
//!             bucket: "charts".to_string(),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     };
//!
//!     let service = ScreenshotService::launch(config).await?;
//!     let result = service
//!         .screenshot(&ArtifactRequest::new("NVDA", "us", "1d"), &CancellationToken::new())
//!         .await?;
//!     println!("{}", result.url);
//!
//!     service.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Common**: configuration, shared types, errors, time buckets, browser middlewares
//! - **Worker**: browser pool, task coordinator, capture workflow, storage clients
//!   and the batch binary
//!
//! ## Features
//!
//! - `worker` (default): Include the worker crate
//!
//! Use `default-features = false` to depend on the shared types only.

/// Re-export of common types and traits
pub use chart_snap_common as common;

/// Re-export of worker functionality
#[cfg(feature = "worker")]
pub use chart_snap_worker as worker;

/// Convenient re-exports of commonly used types
pub mod prelude {
    pub use crate::common::{
        ArtifactKey, ArtifactRequest, ArtifactResult, ArtifactSource, CancellationToken,
        Error, Result, Timeframe, UploadResult,
    };

    // Configuration types
    pub use crate::common::{
        BrowserConfig, CaptureConfig, CdnConfig, ChartSiteConfig, PanelDataConfig, ServiceConfig,
        StoreConfig, TaskConfig,
    };

    // Browser middlewares
    pub use crate::common::{LaunchArgsMiddleware, SessionInitMiddleware};

    #[cfg(feature = "worker")]
    pub use crate::worker::{
        run_batch, ArtifactStore, BrowserPool, ExistenceOracle, Metrics, PanelDataSource,
        ScreenshotService, TaskCoordinator,
    };
}
