pub mod browser_middleware;
pub mod bucket;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use browser_middleware::{
    ChartLaunchArgs, HeaderOverride, LaunchArgsMiddleware, SessionInitMiddleware,
};
pub use bucket::{ArtifactKey, Clock, SystemClock, Timeframe};
pub use cancellation::{check_cancellation, CancellationError, CancellationExt, CancellationToken};
pub use config::*;
pub use error::{CaptureStage, Error, Result};
pub use types::*;
pub use utils::{chart_url, format_symbol_for_market, parse_symbol_market};
