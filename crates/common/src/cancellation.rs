//! Cancellation helpers for pool acquisition, task joins and capture steps.
//!
//! Every blocking operation in chart-snap takes a [`CancellationToken`]. Instead of
//! writing the same `tokio::select!` in each of them, futures are wrapped with
//! [`CancellationExt::with_cancellation`]:
//!
//! ```rust
//! use chart_snap_common::{CancellationExt, CancellationToken, Error};
//!
//! # async fn upload() -> Result<String, Error> { Ok("ok".to_string()) }
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error> {
//! let token = CancellationToken::new();
//! let url = upload().with_cancellation::<Error>(&token, "upload").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Synchronous polling loops (the refresh wait runs one) call
//! [`check_cancellation`] at the top of each iteration.

use std::future::Future;

pub use tokio_util::sync::CancellationToken;

/// Marker error returned when a token fires before the wrapped operation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancellationError;

impl std::fmt::Display for CancellationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancellationError {}

/// Extension trait adding cancellation to any future returning a `Result`.
///
/// The original error and [`CancellationError`] must both convert into the target
/// error type `E`.
pub trait CancellationExt<T> {
    /// The error type of the wrapped future.
    type OriginalError;

    /// Race the future against `token`.
    ///
    /// `context` names the operation in the log line emitted on cancellation.
    fn with_cancellation<'a, E>(
        self,
        token: &'a CancellationToken,
        context: &'a str,
    ) -> impl Future<Output = Result<T, E>> + Send + 'a
    where
        CancellationError: Into<E>,
        Self::OriginalError: Into<E>,
        Self: 'a;
}

#[allow(clippy::manual_async_fn)] // Complex lifetime bounds make async fn impractical here
impl<F, T, OriginalError> CancellationExt<T> for F
where
    F: Future<Output = Result<T, OriginalError>> + Send,
{
    type OriginalError = OriginalError;

    fn with_cancellation<'a, E>(
        self,
        token: &'a CancellationToken,
        context: &'a str,
    ) -> impl Future<Output = Result<T, E>> + Send + 'a
    where
        CancellationError: Into<E>,
        OriginalError: Into<E>,
        F: 'a,
    {
        async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::info!("{}: cancellation signal received", context);
                    Err(CancellationError.into())
                }
                result = self => {
                    result.map_err(Into::into)
                }
            }
        }
    }
}

/// Returns `Err(CancellationError)` when `token` has fired.
pub fn check_cancellation(
    token: &CancellationToken,
    context: &str,
) -> Result<(), CancellationError> {
    if token.is_cancelled() {
        tracing::info!("{}: cancellation detected", context);
        Err(CancellationError)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::time::Duration;

    #[tokio::test]
    async fn test_successful_operation() {
        let token = CancellationToken::new();

        async fn head_ok() -> Result<bool, Error> {
            Ok(true)
        }

        let result: Result<bool, Error> = head_ok().with_cancellation(&token, "head").await;
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_before_completion() {
        let token = CancellationToken::new();

        async fn slow_upload() -> Result<String, Error> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("never".to_string())
        }

        token.cancel();

        let result: Result<String, Error> =
            slow_upload().with_cancellation(&token, "slow_upload").await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_original_error_propagates() {
        let token = CancellationToken::new();

        async fn failing() -> Result<(), Error> {
            Err(Error::PoolClosed)
        }

        let result: Result<(), Error> = failing().with_cancellation(&token, "failing").await;
        assert!(matches!(result, Err(Error::PoolClosed)));
    }

    #[test]
    fn test_check_cancellation() {
        let token = CancellationToken::new();
        assert!(check_cancellation(&token, "poll").is_ok());

        token.cancel();
        assert_eq!(check_cancellation(&token, "poll"), Err(CancellationError));
    }
}
