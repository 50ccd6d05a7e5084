//! Deadline race for remote operations.

use std::future::Future;
use std::time::Duration;

use pinnet_types::{Error, Result};

/// Default bound for any single network operation.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Race `operation` against `deadline`; whichever completes first
/// determines the outcome.
///
/// Losing the race drops the operation future, cancelling the local side
/// of the work at its next await point. The remote side's outcome stays
/// unknown: callers must treat [`Error::Timeout`] as "unknown outcome",
/// not "operation aborted".
pub async fn bound<F, T>(operation: F, deadline: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}
