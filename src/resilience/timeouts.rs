//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap backend calls with a deadline
//! - Cancel operations cleanly on timeout
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors
//! - Timed-out requests return 504 Gateway Timeout

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline of {0:?} exceeded")]
pub struct DeadlineExceeded(pub Duration);

/// Run `fut` under `deadline`. The future is dropped when it expires.
pub async fn with_deadline<F: Future>(
    deadline: Duration,
    fut: F,
) -> Result<F::Output, DeadlineExceeded> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| DeadlineExceeded(deadline))
}
