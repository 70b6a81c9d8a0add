use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("run cancelled")]
    Cancelled,
    #[error("run deadline exceeded")]
    Deadline,
}

/// Cancellation token plus wall-clock deadline for one run. Every suspension
/// point (model call, solver poll, operator prompt, sandbox dispatch) awaits
/// through [`RunScope::guard`].
#[derive(Clone, Debug)]
pub struct RunScope {
    cancel: CancellationToken,
    deadline: Instant,
}

impl RunScope {
    pub fn new(cancel: CancellationToken, max_duration: Duration) -> Self {
        Self { cancel, deadline: Instant::now() + max_duration }
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(Interrupted::Deadline);
        }
        Ok(())
    }

    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = sleep_until(self.deadline) => Err(Interrupted::Deadline),
            out = fut => Ok(out),
        }
    }

    pub async fn pause(&self, d: Duration) -> Result<(), Interrupted> {
        self.guard(sleep(d)).await
    }
}
