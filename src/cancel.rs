//! Cancellation for an in-flight fan-out
//!
//! `CancelHandle::cancel` trips a shared `CancellationToken`; every
//! per-endpoint worker holds a `CancelSignal` clone and abandons its call once
//! the token is cancelled or the signal's deadline passes. Signals taken after
//! the cancel still see it.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let handle = CancelHandle {
        token: CancellationToken::new(),
    };
    let signal = handle.signal();
    (handle, signal)
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            token: self.token.clone(),
            deadline: None,
        }
    }
}

impl CancelSignal {
    /// A signal that never fires on its own
    pub fn never() -> Self {
        CancelSignal {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Also fire once `after` has elapsed. The earlier of two deadlines wins.
    pub fn with_deadline(mut self, after: Option<Duration>) -> Self {
        if let Some(after) = after {
            let at = Instant::now() + after;
            self.deadline = Some(match self.deadline {
                Some(existing) if existing < at => existing,
                _ => at,
            });
        }
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once cancelled or past the deadline
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(at) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}
