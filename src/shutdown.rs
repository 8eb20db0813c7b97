//! Shutdown coordination.
//!
//! [`ShutdownCoordinator::request_shutdown`] walks
//! `Idle → Waiting → Persisting → Done`:
//!
//! 1. **Waiting** seals the document, then awaits the in-flight update count
//!    reaching zero. Sealing means the count can only fall from here on, so
//!    once it is zero it stays zero.
//! 2. **Persisting** saves on a blocking thread.
//! 3. **Done** is terminal; later requests return `Ok(())` immediately.
//!
//! A failed save or an expired wait returns the coordinator to `Idle` with
//! the document still sealed, so the caller can report the error and retry.
//! Dropping a pending `request_shutdown` future does the same.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::document::{Document, PersistError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Idle,
    Waiting,
    Persisting,
    Done,
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Saving failed; the previous feeds file is intact
    #[error("Failed to save feeds: {0}")]
    Persist(#[from] PersistError),

    /// Background updates did not finish within the configured limit.
    /// Nothing was saved.
    #[error("Timed out after {0:?} waiting for background updates to finish")]
    Timeout(Duration),

    /// Another caller is already shutting down
    #[error("Shutdown already in progress")]
    AlreadyInProgress,

    /// The blocking save task panicked or was cancelled
    #[error("Save task failed: {0}")]
    SaveTask(#[from] tokio::task::JoinError),
}

pub struct ShutdownCoordinator {
    document: Document,
    timeout: Option<Duration>,
    state: watch::Sender<ShutdownState>,
}

impl ShutdownCoordinator {
    /// `timeout` bounds the wait for in-flight updates; `None` waits forever.
    pub fn new(document: Document, timeout: Option<Duration>) -> Self {
        let (state, _) = watch::channel(ShutdownState::Idle);
        Self {
            document,
            timeout,
            state,
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions (e.g. to show "saving…" in the UI).
    pub fn watch_state(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Wait for in-flight updates, then save the document.
    ///
    /// Never saves while an update is in flight.
    pub async fn request_shutdown(&self) -> Result<(), ShutdownError> {
        let mut previous = ShutdownState::Idle;
        let began = self.state.send_if_modified(|s| {
            previous = *s;
            if *s == ShutdownState::Idle {
                *s = ShutdownState::Waiting;
                true
            } else {
                false
            }
        });

        if !began {
            return match previous {
                ShutdownState::Done => Ok(()),
                _ => Err(ShutdownError::AlreadyInProgress),
            };
        }

        let attempt = AttemptGuard {
            state: &self.state,
            finished: false,
        };
        let result = self.run().await;
        attempt.finish(&result);

        result
    }

    async fn run(&self) -> Result<(), ShutdownError> {
        if self.document.seal() {
            tracing::info!("Document sealed for shutdown");
        }

        self.wait_until_idle().await?;

        self.state.send_replace(ShutdownState::Persisting);
        let document = self.document.clone();
        tokio::task::spawn_blocking(move || document.save()).await??;
        Ok(())
    }

    async fn wait_until_idle(&self) -> Result<(), ShutdownError> {
        let mut activity = self.document.watch_activity();
        let in_flight = activity.borrow().in_flight;
        if in_flight > 0 {
            tracing::info!(in_flight, "Waiting for background updates to finish");
        }

        let idle = async {
            // The sender lives in the document we hold, so this cannot close
            if activity.wait_for(|a| a.in_flight == 0).await.is_err() {
                tracing::warn!("Activity channel closed while waiting");
            }
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, idle)
                .await
                .map_err(|_| ShutdownError::Timeout(limit)),
            None => {
                idle.await;
                Ok(())
            }
        }
    }
}

/// Resets the coordinator to `Idle` if a shutdown attempt is abandoned.
///
/// The caller's future can be dropped while `Waiting` or `Persisting` (an
/// outer timeout, a `select!` against a second signal, an aborted task).
/// Without this the state would stay there and every retry would report
/// `AlreadyInProgress`.
struct AttemptGuard<'a> {
    state: &'a watch::Sender<ShutdownState>,
    finished: bool,
}

impl AttemptGuard<'_> {
    fn finish(mut self, result: &Result<(), ShutdownError>) {
        self.finished = true;
        match result {
            Ok(()) => {
                self.state.send_replace(ShutdownState::Done);
                tracing::info!("Shutdown complete");
            }
            Err(e) => {
                self.state.send_replace(ShutdownState::Idle);
                tracing::error!(error = %e, "Shutdown failed; unsaved changes remain in memory");
            }
        }
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let abandoned = self.state.send_replace(ShutdownState::Idle);
            tracing::warn!(state = ?abandoned, "Shutdown request cancelled; nothing was saved by it");
        }
    }
}
