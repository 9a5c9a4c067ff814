//! Query Service
//!
//! Front door for concurrent callers: bounded worker permits, an end-to-end
//! deadline, and cancellation. A cancelled or timed-out request drops the
//! pipeline future, so in-flight calls are abandoned and no history is written.

use crate::error::{QaError, Result};
use crate::execution_loop::pipeline::QueryEngine;
use crate::model::{AnswerResponse, QaOutcome, QaRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

/// Cancels one request. Clones share the same signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct QueryService {
    engine: Arc<QueryEngine>,
    permits: Arc<Semaphore>,
    deadline: Duration,
}

impl QueryService {
    pub fn new(engine: QueryEngine, max_concurrent: usize, deadline: Duration) -> Self {
        Self {
            engine: Arc::new(engine),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            deadline,
        }
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// Requests currently allowed to start without waiting.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn ask(&self, request: QaRequest) -> Result<AnswerResponse> {
        self.ask_with_cancel(request, &CancelHandle::new()).await
    }

    /// Answer one request under the deadline, abandoning it if `cancel` fires.
    pub async fn ask_with_cancel(
        &self,
        request: QaRequest,
        cancel: &CancelHandle,
    ) -> Result<AnswerResponse> {
        let question = request.into_question()?;
        if cancel.is_cancelled() {
            return Err(QaError::Cancelled);
        }

        let work = async {
            // waiting for a permit counts against the deadline
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| QaError::Overloaded("query service is shutting down".to_string()))?;
            self.engine.answer(&question).await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(question = %question.text, "Request cancelled; discarding partial work");
                Err(QaError::Cancelled)
            }
            outcome = tokio::time::timeout(self.deadline, work) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(deadline_ms = self.deadline.as_millis() as u64, "Request deadline exceeded");
                    Err(QaError::DeadlineExceeded(self.deadline.as_millis() as u64))
                }
            },
        }
    }

    /// Like `ask_with_cancel`, with failures mapped to their sanitized form.
    pub async fn outcome(&self, request: QaRequest, cancel: &CancelHandle) -> QaOutcome {
        let result = self.ask_with_cancel(request, cancel).await;
        if let Err(e) = &result {
            error!(kind = ?e.kind(), "Request failed: {}", e);
        }
        result.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_handle_resolves_after_cancel() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        assert!(!handle.is_cancelled());
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_cancelled() {
        let handle = CancelHandle::new();
        handle.cancel();
        tokio::time::timeout(Duration::from_millis(100), handle.cancelled())
            .await
            .unwrap();
    }
}
