//! Background operation tracking
//!
//! Work that continues after intake has answered "accepted" runs as a
//! tracked task. Each task owns the resource guard taken at intake, so the
//! per-resource lock is held until the ledger records the outcome.

use crate::ledger::ResourceGuard;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info_span, warn, Instrument};

/// How a background operation ended, as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum OperationOutcome {
    /// Remote work succeeded and the ledger holds the final state
    Completed,
    /// A local precondition failed and the ledger entry was reverted
    RolledBack { reason: String },
    /// Remote work failed and the ledger entry carries an error status
    Failed { reason: String },
}

/// Handle to a running background operation
#[derive(Debug)]
pub struct OperationHandle {
    pub operation: &'static str,
    pub resource_id: String,
    handle: JoinHandle<OperationOutcome>,
}

impl OperationHandle {
    /// Wait for the operation to finish
    pub async fn join(self) -> OperationOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => OperationOutcome::Failed {
                reason: format!("task aborted: {}", e),
            },
        }
    }
}

/// Spawns and tracks background operations
#[derive(Debug, Clone, Default)]
pub struct OperationRunner {
    tracker: TaskTracker,
}

impl OperationRunner {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    /// Run `work` in the background while holding `guard`
    pub fn spawn<F>(
        &self,
        operation: &'static str,
        guard: ResourceGuard,
        work: F,
    ) -> OperationHandle
    where
        F: Future<Output = OperationOutcome> + Send + 'static,
    {
        let resource_id = guard.resource_id().to_string();
        let span = info_span!("operation", op = operation, id = %resource_id);

        let handle = self.tracker.spawn(
            async move {
                let outcome = work.await;
                match &outcome {
                    OperationOutcome::Completed => debug!("{} completed", operation),
                    OperationOutcome::RolledBack { reason } => {
                        warn!("{} rolled back: {}", operation, reason)
                    }
                    OperationOutcome::Failed { reason } => {
                        warn!("{} failed: {}", operation, reason)
                    }
                }
                drop(guard);
                outcome
            }
            .instrument(span),
        );

        OperationHandle {
            operation,
            resource_id,
            handle,
        }
    }

    /// Operations still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait for running operations to finish
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
