//! Initiator side of a global transaction.
//!
//! [`TransactionManager::with_global_transaction`] is the scoped form of
//! "run this in a global transaction": it begins the transaction, runs the
//! body, and guarantees exactly one commit-or-rollback request on every exit
//! path, including a body that overruns its timeout.

use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::{
    retry::{retry_with_backoff, RetryPolicy},
    GlobalId, GlobalStatusResponse, TransactionCoordinator, TxError,
};

pub struct TransactionManager {
    coordinator: Arc<dyn TransactionCoordinator>,
    initiator: String,
    retry: RetryPolicy,
}

impl TransactionManager {
    pub fn new(coordinator: Arc<dyn TransactionCoordinator>, initiator: impl Into<String>) -> Self {
        Self {
            coordinator,
            initiator: initiator.into(),
            retry: RetryPolicy::default().with_max_attempts(5),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn coordinator(&self) -> &Arc<dyn TransactionCoordinator> {
        &self.coordinator
    }

    /// Run `body` inside a new global transaction.
    ///
    /// The body receives the global id to propagate to participants. A body
    /// error triggers a global rollback and is returned unchanged. A body that
    /// does not finish within `timeout` is abandoned, rolled back and reported
    /// as [`TxError::TransactionTimeout`]. A commit the coordinator turns into
    /// a rollback is reported as [`TxError::GlobalRolledBack`].
    ///
    /// A zero `timeout` leaves the deadline to the coordinator's default: the
    /// body is not timed locally, and a commit arriving after the coordinator's
    /// deadline comes back as [`TxError::GlobalRolledBack`].
    pub async fn with_global_transaction<T, E, F, Fut>(
        &self,
        name: &str,
        timeout: Duration,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(GlobalId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TxError> + Display,
    {
        let global_id = self.coordinator.begin(&self.initiator, name, timeout).await?;
        info!(%global_id, name, "global transaction begun");

        let finished = if timeout.is_zero() {
            Ok(body(global_id).await)
        } else {
            tokio::time::timeout(timeout, body(global_id)).await
        };

        match finished {
            Ok(Ok(value)) => {
                let status = self.commit(global_id).await?;
                if status.is_commit() {
                    info!(%global_id, status = ?status.status, "global transaction committed");
                    Ok(value)
                } else {
                    warn!(%global_id, status = ?status.status, "commit overridden by coordinator");
                    Err(TxError::GlobalRolledBack { global_id }.into())
                }
            }
            Ok(Err(err)) => {
                warn!(%global_id, error = %err, "global transaction body failed, rolling back");
                self.rollback(global_id).await;
                Err(err)
            }
            Err(_elapsed) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(%global_id, timeout_ms, "global transaction timed out, rolling back");
                self.rollback(global_id).await;
                Err(TxError::TransactionTimeout { global_id, timeout_ms }.into())
            }
        }
    }

    async fn commit(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        retry_with_backoff(
            &self.retry,
            || self.coordinator.global_commit(global_id),
            TxError::is_transient,
        )
        .await
    }

    // The body's own error is what the caller needs to see; a failed rollback
    // request is left to the coordinator's timeout sweeper.
    async fn rollback(&self, global_id: GlobalId) {
        let result = retry_with_backoff(
            &self.retry,
            || self.coordinator.global_rollback(global_id),
            TxError::is_transient,
        )
        .await;

        if let Err(err) = result {
            error!(%global_id, error = %err, "global rollback request failed");
        }
    }
}
