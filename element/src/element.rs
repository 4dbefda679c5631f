use std::{sync::Arc, time::Duration};

use core_2pc::{
    retry::{retry_with_backoff, RetryPolicy},
    BranchId, BranchReport, DecideResponse, Decision, GlobalId, Row, TableRef, TransactionCoordinator, TxError,
    UndoLogEntry,
};
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::{error::ElementError, local_store::LocalDatabase};

/// Identity an element enlists its branches under.
#[derive(Debug, Clone)]
pub struct Enlistment {
    pub participant: String,
    pub resource: String,
    /// Base URL the coordinator delivers decisions to.
    pub endpoint: String,
}

/// Resource manager of one element: turns local units of work into branches
/// of a global transaction and applies the coordinator's decisions.
pub struct ResourceManager {
    enlistment: Enlistment,
    coordinator: Arc<dyn TransactionCoordinator>,
    database: Arc<dyn LocalDatabase>,
    retry: RetryPolicy,
    lock_retry: RetryPolicy,
}

impl ResourceManager {
    pub fn new(
        enlistment: Enlistment,
        coordinator: Arc<dyn TransactionCoordinator>,
        database: Arc<dyn LocalDatabase>,
    ) -> Self {
        Self {
            enlistment,
            coordinator,
            database,
            retry: RetryPolicy::default().with_max_attempts(5),
            lock_retry: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(200)).with_max_attempts(30),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How long a local unit waits for rows held by other branches.
    pub fn with_lock_retry(mut self, lock_retry: RetryPolicy) -> Self {
        self.lock_retry = lock_retry;
        self
    }

    pub fn enlistment(&self) -> &Enlistment {
        &self.enlistment
    }

    pub fn database(&self) -> &Arc<dyn LocalDatabase> {
        &self.database
    }

    /// Register a branch under `global_id` and open its local unit of work.
    pub async fn begin(&self, global_id: GlobalId) -> Result<LocalUnit<'_>, ElementError> {
        let Enlistment {
            participant,
            resource,
            endpoint,
        } = &self.enlistment;

        let branch_id = retry_with_backoff(
            &self.retry,
            || self.coordinator.branch_register(global_id, participant, resource, endpoint),
            TxError::is_transient,
        )
        .await?;
        info!(%global_id, %branch_id, %participant, "branch registered");

        Ok(LocalUnit {
            manager: self,
            global_id,
            branch_id,
            entries: Vec::new(),
        })
    }

    /// Apply a phase-two decision. Safe to call any number of times.
    ///
    /// A compensation that cannot be replayed is answered with an escalated
    /// ack rather than an error, so the coordinator stops retrying it.
    pub async fn on_decision(&self, branch_id: BranchId, decision: Decision) -> Result<DecideResponse, ElementError> {
        match self.database.finish_branch(branch_id, decision).await {
            Ok(status) => {
                info!(%branch_id, ?decision, ?status, "decision applied");
                Ok(DecideResponse::acked(branch_id, status))
            }
            Err(ElementError::Tx(err @ TxError::UndoLogReplayFailed { .. })) => {
                error!(%branch_id, error = %err, "undo log replay failed, branch needs manual repair");
                Ok(DecideResponse::escalated(branch_id, err.to_string()))
            }
            Err(err) => {
                warn!(%branch_id, ?decision, error = %err, "failed to apply decision");
                Err(err)
            }
        }
    }

    async fn report(&self, branch_id: BranchId, report: BranchReport) -> Result<(), TxError> {
        retry_with_backoff(
            &self.retry,
            || self.coordinator.branch_report(branch_id, report),
            TxError::is_transient,
        )
        .await
    }
}

/// Writes staged by one branch, applied by [`LocalUnit::commit_with`].
pub struct LocalUnit<'a> {
    manager: &'a ResourceManager,
    global_id: GlobalId,
    branch_id: BranchId,
    entries: Vec<UndoLogEntry>,
}

impl<'a> LocalUnit<'a> {
    pub fn global_id(&self) -> GlobalId {
        self.global_id
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    /// Current image of a row, including writes staged in this unit.
    pub async fn read(&self, table: &TableRef, key: i64) -> Result<Option<Row>, ElementError> {
        let staged = self
            .entries
            .iter()
            .rev()
            .find(|entry| entry.table == table.name && entry.key == key);
        match staged {
            Some(entry) => Ok(entry.after.clone()),
            None => self.manager.database.read(table, key).await,
        }
    }

    pub fn record_undo(&mut self, table: &TableRef, key: i64, before: Option<Row>, after: Option<Row>) {
        let sequence = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        self.entries
            .push(UndoLogEntry::new(self.branch_id, sequence, table, key, before, after));
    }

    pub async fn update(&mut self, table: &TableRef, key: i64, after: Row) -> Result<(), ElementError> {
        let before = self.read(table, key).await?;
        self.record_undo(table, key, before, Some(after));
        Ok(())
    }

    /// Stage a new row under the next free key and return the key.
    pub async fn insert(&mut self, table: &TableRef, row: Row) -> Result<i64, ElementError> {
        let staged_max = self
            .entries
            .iter()
            .filter(|entry| entry.table == table.name)
            .map(|entry| entry.key + 1)
            .max();
        let key = self.manager.database.next_key(table).await?.max(staged_max.unwrap_or(0));

        self.record_undo(table, key, None, Some(row.with(table.key_column, key)));
        Ok(key)
    }

    /// Stage writes with `stage`, then commit them together with their undo
    /// log and report the branch PhaseOneDone.
    ///
    /// A row held by another branch, or changed since it was read, drops the
    /// staged writes and runs `stage` again on fresh rows once the manager's
    /// lock retry policy allows. A staging error or any other commit failure
    /// reports the branch Failed.
    pub async fn commit_with<T, F>(mut self, mut stage: F) -> Result<T, ElementError>
    where
        F: for<'u> FnMut(&'u mut LocalUnit<'a>) -> BoxFuture<'u, Result<T, ElementError>>,
    {
        let lock_retry = self.manager.lock_retry.clone();
        let mut attempt = 0;

        let value = loop {
            self.entries.clear();
            let staged = stage(&mut self).await;
            let value = match staged {
                Ok(value) => value,
                Err(err) => {
                    self.abort(&err).await;
                    return Err(err);
                }
            };

            let committed = self.manager.database.commit_unit(self.branch_id, &self.entries).await;
            match committed {
                Ok(()) => break value,
                Err(err @ (ElementError::RowLocked { .. } | ElementError::Conflict { .. }))
                    if !lock_retry.is_exhausted(attempt) =>
                {
                    let delay = lock_retry.delay_for_attempt(attempt);
                    debug!(
                        global_id = %self.global_id,
                        branch_id = %self.branch_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason = %err,
                        "row busy, staging again"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(global_id = %self.global_id, branch_id = %self.branch_id, error = %err, "local commit failed");
                    if let Err(report_err) = self.manager.report(self.branch_id, BranchReport::Failed).await {
                        warn!(branch_id = %self.branch_id, error = %report_err, "failed to report branch failure");
                    }
                    return Err(err);
                }
            }
        };

        self.manager.report(self.branch_id, BranchReport::PhaseOneDone).await?;
        info!(
            global_id = %self.global_id,
            branch_id = %self.branch_id,
            writes = self.entries.len(),
            "branch committed locally"
        );
        Ok(value)
    }

    /// Drop the staged writes and report the branch Failed.
    pub async fn abort(self, reason: &ElementError) {
        warn!(global_id = %self.global_id, branch_id = %self.branch_id, reason = %reason, "local work aborted");
        if let Err(err) = self.manager.report(self.branch_id, BranchReport::Failed).await {
            warn!(branch_id = %self.branch_id, error = %err, "failed to report branch failure");
        }
    }
}
