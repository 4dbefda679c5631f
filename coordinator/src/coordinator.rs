use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use core_2pc::{
    retry::{retry_with_backoff, RetryPolicy},
    BranchId, BranchReport, BranchStatus, BranchTransaction, Decision, GlobalId, GlobalStatus,
    GlobalStatusResponse, GlobalTransaction, ParticipantClient, TransactionCoordinator, TxError,
};
use futures::future::join_all;
use tokio::{
    task::JoinHandle,
    time::{sleep, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    registry::{BranchRegistry, Lookup, SessionHandle},
    store::TransactionStore,
    transaction::GlobalSession,
};

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Used when `begin` is called with a zero timeout.
    pub default_timeout: Duration,
    /// Backoff for phase-two deliveries; the attempt limit is ignored.
    pub retry: RetryPolicy,
    /// How long commit/rollback requests wait for phase two before answering
    /// with the in-progress status.
    pub phase_two_wait: Duration,
    pub sweep_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            phase_two_wait: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// The transaction coordinator.
///
/// Cheap to clone; clones share the registry, the store and the background
/// tasks.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: BranchRegistry,
    store: Arc<dyn TransactionStore>,
    participants: Arc<dyn ParticipantClient>,
    options: CoordinatorOptions,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn finished_response(global: &GlobalTransaction) -> GlobalStatusResponse {
    GlobalStatusResponse {
        global_id: global.id,
        status: global.status,
        outcome: global.outcome,
    }
}

/// Whether `status` is an acceptable final answer to `decision`.
fn acknowledges(decision: Decision, status: BranchStatus) -> bool {
    match decision {
        Decision::Commit => status == BranchStatus::Committed,
        // Failed: the branch never committed locally, nothing to compensate.
        Decision::Rollback => matches!(status, BranchStatus::RolledBack | BranchStatus::Failed),
    }
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        participants: Arc<dyn ParticipantClient>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: BranchRegistry::new(),
                store,
                participants,
                options,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build a coordinator from what `store` holds and resume every decided
    /// transaction's phase two. Undecided ones are left to the timeout sweeper.
    pub async fn recover(
        store: Arc<dyn TransactionStore>,
        participants: Arc<dyn ParticipantClient>,
        options: CoordinatorOptions,
    ) -> Result<Self, TxError> {
        let coordinator = Self::new(store.clone(), participants, options);
        let sessions = store.load_active().await?;
        let recovered = sessions.len();

        for (global, branches) in sessions {
            let session = GlobalSession::restore(global, branches);
            let global_id = session.id();
            let status = session.status();
            let decision = session.global.decision.or(status.decision());
            let pending = session.pending();
            let entry = coordinator.inner.registry.open(session);

            match decision {
                Some(decision) if status != GlobalStatus::Begin => {
                    info!(%global_id, ?status, ?decision, pending = pending.len(), "resuming phase two");
                    coordinator.inner.spawn_phase_two(entry, decision, pending);
                }
                _ => info!(%global_id, "recovered undecided global transaction"),
            }
        }

        info!(recovered, "coordinator recovered from store");
        Ok(coordinator)
    }

    pub fn registry(&self) -> &BranchRegistry {
        &self.inner.registry
    }

    /// Branches of an active or recently finished transaction, in registration order.
    pub async fn branches(&self, global_id: GlobalId) -> Result<Vec<BranchTransaction>, TxError> {
        self.inner.registry.list(global_id).await
    }

    pub async fn begin(&self, initiator: &str, name: &str, timeout: Duration) -> Result<GlobalId, TxError> {
        self.inner.begin(initiator, name, timeout).await
    }

    pub async fn branch_register(
        &self,
        global_id: GlobalId,
        participant: &str,
        resource: &str,
        endpoint: &str,
    ) -> Result<BranchId, TxError> {
        self.inner.branch_register(global_id, participant, resource, endpoint).await
    }

    pub async fn branch_report(&self, branch_id: BranchId, report: BranchReport) -> Result<(), TxError> {
        self.inner.branch_report(branch_id, report).await
    }

    pub async fn global_commit(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        self.inner.conclude(global_id, Decision::Commit).await
    }

    pub async fn global_rollback(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        self.inner.conclude(global_id, Decision::Rollback).await
    }

    pub async fn query(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        self.inner.query(global_id).await
    }

    /// Roll back every undecided transaction whose deadline has passed.
    /// Returns how many were rolled back.
    pub async fn expire_overdue(&self) -> usize {
        let now = Utc::now();
        let mut expired = 0;

        for entry in self.inner.registry.active() {
            if !entry.lock().await.global.is_expired(now) {
                continue;
            }
            warn!(global_id = %entry.id(), "global transaction timed out, rolling back");
            match self.inner.start_phase_two(&entry, Decision::Rollback).await {
                Ok(_) => expired += 1,
                Err(err) => error!(global_id = %entry.id(), error = %err, "failed to roll back timed out transaction"),
            }
        }
        expired
    }

    pub fn spawn_timeout_sweeper(&self) {
        let coordinator = self.clone();
        let period = self.inner.options.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = coordinator.expire_overdue().await;
                if expired > 0 {
                    debug!(expired, "timeout sweep finished");
                }
            }
        });
        self.inner.track(handle);
    }

    /// Stop the sweeper and every phase-two driver. Whatever they had not
    /// finished stays in the store for the next [`Coordinator::recover`].
    pub fn shutdown(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("coordinator background tasks stopped");
    }
}

impl Inner {
    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn finished_record(&self, global_id: GlobalId) -> Result<Option<GlobalTransaction>, TxError> {
        Ok(self
            .store
            .load_global(global_id)
            .await?
            .filter(|global| global.status == GlobalStatus::Finished))
    }

    #[instrument(skip(self))]
    async fn begin(&self, initiator: &str, name: &str, timeout: Duration) -> Result<GlobalId, TxError> {
        let timeout = if timeout.is_zero() {
            self.options.default_timeout
        } else {
            timeout
        };
        let global = GlobalTransaction::new(initiator, name, timeout);
        self.store.insert_global(&global).await?;

        let global_id = global.id;
        info!(%global_id, deadline = %global.deadline, "global transaction begun");
        self.registry.open(GlobalSession::new(global));
        Ok(global_id)
    }

    #[instrument(skip(self))]
    async fn branch_register(
        &self,
        global_id: GlobalId,
        participant: &str,
        resource: &str,
        endpoint: &str,
    ) -> Result<BranchId, TxError> {
        let entry = match self.registry.lookup(global_id) {
            Lookup::Active(entry) => entry,
            Lookup::Finished(_) => {
                return Err(TxError::BranchRegistrationRejected {
                    global_id,
                    status: GlobalStatus::Finished,
                })
            }
            Lookup::Unknown => {
                return Err(match self.finished_record(global_id).await? {
                    Some(global) => TxError::BranchRegistrationRejected {
                        global_id,
                        status: global.status,
                    },
                    None => TxError::UnknownGlobalTransaction { global_id },
                })
            }
        };

        let mut session = entry.lock().await;
        let branch = self.registry.register(&mut session, participant, resource, endpoint)?;
        if let Err(err) = self.store.insert_branch(&branch).await {
            self.registry.discard(&mut session, branch.id);
            return Err(err);
        }

        info!(%global_id, branch_id = %branch.id, "branch registered");
        Ok(branch.id)
    }

    #[instrument(skip(self))]
    async fn branch_report(self: &Arc<Self>, branch_id: BranchId, report: BranchReport) -> Result<(), TxError> {
        let unknown = TxError::UnknownBranch { branch_id };
        let global_id = self.registry.owner(branch_id).ok_or_else(|| unknown.clone())?;
        let Lookup::Active(entry) = self.registry.lookup(global_id) else {
            return Err(unknown);
        };

        let fail_global = {
            let mut session = entry.lock().await;
            let global_status = session.status();
            let mut branch = session.branch(branch_id).cloned().ok_or(unknown)?;

            if branch.status.is_terminal() || branch.status == report.status() {
                debug!(%global_id, %branch_id, status = ?branch.status, "report ignored");
                return Ok(());
            }
            // The local commit may have landed even though the participant saw
            // it fail. The branch keeps PhaseOneDone so rollback compensates it.
            if branch.status == BranchStatus::PhaseOneDone && report == BranchReport::Failed {
                warn!(%global_id, %branch_id, "failure reported after phase one, branch kept for compensation");
                global_status == GlobalStatus::Begin
            } else {
                branch.status = report.status();
                self.store.update_branch(&branch).await?;
                if let Some(stored) = session.branch_mut(branch_id) {
                    stored.status = branch.status;
                }

                match report {
                    BranchReport::PhaseOneDone => info!(%global_id, %branch_id, "branch finished phase one"),
                    BranchReport::Failed => warn!(%global_id, %branch_id, "branch failed phase one"),
                }
                report == BranchReport::Failed && global_status == GlobalStatus::Begin
            }
        };

        if fail_global {
            self.start_phase_two(&entry, Decision::Rollback).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        match self.registry.lookup(global_id) {
            Lookup::Active(entry) => Ok(entry.lock().await.status_response()),
            Lookup::Finished(archived) => Ok(finished_response(&archived.global)),
            Lookup::Unknown => self
                .store
                .load_global(global_id)
                .await?
                .map(|global| finished_response(&global))
                .ok_or(TxError::UnknownGlobalTransaction { global_id }),
        }
    }

    /// Commit or rollback request from the initiator.
    #[instrument(skip(self))]
    async fn conclude(self: &Arc<Self>, global_id: GlobalId, requested: Decision) -> Result<GlobalStatusResponse, TxError> {
        let entry = match self.registry.lookup(global_id) {
            Lookup::Active(entry) => entry,
            Lookup::Finished(archived) => return Ok(finished_response(&archived.global)),
            Lookup::Unknown => {
                return self
                    .finished_record(global_id)
                    .await?
                    .map(|global| finished_response(&global))
                    .ok_or(TxError::UnknownGlobalTransaction { global_id })
            }
        };

        self.start_phase_two(&entry, requested).await?;

        let mut progress = entry.subscribe();
        let finished = matches!(
            tokio::time::timeout(
                self.options.phase_two_wait,
                progress.wait_for(|status| *status == GlobalStatus::Finished),
            )
            .await,
            Ok(Ok(_))
        );
        if !finished {
            info!(%global_id, "phase two still in progress");
        }

        let response = entry.lock().await.status_response();
        Ok(response)
    }

    /// Take the phase-two decision unless one was already taken, then start
    /// delivering it. Later calls just report the current status.
    async fn start_phase_two(
        self: &Arc<Self>,
        entry: &SessionHandle,
        requested: Decision,
    ) -> Result<GlobalStatusResponse, TxError> {
        let mut session = entry.lock().await;
        if session.status() != GlobalStatus::Begin {
            return Ok(session.status_response());
        }

        let global_id = session.id();
        let decision = session.resolve(requested, Utc::now());
        if decision != requested {
            warn!(%global_id, "commit overridden: a branch failed or the deadline passed");
        }

        let previous = session.global.clone();
        let snapshot = session.decide(decision);
        if let Err(err) = self.store.update_global(&session.global).await {
            session.global = previous;
            return Err(err);
        }

        info!(%global_id, ?decision, branches = snapshot.len(), "phase two started");
        entry.publish(session.status());
        let response = session.status_response();
        drop(session);

        self.spawn_phase_two(entry.clone(), decision, snapshot);
        Ok(response)
    }

    fn spawn_phase_two(self: &Arc<Self>, entry: SessionHandle, decision: Decision, snapshot: Vec<BranchTransaction>) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.drive_phase_two(entry, decision, snapshot).await;
        });
        self.track(handle);
    }

    /// Deliver `decision` to every branch of the snapshot concurrently and
    /// archive the transaction once all of them are terminal.
    async fn drive_phase_two(&self, entry: SessionHandle, decision: Decision, snapshot: Vec<BranchTransaction>) {
        join_all(snapshot.iter().map(|branch| self.deliver(&entry, branch, decision))).await;
        self.finish(&entry, decision).await;
    }

    async fn deliver(&self, entry: &SessionHandle, branch: &BranchTransaction, decision: Decision) {
        let global_id = branch.global_id;
        let branch_id = branch.id;
        let mut attempt = 0;

        loop {
            match self.participants.decide(&branch.endpoint, branch_id, decision).await {
                Ok(ack) if ack.branch_id != branch_id => {
                    warn!(%global_id, %branch_id, acked = %ack.branch_id, "ack names another branch, ignoring it");
                }
                Ok(ack) if ack.ack && acknowledges(decision, ack.status) => {
                    debug!(%global_id, %branch_id, status = ?ack.status, "branch acknowledged");
                    self.settle(entry, branch_id, ack.status).await;
                    return;
                }
                Ok(ack) if !ack.ack && ack.status == BranchStatus::Failed => {
                    error!(
                        %global_id,
                        %branch_id,
                        endpoint = %branch.endpoint,
                        error = ack.error.as_deref().unwrap_or("unspecified"),
                        "branch cannot apply decision, operator intervention required"
                    );
                    self.settle(entry, branch_id, BranchStatus::Failed).await;
                    return;
                }
                Ok(ack) => {
                    warn!(%global_id, %branch_id, ack = ack.ack, status = ?ack.status, "unexpected ack");
                }
                Err(err @ TxError::UndoLogReplayFailed { .. }) => {
                    error!(%global_id, %branch_id, error = %err, "compensation failed, operator intervention required");
                    self.settle(entry, branch_id, BranchStatus::Failed).await;
                    return;
                }
                Err(err) => {
                    warn!(%global_id, %branch_id, attempt, error = %err, "decision delivery failed");
                }
            }

            if attempt == 0 && decision == Decision::Commit {
                self.mark_commit_retrying(entry).await;
            }
            let delay = self.options.retry.delay_for_attempt(attempt);
            debug!(%global_id, %branch_id, attempt, delay_ms = delay.as_millis() as u64, "retrying decision");
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn settle(&self, entry: &SessionHandle, branch_id: BranchId, status: BranchStatus) {
        let mut session = entry.lock().await;
        match self.registry.mark_terminal(&mut session, branch_id, status) {
            Ok(branch) => {
                if let Err(err) = self.store.update_branch(&branch).await {
                    warn!(%branch_id, error = %err, "failed to persist branch outcome");
                }
            }
            Err(err) => warn!(%branch_id, error = %err, "failed to record branch outcome"),
        }
    }

    async fn mark_commit_retrying(&self, entry: &SessionHandle) {
        let mut session = entry.lock().await;
        if session.status() != GlobalStatus::Committing {
            return;
        }
        session.global.status = GlobalStatus::CommitRetrying;
        if let Err(err) = self.store.update_global(&session.global).await {
            warn!(global_id = %session.id(), error = %err, "failed to persist commit retry status");
        }
        entry.publish(session.status());
    }

    async fn finish(&self, entry: &SessionHandle, decision: Decision) {
        let mut session = entry.lock().await;
        let global_id = session.id();
        if !session.all_terminal() {
            error!(%global_id, "phase two ended with unfinished branches");
            return;
        }

        if decision == Decision::Rollback && session.status() != GlobalStatus::RolledBack {
            session.global.status = GlobalStatus::RolledBack;
            if let Err(err) = self.store.update_global(&session.global).await {
                warn!(%global_id, error = %err, "failed to persist rolled back status");
            }
            entry.publish(session.status());
        }

        session.global.status = GlobalStatus::Finished;
        session.global.outcome = Some(decision.outcome());
        let archived = session.global.clone();
        let stored = retry_with_backoff(
            &RetryPolicy {
                max_attempts: None,
                ..self.options.retry.clone()
            },
            || self.store.archive_global(&archived),
            |_| true,
        )
        .await;
        if let Err(err) = stored {
            error!(%global_id, error = %err, "failed to archive global transaction");
        }

        self.registry.archive(&session);
        entry.publish(GlobalStatus::Finished);
        info!(%global_id, outcome = ?decision.outcome(), "global transaction finished");
    }
}

#[async_trait]
impl TransactionCoordinator for Coordinator {
    async fn begin(&self, initiator: &str, name: &str, timeout: Duration) -> Result<GlobalId, TxError> {
        Coordinator::begin(self, initiator, name, timeout).await
    }

    async fn branch_register(
        &self,
        global_id: GlobalId,
        participant: &str,
        resource: &str,
        endpoint: &str,
    ) -> Result<BranchId, TxError> {
        Coordinator::branch_register(self, global_id, participant, resource, endpoint).await
    }

    async fn branch_report(&self, branch_id: BranchId, report: BranchReport) -> Result<(), TxError> {
        Coordinator::branch_report(self, branch_id, report).await
    }

    async fn global_commit(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        Coordinator::global_commit(self, global_id).await
    }

    async fn global_rollback(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        Coordinator::global_rollback(self, global_id).await
    }

    async fn query(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        Coordinator::query(self, global_id).await
    }
}
