use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use coordinator::{Coordinator, CoordinatorOptions, MemoryTransactionStore, TransactionStore};
use core_2pc::{
    retry::RetryPolicy, BranchId, BranchReport, BranchStatus, DecideResponse, Decision, GlobalId, GlobalStatus,
    GlobalStatusResponse, Outcome, ParticipantClient, TxError,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Behavior {
    Ack,
    Unreachable,
    CannotCompensate,
}

/// Participant double answering `decide` per endpoint.
#[derive(Default)]
struct ScriptedParticipants {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<(String, Decision)>>,
}

impl ScriptedParticipants {
    fn set(&self, endpoint: &str, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(endpoint.to_string(), behavior);
    }

    fn calls(&self) -> Vec<(String, Decision)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_to(&self, endpoint: &str) -> usize {
        self.calls().iter().filter(|(e, _)| e == endpoint).count()
    }
}

#[async_trait]
impl ParticipantClient for ScriptedParticipants {
    async fn decide(&self, endpoint: &str, branch_id: BranchId, decision: Decision) -> Result<DecideResponse, TxError> {
        self.calls.lock().unwrap().push((endpoint.to_string(), decision));
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(endpoint)
            .copied()
            .unwrap_or(Behavior::Ack);

        match behavior {
            Behavior::Ack => Ok(DecideResponse::acked(
                branch_id,
                match decision {
                    Decision::Commit => BranchStatus::Committed,
                    Decision::Rollback => BranchStatus::RolledBack,
                },
            )),
            Behavior::Unreachable => Err(TxError::ParticipantUnreachable {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            }),
            Behavior::CannotCompensate => Err(TxError::UndoLogReplayFailed {
                branch_id,
                reason: "row changed since phase one".to_string(),
            }),
        }
    }
}

fn options(phase_two_wait: Duration) -> CoordinatorOptions {
    CoordinatorOptions {
        default_timeout: Duration::from_secs(60),
        retry: RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
        phase_two_wait,
        sweep_interval: Duration::from_millis(20),
    }
}

fn coordinator_over(
    store: &MemoryTransactionStore,
    participants: &Arc<ScriptedParticipants>,
    phase_two_wait: Duration,
) -> Coordinator {
    Coordinator::new(Arc::new(store.clone()), participants.clone(), options(phase_two_wait))
}

async fn enlist(coordinator: &Coordinator, global_id: GlobalId, participants: &[&str]) -> Vec<BranchId> {
    let mut branches = Vec::new();
    for participant in participants {
        let branch_id = coordinator
            .branch_register(global_id, participant, "db", participant)
            .await
            .unwrap();
        branches.push(branch_id);
    }
    branches
}

async fn finish_phase_one(coordinator: &Coordinator, branches: &[BranchId]) {
    for branch_id in branches {
        coordinator
            .branch_report(*branch_id, BranchReport::PhaseOneDone)
            .await
            .unwrap();
    }
}

async fn wait_finished(coordinator: &Coordinator, global_id: GlobalId) -> GlobalStatusResponse {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = coordinator.query(global_id).await.unwrap();
            if status.is_finished() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("global transaction did not finish")
}

async fn branch_statuses(coordinator: &Coordinator, global_id: GlobalId) -> Vec<BranchStatus> {
    coordinator
        .branches(global_id)
        .await
        .unwrap()
        .iter()
        .map(|b| b.status)
        .collect()
}

#[tokio::test]
async fn commit_reaches_every_branch_in_registration_order() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    let coordinator = coordinator_over(&store, &participants, Duration::from_secs(2));

    let global_id = coordinator.begin("business", "fsp-create-order", Duration::from_secs(60)).await.unwrap();
    let branches = enlist(&coordinator, global_id, &["storage", "account", "order"]).await;
    finish_phase_one(&coordinator, &branches).await;

    let response = coordinator.global_commit(global_id).await.unwrap();
    assert_eq!(response.status, GlobalStatus::Finished);
    assert_eq!(response.outcome, Some(Outcome::Committed));

    let endpoints: Vec<_> = participants.calls().into_iter().map(|(e, _)| e).collect();
    assert_eq!(endpoints, ["storage", "account", "order"]);
    assert_eq!(branch_statuses(&coordinator, global_id).await, [BranchStatus::Committed; 3]);
    assert!(store.load_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_decisions_return_the_settled_outcome() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    let coordinator = coordinator_over(&store, &participants, Duration::from_secs(2));

    let global_id = coordinator.begin("business", "fsp-create-order", Duration::from_secs(60)).await.unwrap();
    let branches = enlist(&coordinator, global_id, &["storage"]).await;
    finish_phase_one(&coordinator, &branches).await;

    let first = coordinator.global_commit(global_id).await.unwrap();
    let second = coordinator.global_commit(global_id).await.unwrap();
    let late_rollback = coordinator.global_rollback(global_id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(late_rollback.outcome, Some(Outcome::Committed));
    assert_eq!(participants.calls_to("storage"), 1);
}

#[tokio::test]
async fn failed_branch_report_rolls_back_and_overrides_commit() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    let coordinator = coordinator_over(&store, &participants, Duration::from_secs(2));

    let global_id = coordinator.begin("business", "fsp-create-order", Duration::from_secs(60)).await.unwrap();
    let branches = enlist(&coordinator, global_id, &["storage", "account"]).await;
    finish_phase_one(&coordinator, &branches[..1]).await;
    coordinator.branch_report(branches[1], BranchReport::Failed).await.unwrap();

    let response = coordinator.global_commit(global_id).await.unwrap();
    assert_eq!(response.status, GlobalStatus::Finished);
    assert_eq!(response.outcome, Some(Outcome::RolledBack));
    assert_eq!(
        branch_statuses(&coordinator, global_id).await,
        [BranchStatus::RolledBack, BranchStatus::Failed]
    );
    assert_eq!(participants.calls(), [("storage".to_string(), Decision::Rollback)]);
}

#[tokio::test]
async fn failure_reported_after_phase_one_still_compensates_the_branch() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    let coordinator = coordinator_over(&store, &participants, Duration::from_secs(2));

    let global_id = coordinator.begin("business", "fsp-create-order", Duration::from_secs(60)).await.unwrap();
    let branches = enlist(&coordinator, global_id, &["storage"]).await;
    finish_phase_one(&coordinator, &branches).await;
    coordinator.branch_report(branches[0], BranchReport::Failed).await.unwrap();

    let response = wait_finished(&coordinator, global_id).await;
    assert_eq!(response.outcome, Some(Outcome::RolledBack));
    assert_eq!(branch_statuses(&coordinator, global_id).await, [BranchStatus::RolledBack]);
    assert_eq!(participants.calls(), [("storage".to_string(), Decision::Rollback)]);
}

#[tokio::test]
async fn commit_with_unfinished_branch_rolls_back() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    let coordinator = coordinator_over(&store, &participants, Duration::from_secs(2));

    let global_id = coordinator.begin("business", "fsp-create-order", Duration::from_secs(60)).await.unwrap();
    let branches = enlist(&coordinator, global_id, &["storage", "account"]).await;
    finish_phase_one(&coordinator, &branches[..1]).await;

    let response = coordinator.global_commit(global_id).await.unwrap();
    assert_eq!(response.outcome, Some(Outcome::RolledBack));
    assert!(participants.calls().iter().all(|(_, d)| *d == Decision::Rollback));
}

#[tokio::test]
async fn unreachable_branch_is_retried_until_it_acknowledges() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    participants.set("account", Behavior::Unreachable);
    let coordinator = coordinator_over(&store, &participants, Duration::from_millis(50));

    let global_id = coordinator.begin("business", "fsp-create-order", Duration::from_secs(60)).await.unwrap();
    let branches = enlist(&coordinator, global_id, &["storage", "account"]).await;
    finish_phase_one(&coordinator, &branches).await;

    let response = coordinator.global_commit(global_id).await.unwrap();
    assert_eq!(response.status, GlobalStatus::CommitRetrying);
    assert!(response.is_commit());
    assert_eq!(
        branch_statuses(&coordinator, global_id).await,
        [BranchStatus::Committed, BranchStatus::PhaseOneDone]
    );

    participants.set("account", Behavior::Ack);
    let finished = wait_finished(&coordinator, global_id).await;
    assert_eq!(finished.outcome, Some(Outcome::Committed));
    assert!(participants.calls_to("account") > 1);
    assert_eq!(participants.calls_to("storage"), 1);
}

#[tokio::test]
async fn rolled_back_branches_settle_independently() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    participants.set("storage", Behavior::Unreachable);
    let coordinator = coordinator_over(&store, &participants, Duration::from_millis(50));

    let global_id = coordinator.begin("business", "fsp-create-order", Duration::from_secs(60)).await.unwrap();
    let branches = enlist(&coordinator, global_id, &["storage", "account"]).await;
    finish_phase_one(&coordinator, &branches).await;

    let response = coordinator.global_rollback(global_id).await.unwrap();
    assert_eq!(response.status, GlobalStatus::RollbackRetrying);
    // The later branch is compensated while the earlier one is still unreachable.
    assert_eq!(
        branch_statuses(&coordinator, global_id).await,
        [BranchStatus::PhaseOneDone, BranchStatus::RolledBack]
    );

    participants.set("storage", Behavior::Ack);
    let finished = wait_finished(&coordinator, global_id).await;
    assert_eq!(finished.outcome, Some(Outcome::RolledBack));
}

#[tokio::test]
async fn failed_compensation_is_escalated_and_does_not_block_finish() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    participants.set("storage", Behavior::CannotCompensate);
    let coordinator = coordinator_over(&store, &participants, Duration::from_secs(2));

    let global_id = coordinator.begin("business", "fsp-create-order", Duration::from_secs(60)).await.unwrap();
    let branches = enlist(&coordinator, global_id, &["storage", "account"]).await;
    finish_phase_one(&coordinator, &branches).await;

    let response = coordinator.global_rollback(global_id).await.unwrap();
    assert_eq!(response.status, GlobalStatus::Finished);
    assert_eq!(
        branch_statuses(&coordinator, global_id).await,
        [BranchStatus::Failed, BranchStatus::RolledBack]
    );
    assert_eq!(participants.calls_to("storage"), 1);
}

#[tokio::test]
async fn overdue_transaction_is_rolled_back_and_then_closed_to_registration() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    let coordinator = coordinator_over(&store, &participants, Duration::from_secs(2));

    let global_id = coordinator.begin("business", "fsp-create-order", Duration::from_millis(30)).await.unwrap();
    let branches = enlist(&coordinator, global_id, &["storage"]).await;
    finish_phase_one(&coordinator, &branches).await;

    assert_eq!(coordinator.expire_overdue().await, 0);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(coordinator.expire_overdue().await, 1);

    let finished = wait_finished(&coordinator, global_id).await;
    assert_eq!(finished.outcome, Some(Outcome::RolledBack));

    let err = coordinator
        .branch_register(global_id, "order", "db", "order")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TxError::BranchRegistrationRejected {
            status: GlobalStatus::Finished,
            ..
        }
    ));
}

#[tokio::test]
async fn sweeper_task_expires_transactions_in_the_background() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    let coordinator = coordinator_over(&store, &participants, Duration::from_secs(2));
    coordinator.spawn_timeout_sweeper();

    let global_id = coordinator.begin("business", "fsp-create-order", Duration::from_millis(30)).await.unwrap();
    enlist(&coordinator, global_id, &["storage"]).await;

    let finished = wait_finished(&coordinator, global_id).await;
    assert_eq!(finished.outcome, Some(Outcome::RolledBack));
    assert_eq!(participants.calls(), [("storage".to_string(), Decision::Rollback)]);
    coordinator.shutdown();
}

#[tokio::test]
async fn restarted_coordinator_drives_pending_commit_to_the_end() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    participants.set("storage", Behavior::Unreachable);
    let crashed = coordinator_over(&store, &participants, Duration::from_millis(30));

    let global_id = crashed.begin("business", "fsp-create-order", Duration::from_secs(60)).await.unwrap();
    let branches = enlist(&crashed, global_id, &["storage", "account"]).await;
    finish_phase_one(&crashed, &branches).await;
    let response = crashed.global_commit(global_id).await.unwrap();
    assert_eq!(response.status, GlobalStatus::CommitRetrying);
    crashed.shutdown();

    participants.set("storage", Behavior::Ack);
    let restarted = Coordinator::recover(
        Arc::new(store.clone()),
        participants.clone(),
        options(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    let finished = wait_finished(&restarted, global_id).await;
    assert_eq!(finished.outcome, Some(Outcome::Committed));
    assert_eq!(
        branch_statuses(&restarted, global_id).await,
        [BranchStatus::Committed, BranchStatus::Committed]
    );
    assert!(store.branch_rows(global_id).is_empty());
}

#[tokio::test]
async fn finished_transactions_stay_queryable_after_restart() {
    let store = MemoryTransactionStore::new();
    let participants = Arc::new(ScriptedParticipants::default());
    let first = coordinator_over(&store, &participants, Duration::from_secs(2));

    let global_id = first.begin("business", "fsp-create-order", Duration::from_secs(60)).await.unwrap();
    first.global_rollback(global_id).await.unwrap();

    let restarted = Coordinator::recover(Arc::new(store.clone()), participants.clone(), options(Duration::from_secs(2)))
        .await
        .unwrap();
    let status = restarted.query(global_id).await.unwrap();
    assert_eq!(status.outcome, Some(Outcome::RolledBack));
    assert!(matches!(
        restarted.branch_register(global_id, "storage", "db", "storage").await,
        Err(TxError::BranchRegistrationRejected { .. })
    ));
    assert!(matches!(
        restarted.query(GlobalId::new()).await,
        Err(TxError::UnknownGlobalTransaction { .. })
    ));
}
