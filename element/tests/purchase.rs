mod common;

use std::time::Duration;

use common::*;
use core_2pc::{BranchStatus, Decision, GlobalStatus, Outcome, Row, TxError};
use element::{
    business::PurchaseReply,
    services::{self, DecreaseStock, ORDER_CREATED, ORDER, STORAGE},
    ElementError, LocalDatabase,
};

#[tokio::test]
async fn scenario_a_every_participant_commits() {
    let harness = Harness::start(HarnessConfig::default()).await;

    let result = harness.business.purchase(purchase(10, 100)).await;
    assert_eq!(PurchaseReply::from_result(&result).message, "purchase succeeded");

    assert_eq!(harness.stock().await, Some(stock_row(10, 90)));
    assert_eq!(harness.balance().await, Some(balance_row(100, 900)));
    let order = harness.order_db.read(&ORDER, 1).await.unwrap().unwrap();
    assert_eq!(order.get("status"), Some(ORDER_CREATED));
    assert_eq!(order.get("money"), Some(100));

    let deliveries = harness.network.deliveries();
    assert_eq!(deliveries.len(), 3);
    assert!(deliveries
        .iter()
        .all(|d| d.decision == Decision::Commit && d.status == BranchStatus::Committed));
    for delivery in &deliveries {
        assert!(harness.storage_db.undo_entries(delivery.branch_id).await.unwrap().is_empty());
        assert!(harness.account_db.undo_entries(delivery.branch_id).await.unwrap().is_empty());
        assert!(harness.order_db.undo_entries(delivery.branch_id).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn repeated_decision_repeats_the_outcome_without_mutation() {
    let harness = Harness::start(HarnessConfig::default()).await;
    harness.business.purchase(purchase(10, 100)).await.unwrap();

    let stock = harness.network.deliveries_to(STORAGE_ENDPOINT)[0].clone();
    let again = harness.storage.on_decision(stock.branch_id, Decision::Commit).await.unwrap();
    assert!(again.ack);
    assert_eq!(again.status, BranchStatus::Committed);

    // Even a contradicting decision cannot move a finished branch.
    let contradicting = harness.storage.on_decision(stock.branch_id, Decision::Rollback).await.unwrap();
    assert_eq!(contradicting.status, BranchStatus::Committed);
    assert_eq!(harness.stock().await, Some(stock_row(10, 90)));
}

#[tokio::test]
async fn scenario_b_insufficient_balance_restores_stock() {
    let harness = Harness::start(HarnessConfig::default()).await;

    let result = harness.business.purchase(purchase(10, 5_000)).await;
    assert_eq!(
        PurchaseReply::from_result(&result).message,
        "purchase failed: insufficient balance"
    );
    assert!(matches!(result, Err(ElementError::Business(_))));

    assert_eq!(harness.stock().await, Some(stock_row(0, 100)));
    assert_eq!(harness.balance().await, Some(balance_row(0, 1_000)));
    assert_eq!(harness.order_db.read(&ORDER, 1).await.unwrap(), None);

    let stock = harness.network.deliveries_to(STORAGE_ENDPOINT);
    assert_eq!(stock.len(), 1);
    assert_eq!(stock[0].decision, Decision::Rollback);
    assert_eq!(stock[0].status, BranchStatus::RolledBack);
    assert!(harness.network.deliveries_to(ORDER_ENDPOINT).is_empty());
}

#[tokio::test]
async fn insufficient_stock_fails_before_any_money_moves() {
    let harness = Harness::start(HarnessConfig::default()).await;

    let result = harness.business.purchase(purchase(500, 100)).await;
    assert_eq!(
        PurchaseReply::from_result(&result).message,
        "purchase failed: insufficient stock"
    );
    assert_eq!(harness.stock().await, Some(stock_row(0, 100)));
    assert_eq!(harness.balance().await, Some(balance_row(0, 1_000)));
    assert!(harness.network.deliveries().is_empty());
}

#[tokio::test]
async fn scenario_c_coordinator_crash_before_phase_two() {
    let harness = Harness::start(HarnessConfig::default()).await;

    let global_id = harness
        .coordinator
        .begin("business", "fsp-create-order", Duration::from_millis(100))
        .await
        .unwrap();
    services::decrease_stock(
        &harness.storage,
        global_id,
        DecreaseStock {
            product_id: 1,
            count: 10,
        },
    )
    .await
    .unwrap();
    assert_eq!(harness.stock().await, Some(stock_row(10, 90)));

    let restarted = harness.restart_coordinator().await;
    restarted.spawn_timeout_sweeper();

    let finished = wait_finished(&restarted, global_id).await;
    assert_eq!(finished.outcome, Some(Outcome::RolledBack));
    assert_eq!(harness.stock().await, Some(stock_row(0, 100)));

    let branch = &restarted.branches(global_id).await.unwrap()[0];
    assert_eq!(branch.status, BranchStatus::RolledBack);
    assert!(harness.storage_db.undo_entries(branch.id).await.unwrap().is_empty());
    restarted.shutdown();
}

#[tokio::test]
async fn decided_commit_survives_an_unreachable_participant_and_a_restart() {
    let harness = Harness::start(HarnessConfig {
        phase_two_wait: Duration::from_millis(50),
        ..HarnessConfig::default()
    })
    .await;
    harness.network.set_unreachable(STORAGE_ENDPOINT, true);

    // The decision is commit, so the purchase succeeds while phase two retries.
    harness.business.purchase(purchase(10, 100)).await.unwrap();
    assert!(harness.network.deliveries_to(STORAGE_ENDPOINT).is_empty());
    assert_eq!(harness.network.deliveries().len(), 2);

    let restarted = harness.restart_coordinator().await;
    harness.network.set_unreachable(STORAGE_ENDPOINT, false);

    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(delivery) = harness.network.deliveries_to(STORAGE_ENDPOINT).pop() {
                return delivery;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(delivered.status, BranchStatus::Committed);
    assert_eq!(harness.stock().await, Some(stock_row(10, 90)));
    restarted.shutdown();
}

#[tokio::test]
async fn purchase_timeout_rolls_back_the_committed_branches() {
    let harness = Harness::start(HarnessConfig {
        purchase_timeout: Duration::from_millis(100),
        order_delay: Duration::from_millis(400),
        ..HarnessConfig::default()
    })
    .await;

    let result = harness.business.purchase(purchase(10, 100)).await;
    assert!(matches!(
        result,
        Err(ElementError::Tx(TxError::TransactionTimeout { timeout_ms: 100, .. }))
    ));

    assert_eq!(harness.stock().await, Some(stock_row(0, 100)));
    assert_eq!(harness.balance().await, Some(balance_row(0, 1_000)));
    assert_eq!(harness.order_db.read(&ORDER, 1).await.unwrap(), None);
    assert!(harness
        .network
        .deliveries()
        .iter()
        .all(|d| d.status == BranchStatus::RolledBack));
}

#[tokio::test]
async fn registration_after_timeout_is_rejected() {
    let harness = Harness::start(HarnessConfig::default()).await;

    let global_id = harness
        .coordinator
        .begin("business", "fsp-create-order", Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(harness.coordinator.expire_overdue().await, 1);
    wait_finished(&harness.coordinator, global_id).await;

    let err = services::decrease_stock(
        &harness.storage,
        global_id,
        DecreaseStock {
            product_id: 1,
            count: 10,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        ElementError::Tx(TxError::BranchRegistrationRejected {
            status: GlobalStatus::Finished,
            ..
        })
    ));
    assert_eq!(harness.stock().await, Some(stock_row(0, 100)));
}

#[tokio::test]
async fn unreplayable_compensation_is_escalated() {
    let harness = Harness::start(HarnessConfig::default()).await;

    let global_id = harness
        .coordinator
        .begin("business", "fsp-create-order", Duration::from_secs(60))
        .await
        .unwrap();
    services::decrease_stock(
        &harness.storage,
        global_id,
        DecreaseStock {
            product_id: 1,
            count: 10,
        },
    )
    .await
    .unwrap();

    // Someone else writes the row outside the global transaction.
    harness
        .storage_db
        .seed(&element::services::STORAGE, stock_row(15, 85))
        .await
        .unwrap();

    let response = harness.coordinator.global_rollback(global_id).await.unwrap();
    assert_eq!(response.status, GlobalStatus::Finished);
    assert_eq!(response.outcome, Some(Outcome::RolledBack));

    let branch = &harness.coordinator.branches(global_id).await.unwrap()[0];
    assert_eq!(branch.status, BranchStatus::Failed);
    assert_eq!(harness.stock().await, Some(stock_row(15, 85)));
    assert_eq!(harness.storage_db.undo_entries(branch.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn overlapping_globals_wait_for_the_row_and_roll_back_cleanly() {
    let harness = Harness::start(HarnessConfig::default()).await;
    let other_product = Row::new()
        .with("product_id", 2)
        .with("total", 50)
        .with("used", 0)
        .with("residue", 50);
    harness.storage_db.seed(&STORAGE, other_product).await.unwrap();

    let first = harness
        .coordinator
        .begin("business", "fsp-create-order", Duration::from_secs(60))
        .await
        .unwrap();
    let second = harness
        .coordinator
        .begin("business", "fsp-create-order", Duration::from_secs(60))
        .await
        .unwrap();
    let third = harness
        .coordinator
        .begin("business", "fsp-create-order", Duration::from_secs(60))
        .await
        .unwrap();
    let decrease = |product_id, count| DecreaseStock { product_id, count };

    services::decrease_stock(&harness.storage, first, decrease(1, 10)).await.unwrap();

    let storage = harness.storage.clone();
    let waiting = tokio::spawn(async move { services::decrease_stock(&storage, second, decrease(1, 5)).await });

    // Rows the first global does not hold stay free for others.
    services::decrease_stock(&harness.storage, third, decrease(2, 5)).await.unwrap();
    let third_done = harness.coordinator.global_commit(third).await.unwrap();
    assert_eq!(third_done.outcome, Some(Outcome::Committed));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());
    assert_eq!(harness.stock().await, Some(stock_row(10, 90)));

    let rolled_back = harness.coordinator.global_rollback(first).await.unwrap();
    assert_eq!(rolled_back.outcome, Some(Outcome::RolledBack));
    assert_eq!(
        harness.coordinator.branches(first).await.unwrap()[0].status,
        BranchStatus::RolledBack
    );

    waiting.await.unwrap().unwrap();
    let committed = harness.coordinator.global_commit(second).await.unwrap();
    assert_eq!(committed.outcome, Some(Outcome::Committed));
    assert_eq!(harness.stock().await, Some(stock_row(5, 95)));
    assert_eq!(
        harness.storage_db.read(&STORAGE, 2).await.unwrap().and_then(|row| row.get("residue")),
        Some(45)
    );
}
