use std::time::Duration;

use async_trait::async_trait;

use crate::{BranchId, BranchReport, DecideResponse, Decision, GlobalId, GlobalStatusResponse, TxError};

/// Operations the transaction coordinator offers to initiators and participants.
///
/// Implemented in process by the coordinator itself and remotely by
/// [`crate::HttpCoordinatorClient`].
#[async_trait]
pub trait TransactionCoordinator: Send + Sync {
    async fn begin(&self, initiator: &str, name: &str, timeout: Duration) -> Result<GlobalId, TxError>;

    async fn branch_register(
        &self,
        global_id: GlobalId,
        participant: &str,
        resource: &str,
        endpoint: &str,
    ) -> Result<BranchId, TxError>;

    async fn branch_report(&self, branch_id: BranchId, report: BranchReport) -> Result<(), TxError>;

    async fn global_commit(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError>;

    async fn global_rollback(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError>;

    async fn query(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError>;
}

/// Coordinator-to-participant delivery of phase-two decisions.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// `Err` means the decision may not have been applied and must be retried.
    async fn decide(
        &self,
        endpoint: &str,
        branch_id: BranchId,
        decision: Decision,
    ) -> Result<DecideResponse, TxError>;
}
