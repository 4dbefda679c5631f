use chrono::{DateTime, Utc};
use core_2pc::{
    BranchId, BranchStatus, BranchTransaction, Decision, GlobalId, GlobalStatus, GlobalStatusResponse,
    GlobalTransaction,
};

/// A global transaction together with its branches, in registration order.
///
/// Always accessed through the per-transaction lock held by the registry.
#[derive(Debug, Clone)]
pub struct GlobalSession {
    pub global: GlobalTransaction,
    pub branches: Vec<BranchTransaction>,
}

impl GlobalSession {
    pub fn new(global: GlobalTransaction) -> Self {
        Self {
            global,
            branches: Vec::new(),
        }
    }

    pub fn restore(global: GlobalTransaction, branches: Vec<BranchTransaction>) -> Self {
        Self { global, branches }
    }

    pub fn id(&self) -> GlobalId {
        self.global.id
    }

    pub fn status(&self) -> GlobalStatus {
        self.global.status
    }

    pub fn branch(&self, branch_id: BranchId) -> Option<&BranchTransaction> {
        self.branches.iter().find(|b| b.id == branch_id)
    }

    pub fn branch_mut(&mut self, branch_id: BranchId) -> Option<&mut BranchTransaction> {
        self.branches.iter_mut().find(|b| b.id == branch_id)
    }

    /// The decision phase two will actually carry out.
    ///
    /// Commit needs every branch to have finished phase one before the
    /// deadline. A failed branch, a branch still running its local work, or an
    /// expired deadline turns a commit request into a rollback.
    pub fn resolve(&self, requested: Decision, now: DateTime<Utc>) -> Decision {
        match requested {
            Decision::Rollback => Decision::Rollback,
            Decision::Commit if self.global.is_expired(now) => Decision::Rollback,
            Decision::Commit => {
                if self
                    .branches
                    .iter()
                    .all(|b| matches!(b.status, BranchStatus::PhaseOneDone | BranchStatus::Committed))
                {
                    Decision::Commit
                } else {
                    Decision::Rollback
                }
            }
        }
    }

    /// Leave `Begin` for the phase-two status of `decision` and freeze the set
    /// of branches that still need the decision delivered.
    pub fn decide(&mut self, decision: Decision) -> Vec<BranchTransaction> {
        self.global.decision = Some(decision);
        self.global.status = match decision {
            Decision::Commit => GlobalStatus::Committing,
            Decision::Rollback => GlobalStatus::RollbackRetrying,
        };
        self.pending()
    }

    /// Branches not yet in a terminal state.
    pub fn pending(&self) -> Vec<BranchTransaction> {
        self.branches
            .iter()
            .filter(|b| !b.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.branches.iter().all(|b| b.status.is_terminal())
    }

    pub fn status_response(&self) -> GlobalStatusResponse {
        GlobalStatusResponse {
            global_id: self.global.id,
            status: self.global.status,
            outcome: self.global.outcome,
        }
    }
}
