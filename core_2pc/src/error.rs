use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BranchId, GlobalId, GlobalStatus};

/// Failures of the global transaction protocol.
///
/// The enum is serializable so the coordinator can hand it to remote callers
/// without losing the variant; see [`crate::ErrorBody`].
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxError {
    /// The global id is not active (never begun, or already archived).
    #[error("unknown global transaction {global_id}")]
    UnknownGlobalTransaction { global_id: GlobalId },

    /// A report or decision referenced a branch id the registry never issued.
    #[error("unknown branch {branch_id}")]
    UnknownBranch { branch_id: BranchId },

    #[error("participant {participant} already enlisted resource {resource} in {global_id}")]
    DuplicateBranch {
        global_id: GlobalId,
        participant: String,
        resource: String,
    },

    /// The global transaction was already decided when the branch tried to join.
    #[error("global transaction {global_id} is {status:?}; branch registration rejected")]
    BranchRegistrationRejected {
        global_id: GlobalId,
        status: GlobalStatus,
    },

    #[error("global transaction {global_id} timed out after {timeout_ms}ms")]
    TransactionTimeout { global_id: GlobalId, timeout_ms: u64 },

    /// A commit request ended in rollback because a branch had failed or the
    /// deadline had passed.
    #[error("global transaction {global_id} was rolled back")]
    GlobalRolledBack { global_id: GlobalId },

    #[error("participant at {endpoint} unreachable: {reason}")]
    ParticipantUnreachable { endpoint: String, reason: String },

    #[error("coordinator unreachable: {reason}")]
    CoordinatorUnreachable { reason: String },

    /// Compensation could not restore the before-image. Needs an operator.
    #[error("undo log replay failed for branch {branch_id}: {reason}")]
    UndoLogReplayFailed { branch_id: BranchId, reason: String },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl TxError {
    pub fn storage(message: impl ToString) -> Self {
        Self::Storage {
            message: message.to_string(),
        }
    }

    pub fn protocol(message: impl ToString) -> Self {
        Self::Protocol {
            message: message.to_string(),
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownGlobalTransaction { .. } => "UNKNOWN_GLOBAL_TRANSACTION",
            Self::UnknownBranch { .. } => "UNKNOWN_BRANCH",
            Self::DuplicateBranch { .. } => "DUPLICATE_BRANCH",
            Self::BranchRegistrationRejected { .. } => "BRANCH_REGISTRATION_REJECTED",
            Self::TransactionTimeout { .. } => "TRANSACTION_TIMEOUT",
            Self::GlobalRolledBack { .. } => "GLOBAL_ROLLED_BACK",
            Self::ParticipantUnreachable { .. } => "PARTICIPANT_UNREACHABLE",
            Self::CoordinatorUnreachable { .. } => "COORDINATOR_UNREACHABLE",
            Self::UndoLogReplayFailed { .. } => "UNDO_LOG_REPLAY_FAILED",
            Self::Storage { .. } => "STORAGE",
            Self::Protocol { .. } => "PROTOCOL",
        }
    }

    /// Failures worth retrying with backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ParticipantUnreachable { .. }
                | Self::CoordinatorUnreachable { .. }
                | Self::Storage { .. }
        )
    }

    pub const fn http_status(&self) -> u16 {
        match self {
            Self::UnknownGlobalTransaction { .. } | Self::UnknownBranch { .. } => 404,
            Self::DuplicateBranch { .. }
            | Self::BranchRegistrationRejected { .. }
            | Self::GlobalRolledBack { .. } => 409,
            Self::TransactionTimeout { .. } => 408,
            Self::ParticipantUnreachable { .. } | Self::CoordinatorUnreachable { .. } => 503,
            Self::Protocol { .. } => 400,
            Self::UndoLogReplayFailed { .. } | Self::Storage { .. } => 500,
        }
    }
}
