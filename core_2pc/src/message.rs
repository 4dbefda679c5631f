use serde::{Deserialize, Serialize};

use crate::{BranchId, BranchStatus, Decision, GlobalId, GlobalStatus, Outcome, TxError};

/// Header carrying the global transaction id from the initiator to participants.
pub const XID_HEADER: &str = "TX_XID";

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BeginRequest {
    pub initiator: String,
    #[serde(default)]
    pub name: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BeginResponse {
    pub global_id: GlobalId,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRequest {
    pub global_id: GlobalId,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStatusResponse {
    pub global_id: GlobalId,
    pub status: GlobalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl GlobalStatusResponse {
    /// Whether the coordinator has settled on commit, even if phase two is still running.
    pub fn is_commit(&self) -> bool {
        match self.status {
            GlobalStatus::Finished => self.outcome == Some(Outcome::Committed),
            status => status.decision() == Some(Decision::Commit),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == GlobalStatus::Finished
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBranchRequest {
    pub global_id: GlobalId,
    pub participant: String,
    pub resource: String,
    pub endpoint: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBranchResponse {
    pub branch_id: BranchId,
}

/// Phase-one result a participant reports for its branch.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum BranchReport {
    PhaseOneDone,
    Failed,
}

impl BranchReport {
    pub const fn status(&self) -> BranchStatus {
        match self {
            Self::PhaseOneDone => BranchStatus::PhaseOneDone,
            Self::Failed => BranchStatus::Failed,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReportBranchRequest {
    pub branch_id: BranchId,
    pub status: BranchReport,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DecideRequest {
    pub branch_id: BranchId,
    pub decision: Decision,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DecideResponse {
    pub branch_id: BranchId,
    pub ack: bool,
    pub status: BranchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DecideResponse {
    pub fn acked(branch_id: BranchId, status: BranchStatus) -> Self {
        Self {
            branch_id,
            ack: true,
            status,
            error: None,
        }
    }

    /// A decision the participant could not apply and will not apply on retry.
    pub fn escalated(branch_id: BranchId, error: impl Into<String>) -> Self {
        Self {
            branch_id,
            ack: false,
            status: BranchStatus::Failed,
            error: Some(error.into()),
        }
    }
}

/// Error payload shared by every HTTP surface in the workspace.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TxError>,
}

impl From<&TxError> for ErrorBody {
    fn from(err: &TxError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            error: Some(err.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_camel_case() {
        let request = BeginRequest {
            initiator: "business".to_string(),
            name: None,
            timeout_ms: 500,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["timeoutMs"], 500);

        let report: ReportBranchRequest = serde_json::from_value(serde_json::json!({
            "branchId": BranchId::new(),
            "status": "Failed",
        }))
        .unwrap();
        assert_eq!(report.status, BranchReport::Failed);
    }

    #[test]
    fn in_flight_commit_counts_as_commit() {
        let mut response = GlobalStatusResponse {
            global_id: GlobalId::new(),
            status: GlobalStatus::CommitRetrying,
            outcome: None,
        };
        assert!(response.is_commit());

        response.status = GlobalStatus::Finished;
        response.outcome = Some(Outcome::RolledBack);
        assert!(!response.is_commit());
        assert!(response.is_finished());
    }

    #[test]
    fn error_body_keeps_the_typed_error() {
        let err = TxError::UnknownGlobalTransaction {
            global_id: GlobalId::new(),
        };
        let body = ErrorBody::from(&err);
        let decoded: ErrorBody = serde_json::from_str(&serde_json::to_string(&body).unwrap()).unwrap();

        assert_eq!(decoded.code, "UNKNOWN_GLOBAL_TRANSACTION");
        assert_eq!(decoded.error, Some(err));
    }
}
