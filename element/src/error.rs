use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use core_2pc::{BranchId, ErrorBody, TxError};
use thiserror::Error;

pub const BUSINESS_FAILURE: &str = "BUSINESS_FAILURE";

#[derive(Debug, Error)]
pub enum ElementError {
    /// A business rule refused the operation, e.g. insufficient stock.
    #[error("{0}")]
    Business(String),

    /// A participant called by the initiator answered with an error.
    #[error("{message}")]
    Participant { participant: String, message: String },

    /// The row changed between the read and the local commit.
    #[error("write conflict on {table} key {key}")]
    Conflict { table: String, key: i64 },

    /// Another branch committed this row locally and has not finished phase
    /// two yet.
    #[error("{table} key {key} is locked by branch {holder}")]
    RowLocked { table: String, key: i64, holder: BranchId },

    /// Phase two already reached this branch; its local work is refused.
    #[error("branch {0} already finished")]
    BranchFinished(BranchId),

    #[error("missing or malformed {0} header")]
    MissingXid(&'static str),

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Tx(#[from] TxError),
}

impl ElementError {
    pub fn database(err: impl ToString) -> Self {
        Self::Database(err.to_string())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Business(_) => BUSINESS_FAILURE,
            Self::Participant { .. } => "PARTICIPANT_FAILURE",
            Self::Conflict { .. } => "WRITE_CONFLICT",
            Self::RowLocked { .. } => "ROW_LOCKED",
            Self::BranchFinished(_) => "BRANCH_FINISHED",
            Self::MissingXid(_) => "MISSING_XID",
            Self::Database(_) => "DATABASE",
            Self::Tx(err) => err.code(),
        }
    }
}

impl ResponseError for ElementError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Business(_) | Self::MissingXid(_) => StatusCode::BAD_REQUEST,
            Self::Conflict { .. } | Self::RowLocked { .. } | Self::BranchFinished(_) => StatusCode::CONFLICT,
            Self::Participant { .. } => StatusCode::BAD_GATEWAY,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Tx(err) => StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            Self::Tx(err) => ErrorBody::from(err),
            other => ErrorBody {
                code: other.code().to_string(),
                message: other.to_string(),
                error: None,
            },
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}
