use std::time::Duration;

use actix_web::{
    get,
    http::StatusCode,
    post,
    web::{Data, Json, Path, ServiceConfig},
    HttpResponse, Responder, ResponseError,
};
use core_2pc::{
    BeginRequest, BeginResponse, ErrorBody, GlobalId, GlobalRequest, RegisterBranchRequest,
    RegisterBranchResponse, ReportBranchRequest, TxError,
};
use serde_json::json;

use crate::app_state::AppState;

/// [`TxError`] rendered as `{code, message, error}` JSON.
#[derive(Debug)]
pub struct ApiError(pub TxError);

impl From<TxError> for ApiError {
    fn from(err: TxError) -> Self {
        Self(err)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody::from(&self.0))
    }
}

type ApiResult = Result<HttpResponse, ApiError>;

pub fn configure(cfg: &mut ServiceConfig) {
    cfg.service(get_root)
        .service(begin)
        .service(commit)
        .service(rollback)
        .service(status)
        .service(branches)
        .service(register_branch)
        .service(report_branch);
}

#[get("/")]
async fn get_root() -> impl Responder {
    HttpResponse::Ok().body("transaction coordinator")
}

#[post("/global/begin")]
async fn begin(state: Data<AppState>, request: Json<BeginRequest>) -> ApiResult {
    let BeginRequest {
        initiator,
        name,
        timeout_ms,
    } = request.into_inner();
    let name = name.unwrap_or_else(|| initiator.clone());

    let global_id = state
        .coordinator
        .begin(&initiator, &name, Duration::from_millis(timeout_ms))
        .await?;
    Ok(HttpResponse::Ok().json(BeginResponse { global_id }))
}

#[post("/global/commit")]
async fn commit(state: Data<AppState>, request: Json<GlobalRequest>) -> ApiResult {
    let response = state.coordinator.global_commit(request.global_id).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/global/rollback")]
async fn rollback(state: Data<AppState>, request: Json<GlobalRequest>) -> ApiResult {
    let response = state.coordinator.global_rollback(request.global_id).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[get("/global/status/{global_id}")]
async fn status(state: Data<AppState>, global_id: Path<GlobalId>) -> ApiResult {
    let response = state.coordinator.query(global_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// Operator view of a transaction's branches.
#[get("/global/branches/{global_id}")]
async fn branches(state: Data<AppState>, global_id: Path<GlobalId>) -> ApiResult {
    let branches = state.coordinator.branches(global_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(branches))
}

#[post("/branch/register")]
async fn register_branch(state: Data<AppState>, request: Json<RegisterBranchRequest>) -> ApiResult {
    let branch_id = state
        .coordinator
        .branch_register(
            request.global_id,
            &request.participant,
            &request.resource,
            &request.endpoint,
        )
        .await?;
    Ok(HttpResponse::Ok().json(RegisterBranchResponse { branch_id }))
}

#[post("/branch/report")]
async fn report_branch(state: Data<AppState>, request: Json<ReportBranchRequest>) -> ApiResult {
    state
        .coordinator
        .branch_report(request.branch_id, request.status)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "branchId": request.branch_id })))
}
