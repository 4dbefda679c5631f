use actix_web::{
    get, post,
    web::{Data, Json, ServiceConfig},
    HttpRequest, HttpResponse, ResponseError,
};
use core_2pc::{DecideRequest, GlobalId, XID_HEADER};
use serde_json::json;

use crate::{
    app_state::{BusinessState, ParticipantState},
    business::{PurchaseReply, PurchaseRequest},
    config::Role,
    error::ElementError,
    services::{self, CreateOrder, DecreaseBalance, DecreaseStock},
};

/// Mount the routes served by `role`. Participant roles also serve
/// `/branch/decide` for the coordinator.
pub fn configure(role: Role) -> impl FnOnce(&mut ServiceConfig) {
    move |cfg| match role {
        Role::Storage => {
            cfg.service(decide).service(decrease_stock);
        }
        Role::Account => {
            cfg.service(decide).service(decrease_balance);
        }
        Role::Order => {
            cfg.service(decide).service(create_order);
        }
        Role::Business => {
            cfg.service(purchase).service(demo_purchase);
        }
    }
}

fn xid(request: &HttpRequest) -> Result<GlobalId, ElementError> {
    request
        .headers()
        .get(XID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or(ElementError::MissingXid(XID_HEADER))
}

#[post("/branch/decide")]
async fn decide(state: Data<ParticipantState>, request: Json<DecideRequest>) -> Result<HttpResponse, ElementError> {
    let response = state
        .manager
        .on_decision(request.branch_id, request.decision)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

#[post("/storage/decrease")]
async fn decrease_stock(
    state: Data<ParticipantState>,
    http: HttpRequest,
    request: Json<DecreaseStock>,
) -> Result<HttpResponse, ElementError> {
    services::decrease_stock(&state.manager, xid(&http)?, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "stock decreased" })))
}

#[post("/account/decrease")]
async fn decrease_balance(
    state: Data<ParticipantState>,
    http: HttpRequest,
    request: Json<DecreaseBalance>,
) -> Result<HttpResponse, ElementError> {
    services::decrease_balance(&state.manager, xid(&http)?, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "balance decreased" })))
}

#[post("/order/create")]
async fn create_order(
    state: Data<ParticipantState>,
    http: HttpRequest,
    request: Json<CreateOrder>,
) -> Result<HttpResponse, ElementError> {
    let order_id = services::create_order(&state.manager, xid(&http)?, request.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "orderId": order_id })))
}

async fn run_purchase(state: &BusinessState, request: PurchaseRequest) -> HttpResponse {
    let result = state.service.purchase(request).await;
    let reply = PurchaseReply::from_result(&result);
    match result {
        Ok(()) => HttpResponse::Ok().json(reply),
        Err(err) => HttpResponse::build(err.status_code()).json(reply),
    }
}

#[post("/purchase")]
async fn purchase(state: Data<BusinessState>, request: Json<PurchaseRequest>) -> HttpResponse {
    run_purchase(&state, request.into_inner()).await
}

/// The fixed demo purchase.
#[get("/purchase")]
async fn demo_purchase(state: Data<BusinessState>) -> HttpResponse {
    run_purchase(&state, PurchaseRequest::default()).await
}
