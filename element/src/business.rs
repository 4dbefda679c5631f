//! The initiating side of the purchase flow.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use core_2pc::{tm::TransactionManager, ErrorBody, GlobalId, TxError, XID_HEADER};
use serde::{de::IgnoredAny, Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{ElementError, BUSINESS_FAILURE},
    services::{CreateOrder, DecreaseBalance, DecreaseStock},
};

pub const PURCHASE_TRANSACTION: &str = "fsp-create-order";

/// Calls the business makes to the participants, carrying the global id.
#[async_trait]
pub trait PurchaseParticipants: Send + Sync {
    async fn decrease_stock(&self, global_id: GlobalId, request: DecreaseStock) -> Result<(), ElementError>;

    async fn decrease_balance(&self, global_id: GlobalId, request: DecreaseBalance) -> Result<(), ElementError>;

    async fn create_order(&self, global_id: GlobalId, request: CreateOrder) -> Result<(), ElementError>;
}

/// [`PurchaseParticipants`] over HTTP, the global id travelling in the
/// [`XID_HEADER`] header.
pub struct HttpPurchaseParticipants {
    http: reqwest::Client,
    storage_url: String,
    account_url: String,
    order_url: String,
}

impl HttpPurchaseParticipants {
    pub fn new(
        storage_url: impl Into<String>,
        account_url: impl Into<String>,
        order_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ElementError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TxError::protocol(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            storage_url: storage_url.into(),
            account_url: account_url.into(),
            order_url: order_url.into(),
        })
    }

    async fn call<B: Serialize + Sync>(
        &self,
        participant: &str,
        base_url: &str,
        path: &str,
        global_id: GlobalId,
        body: &B,
    ) -> Result<(), ElementError> {
        let url = format!("{}{path}", base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header(XID_HEADER, global_id.to_string())
            .json(body)
            .send()
            .await
            .map_err(|e| TxError::ParticipantUnreachable {
                endpoint: url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            let _: IgnoredAny = response.json().await.map_err(TxError::protocol)?;
            return Ok(());
        }

        Err(refusal(participant, status, response.json::<ErrorBody>().await.ok()))
    }
}

/// A participant's business refusal stays a business failure for the caller;
/// anything else is the participant malfunctioning.
fn refusal(participant: &str, status: reqwest::StatusCode, body: Option<ErrorBody>) -> ElementError {
    match body {
        Some(body) if body.code == BUSINESS_FAILURE => ElementError::Business(body.message),
        Some(body) => ElementError::Participant {
            participant: participant.to_string(),
            message: body.message,
        },
        None => ElementError::Participant {
            participant: participant.to_string(),
            message: status.to_string(),
        },
    }
}

#[async_trait]
impl PurchaseParticipants for HttpPurchaseParticipants {
    async fn decrease_stock(&self, global_id: GlobalId, request: DecreaseStock) -> Result<(), ElementError> {
        self.call("storage", &self.storage_url, "/storage/decrease", global_id, &request)
            .await
    }

    async fn decrease_balance(&self, global_id: GlobalId, request: DecreaseBalance) -> Result<(), ElementError> {
        self.call("account", &self.account_url, "/account/decrease", global_id, &request)
            .await
    }

    async fn create_order(&self, global_id: GlobalId, request: CreateOrder) -> Result<(), ElementError> {
        self.call("order", &self.order_url, "/order/create", global_id, &request)
            .await
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub user_id: i64,
    pub product_id: i64,
    pub count: i64,
    /// Amount in cents.
    pub money: i64,
}

impl Default for PurchaseRequest {
    /// The demo purchase: ten units of product 1 for 100.00 by user 1.
    fn default() -> Self {
        Self {
            user_id: 1,
            product_id: 1,
            count: 10,
            money: 10_000,
        }
    }
}

/// What the caller of a purchase gets to see.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PurchaseReply {
    pub success: bool,
    pub message: String,
}

impl PurchaseReply {
    pub fn from_result(result: &Result<(), ElementError>) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                message: "purchase succeeded".to_string(),
            },
            Err(err) => Self {
                success: false,
                message: format!("purchase failed: {err}"),
            },
        }
    }
}

pub struct BusinessService {
    tm: TransactionManager,
    participants: Arc<dyn PurchaseParticipants>,
    timeout: Duration,
}

impl BusinessService {
    pub fn new(tm: TransactionManager, participants: Arc<dyn PurchaseParticipants>, timeout: Duration) -> Self {
        Self {
            tm,
            participants,
            timeout,
        }
    }

    /// Decrease stock, decrease balance and create the order, in that order,
    /// as one global transaction.
    pub async fn purchase(&self, request: PurchaseRequest) -> Result<(), ElementError> {
        let participants = Arc::clone(&self.participants);

        self.tm
            .with_global_transaction(PURCHASE_TRANSACTION, self.timeout, |global_id| async move {
                info!(%global_id, ?request, "purchase started");
                participants
                    .decrease_stock(
                        global_id,
                        DecreaseStock {
                            product_id: request.product_id,
                            count: request.count,
                        },
                    )
                    .await?;
                participants
                    .decrease_balance(
                        global_id,
                        DecreaseBalance {
                            user_id: request.user_id,
                            money: request.money,
                        },
                    )
                    .await?;
                participants
                    .create_order(
                        global_id,
                        CreateOrder {
                            user_id: request.user_id,
                            product_id: request.product_id,
                            count: request.count,
                            money: request.money,
                        },
                    )
                    .await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode as ActixStatus, ResponseError};
    use reqwest::StatusCode;

    use super::*;

    fn body(code: &str, message: &str) -> ErrorBody {
        ErrorBody {
            code: code.to_string(),
            message: message.to_string(),
            error: None,
        }
    }

    #[test]
    fn business_refusal_is_not_a_gateway_error() {
        let err = refusal(
            "account",
            StatusCode::BAD_REQUEST,
            Some(body(BUSINESS_FAILURE, "insufficient balance")),
        );
        assert!(matches!(&err, ElementError::Business(message) if message == "insufficient balance"));
        assert_eq!(err.status_code(), ActixStatus::BAD_REQUEST);
        assert_eq!(
            PurchaseReply::from_result(&Err(err)).message,
            "purchase failed: insufficient balance"
        );
    }

    #[test]
    fn participant_malfunction_is_a_gateway_error() {
        let err = refusal("storage", StatusCode::INTERNAL_SERVER_ERROR, Some(body("DATABASE", "pool closed")));
        assert!(matches!(&err, ElementError::Participant { participant, .. } if participant == "storage"));
        assert_eq!(err.status_code(), ActixStatus::BAD_GATEWAY);

        let err = refusal("order", StatusCode::SERVICE_UNAVAILABLE, None);
        assert_eq!(err.to_string(), "503 Service Unavailable");
    }
}
