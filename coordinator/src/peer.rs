use std::time::Duration;

use async_trait::async_trait;
use core_2pc::{BranchId, DecideRequest, DecideResponse, Decision, ErrorBody, ParticipantClient, TxError};

/// Delivers phase-two decisions to participants' `/branch/decide` endpoints.
#[derive(Debug, Clone)]
pub struct HttpParticipantClient {
    http: reqwest::Client,
}

impl HttpParticipantClient {
    pub fn new(request_timeout: Duration) -> Result<Self, TxError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TxError::protocol(format!("failed to build http client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ParticipantClient for HttpParticipantClient {
    async fn decide(
        &self,
        endpoint: &str,
        branch_id: BranchId,
        decision: Decision,
    ) -> Result<DecideResponse, TxError> {
        let unreachable = |reason: String| TxError::ParticipantUnreachable {
            endpoint: endpoint.to_string(),
            reason,
        };

        let response = self
            .http
            .post(format!("{}/branch/decide", endpoint.trim_end_matches('/')))
            .json(&DecideRequest { branch_id, decision })
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| TxError::protocol(format!("malformed decide ack from {endpoint}: {e}")));
        }

        // Anything but an explicit escalation is worth another attempt.
        match response.json::<ErrorBody>().await {
            Ok(ErrorBody {
                error: Some(err @ TxError::UndoLogReplayFailed { .. }),
                ..
            }) => Err(err),
            Ok(body) => Err(unreachable(format!("{status}: {}", body.message))),
            Err(_) => Err(unreachable(status.to_string())),
        }
    }
}
