use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    BeginRequest, BeginResponse, BranchId, BranchReport, ErrorBody, GlobalId, GlobalRequest,
    GlobalStatusResponse, RegisterBranchRequest, RegisterBranchResponse, ReportBranchRequest,
    TransactionCoordinator, TxError,
};

/// Talks to a remote coordinator over its HTTP/JSON surface.
#[derive(Debug, Clone)]
pub struct HttpCoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, TxError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TxError::protocol(format!("failed to build http client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, TxError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(unreachable)?;

        decode(response).await
    }

    async fn get<Resp: DeserializeOwned>(&self, path: &str) -> Result<Resp, TxError> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(unreachable)?;

        decode(response).await
    }
}

fn unreachable(err: reqwest::Error) -> TxError {
    TxError::CoordinatorUnreachable {
        reason: err.to_string(),
    }
}

async fn decode<Resp: DeserializeOwned>(response: reqwest::Response) -> Result<Resp, TxError> {
    if response.status().is_success() {
        return response.json().await.map_err(TxError::protocol);
    }

    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(ErrorBody { error: Some(err), .. }) => Err(err),
        Ok(body) => Err(TxError::protocol(format!("{status}: {}", body.message))),
        Err(e) => Err(TxError::protocol(format!("{status}: undecodable error body: {e}"))),
    }
}

#[async_trait]
impl TransactionCoordinator for HttpCoordinatorClient {
    async fn begin(&self, initiator: &str, name: &str, timeout: Duration) -> Result<GlobalId, TxError> {
        let request = BeginRequest {
            initiator: initiator.to_string(),
            name: Some(name.to_string()),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let response: BeginResponse = self.post("/global/begin", &request).await?;
        Ok(response.global_id)
    }

    async fn branch_register(
        &self,
        global_id: GlobalId,
        participant: &str,
        resource: &str,
        endpoint: &str,
    ) -> Result<BranchId, TxError> {
        let request = RegisterBranchRequest {
            global_id,
            participant: participant.to_string(),
            resource: resource.to_string(),
            endpoint: endpoint.to_string(),
        };
        let response: RegisterBranchResponse = self.post("/branch/register", &request).await?;
        Ok(response.branch_id)
    }

    async fn branch_report(&self, branch_id: BranchId, report: BranchReport) -> Result<(), TxError> {
        let request = ReportBranchRequest {
            branch_id,
            status: report,
        };
        let _: serde::de::IgnoredAny = self.post("/branch/report", &request).await?;
        Ok(())
    }

    async fn global_commit(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        self.post("/global/commit", &GlobalRequest { global_id }).await
    }

    async fn global_rollback(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        self.post("/global/rollback", &GlobalRequest { global_id }).await
    }

    async fn query(&self, global_id: GlobalId) -> Result<GlobalStatusResponse, TxError> {
        self.get(&format!("/global/status/{global_id}")).await
    }
}
