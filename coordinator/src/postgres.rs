use async_trait::async_trait;
use core_2pc::{BranchId, BranchTransaction, GlobalId, GlobalTransaction, TxError};
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use crate::store::TransactionStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS global_transaction (
        global_id UUID PRIMARY KEY,
        initiator TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        decision TEXT,
        outcome TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        deadline TIMESTAMPTZ NOT NULL
    );
    CREATE TABLE IF NOT EXISTS branch_transaction (
        seq BIGSERIAL,
        branch_id UUID PRIMARY KEY,
        global_id UUID NOT NULL REFERENCES global_transaction (global_id),
        participant TEXT NOT NULL,
        resource TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        status TEXT NOT NULL,
        registered_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS branch_transaction_global_idx
        ON branch_transaction (global_id, seq);
";

/// [`TransactionStore`] over PostgreSQL.
pub struct PostgresTransactionStore {
    pool: Pool,
}

impl PostgresTransactionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), TxError> {
        let client = self.client().await?;
        client.batch_execute(SCHEMA).await.map_err(TxError::storage)
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, TxError> {
        self.pool.get().await.map_err(TxError::storage)
    }
}

fn global_from_row(row: &Row) -> Result<GlobalTransaction, TxError> {
    let parse_opt = |column: &str| -> Result<Option<String>, TxError> {
        row.try_get::<_, Option<String>>(column).map_err(TxError::storage)
    };

    Ok(GlobalTransaction {
        id: GlobalId::from_uuid(row.try_get("global_id").map_err(TxError::storage)?),
        initiator: row.try_get("initiator").map_err(TxError::storage)?,
        name: row.try_get("name").map_err(TxError::storage)?,
        status: row
            .try_get::<_, String>("status")
            .map_err(TxError::storage)?
            .parse()
            .map_err(TxError::storage)?,
        decision: parse_opt("decision")?
            .map(|d| d.parse())
            .transpose()
            .map_err(TxError::storage)?,
        outcome: parse_opt("outcome")?
            .map(|o| o.parse())
            .transpose()
            .map_err(TxError::storage)?,
        created_at: row.try_get("created_at").map_err(TxError::storage)?,
        deadline: row.try_get("deadline").map_err(TxError::storage)?,
    })
}

fn branch_from_row(row: &Row) -> Result<BranchTransaction, TxError> {
    Ok(BranchTransaction {
        id: BranchId::from_uuid(row.try_get("branch_id").map_err(TxError::storage)?),
        global_id: GlobalId::from_uuid(row.try_get("global_id").map_err(TxError::storage)?),
        participant: row.try_get("participant").map_err(TxError::storage)?,
        resource: row.try_get("resource").map_err(TxError::storage)?,
        endpoint: row.try_get("endpoint").map_err(TxError::storage)?,
        status: row
            .try_get::<_, String>("status")
            .map_err(TxError::storage)?
            .parse()
            .map_err(TxError::storage)?,
        registered_at: row.try_get("registered_at").map_err(TxError::storage)?,
    })
}

#[async_trait]
impl TransactionStore for PostgresTransactionStore {
    async fn insert_global(&self, global: &GlobalTransaction) -> Result<(), TxError> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO global_transaction
                    (global_id, initiator, name, status, decision, outcome, created_at, deadline)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &global.id.as_uuid(),
                    &global.initiator,
                    &global.name,
                    &global.status.as_str(),
                    &global.decision.map(|d| d.as_str()),
                    &global.outcome.map(|o| o.as_str()),
                    &global.created_at,
                    &global.deadline,
                ],
            )
            .await
            .map_err(TxError::storage)?;
        Ok(())
    }

    async fn update_global(&self, global: &GlobalTransaction) -> Result<(), TxError> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE global_transaction SET status = $2, decision = $3, outcome = $4
                 WHERE global_id = $1",
                &[
                    &global.id.as_uuid(),
                    &global.status.as_str(),
                    &global.decision.map(|d| d.as_str()),
                    &global.outcome.map(|o| o.as_str()),
                ],
            )
            .await
            .map_err(TxError::storage)?;
        if updated == 0 {
            return Err(TxError::storage(format!("global transaction {} not stored", global.id)));
        }
        Ok(())
    }

    async fn insert_branch(&self, branch: &BranchTransaction) -> Result<(), TxError> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO branch_transaction
                    (branch_id, global_id, participant, resource, endpoint, status, registered_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &branch.id.as_uuid(),
                    &branch.global_id.as_uuid(),
                    &branch.participant,
                    &branch.resource,
                    &branch.endpoint,
                    &branch.status.as_str(),
                    &branch.registered_at,
                ],
            )
            .await
            .map_err(TxError::storage)?;
        Ok(())
    }

    async fn update_branch(&self, branch: &BranchTransaction) -> Result<(), TxError> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE branch_transaction SET status = $2 WHERE branch_id = $1",
                &[&branch.id.as_uuid(), &branch.status.as_str()],
            )
            .await
            .map_err(TxError::storage)?;
        if updated == 0 {
            return Err(TxError::storage(format!("branch {} not stored", branch.id)));
        }
        Ok(())
    }

    async fn archive_global(&self, global: &GlobalTransaction) -> Result<(), TxError> {
        let mut client = self.client().await?;
        let transaction = client.transaction().await.map_err(TxError::storage)?;

        transaction
            .execute(
                "DELETE FROM branch_transaction WHERE global_id = $1",
                &[&global.id.as_uuid()],
            )
            .await
            .map_err(TxError::storage)?;
        transaction
            .execute(
                "UPDATE global_transaction SET status = $2, decision = $3, outcome = $4
                 WHERE global_id = $1",
                &[
                    &global.id.as_uuid(),
                    &global.status.as_str(),
                    &global.decision.map(|d| d.as_str()),
                    &global.outcome.map(|o| o.as_str()),
                ],
            )
            .await
            .map_err(TxError::storage)?;

        transaction.commit().await.map_err(TxError::storage)
    }

    async fn load_active(&self) -> Result<Vec<(GlobalTransaction, Vec<BranchTransaction>)>, TxError> {
        let client = self.client().await?;
        let globals = client
            .query(
                "SELECT global_id, initiator, name, status, decision, outcome, created_at, deadline
                 FROM global_transaction WHERE status <> 'Finished' ORDER BY created_at",
                &[],
            )
            .await
            .map_err(TxError::storage)?;

        let mut active = Vec::with_capacity(globals.len());
        for row in &globals {
            let global = global_from_row(row)?;
            let branches = client
                .query(
                    "SELECT branch_id, global_id, participant, resource, endpoint, status, registered_at
                     FROM branch_transaction WHERE global_id = $1 ORDER BY seq",
                    &[&global.id.as_uuid()],
                )
                .await
                .map_err(TxError::storage)?
                .iter()
                .map(branch_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            active.push((global, branches));
        }
        Ok(active)
    }

    async fn load_global(&self, global_id: GlobalId) -> Result<Option<GlobalTransaction>, TxError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT global_id, initiator, name, status, decision, outcome, created_at, deadline
                 FROM global_transaction WHERE global_id = $1",
                &[&global_id.as_uuid()],
            )
            .await
            .map_err(TxError::storage)?;

        row.as_ref().map(global_from_row).transpose()
    }
}
