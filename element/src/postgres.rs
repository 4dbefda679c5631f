use async_trait::async_trait;
use chrono::Utc;
use core_2pc::{BranchId, BranchStatus, Decision, Row, TableRef, UndoLogEntry};
use deadpool_postgres::Pool;
use tokio_postgres::{types::ToSql, Transaction};

use crate::{
    error::ElementError,
    local_store::{replay_failed, row_key, tombstone, LocalDatabase},
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS undo_log (
        branch_id UUID NOT NULL,
        sequence BIGINT NOT NULL,
        payload BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (branch_id, sequence)
    );
    CREATE TABLE IF NOT EXISTS branch_log (
        branch_id UUID PRIMARY KEY,
        status TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    );
    CREATE TABLE IF NOT EXISTS row_lock (
        table_name TEXT NOT NULL,
        row_key BIGINT NOT NULL,
        branch_id UUID NOT NULL,
        PRIMARY KEY (table_name, row_key)
    );
";

/// [`LocalDatabase`] over PostgreSQL. Business tables hold `BIGINT` columns
/// only and are created by [`PostgresDatabase::migrate`].
pub struct PostgresDatabase {
    pool: Pool,
    tables: Vec<TableRef>,
}

fn table_ddl(table: &TableRef) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            if *column == table.key_column {
                format!("{column} BIGINT PRIMARY KEY")
            } else {
                format!("{column} BIGINT NOT NULL")
            }
        })
        .collect();
    format!("CREATE TABLE IF NOT EXISTS {} ({});", table.name, columns.join(", "))
}

async fn select_row(
    tx: &Transaction<'_>,
    table: &TableRef,
    key: i64,
    for_update: bool,
) -> Result<Option<Row>, ElementError> {
    let query = format!(
        "SELECT {} FROM {} WHERE {} = $1{}",
        table.columns.join(", "),
        table.name,
        table.key_column,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row = tx.query_opt(&query, &[&key]).await.map_err(ElementError::database)?;

    row.map(|row| {
        table.columns.iter().enumerate().try_fold(Row::new(), |image, (idx, column)| {
            let value: i64 = row.try_get(idx).map_err(ElementError::database)?;
            Ok::<_, ElementError>(image.with(column, value))
        })
    })
    .transpose()
}

fn values(table: &TableRef, row: &Row) -> Result<Vec<i64>, ElementError> {
    table
        .columns
        .iter()
        .map(|column| {
            row.get(column)
                .ok_or_else(|| ElementError::database(format!("row for {} has no {column}", table.name)))
        })
        .collect()
}

/// Replace the row at `key` with `replacement` if it currently equals `expected`.
async fn swap_row(
    tx: &Transaction<'_>,
    table: &TableRef,
    key: i64,
    expected: Option<&Row>,
    replacement: Option<&Row>,
) -> Result<bool, ElementError> {
    let current = select_row(tx, table, key, true).await?;
    if current.as_ref() != expected {
        return Ok(false);
    }

    match (current, replacement) {
        (None, None) => {}
        (Some(_), None) => {
            let query = format!("DELETE FROM {} WHERE {} = $1", table.name, table.key_column);
            tx.execute(&query, &[&key]).await.map_err(ElementError::database)?;
        }
        (None, Some(row)) => {
            let values = values(table, row)?;
            let params: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("${i}")).collect();
            let query = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table.name,
                table.columns.join(", "),
                placeholders.join(", ")
            );
            tx.execute(&query, &params).await.map_err(ElementError::database)?;
        }
        (Some(_), Some(row)) => {
            let values = values(table, row)?;
            let mut params: Vec<&(dyn ToSql + Sync)> = vec![&key];
            let mut assignments = Vec::new();
            for (column, value) in table.columns.iter().zip(&values) {
                if *column != table.key_column {
                    params.push(value);
                    assignments.push(format!("{column} = ${}", params.len()));
                }
            }
            let query = format!(
                "UPDATE {} SET {} WHERE {} = $1",
                table.name,
                assignments.join(", "),
                table.key_column
            );
            tx.execute(&query, &params).await.map_err(ElementError::database)?;
        }
    }
    Ok(true)
}

/// Insert `status` for a branch unless it already has one. Returns the
/// status the branch ends up with and whether it was inserted.
async fn claim_branch(
    tx: &Transaction<'_>,
    branch_id: BranchId,
    status: BranchStatus,
) -> Result<(BranchStatus, bool), ElementError> {
    let inserted = tx
        .execute(
            "INSERT INTO branch_log (branch_id, status, updated_at) VALUES ($1, $2, $3)
             ON CONFLICT (branch_id) DO NOTHING",
            &[&branch_id.as_uuid(), &status.as_str(), &Utc::now()],
        )
        .await
        .map_err(ElementError::database)?;
    if inserted == 1 {
        return Ok((status, true));
    }

    let row = tx
        .query_one(
            "SELECT status FROM branch_log WHERE branch_id = $1 FOR UPDATE",
            &[&branch_id.as_uuid()],
        )
        .await
        .map_err(ElementError::database)?;
    let stored: String = row.try_get(0).map_err(ElementError::database)?;
    Ok((stored.parse().map_err(ElementError::database)?, false))
}

/// Take the lock on a row for `branch_id`, or report who holds it.
async fn lock_row(tx: &Transaction<'_>, branch_id: BranchId, table: &str, key: i64) -> Result<(), ElementError> {
    tx.execute(
        "INSERT INTO row_lock (table_name, row_key, branch_id) VALUES ($1, $2, $3)
         ON CONFLICT (table_name, row_key) DO NOTHING",
        &[&table, &key, &branch_id.as_uuid()],
    )
    .await
    .map_err(ElementError::database)?;

    let row = tx
        .query_one(
            "SELECT branch_id FROM row_lock WHERE table_name = $1 AND row_key = $2",
            &[&table, &key],
        )
        .await
        .map_err(ElementError::database)?;
    let holder = BranchId::from_uuid(row.try_get(0).map_err(ElementError::database)?);
    if holder != branch_id {
        return Err(ElementError::RowLocked {
            table: table.to_string(),
            key,
            holder,
        });
    }
    Ok(())
}

impl PostgresDatabase {
    pub fn new(pool: Pool, tables: &[TableRef]) -> Self {
        Self {
            pool,
            tables: tables.to_vec(),
        }
    }

    pub async fn migrate(&self) -> Result<(), ElementError> {
        let client = self.client().await?;
        let mut ddl = SCHEMA.to_string();
        for table in &self.tables {
            ddl.push_str(&table_ddl(table));
        }
        client.batch_execute(&ddl).await.map_err(ElementError::database)
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, ElementError> {
        self.pool.get().await.map_err(ElementError::database)
    }

    fn table(&self, name: &str) -> Result<&TableRef, ElementError> {
        self.tables
            .iter()
            .find(|table| table.name == name)
            .ok_or_else(|| ElementError::database(format!("unknown table {name}")))
    }

    async fn load_undo(tx: &Transaction<'_>, branch_id: BranchId) -> Result<Vec<UndoLogEntry>, ElementError> {
        tx.query(
            "SELECT payload FROM undo_log WHERE branch_id = $1 ORDER BY sequence",
            &[&branch_id.as_uuid()],
        )
        .await
        .map_err(ElementError::database)?
        .iter()
        .map(|row| {
            let payload: Vec<u8> = row.try_get(0).map_err(ElementError::database)?;
            UndoLogEntry::from_binary(&payload).map_err(ElementError::database)
        })
        .collect()
    }
}

#[async_trait]
impl LocalDatabase for PostgresDatabase {
    async fn read(&self, table: &TableRef, key: i64) -> Result<Option<Row>, ElementError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(ElementError::database)?;
        let row = select_row(&tx, table, key, false).await?;
        tx.commit().await.map_err(ElementError::database)?;
        Ok(row)
    }

    async fn next_key(&self, table: &TableRef) -> Result<i64, ElementError> {
        let client = self.client().await?;
        let query = format!("SELECT COALESCE(MAX({}), 0) + 1 FROM {}", table.key_column, table.name);
        let row = client.query_one(&query, &[]).await.map_err(ElementError::database)?;
        row.try_get(0).map_err(ElementError::database)
    }

    async fn commit_unit(&self, branch_id: BranchId, entries: &[UndoLogEntry]) -> Result<(), ElementError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(ElementError::database)?;

        let (status, _) = claim_branch(&tx, branch_id, BranchStatus::PhaseOneDone).await?;
        if status.is_terminal() {
            return Err(ElementError::BranchFinished(branch_id));
        }

        for entry in entries {
            let table = self.table(&entry.table)?;
            lock_row(&tx, branch_id, table.name, entry.key).await?;
            if !swap_row(&tx, table, entry.key, entry.before.as_ref(), entry.after.as_ref()).await? {
                return Err(ElementError::Conflict {
                    table: entry.table.clone(),
                    key: entry.key,
                });
            }
            let payload = entry.to_binary().map_err(ElementError::database)?;
            tx.execute(
                "INSERT INTO undo_log (branch_id, sequence, payload, created_at) VALUES ($1, $2, $3, $4)",
                &[&branch_id.as_uuid(), &i64::from(entry.sequence), &payload, &entry.created_at],
            )
            .await
            .map_err(ElementError::database)?;
        }

        tx.commit().await.map_err(ElementError::database)
    }

    async fn finish_branch(&self, branch_id: BranchId, decision: Decision) -> Result<BranchStatus, ElementError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(ElementError::database)?;

        let (current, inserted) = claim_branch(&tx, branch_id, tombstone(decision)).await?;
        if inserted {
            tx.commit().await.map_err(ElementError::database)?;
            return Ok(current);
        }
        if current.is_terminal() {
            return Ok(current);
        }

        let status = match decision {
            Decision::Commit => BranchStatus::Committed,
            Decision::Rollback => {
                for entry in Self::load_undo(&tx, branch_id).await?.iter().rev() {
                    let table = self.table(&entry.table)?;
                    if !swap_row(&tx, table, entry.key, entry.after.as_ref(), entry.before.as_ref()).await? {
                        return Err(replay_failed(entry));
                    }
                }
                BranchStatus::RolledBack
            }
        };

        tx.execute("DELETE FROM undo_log WHERE branch_id = $1", &[&branch_id.as_uuid()])
            .await
            .map_err(ElementError::database)?;
        tx.execute("DELETE FROM row_lock WHERE branch_id = $1", &[&branch_id.as_uuid()])
            .await
            .map_err(ElementError::database)?;
        tx.execute(
            "UPDATE branch_log SET status = $2, updated_at = $3 WHERE branch_id = $1",
            &[&branch_id.as_uuid(), &status.as_str(), &Utc::now()],
        )
        .await
        .map_err(ElementError::database)?;
        tx.commit().await.map_err(ElementError::database)?;
        Ok(status)
    }

    async fn branch_status(&self, branch_id: BranchId) -> Result<Option<BranchStatus>, ElementError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT status FROM branch_log WHERE branch_id = $1", &[&branch_id.as_uuid()])
            .await
            .map_err(ElementError::database)?;
        row.map(|row| {
            let status: String = row.try_get(0).map_err(ElementError::database)?;
            status.parse().map_err(ElementError::database)
        })
        .transpose()
    }

    async fn undo_entries(&self, branch_id: BranchId) -> Result<Vec<UndoLogEntry>, ElementError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(ElementError::database)?;
        let entries = Self::load_undo(&tx, branch_id).await?;
        tx.commit().await.map_err(ElementError::database)?;
        Ok(entries)
    }

    async fn seed(&self, table: &TableRef, row: Row) -> Result<(), ElementError> {
        let key = row_key(table, &row)?;
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(ElementError::database)?;
        let current = select_row(&tx, table, key, true).await?;
        swap_row(&tx, table, key, current.as_ref(), Some(&row)).await?;
        tx.commit().await.map_err(ElementError::database)
    }
}
