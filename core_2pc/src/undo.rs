use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BranchId;

/// Static description of a business table the participants mutate.
///
/// Every column is a `BIGINT`; money is kept in cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    pub name: &'static str,
    pub key_column: &'static str,
    pub columns: &'static [&'static str],
}

/// Image of one row: column name to value, key column included.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, i64>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: i64) -> Self {
        self.set(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<i64> {
        self.0.get(column).copied()
    }

    pub fn set(&mut self, column: &str, value: i64) {
        self.0.insert(column.to_string(), value);
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(column, value)| (column.as_str(), *value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    Insert,
    Update,
    Delete,
}

impl UndoKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("undo log codec: {0}")]
pub struct UndoCodecError(#[from] bincode::Error);

/// Before/after images of one row mutated by a branch.
///
/// `before == None` records an insert, `after == None` a delete.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct UndoLogEntry {
    pub branch_id: BranchId,
    pub sequence: u32,
    pub table: String,
    pub key_column: String,
    pub key: i64,
    pub before: Option<Row>,
    pub after: Option<Row>,
    pub created_at: DateTime<Utc>,
}

impl UndoLogEntry {
    pub fn new(
        branch_id: BranchId,
        sequence: u32,
        table: &TableRef,
        key: i64,
        before: Option<Row>,
        after: Option<Row>,
    ) -> Self {
        Self {
            branch_id,
            sequence,
            table: table.name.to_string(),
            key_column: table.key_column.to_string(),
            key,
            before,
            after,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> UndoKind {
        match (&self.before, &self.after) {
            (None, _) => UndoKind::Insert,
            (Some(_), None) => UndoKind::Delete,
            (Some(_), Some(_)) => UndoKind::Update,
        }
    }

    pub fn to_binary(&self) -> Result<Vec<u8>, UndoCodecError> {
        Ok(bincode::serialize(&self)?)
    }

    pub fn from_binary(data: &[u8]) -> Result<Self, UndoCodecError> {
        Ok(bincode::deserialize(data)?)
    }
}
