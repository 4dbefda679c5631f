//! The participant's own database: business rows, undo log and branch log.
//!
//! Every method is one local transaction. Business rows are only ever written
//! together with the undo entries describing the write, so a branch that
//! reached phase one can always be compensated from its own store.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use core_2pc::{BranchId, BranchStatus, Decision, Row, TableRef, TxError, UndoLogEntry};

use crate::error::ElementError;

#[async_trait]
pub trait LocalDatabase: Send + Sync {
    async fn read(&self, table: &TableRef, key: i64) -> Result<Option<Row>, ElementError>;

    /// A key one past the largest key of `table`.
    async fn next_key(&self, table: &TableRef) -> Result<i64, ElementError>;

    /// Apply the staged writes of a branch, store them as its undo log and
    /// mark the branch PhaseOneDone.
    ///
    /// Each entry's `before` image must match the stored row, otherwise
    /// nothing is applied and [`ElementError::Conflict`] is returned. A branch
    /// phase two already finished is refused with [`ElementError::BranchFinished`].
    ///
    /// Every written row stays locked to the branch until [`finish_branch`]
    /// succeeds for it. A row locked by another branch is refused with
    /// [`ElementError::RowLocked`].
    ///
    /// [`finish_branch`]: LocalDatabase::finish_branch
    async fn commit_unit(&self, branch_id: BranchId, entries: &[UndoLogEntry]) -> Result<(), ElementError>;

    /// Apply the phase-two decision to a branch and return its terminal status.
    ///
    /// Idempotent: a finished branch returns the status it finished with. A
    /// branch with no local record is finished without touching business rows
    /// (`Failed` on rollback), which also fences off a late `commit_unit`.
    /// Rollback restores before-images in reverse sequence order and fails
    /// with [`TxError::UndoLogReplayFailed`] when a row no longer matches its
    /// after-image; the undo log and the row locks are then kept for an
    /// operator.
    async fn finish_branch(&self, branch_id: BranchId, decision: Decision) -> Result<BranchStatus, ElementError>;

    async fn branch_status(&self, branch_id: BranchId) -> Result<Option<BranchStatus>, ElementError>;

    /// Undo entries of a branch in sequence order.
    async fn undo_entries(&self, branch_id: BranchId) -> Result<Vec<UndoLogEntry>, ElementError>;

    /// Insert or overwrite a business row outside any branch.
    async fn seed(&self, table: &TableRef, row: Row) -> Result<(), ElementError>;
}

/// Terminal status of a branch that reaches phase two without local work.
pub(crate) fn tombstone(decision: Decision) -> BranchStatus {
    match decision {
        Decision::Commit => BranchStatus::Committed,
        Decision::Rollback => BranchStatus::Failed,
    }
}

pub(crate) fn replay_failed(entry: &UndoLogEntry) -> ElementError {
    TxError::UndoLogReplayFailed {
        branch_id: entry.branch_id,
        reason: format!(
            "{} of {} key {} changed since phase one",
            entry.kind().as_str(),
            entry.table,
            entry.key
        ),
    }
    .into()
}

pub(crate) fn row_key(table: &TableRef, row: &Row) -> Result<i64, ElementError> {
    row.get(table.key_column)
        .ok_or_else(|| ElementError::database(format!("row for {} has no {}", table.name, table.key_column)))
}

type Table = BTreeMap<i64, Row>;

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Table>,
    undo: HashMap<BranchId, Vec<UndoLogEntry>>,
    branches: HashMap<BranchId, BranchStatus>,
    /// (table, key) to the branch holding the row.
    locks: HashMap<(String, i64), BranchId>,
}

/// [`LocalDatabase`] kept in process memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
}

fn table_mut<'a>(tables: &'a mut HashMap<String, Table>, name: &str) -> Result<&'a mut Table, ElementError> {
    tables
        .get_mut(name)
        .ok_or_else(|| ElementError::database(format!("unknown table {name}")))
}

/// Replace the row at `key` with `replacement` if it currently equals `expected`.
fn swap_row(
    tables: &mut HashMap<String, Table>,
    name: &str,
    key: i64,
    expected: Option<&Row>,
    replacement: Option<&Row>,
) -> Result<bool, ElementError> {
    let table = table_mut(tables, name)?;
    if table.get(&key) != expected {
        return Ok(false);
    }
    match replacement {
        Some(row) => table.insert(key, row.clone()),
        None => table.remove(&key),
    };
    Ok(true)
}

impl MemoryDatabase {
    pub fn new(tables: &[TableRef]) -> Self {
        let state = MemoryState {
            tables: tables.iter().map(|t| (t.name.to_string(), Table::new())).collect(),
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LocalDatabase for MemoryDatabase {
    async fn read(&self, table: &TableRef, key: i64) -> Result<Option<Row>, ElementError> {
        let mut state = self.state();
        Ok(table_mut(&mut state.tables, table.name)?.get(&key).cloned())
    }

    async fn next_key(&self, table: &TableRef) -> Result<i64, ElementError> {
        let mut state = self.state();
        let rows = table_mut(&mut state.tables, table.name)?;
        Ok(rows.keys().next_back().map_or(1, |key| key + 1))
    }

    async fn commit_unit(&self, branch_id: BranchId, entries: &[UndoLogEntry]) -> Result<(), ElementError> {
        let mut state = self.state();
        if state.branches.get(&branch_id).is_some_and(BranchStatus::is_terminal) {
            return Err(ElementError::BranchFinished(branch_id));
        }

        for entry in entries {
            match state.locks.get(&(entry.table.clone(), entry.key)) {
                Some(holder) if *holder != branch_id => {
                    return Err(ElementError::RowLocked {
                        table: entry.table.clone(),
                        key: entry.key,
                        holder: *holder,
                    })
                }
                _ => {}
            }
        }

        let mut tables = state.tables.clone();
        for entry in entries {
            if !swap_row(&mut tables, &entry.table, entry.key, entry.before.as_ref(), entry.after.as_ref())? {
                return Err(ElementError::Conflict {
                    table: entry.table.clone(),
                    key: entry.key,
                });
            }
        }

        state.tables = tables;
        for entry in entries {
            state.locks.insert((entry.table.clone(), entry.key), branch_id);
        }
        state.undo.entry(branch_id).or_default().extend(entries.iter().cloned());
        state.branches.insert(branch_id, BranchStatus::PhaseOneDone);
        Ok(())
    }

    async fn finish_branch(&self, branch_id: BranchId, decision: Decision) -> Result<BranchStatus, ElementError> {
        let mut state = self.state();
        match state.branches.get(&branch_id).copied() {
            Some(status) if status.is_terminal() => return Ok(status),
            Some(_) => {}
            None => {
                let status = tombstone(decision);
                state.branches.insert(branch_id, status);
                return Ok(status);
            }
        }

        let status = match decision {
            Decision::Commit => BranchStatus::Committed,
            Decision::Rollback => {
                let mut entries = state.undo.get(&branch_id).cloned().unwrap_or_default();
                entries.sort_by_key(|entry| entry.sequence);

                let mut tables = state.tables.clone();
                for entry in entries.iter().rev() {
                    if !swap_row(&mut tables, &entry.table, entry.key, entry.after.as_ref(), entry.before.as_ref())? {
                        return Err(replay_failed(entry));
                    }
                }
                state.tables = tables;
                BranchStatus::RolledBack
            }
        };

        state.undo.remove(&branch_id);
        state.locks.retain(|_, holder| *holder != branch_id);
        state.branches.insert(branch_id, status);
        Ok(status)
    }

    async fn branch_status(&self, branch_id: BranchId) -> Result<Option<BranchStatus>, ElementError> {
        Ok(self.state().branches.get(&branch_id).copied())
    }

    async fn undo_entries(&self, branch_id: BranchId) -> Result<Vec<UndoLogEntry>, ElementError> {
        let mut entries = self.state().undo.get(&branch_id).cloned().unwrap_or_default();
        entries.sort_by_key(|entry| entry.sequence);
        Ok(entries)
    }

    async fn seed(&self, table: &TableRef, row: Row) -> Result<(), ElementError> {
        let key = row_key(table, &row)?;
        let mut state = self.state();
        table_mut(&mut state.tables, table.name)?.insert(key, row);
        Ok(())
    }
}
