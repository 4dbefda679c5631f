use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use core_2pc::{BranchTransaction, GlobalId, GlobalStatus, GlobalTransaction, TxError};

/// Durable record of global and branch transactions.
///
/// Everything the coordinator needs to resume phase two after a restart goes
/// through this trait; the in-memory registry is rebuilt from
/// [`TransactionStore::load_active`].
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert_global(&self, global: &GlobalTransaction) -> Result<(), TxError>;

    async fn update_global(&self, global: &GlobalTransaction) -> Result<(), TxError>;

    async fn insert_branch(&self, branch: &BranchTransaction) -> Result<(), TxError>;

    async fn update_branch(&self, branch: &BranchTransaction) -> Result<(), TxError>;

    /// Persist the finished global record and drop its branch rows.
    async fn archive_global(&self, global: &GlobalTransaction) -> Result<(), TxError>;

    /// Every non-finished global transaction with its branches in registration order.
    async fn load_active(&self) -> Result<Vec<(GlobalTransaction, Vec<BranchTransaction>)>, TxError>;

    async fn load_global(&self, global_id: GlobalId) -> Result<Option<GlobalTransaction>, TxError>;
}

#[derive(Default)]
struct MemoryState {
    globals: HashMap<GlobalId, GlobalTransaction>,
    branches: HashMap<GlobalId, Vec<BranchTransaction>>,
}

/// Store kept in process memory.
///
/// Clones share the same state, so a coordinator built over a clone sees what
/// an earlier coordinator wrote; tests use this to model a restart.
#[derive(Clone, Default)]
pub struct MemoryTransactionStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn branch_rows(&self, global_id: GlobalId) -> Vec<BranchTransaction> {
        self.state().branches.get(&global_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn insert_global(&self, global: &GlobalTransaction) -> Result<(), TxError> {
        let mut state = self.state();
        if state.globals.contains_key(&global.id) {
            return Err(TxError::storage(format!("global transaction {} already stored", global.id)));
        }
        state.globals.insert(global.id, global.clone());
        Ok(())
    }

    async fn update_global(&self, global: &GlobalTransaction) -> Result<(), TxError> {
        match self.state().globals.get_mut(&global.id) {
            Some(stored) => {
                *stored = global.clone();
                Ok(())
            }
            None => Err(TxError::storage(format!("global transaction {} not stored", global.id))),
        }
    }

    async fn insert_branch(&self, branch: &BranchTransaction) -> Result<(), TxError> {
        let mut state = self.state();
        if !state.globals.contains_key(&branch.global_id) {
            return Err(TxError::storage(format!("global transaction {} not stored", branch.global_id)));
        }
        state.branches.entry(branch.global_id).or_default().push(branch.clone());
        Ok(())
    }

    async fn update_branch(&self, branch: &BranchTransaction) -> Result<(), TxError> {
        let mut state = self.state();
        let stored = state
            .branches
            .get_mut(&branch.global_id)
            .and_then(|branches| branches.iter_mut().find(|b| b.id == branch.id));
        match stored {
            Some(stored) => {
                *stored = branch.clone();
                Ok(())
            }
            None => Err(TxError::storage(format!("branch {} not stored", branch.id))),
        }
    }

    async fn archive_global(&self, global: &GlobalTransaction) -> Result<(), TxError> {
        let mut state = self.state();
        state.globals.insert(global.id, global.clone());
        state.branches.remove(&global.id);
        Ok(())
    }

    async fn load_active(&self) -> Result<Vec<(GlobalTransaction, Vec<BranchTransaction>)>, TxError> {
        let state = self.state();
        let mut active: Vec<_> = state
            .globals
            .values()
            .filter(|g| g.status != GlobalStatus::Finished)
            .map(|g| (g.clone(), state.branches.get(&g.id).cloned().unwrap_or_default()))
            .collect();
        active.sort_by_key(|(g, _)| g.created_at);
        Ok(active)
    }

    async fn load_global(&self, global_id: GlobalId) -> Result<Option<GlobalTransaction>, TxError> {
        Ok(self.state().globals.get(&global_id).cloned())
    }
}
