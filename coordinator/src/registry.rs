//! In-memory bookkeeping of active global transactions and their branches.
//!
//! Each global transaction lives behind its own async mutex; the index maps
//! here are only touched for insert/lookup/remove and never held across an
//! await, so unrelated transactions never wait on each other.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use core_2pc::{BranchId, BranchStatus, BranchTransaction, GlobalId, GlobalStatus, GlobalTransaction, TxError};
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::transaction::GlobalSession;

/// Finished transactions kept in memory for status queries.
const ARCHIVE_CAPACITY: usize = 4096;

pub type SessionHandle = Arc<SessionEntry>;

pub struct SessionEntry {
    id: GlobalId,
    state: AsyncMutex<GlobalSession>,
    progress: watch::Sender<GlobalStatus>,
}

impl SessionEntry {
    pub fn id(&self) -> GlobalId {
        self.id
    }

    pub async fn lock(&self) -> AsyncMutexGuard<'_, GlobalSession> {
        self.state.lock().await
    }

    pub fn publish(&self, status: GlobalStatus) {
        self.progress.send_replace(status);
    }

    pub fn subscribe(&self) -> watch::Receiver<GlobalStatus> {
        self.progress.subscribe()
    }
}

/// A finished transaction with the final state of its branches.
#[derive(Debug, Clone)]
pub struct ArchivedSession {
    pub global: GlobalTransaction,
    pub branches: Vec<BranchTransaction>,
}

pub enum Lookup {
    Active(SessionHandle),
    Finished(ArchivedSession),
    Unknown,
}

#[derive(Default)]
struct Index {
    sessions: HashMap<GlobalId, SessionHandle>,
    branches: HashMap<BranchId, GlobalId>,
    finished: HashMap<GlobalId, ArchivedSession>,
    finished_order: VecDeque<GlobalId>,
}

#[derive(Default)]
pub struct BranchRegistry {
    index: Mutex<Index>,
}

impl BranchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new (or recovered) session and index its branches.
    pub fn open(&self, session: GlobalSession) -> SessionHandle {
        let id = session.id();
        let (progress, _) = watch::channel(session.status());
        let mut index = self.index();

        for branch in &session.branches {
            index.branches.insert(branch.id, id);
        }
        let entry = Arc::new(SessionEntry {
            id,
            state: AsyncMutex::new(session),
            progress,
        });
        index.sessions.insert(id, entry.clone());
        entry
    }

    pub fn lookup(&self, global_id: GlobalId) -> Lookup {
        let index = self.index();
        if let Some(entry) = index.sessions.get(&global_id) {
            Lookup::Active(entry.clone())
        } else if let Some(archived) = index.finished.get(&global_id) {
            Lookup::Finished(archived.clone())
        } else {
            Lookup::Unknown
        }
    }

    pub fn owner(&self, branch_id: BranchId) -> Option<GlobalId> {
        self.index().branches.get(&branch_id).copied()
    }

    pub fn active(&self) -> Vec<SessionHandle> {
        self.index().sessions.values().cloned().collect()
    }

    /// Enlist a participant's resource under the locked session.
    ///
    /// A participant may enlist the same resource again once its earlier
    /// branch has finished phase one; a second enlistment while the first is
    /// still running, or any enlistment after the decision, is refused.
    pub fn register(
        &self,
        session: &mut GlobalSession,
        participant: &str,
        resource: &str,
        endpoint: &str,
    ) -> Result<BranchTransaction, TxError> {
        let global_id = session.id();
        let duplicate = || TxError::DuplicateBranch {
            global_id,
            participant: participant.to_string(),
            resource: resource.to_string(),
        };

        if !session.status().accepts_branches() {
            if session.branches.iter().any(|b| b.enlists(participant, resource)) {
                return Err(duplicate());
            }
            return Err(TxError::BranchRegistrationRejected {
                global_id,
                status: session.status(),
            });
        }
        if session
            .branches
            .iter()
            .any(|b| b.enlists(participant, resource) && b.status == BranchStatus::Registered)
        {
            return Err(duplicate());
        }

        let branch = BranchTransaction::new(global_id, participant, resource, endpoint);
        session.branches.push(branch.clone());
        self.index().branches.insert(branch.id, global_id);
        Ok(branch)
    }

    /// Undo a [`Self::register`] whose branch record could not be persisted.
    pub fn discard(&self, session: &mut GlobalSession, branch_id: BranchId) {
        session.branches.retain(|b| b.id != branch_id);
        self.index().branches.remove(&branch_id);
    }

    /// Branches of a transaction in registration order.
    pub async fn list(&self, global_id: GlobalId) -> Result<Vec<BranchTransaction>, TxError> {
        match self.lookup(global_id) {
            Lookup::Active(entry) => Ok(entry.lock().await.branches.clone()),
            Lookup::Finished(archived) => Ok(archived.branches),
            Lookup::Unknown => Err(TxError::UnknownGlobalTransaction { global_id }),
        }
    }

    /// Record the final state of a branch. Terminal states never change.
    pub fn mark_terminal(
        &self,
        session: &mut GlobalSession,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> Result<BranchTransaction, TxError> {
        let branch = session
            .branch_mut(branch_id)
            .ok_or(TxError::UnknownBranch { branch_id })?;
        if !branch.status.is_terminal() {
            branch.status = status;
        }
        Ok(branch.clone())
    }

    /// Move a finished session out of the active set.
    pub fn archive(&self, session: &GlobalSession) {
        let id = session.id();
        let mut index = self.index();

        index.sessions.remove(&id);
        for branch in &session.branches {
            index.branches.remove(&branch.id);
        }
        index.finished.insert(
            id,
            ArchivedSession {
                global: session.global.clone(),
                branches: session.branches.clone(),
            },
        );
        index.finished_order.push_back(id);
        while index.finished_order.len() > ARCHIVE_CAPACITY {
            if let Some(evicted) = index.finished_order.pop_front() {
                index.finished.remove(&evicted);
            }
        }
    }
}
