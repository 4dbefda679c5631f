use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coordinator-assigned identifier of a global transaction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GlobalId(Uuid);

impl GlobalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for GlobalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of one participant's unit of work under a global transaction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BranchId(Uuid);

impl BranchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Returned when a persisted status column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status `{0}`")]
pub struct ParseStatusError(pub String);

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum GlobalStatus {
    Begin,
    Committing,
    CommitRetrying,
    RolledBack,
    RollbackRetrying,
    Finished,
}

impl GlobalStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "Begin",
            Self::Committing => "Committing",
            Self::CommitRetrying => "CommitRetrying",
            Self::RolledBack => "RolledBack",
            Self::RollbackRetrying => "RollbackRetrying",
            Self::Finished => "Finished",
        }
    }

    /// Only a transaction in `Begin` accepts new branches.
    pub const fn accepts_branches(&self) -> bool {
        matches!(self, Self::Begin)
    }

    /// The phase-two decision implied by this status, if one was taken.
    pub const fn decision(&self) -> Option<Decision> {
        match self {
            Self::Committing | Self::CommitRetrying => Some(Decision::Commit),
            Self::RollbackRetrying | Self::RolledBack => Some(Decision::Rollback),
            Self::Begin | Self::Finished => None,
        }
    }
}

impl FromStr for GlobalStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Begin" => Ok(Self::Begin),
            "Committing" => Ok(Self::Committing),
            "CommitRetrying" => Ok(Self::CommitRetrying),
            "RolledBack" => Ok(Self::RolledBack),
            "RollbackRetrying" => Ok(Self::RollbackRetrying),
            "Finished" => Ok(Self::Finished),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum BranchStatus {
    Registered,
    PhaseOneDone,
    Committed,
    RolledBack,
    Failed,
}

impl BranchStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "Registered",
            Self::PhaseOneDone => "PhaseOneDone",
            Self::Committed => "Committed",
            Self::RolledBack => "RolledBack",
            Self::Failed => "Failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

impl FromStr for BranchStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Registered" => Ok(Self::Registered),
            "PhaseOneDone" => Ok(Self::PhaseOneDone),
            "Committed" => Ok(Self::Committed),
            "RolledBack" => Ok(Self::RolledBack),
            "Failed" => Ok(Self::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Decision {
    Commit,
    Rollback,
}

impl Decision {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "Commit",
            Self::Rollback => "Rollback",
        }
    }

    pub const fn outcome(&self) -> Outcome {
        match self {
            Self::Commit => Outcome::Committed,
            Self::Rollback => Outcome::RolledBack,
        }
    }
}

impl FromStr for Decision {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Commit" => Ok(Self::Commit),
            "Rollback" => Ok(Self::Rollback),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Final result recorded on a finished global transaction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Outcome {
    Committed,
    RolledBack,
}

impl Outcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "Committed",
            Self::RolledBack => "RolledBack",
        }
    }
}

impl FromStr for Outcome {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Committed" => Ok(Self::Committed),
            "RolledBack" => Ok(Self::RolledBack),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct GlobalTransaction {
    pub id: GlobalId,
    pub initiator: String,
    pub name: String,
    pub status: GlobalStatus,
    pub decision: Option<Decision>,
    pub outcome: Option<Outcome>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl GlobalTransaction {
    pub fn new(initiator: impl Into<String>, name: impl Into<String>, timeout: Duration) -> Self {
        let created_at = Utc::now();
        let timeout = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));

        Self {
            id: GlobalId::new(),
            initiator: initiator.into(),
            name: name.into(),
            status: GlobalStatus::Begin,
            decision: None,
            outcome: None,
            created_at,
            deadline: created_at.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == GlobalStatus::Begin && now >= self.deadline
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct BranchTransaction {
    pub id: BranchId,
    pub global_id: GlobalId,
    pub participant: String,
    pub resource: String,
    pub endpoint: String,
    pub status: BranchStatus,
    pub registered_at: DateTime<Utc>,
}

impl BranchTransaction {
    pub fn new(
        global_id: GlobalId,
        participant: impl Into<String>,
        resource: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: BranchId::new(),
            global_id,
            participant: participant.into(),
            resource: resource.into(),
            endpoint: endpoint.into(),
            status: BranchStatus::Registered,
            registered_at: Utc::now(),
        }
    }

    pub fn enlists(&self, participant: &str, resource: &str) -> bool {
        self.participant == participant && self.resource == resource
    }
}
