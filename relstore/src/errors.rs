use std::fmt;

use thiserror::Error;

use crate::db::{DbError, EntityRef, ModelError};

/// Entity implicated in a failure, with the table it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityAt {
    pub entity: EntityRef,
    pub table: String,
}

impl fmt::Display for EntityAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.entity, self.table)
    }
}

fn join(entities: &[EntityAt]) -> String {
    entities
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("invalid change set: {0}")]
    Model(#[from] ModelError),

    #[error("dependency cycle between {}", join(.entities))]
    DependencyCycle { entities: Vec<EntityAt> },

    #[error("{0} references its own generated key and the provider cannot write it")]
    SelfReference(EntityAt),

    #[error("concurrency conflict on {0}: the row was changed or removed")]
    ConcurrencyConflict(EntityAt),

    #[error("expected {expected} row(s) affected for {at}, got {actual}")]
    UnexpectedRowCount {
        at: EntityAt,
        expected: u64,
        actual: u64,
    },

    #[error("save cancelled")]
    Cancelled,

    #[error("save failed after {attempts} attempt(s)")]
    Faulted {
        attempts: u32,
        #[source]
        source: DbError,
    },
}

/// Caller-facing outcome of a save operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Success,
    ConflictAt(EntityRef),
    Faulted(String),
}

impl SaveError {
    pub const fn code(&self) -> &'static str {
        match self {
            SaveError::Model(_) => "invalid_model",
            SaveError::DependencyCycle { .. } => "dependency_cycle",
            SaveError::SelfReference(_) => "self_reference",
            SaveError::ConcurrencyConflict(_) => "concurrency_conflict",
            SaveError::UnexpectedRowCount { .. } => "unexpected_row_count",
            SaveError::Cancelled => "cancelled",
            SaveError::Faulted { .. } => "faulted",
        }
    }

    /// Conflicts can be resolved by reloading and saving again.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, SaveError::ConcurrencyConflict(_))
    }

    pub fn status(&self) -> SaveStatus {
        match self {
            SaveError::ConcurrencyConflict(at) => SaveStatus::ConflictAt(at.entity),
            other => SaveStatus::Faulted(other.to_string()),
        }
    }
}

pub type SaveResult<T> = Result<T, SaveError>;
