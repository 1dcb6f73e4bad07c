#![allow(async_fn_in_trait)]

use std::collections::HashMap;

use sqlx::{PgPool, Postgres};
use thiserror::Error;

use crate::conf::RetryPolicy;
use crate::context::SaveContext;
use crate::db::batch::CommandBatch;
use crate::db::command::{CommandId, EntityRef, ModificationCommand};
use crate::db::value::ColumnValue;
use crate::errors::{EntityAt, SaveError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
    Exclusion,
    Other(String),
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("integrity violation ({kind:?})")]
    Integrity {
        kind: IntegrityKind,
        constraint: Option<String>,
        #[source]
        source: sqlx::Error,
    },
    #[error("temporary database failure: {0}")]
    Temporary(String),
    #[error("bind error: {0}")]
    Bind(String),
    #[error("no open transaction")]
    NoTransaction,
    #[error("unhandled db error")]
    Fatal(#[source] sqlx::Error),
}

impl DbError {
    pub const fn code(&self) -> &'static str {
        match self {
            DbError::Integrity { .. } => "integrity_violation",
            DbError::Temporary(_) => "temporary_error",
            DbError::Bind(_) => "bind_error",
            DbError::NoTransaction => "no_transaction",
            DbError::Fatal(_) => "fatal_error",
        }
    }

    /// Failures worth retrying: lost connections, deadlocks and serialization aborts.
    pub const fn is_transient(&self) -> bool {
        matches!(self, DbError::Temporary(_))
    }

    pub fn integrity(kind: IntegrityKind, constraint: &str, message: impl Into<String>) -> Self {
        DbError::Integrity {
            kind,
            constraint: Some(constraint.to_string()),
            source: sqlx::Error::Protocol(message.into()),
        }
    }
}

fn is_transient_state(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "53300" | "57P01" | "57P03") || code.starts_with("08")
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                if is_transient_state(&code) {
                    return DbError::Temporary(db.message().to_string());
                }
                if !code.starts_with("23") {
                    return DbError::Fatal(e);
                }
                let kind = match code.as_str() {
                    "23505" => IntegrityKind::Unique,
                    "23503" => IntegrityKind::ForeignKey,
                    "23514" => IntegrityKind::Check,
                    "23502" => IntegrityKind::NotNull,
                    "23P01" => IntegrityKind::Exclusion,
                    other => IntegrityKind::Other(other.to_string()),
                };
                DbError::Integrity {
                    kind,
                    constraint: db.constraint().map(|s| s.to_owned()),
                    source: e,
                }
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
                DbError::Temporary(e.to_string())
            }
            _ => DbError::Fatal(e),
        }
    }
}

/// Outcome of one command inside an executed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    pub rows_affected: u64,
    /// Store-generated values read back from the affected row.
    pub values: Vec<(String, ColumnValue)>,
}

/// Transactional backend the executor drives. Implementations return one
/// result per command, in batch order.
pub trait BatchConnection {
    async fn begin(&mut self) -> Result<(), DbError>;

    async fn execute_batch(&mut self, batch: &CommandBatch) -> Result<Vec<CommandResult>, DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;
}

/// Postgres connection over a pool, holding at most one open transaction.
///
/// Parameterized statements cannot share one extended-protocol message, so
/// [`ProviderCapabilities::postgres`](crate::ProviderCapabilities::postgres)
/// plans one command per batch. Larger batches from a misconfigured
/// capability set are still sent statement by statement on the transaction.
pub struct PgBatchConnection {
    pool: PgPool,
    transaction: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgBatchConnection {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            transaction: None,
        }
    }

    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl BatchConnection for PgBatchConnection {
    async fn begin(&mut self) -> Result<(), DbError> {
        self.transaction = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn execute_batch(&mut self, batch: &CommandBatch) -> Result<Vec<CommandResult>, DbError> {
        let tx = self.transaction.as_mut().ok_or(DbError::NoTransaction)?;
        let mut results = Vec::with_capacity(batch.len());
        for (cmd, stmt) in batch.commands().iter().zip(batch.statements()) {
            tracing::trace!(sql = %stmt.debug_sql(cmd), "executing statement");
            let args = stmt.bind(cmd)?;
            let query = sqlx::query_with(stmt.sql(), args);
            if !stmt.returns_rows() {
                let done = query.execute(&mut **tx).await?;
                results.push(CommandResult {
                    rows_affected: done.rows_affected(),
                    values: Vec::new(),
                });
                continue;
            }

            let rows = query.fetch_all(&mut **tx).await?;
            let mut values = Vec::with_capacity(stmt.returning().len());
            if let Some(row) = rows.first() {
                for &ix in stmt.returning() {
                    let col = &cmd.columns[ix];
                    let kind = col.current_value.kind();
                    values.push((
                        col.column_name.clone(),
                        ColumnValue::decode(row, &col.column_name, kind)?,
                    ));
                }
            }
            results.push(CommandResult {
                rows_affected: rows.len() as u64,
                values,
            });
        }
        Ok(results)
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let tx = self.transaction.take().ok_or(DbError::NoTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        if let Some(tx) = self.transaction.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Executing(usize),
    Committed,
    ConflictDetected,
    Faulted,
}

/// A value the store produced for a tracked entity during the save.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreValue {
    pub entity: EntityRef,
    pub column: String,
    pub value: ColumnValue,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub attempts: u32,
    pub rows_affected: u64,
    pub store_values: Vec<StoreValue>,
}

enum Failure {
    /// Ends the save.
    Final(SaveError),
    /// Ends the attempt; the save may be retried.
    Db(DbError),
}

fn at(cmd: &ModificationCommand) -> EntityAt {
    EntityAt {
        entity: cmd.entity,
        table: cmd.table_name.clone(),
    }
}

/// Runs prepared batches inside one transaction per attempt.
#[derive(Debug)]
pub struct BatchExecutor {
    retry: RetryPolicy,
    state: ExecutionState,
}

impl BatchExecutor {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            state: ExecutionState::Pending,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub async fn execute<C: BatchConnection>(
        &mut self,
        conn: &mut C,
        batches: &[CommandBatch],
        ctx: &SaveContext,
    ) -> Result<ExecutionOutcome, SaveError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if ctx.is_cancelled() {
                self.state = ExecutionState::Faulted;
                return Err(SaveError::Cancelled);
            }

            // every attempt starts from the commands as prepared
            let mut work = batches.to_vec();
            let err = match self.attempt(conn, &mut work, ctx, attempt).await {
                Ok(mut outcome) => {
                    self.state = ExecutionState::Committed;
                    outcome.attempts = attempt;
                    tracing::info!(
                        attempts = attempt,
                        rows = outcome.rows_affected,
                        "save committed"
                    );
                    return Ok(outcome);
                }
                Err(Failure::Final(err)) => {
                    self.state = match err {
                        SaveError::ConcurrencyConflict(_) => ExecutionState::ConflictDetected,
                        _ => ExecutionState::Faulted,
                    };
                    return Err(err);
                }
                Err(Failure::Db(err)) => err,
            };

            if !err.is_transient() || attempt > self.retry.max_retries {
                tracing::error!(attempts = attempt, error = %err, "save failed");
                self.state = ExecutionState::Faulted;
                return Err(SaveError::Faulted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.retry.delay(attempt);
            tracing::warn!(attempt, ?delay, error = %err, "transient failure, retrying save");
            tokio::select! {
                _ = ctx.cancelled() => {
                    self.state = ExecutionState::Faulted;
                    return Err(SaveError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt<C: BatchConnection>(
        &mut self,
        conn: &mut C,
        work: &mut [CommandBatch],
        ctx: &SaveContext,
        attempt: u32,
    ) -> Result<ExecutionOutcome, Failure> {
        self.state = ExecutionState::Pending;
        conn.begin().await.map_err(Failure::Db)?;

        let mut outcome = ExecutionOutcome::default();
        for ix in 0..work.len() {
            self.state = ExecutionState::Executing(ix);
            tracing::debug!(batch = ix, commands = work[ix].len(), "executing batch");

            let executed = tokio::select! {
                biased;
                _ = ctx.cancelled() => None,
                res = conn.execute_batch(&work[ix]) => Some(res),
            };
            let results = match executed {
                None => {
                    Self::abandon(conn).await;
                    return Err(Failure::Final(SaveError::Cancelled));
                }
                Some(Err(err)) => {
                    Self::abandon(conn).await;
                    return Err(Failure::Db(err));
                }
                Some(Ok(results)) => results,
            };

            if let Err(err) = Self::check_rows(&work[ix], &results) {
                tracing::warn!(batch = ix, error = %err, "row count check failed");
                Self::abandon(conn).await;
                return Err(Failure::Final(err));
            }

            let (done, rest) = work.split_at_mut(ix + 1);
            let produced = Self::apply_read_back(&mut done[ix], results, &mut outcome);
            Self::propagate(&produced, rest, &mut outcome);
        }

        if let Err(err) = conn.commit().await {
            // the commit outcome is unknown, so it is never retried
            tracing::error!(error = %err, "commit failed");
            return Err(Failure::Final(SaveError::Faulted {
                attempts: attempt,
                source: err,
            }));
        }
        Ok(outcome)
    }

    async fn abandon<C: BatchConnection>(conn: &mut C) {
        if let Err(err) = conn.rollback().await {
            tracing::warn!(error = %err, "rollback failed");
        }
    }

    fn check_rows(batch: &CommandBatch, results: &[CommandResult]) -> Result<(), SaveError> {
        for (pos, cmd) in batch.commands().iter().enumerate() {
            let actual = results.get(pos).map_or(0, |r| r.rows_affected);
            if actual == 1 {
                continue;
            }
            if actual == 0 && cmd.has_conditions() {
                return Err(SaveError::ConcurrencyConflict(at(cmd)));
            }
            return Err(SaveError::UnexpectedRowCount {
                at: at(cmd),
                expected: 1,
                actual,
            });
        }
        Ok(())
    }

    fn apply_read_back(
        batch: &mut CommandBatch,
        results: Vec<CommandResult>,
        outcome: &mut ExecutionOutcome,
    ) -> HashMap<(CommandId, String), ColumnValue> {
        let mut produced = HashMap::new();
        for (cmd, result) in batch.commands_mut().iter_mut().zip(results) {
            outcome.rows_affected += result.rows_affected;
            for (column, value) in result.values {
                if let Some(col) = cmd.column_mut(&column) {
                    col.current_value = value.clone();
                }
                outcome.store_values.push(StoreValue {
                    entity: cmd.entity,
                    column: column.clone(),
                    value: value.clone(),
                });
                produced.insert((cmd.id, column), value);
            }
        }
        produced
    }

    /// Copies generated keys into the dependent columns of later commands.
    fn propagate(
        produced: &HashMap<(CommandId, String), ColumnValue>,
        rest: &mut [CommandBatch],
        outcome: &mut ExecutionOutcome,
    ) {
        if produced.is_empty() {
            return;
        }
        for batch in rest {
            for cmd in batch.commands_mut() {
                let entity = cmd.entity;
                for col in &mut cmd.columns {
                    let Some(link) = &col.link else {
                        continue;
                    };
                    let Some(value) = produced.get(&(link.command, link.column.clone())) else {
                        continue;
                    };
                    col.current_value = value.clone();
                    if col.is_write {
                        outcome.store_values.push(StoreValue {
                            entity,
                            column: col.column_name.clone(),
                            value: value.clone(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_states_are_classified() {
        assert!(is_transient_state("40001"));
        assert!(is_transient_state("40P01"));
        assert!(is_transient_state("08006"));
        assert!(!is_transient_state("23505"));
    }

    #[test]
    fn io_errors_are_transient() {
        let err = DbError::from(sqlx::Error::Io(std::io::Error::other("reset")));
        assert!(err.is_transient());
        assert_eq!(err.code(), "temporary_error");
        assert!(!DbError::integrity(IntegrityKind::Unique, "pk_t", "dup").is_transient());
    }
}
