//! In-memory backend for exercising the save pipeline without a database.
//!
//! [`MemoryConnection`] keeps committed rows per table and works on a copy
//! inside a transaction, enforcing primary keys, unique sets, not-null
//! columns and foreign keys the way Postgres reports them.

use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;
use uuid::Uuid;

use crate::db::{
    BatchConnection, ColumnModel, ColumnValue, CommandBatch, CommandResult, DbError, EntityRef,
    IntegrityKind, Model, ModificationCommand, OperationKind, ReferentialAction, StoreValue,
    TableModel, TrackedEntities, ValueKind,
};

pub type Row = IndexMap<String, ColumnValue>;
type Tables = IndexMap<String, Vec<Row>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub begins: u32,
    pub commits: u32,
    pub rollbacks: u32,
    pub batches: u32,
}

/// A command that reached the store in a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub entity: EntityRef,
    pub table: String,
    pub operation: OperationKind,
}

pub struct MemoryConnection {
    model: Model,
    committed: Tables,
    working: Option<Tables>,
    journal: Vec<JournalEntry>,
    pending: Vec<JournalEntry>,
    transient_failures: u32,
    fail_commit: bool,
    latency: Option<Duration>,
    stats: ConnectionStats,
}

fn fatal(message: impl Into<String>) -> DbError {
    DbError::Fatal(sqlx::Error::Protocol(message.into()))
}

fn value_of<'r>(row: &'r Row, column: &str) -> Option<&'r ColumnValue> {
    row.get(column).filter(|v| !v.is_null())
}

/// Values of `columns` in `row`; `None` when any of them is null.
fn key_of(row: &Row, columns: &[String]) -> Option<Vec<ColumnValue>> {
    columns
        .iter()
        .map(|c| value_of(row, c).cloned())
        .collect()
}

fn matches_conditions(row: &Row, cmd: &ModificationCommand) -> bool {
    cmd.columns
        .iter()
        .filter(|c| c.is_condition)
        .all(|c| match row.get(&c.column_name) {
            Some(v) => v == c.condition_value() || (v.is_null() && c.condition_value().is_null()),
            None => c.condition_value().is_null(),
        })
}

/// Literal column defaults; anything else is left null.
fn default_value(column: &ColumnModel) -> ColumnValue {
    let null = ColumnValue::Null(column.kind);
    let Some(sql) = column.default_sql.as_deref().map(str::trim) else {
        return null;
    };
    match column.kind {
        ValueKind::Int => sql.parse().map(ColumnValue::Int).unwrap_or(null),
        ValueKind::Float => sql.parse().map(ColumnValue::Float).unwrap_or(null),
        ValueKind::Bool => match sql.to_ascii_lowercase().as_str() {
            "true" => ColumnValue::Bool(true),
            "false" => ColumnValue::Bool(false),
            _ => null,
        },
        ValueKind::Text => sql
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .map(|s| ColumnValue::Text(s.replace("''", "'")))
            .unwrap_or(null),
        ValueKind::Timestamp => ColumnValue::Timestamp(Utc::now()),
        ValueKind::Uuid => ColumnValue::Uuid(Uuid::now_v7()),
        _ => null,
    }
}

/// Store-generated value. Integers continue from the largest value in the
/// column on insert and count up on update.
fn generate(rows: Option<&Vec<Row>>, column: &ColumnModel, previous: Option<&ColumnValue>) -> ColumnValue {
    match (column.kind, previous) {
        (ValueKind::Int, Some(ColumnValue::Int(v))) => ColumnValue::Int(v + 1),
        (ValueKind::Int, _) => {
            let max = rows
                .into_iter()
                .flatten()
                .filter_map(|r| match r.get(&column.name) {
                    Some(ColumnValue::Int(v)) => Some(*v),
                    _ => None,
                })
                .max()
                .unwrap_or(0);
            ColumnValue::Int(max + 1)
        }
        (ValueKind::Uuid, _) => ColumnValue::Uuid(Uuid::now_v7()),
        (ValueKind::Timestamp, _) => ColumnValue::Timestamp(Utc::now()),
        (kind, _) => ColumnValue::Null(kind),
    }
}

fn read_back(cmd: &ModificationCommand, row: &Row) -> Vec<(String, ColumnValue)> {
    cmd.read_columns()
        .filter_map(|c| row.get(&c.column_name).map(|v| (c.column_name.clone(), v.clone())))
        .collect()
}

/// Constraints a row must satisfy to be stored. `skip` is the row's own
/// position when it replaces an existing row.
fn check_row(
    tables: &Tables,
    table: &TableModel,
    row: &Row,
    skip: Option<usize>,
) -> Result<(), DbError> {
    for col in table.columns.iter().filter(|c| !c.nullable) {
        if value_of(row, &col.name).is_none() {
            return Err(DbError::integrity(
                IntegrityKind::NotNull,
                &format!("{}.{}", table.name, col.name),
                format!("null value in column \"{}\" violates not-null constraint", col.name),
            ));
        }
    }

    let rows = tables.get(&table.name);
    let mut keys: Vec<(&str, &[String])> = Vec::new();
    if let Some(pk) = &table.primary_key {
        keys.push((pk.name.as_str(), pk.columns.as_slice()));
    }
    keys.extend(table.unique_constraints.iter().map(|k| (k.name.as_str(), k.columns.as_slice())));
    keys.extend(
        table
            .indexes
            .iter()
            .filter(|ix| ix.unique)
            .map(|ix| (ix.name.as_str(), ix.columns.as_slice())),
    );
    for (name, columns) in keys {
        let Some(key) = key_of(row, columns) else {
            continue;
        };
        let taken = rows.into_iter().flatten().enumerate().any(|(pos, other)| {
            Some(pos) != skip && key_of(other, columns).as_ref() == Some(&key)
        });
        if taken {
            return Err(DbError::integrity(
                IntegrityKind::Unique,
                name,
                format!("duplicate key value violates unique constraint \"{name}\""),
            ));
        }
    }

    for fk in &table.foreign_keys {
        let Some(key) = key_of(row, &fk.columns) else {
            continue;
        };
        let found = tables
            .get(&fk.principal_table)
            .into_iter()
            .flatten()
            .any(|p| key_of(p, &fk.principal_columns).as_ref() == Some(&key));
        // a row may reference itself
        let own = fk.principal_table == table.name
            && key_of(row, &fk.principal_columns).as_ref() == Some(&key);
        if !found && !own {
            return Err(DbError::integrity(
                IntegrityKind::ForeignKey,
                &fk.name,
                format!("insert or update on table \"{}\" violates foreign key constraint \"{}\"", table.name, fk.name),
            ));
        }
    }
    Ok(())
}

/// Rejects a change of referenced key values while dependents still point at them.
fn check_referenced(model: &Model, tables: &Tables, table: &TableModel, before: &Row, after: &Row) -> Result<(), DbError> {
    for (dependent, fk) in model.referencing(&table.name) {
        let Some(old) = key_of(before, &fk.principal_columns) else {
            continue;
        };
        if key_of(after, &fk.principal_columns).as_ref() == Some(&old) {
            continue;
        }
        let referenced = tables
            .get(&dependent.name)
            .into_iter()
            .flatten()
            .any(|d| d != before && key_of(d, &fk.columns).as_ref() == Some(&old));
        if referenced {
            return Err(DbError::integrity(
                IntegrityKind::ForeignKey,
                &fk.name,
                format!("update on table \"{}\" violates foreign key constraint \"{}\"", table.name, fk.name),
            ));
        }
    }
    Ok(())
}

fn remove_row(model: &Model, tables: &mut Tables, table: &str, row: &Row) -> Result<(), DbError> {
    if let Some(rows) = tables.get_mut(table) {
        if let Some(pos) = rows.iter().position(|r| r == row) {
            rows.remove(pos);
        }
    }
    for (dependent, fk) in model.referencing(table) {
        let Some(key) = key_of(row, &fk.principal_columns) else {
            continue;
        };
        let refs: Vec<Row> = tables
            .get(&dependent.name)
            .into_iter()
            .flatten()
            .filter(|d| key_of(d, &fk.columns).as_ref() == Some(&key))
            .cloned()
            .collect();
        if refs.is_empty() {
            continue;
        }
        match fk.on_delete {
            ReferentialAction::NoAction | ReferentialAction::Restrict => {
                return Err(DbError::integrity(
                    IntegrityKind::ForeignKey,
                    &fk.name,
                    format!(
                        "delete on table \"{}\" violates foreign key constraint \"{}\" on table \"{}\"",
                        table, fk.name, dependent.name
                    ),
                ));
            }
            ReferentialAction::Cascade => {
                for d in &refs {
                    remove_row(model, tables, &dependent.name, d)?;
                }
            }
            ReferentialAction::SetNull => {
                for d in tables.entry(dependent.name.clone()).or_default().iter_mut() {
                    if refs.contains(d) {
                        for c in &fk.columns {
                            let kind = d.get(c).map_or(ValueKind::Text, ColumnValue::kind);
                            d.insert(c.clone(), ColumnValue::Null(kind));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn insert(tables: &mut Tables, table: &TableModel, cmd: &ModificationCommand) -> Result<CommandResult, DbError> {
    let mut row = Row::new();
    for col in &table.columns {
        let value = match cmd.column(&col.name) {
            Some(c) if c.is_write => c.current_value.clone(),
            Some(c) if c.is_read => generate(tables.get(&table.name), col, None),
            _ => default_value(col),
        };
        row.insert(col.name.clone(), value);
    }
    check_row(tables, table, &row, None)?;
    let values = read_back(cmd, &row);
    tables.entry(table.name.clone()).or_default().push(row);
    Ok(CommandResult {
        rows_affected: 1,
        values,
    })
}

fn update(model: &Model, tables: &mut Tables, table: &TableModel, cmd: &ModificationCommand) -> Result<CommandResult, DbError> {
    let matched: Vec<usize> = tables
        .get(&table.name)
        .into_iter()
        .flatten()
        .enumerate()
        .filter(|(_, r)| matches_conditions(r, cmd))
        .map(|(pos, _)| pos)
        .collect();

    let mut values = Vec::new();
    for &pos in &matched {
        let before = tables[&table.name][pos].clone();
        let mut row = before.clone();
        for c in &cmd.columns {
            if c.is_write {
                row.insert(c.column_name.clone(), c.current_value.clone());
            } else if c.is_read {
                let Some(col) = table.find_column(&c.column_name) else {
                    continue;
                };
                row.insert(c.column_name.clone(), generate(None, col, before.get(&c.column_name)));
            }
        }
        check_row(tables, table, &row, Some(pos))?;
        check_referenced(model, tables, table, &before, &row)?;
        values = read_back(cmd, &row);
        if let Some(rows) = tables.get_mut(&table.name) {
            rows[pos] = row;
        }
    }
    Ok(CommandResult {
        rows_affected: matched.len() as u64,
        values,
    })
}

fn delete(model: &Model, tables: &mut Tables, table: &TableModel, cmd: &ModificationCommand) -> Result<CommandResult, DbError> {
    let matched: Vec<Row> = tables
        .get(&table.name)
        .into_iter()
        .flatten()
        .filter(|r| matches_conditions(r, cmd))
        .cloned()
        .collect();
    for row in &matched {
        remove_row(model, tables, &table.name, row)?;
    }
    Ok(CommandResult {
        rows_affected: matched.len() as u64,
        values: Vec::new(),
    })
}

impl MemoryConnection {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            committed: Tables::new(),
            working: None,
            journal: Vec::new(),
            pending: Vec::new(),
            transient_failures: 0,
            fail_commit: false,
            latency: None,
            stats: ConnectionStats::default(),
        }
    }

    /// Stores a committed row directly, with the same constraint checks as an insert.
    pub fn seed(&mut self, table: &str, values: &[(&str, ColumnValue)]) -> Result<(), DbError> {
        let model = self.model.table(table).map_err(|e| fatal(e.to_string()))?;
        let mut row = Row::new();
        for col in &model.columns {
            let value = match values.iter().find(|(name, _)| *name == col.name) {
                Some((_, v)) => v.clone(),
                None if col.generated_on_add() => generate(self.committed.get(table), col, None),
                None => default_value(col),
            };
            row.insert(col.name.clone(), value);
        }
        check_row(&self.committed, model, &row, None)?;
        self.committed.entry(table.to_string()).or_default().push(row);
        Ok(())
    }

    /// The next `count` batches fail with a transient error.
    pub fn fail_next_batches(&mut self, count: u32) {
        self.transient_failures = count;
    }

    /// The next commit fails and the transaction is lost.
    pub fn fail_next_commit(&mut self) {
        self.fail_commit = true;
    }

    /// Every batch waits this long before it runs.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = Some(latency);
    }

    pub fn rows(&self, table: &str) -> &[Row] {
        self.committed.get(table).map_or(&[], Vec::as_slice)
    }

    pub fn find_row(&self, table: &str, column: &str, value: &ColumnValue) -> Option<&Row> {
        self.rows(table).iter().find(|r| r.get(column) == Some(value))
    }

    pub fn journal(&self) -> &[JournalEntry] {
        &self.journal
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn in_transaction(&self) -> bool {
        self.working.is_some()
    }
}

impl BatchConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), DbError> {
        if self.working.is_some() {
            return Err(fatal("a transaction is already open"));
        }
        self.stats.begins += 1;
        self.working = Some(self.committed.clone());
        self.pending.clear();
        Ok(())
    }

    async fn execute_batch(&mut self, batch: &CommandBatch) -> Result<Vec<CommandResult>, DbError> {
        if self.working.is_none() {
            return Err(DbError::NoTransaction);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.stats.batches += 1;
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(DbError::Temporary("connection reset by peer".into()));
        }

        let mut results = Vec::with_capacity(batch.len());
        for cmd in batch.commands() {
            let table = self.model.table(&cmd.table_name).map_err(|e| fatal(e.to_string()))?;
            let tables = self.working.as_mut().ok_or(DbError::NoTransaction)?;
            let result = match cmd.operation {
                OperationKind::Insert => insert(tables, table, cmd)?,
                OperationKind::Update => update(&self.model, tables, table, cmd)?,
                OperationKind::Delete => delete(&self.model, tables, table, cmd)?,
            };
            self.pending.push(JournalEntry {
                entity: cmd.entity,
                table: cmd.table_name.clone(),
                operation: cmd.operation,
            });
            results.push(result);
        }
        Ok(results)
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let working = self.working.take().ok_or(DbError::NoTransaction)?;
        if self.fail_commit {
            self.fail_commit = false;
            self.pending.clear();
            return Err(DbError::Temporary("connection lost during commit".into()));
        }
        self.committed = working;
        self.journal.append(&mut self.pending);
        self.stats.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.working = None;
        self.pending.clear();
        self.stats.rollbacks += 1;
        Ok(())
    }
}

/// Tracker that records what the store reports back.
#[derive(Debug, Default)]
pub struct RecordingTracker {
    pub values: Vec<StoreValue>,
    pub accepted: Vec<EntityRef>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value reported for `entity.column`.
    pub fn value(&self, entity: u64, column: &str) -> Option<&ColumnValue> {
        self.values
            .iter()
            .rev()
            .find(|v| v.entity == EntityRef(entity) && v.column == column)
            .map(|v| &v.value)
    }
}

impl TrackedEntities for RecordingTracker {
    fn set_store_value(&mut self, entity: EntityRef, column: &str, value: ColumnValue) {
        self.values.push(StoreValue {
            entity,
            column: column.to_string(),
            value,
        });
    }

    fn accept_changes(&mut self, entities: &[EntityRef]) {
        self.accepted.extend_from_slice(entities);
    }
}
