use sqlx::postgres::PgArguments;

use crate::db::command::{ColumnModification, ModificationCommand, OperationKind};
use crate::db::value::ColumnValue;
use crate::db::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueVersion {
    Current,
    Original,
}

/// Points a placeholder at a column of the command the statement was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterRef {
    pub column: usize,
    pub version: ValueVersion,
}

/// Rendered text of one command plus the columns its placeholders bind.
///
/// Values are resolved at execution time, so columns patched with
/// propagated keys are bound with their final value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statement {
    sql: String,
    params: Vec<ParameterRef>,
    returning: Vec<usize>,
}

impl Statement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> &mut Self {
        self.sql.push_str(fragment);
        self
    }

    pub fn push_param(&mut self, column: usize, version: ValueVersion) -> &mut Self {
        self.params.push(ParameterRef { column, version });
        self.sql.push('$');
        self.sql.push_str(&self.params.len().to_string());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[ParameterRef] {
        &self.params
    }

    /// Column indexes the statement returns, in select-list order.
    pub fn returning(&self) -> &[usize] {
        &self.returning
    }

    pub fn returns_rows(&self) -> bool {
        !self.returning.is_empty()
    }

    pub fn values<'a>(&self, command: &'a ModificationCommand) -> Vec<&'a ColumnValue> {
        self.params
            .iter()
            .map(|p| {
                let col = &command.columns[p.column];
                match p.version {
                    ValueVersion::Current => &col.current_value,
                    ValueVersion::Original => col.condition_value(),
                }
            })
            .collect()
    }

    pub fn bind(&self, command: &ModificationCommand) -> Result<PgArguments, DbError> {
        let mut args = PgArguments::default();
        for value in self.values(command) {
            value.bind(&mut args)?;
        }
        Ok(args)
    }

    /// Statement text with the bound values inlined, for logs only.
    pub fn debug_sql(&self, command: &ModificationCommand) -> String {
        let mut out = self.sql.clone();
        for (i, value) in self.values(command).iter().enumerate().rev() {
            out = out.replace(&format!("${}", i + 1), &value.to_string());
        }
        out
    }
}

/// Renders modification commands into provider SQL.
pub trait SqlGenerator {
    fn generate(&self, command: &ModificationCommand) -> Statement;

    fn statement_separator(&self) -> &'static str {
        ";\n"
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// PostgreSQL rendering with `RETURNING` for read-back columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgSqlGenerator;

impl PgSqlGenerator {
    fn push_returning(stmt: &mut Statement, columns: &[ColumnModification]) {
        let reads: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_read)
            .map(|(i, _)| i)
            .collect();
        if reads.is_empty() {
            return;
        }
        stmt.push(" RETURNING ");
        for (n, ix) in reads.iter().enumerate() {
            if n > 0 {
                stmt.push(", ");
            }
            stmt.push(&quote_ident(&columns[*ix].column_name));
        }
        stmt.returning = reads;
    }

    fn push_where(stmt: &mut Statement, columns: &[ColumnModification]) {
        stmt.push(" WHERE ");
        let mut first = true;
        for (ix, col) in columns.iter().enumerate().filter(|(_, c)| c.is_condition) {
            if !first {
                stmt.push(" AND ");
            }
            first = false;
            stmt.push(&quote_ident(&col.column_name));
            if col.condition_value().is_null() {
                stmt.push(" IS NULL");
            } else {
                stmt.push(" = ");
                stmt.push_param(ix, ValueVersion::Original);
            }
        }
    }

    fn insert(command: &ModificationCommand) -> Statement {
        let mut stmt = Statement::new();
        stmt.push("INSERT INTO ");
        stmt.push(&command.qualified_name().to_string());
        let writes: Vec<usize> = command
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_write)
            .map(|(i, _)| i)
            .collect();
        if writes.is_empty() {
            stmt.push(" DEFAULT VALUES");
        } else {
            stmt.push(" (");
            for (n, ix) in writes.iter().enumerate() {
                if n > 0 {
                    stmt.push(", ");
                }
                stmt.push(&quote_ident(&command.columns[*ix].column_name));
            }
            stmt.push(") VALUES (");
            for (n, ix) in writes.iter().enumerate() {
                if n > 0 {
                    stmt.push(", ");
                }
                stmt.push_param(*ix, ValueVersion::Current);
            }
            stmt.push(")");
        }
        Self::push_returning(&mut stmt, &command.columns);
        stmt
    }

    fn update(command: &ModificationCommand) -> Statement {
        let mut stmt = Statement::new();
        stmt.push("UPDATE ");
        stmt.push(&command.qualified_name().to_string());
        stmt.push(" SET ");
        let mut first = true;
        for (ix, col) in command.columns.iter().enumerate().filter(|(_, c)| c.is_write) {
            if !first {
                stmt.push(", ");
            }
            first = false;
            stmt.push(&quote_ident(&col.column_name));
            stmt.push(" = ");
            stmt.push_param(ix, ValueVersion::Current);
        }
        Self::push_where(&mut stmt, &command.columns);
        Self::push_returning(&mut stmt, &command.columns);
        stmt
    }

    fn delete(command: &ModificationCommand) -> Statement {
        let mut stmt = Statement::new();
        stmt.push("DELETE FROM ");
        stmt.push(&command.qualified_name().to_string());
        Self::push_where(&mut stmt, &command.columns);
        stmt
    }
}

impl SqlGenerator for PgSqlGenerator {
    fn generate(&self, command: &ModificationCommand) -> Statement {
        match command.operation {
            OperationKind::Insert => Self::insert(command),
            OperationKind::Update => Self::update(command),
            OperationKind::Delete => Self::delete(command),
        }
    }
}
