use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::query::quote_ident;
use crate::db::value::ValueKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("table {0} is declared twice")]
    DuplicateTable(String),

    #[error("table {0} does not exist")]
    UnknownTable(String),

    #[error("column {column} does not exist on {table}")]
    UnknownColumn { table: String, column: String },

    #[error("column {column} already exists on {table}")]
    DuplicateColumn { table: String, column: String },

    #[error("table {0} has no primary key")]
    MissingPrimaryKey(String),

    #[error("no value for key column {column} of {table}")]
    MissingKeyValue { table: String, column: String },

    #[error("constraint or index {name} does not exist on {table}")]
    UnknownConstraint { table: String, name: String },

    #[error("table {table} is still referenced by {by}")]
    Referenced { table: String, by: String },

    #[error("foreign key {name} on {table} maps {columns} columns onto {principal_columns}")]
    ForeignKeyArity {
        table: String,
        name: String,
        columns: usize,
        principal_columns: usize,
    },
}

/// Schema-qualified relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => f.write_str(&quote_ident(&self.name)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueGenerated {
    #[default]
    Never,
    OnAdd,
    OnAddOrUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnModel {
    pub name: String,
    pub store_type: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_sql: Option<String>,
    #[serde(default)]
    pub generated: ValueGenerated,
    #[serde(default)]
    pub concurrency_token: bool,
    /// Explicit rename hint pointing at the column's previous name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

impl ColumnModel {
    pub fn new(name: &str, store_type: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            store_type: store_type.to_string(),
            kind,
            nullable: false,
            default_sql: None,
            generated: ValueGenerated::Never,
            concurrency_token: false,
            renamed_from: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn generated(mut self, generated: ValueGenerated) -> Self {
        self.generated = generated;
        self
    }

    pub fn concurrency_token(mut self) -> Self {
        self.concurrency_token = true;
        self
    }

    pub fn default_sql(mut self, sql: &str) -> Self {
        self.default_sql = Some(sql.to_string());
        self
    }

    /// True when the store produces the value for an insert.
    pub fn generated_on_add(&self) -> bool {
        self.generated != ValueGenerated::Never
    }

    /// True when the store produces the value for an update.
    pub fn generated_on_update(&self) -> bool {
        self.generated == ValueGenerated::OnAddOrUpdate
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyModel {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexModel {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyModel {
    pub name: String,
    pub columns: Vec<String>,
    /// Name of the principal table inside the same model.
    pub principal_table: String,
    pub principal_columns: Vec<String>,
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableModel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub columns: Vec<ColumnModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<KeyModel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique_constraints: Vec<KeyModel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexModel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

impl TableModel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            schema: None,
            columns: Vec::new(),
            primary_key: None,
            unique_constraints: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            renamed_from: None,
        }
    }

    pub fn column(mut self, column: ColumnModel) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = Some(KeyModel {
            name: format!("pk_{}", self.name),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn unique(mut self, name: &str, columns: &[&str]) -> Self {
        self.unique_constraints.push(KeyModel {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn index(mut self, name: &str, columns: &[&str], unique: bool) -> Self {
        self.indexes.push(IndexModel {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
        });
        self
    }

    pub fn foreign_key(
        mut self,
        name: &str,
        columns: &[&str],
        principal_table: &str,
        principal_columns: &[&str],
    ) -> Self {
        self.foreign_keys.push(ForeignKeyModel {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            principal_table: principal_table.to_string(),
            principal_columns: principal_columns.iter().map(|c| c.to_string()).collect(),
            on_delete: ReferentialAction::NoAction,
        });
        self
    }

    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName {
            schema: self.schema.clone(),
            name: self.name.clone(),
        }
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnModel> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn find_column_mut(&mut self, name: &str) -> Option<&mut ColumnModel> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn key_columns(&self) -> &[String] {
        self.primary_key
            .as_ref()
            .map(|k| k.columns.as_slice())
            .unwrap_or_default()
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.key_columns().iter().any(|c| c == name)
    }

    /// Every set of columns whose values must be unique across rows:
    /// the primary key, unique constraints and unique indexes.
    pub fn unique_column_sets(&self) -> Vec<&[String]> {
        let mut sets = Vec::new();
        if let Some(pk) = &self.primary_key {
            sets.push(pk.columns.as_slice());
        }
        for uc in &self.unique_constraints {
            sets.push(uc.columns.as_slice());
        }
        for ix in self.indexes.iter().filter(|ix| ix.unique) {
            sets.push(ix.columns.as_slice());
        }
        sets
    }

    fn check_columns(&self, columns: &[String]) -> Result<(), ModelError> {
        for column in columns {
            if self.find_column(column).is_none() {
                return Err(ModelError::UnknownColumn {
                    table: self.name.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Immutable snapshot of the relational model.
///
/// Tables live in an arena keyed by their name; foreign keys refer to their
/// principal by that name, so the graph carries no ownership cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TableModel>", into = "Vec<TableModel>")]
pub struct Model {
    tables: IndexMap<String, TableModel>,
}

impl Model {
    pub fn new(tables: Vec<TableModel>) -> Result<Self, ModelError> {
        let mut map = IndexMap::with_capacity(tables.len());
        for table in tables {
            if map.contains_key(&table.name) {
                return Err(ModelError::DuplicateTable(table.name));
            }
            map.insert(table.name.clone(), table);
        }
        let model = Self { tables: map };
        model.validate()?;
        Ok(model)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        for table in self.tables.values() {
            if let Some(pk) = &table.primary_key {
                table.check_columns(&pk.columns)?;
            }
            for uc in &table.unique_constraints {
                table.check_columns(&uc.columns)?;
            }
            for ix in &table.indexes {
                table.check_columns(&ix.columns)?;
            }
            for fk in &table.foreign_keys {
                table.check_columns(&fk.columns)?;
                let principal = self.table(&fk.principal_table)?;
                principal.check_columns(&fk.principal_columns)?;
                if fk.columns.len() != fk.principal_columns.len() {
                    return Err(ModelError::ForeignKeyArity {
                        table: table.name.clone(),
                        name: fk.name.clone(),
                        columns: fk.columns.len(),
                        principal_columns: fk.principal_columns.len(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Result<&TableModel, ModelError> {
        self.tables
            .get(name)
            .ok_or_else(|| ModelError::UnknownTable(name.to_string()))
    }

    pub fn find_table(&self, name: &str) -> Option<&TableModel> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableModel> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Result<&mut TableModel, ModelError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| ModelError::UnknownTable(name.to_string()))
    }

    pub(crate) fn tables_mut(&mut self) -> impl Iterator<Item = &mut TableModel> {
        self.tables.values_mut()
    }

    pub(crate) fn insert_table(&mut self, table: TableModel) -> Result<(), ModelError> {
        if self.tables.contains_key(&table.name) {
            return Err(ModelError::DuplicateTable(table.name));
        }
        self.tables.insert(table.name.clone(), table);
        Ok(())
    }

    pub(crate) fn remove_table(&mut self, name: &str) -> Result<TableModel, ModelError> {
        self.tables
            .shift_remove(name)
            .ok_or_else(|| ModelError::UnknownTable(name.to_string()))
    }

    /// Foreign keys of other tables whose principal is `table`.
    pub fn referencing(&self, table: &str) -> Vec<(&TableModel, &ForeignKeyModel)> {
        let mut found = Vec::new();
        for t in self.tables.values() {
            for fk in &t.foreign_keys {
                if fk.principal_table == table {
                    found.push((t, fk));
                }
            }
        }
        found
    }
}

impl TryFrom<Vec<TableModel>> for Model {
    type Error = ModelError;

    fn try_from(tables: Vec<TableModel>) -> Result<Self, Self::Error> {
        Model::new(tables)
    }
}

impl From<Model> for Vec<TableModel> {
    fn from(model: Model) -> Self {
        model.tables.into_values().collect()
    }
}
