use std::fmt;

use serde::{Deserialize, Serialize};

use crate::db::models::{Model, ModelError, QualifiedName, TableModel};
use crate::db::value::ColumnValue;

/// Opaque handle to an entity owned by the change tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef(pub u64);

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Added,
    Modified,
    Deleted,
}

/// One property of a tracked entity as reported by the change tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<ColumnValue>,
    pub current: ColumnValue,
    #[serde(default)]
    pub modified: bool,
    /// The current value is a placeholder until the store generates the real one.
    #[serde(default)]
    pub temporary: bool,
}

impl PropertyValue {
    pub fn new(column: &str, current: impl Into<ColumnValue>) -> Self {
        Self {
            column: column.to_string(),
            original: None,
            current: current.into(),
            modified: false,
            temporary: false,
        }
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn modified_from(mut self, original: impl Into<ColumnValue>) -> Self {
        self.original = Some(original.into());
        self.modified = true;
        self
    }

    pub fn original(mut self, original: impl Into<ColumnValue>) -> Self {
        self.original = Some(original.into());
        self
    }

    /// Value the store currently holds for this property.
    pub fn stored(&self) -> &ColumnValue {
        self.original.as_ref().unwrap_or(&self.current)
    }
}

/// Change descriptor for a single tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryChange {
    pub entity: EntityRef,
    pub table: String,
    pub state: EntityState,
    pub values: Vec<PropertyValue>,
}

impl EntryChange {
    pub fn new(entity: u64, table: &str, state: EntityState) -> Self {
        Self {
            entity: EntityRef(entity),
            table: table.to_string(),
            state,
            values: Vec::new(),
        }
    }

    pub fn value(mut self, value: PropertyValue) -> Self {
        self.values.push(value);
        self
    }

    pub(crate) fn find(&self, column: &str) -> Option<&PropertyValue> {
        self.values.iter().find(|v| v.column == column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// Position of a command in the save operation it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub usize);

/// Marks a column whose value arrives from another command's read-back column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueLink {
    pub command: CommandId,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnModification {
    pub column_name: String,
    pub original_value: Option<ColumnValue>,
    pub current_value: ColumnValue,
    pub is_key: bool,
    pub is_condition: bool,
    pub is_write: bool,
    pub is_read: bool,
    pub link: Option<ValueLink>,
}

impl ColumnModification {
    /// Value used in a WHERE clause.
    pub fn condition_value(&self) -> &ColumnValue {
        self.original_value.as_ref().unwrap_or(&self.current_value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModificationCommand {
    pub id: CommandId,
    pub entity: EntityRef,
    pub table_name: String,
    pub schema: Option<String>,
    pub operation: OperationKind,
    pub columns: Vec<ColumnModification>,
}

impl ModificationCommand {
    /// Builds the command for one change descriptor. Returns `None` when an
    /// update has nothing to send.
    pub fn from_change(
        id: CommandId,
        change: &EntryChange,
        model: &Model,
    ) -> Result<Option<Self>, ModelError> {
        let table = model.table(&change.table)?;
        for value in &change.values {
            if table.find_column(&value.column).is_none() {
                return Err(ModelError::UnknownColumn {
                    table: table.name.clone(),
                    column: value.column.clone(),
                });
            }
        }
        if change.state != EntityState::Added {
            let Some(pk) = &table.primary_key else {
                return Err(ModelError::MissingPrimaryKey(table.name.clone()));
            };
            // updates and deletes locate their row by key
            if let Some(column) = pk
                .columns
                .iter()
                .find(|name| change.find(name).is_none_or(|v| v.stored().is_null()))
            {
                return Err(ModelError::MissingKeyValue {
                    table: table.name.clone(),
                    column: column.clone(),
                });
            }
        }

        let columns = match change.state {
            EntityState::Added => Self::insert_columns(table, change),
            EntityState::Modified => Self::update_columns(table, change),
            EntityState::Deleted => Self::delete_columns(table, change),
        };

        let operation = match change.state {
            EntityState::Added => OperationKind::Insert,
            EntityState::Modified => OperationKind::Update,
            EntityState::Deleted => OperationKind::Delete,
        };

        if operation == OperationKind::Update && !columns.iter().any(|c| c.is_write) {
            return Ok(None);
        }

        Ok(Some(Self {
            id,
            entity: change.entity,
            table_name: table.name.clone(),
            schema: table.schema.clone(),
            operation,
            columns,
        }))
    }

    fn insert_columns(table: &TableModel, change: &EntryChange) -> Vec<ColumnModification> {
        let mut columns = Vec::new();
        for col in &table.columns {
            let value = change.find(&col.name);
            let is_key = table.is_key_column(&col.name);
            let store_generated =
                col.generated_on_add() && value.is_none_or(|v| v.temporary);
            let current = match value {
                Some(v) => v.current.clone(),
                None if store_generated => ColumnValue::Null(col.kind),
                // left to the column default
                None => continue,
            };
            columns.push(ColumnModification {
                column_name: col.name.clone(),
                original_value: None,
                current_value: current,
                is_key,
                is_condition: false,
                is_write: !store_generated,
                is_read: store_generated,
                link: None,
            });
        }
        columns
    }

    fn update_columns(table: &TableModel, change: &EntryChange) -> Vec<ColumnModification> {
        let mut columns = Vec::new();
        for col in &table.columns {
            let value = change.find(&col.name);
            let is_key = table.is_key_column(&col.name);
            let is_condition = is_key || col.concurrency_token;
            let is_write = value.is_some_and(|v| v.modified) && !col.generated_on_update();
            let is_read = col.generated_on_update();
            if !(is_condition || is_write || is_read) {
                continue;
            }
            let (original, current) = match value {
                Some(v) => (v.original.clone(), v.current.clone()),
                None => (None, ColumnValue::Null(col.kind)),
            };
            columns.push(ColumnModification {
                column_name: col.name.clone(),
                original_value: original,
                current_value: current,
                is_key,
                is_condition,
                is_write,
                is_read,
                link: None,
            });
        }
        columns
    }

    fn delete_columns(table: &TableModel, change: &EntryChange) -> Vec<ColumnModification> {
        let mut columns = Vec::new();
        for col in &table.columns {
            let is_key = table.is_key_column(&col.name);
            if !(is_key || col.concurrency_token) {
                continue;
            }
            let Some(value) = change.find(&col.name) else {
                continue;
            };
            columns.push(ColumnModification {
                column_name: col.name.clone(),
                original_value: value.original.clone(),
                current_value: value.current.clone(),
                is_key,
                is_condition: true,
                is_write: false,
                is_read: false,
                link: None,
            });
        }
        columns
    }

    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName {
            schema: self.schema.clone(),
            name: self.table_name.clone(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnModification> {
        self.columns.iter().find(|c| c.column_name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnModification> {
        self.columns.iter_mut().find(|c| c.column_name == name)
    }

    pub fn has_conditions(&self) -> bool {
        self.columns.iter().any(|c| c.is_condition)
    }

    pub fn read_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_read)
    }

    pub fn requires_read_back(&self) -> bool {
        self.columns.iter().any(|c| c.is_read)
    }

    pub fn links(&self) -> impl Iterator<Item = &ValueLink> {
        self.columns.iter().filter_map(|c| c.link.as_ref())
    }

    /// True when the command changes any of `columns`.
    pub(crate) fn writes_any(&self, columns: &[String]) -> bool {
        columns
            .iter()
            .filter_map(|name| self.column(name))
            .any(|c| c.is_write && c.original_value.as_ref() != Some(&c.current_value))
    }

    pub fn parameter_count(&self) -> usize {
        self.columns
            .iter()
            .map(|c| usize::from(c.is_write) + usize::from(c.is_condition && !c.condition_value().is_null()))
            .sum()
    }
}
