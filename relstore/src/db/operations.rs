use serde::{Deserialize, Serialize};

use crate::db::models::{
    ColumnModel, ForeignKeyModel, IndexModel, KeyModel, Model, ModelError, QualifiedName,
    TableModel,
};

/// One atomic schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MigrationOperation {
    EnsureSchema {
        name: String,
    },
    /// Carries columns, primary key and unique constraints. Indexes and
    /// foreign keys follow as their own operations.
    CreateTable {
        table: TableModel,
    },
    DropTable {
        table: QualifiedName,
    },
    RenameTable {
        table: QualifiedName,
        new_name: String,
        new_schema: Option<String>,
    },
    AddColumn {
        table: QualifiedName,
        column: ColumnModel,
    },
    DropColumn {
        table: QualifiedName,
        name: String,
    },
    AlterColumn {
        table: QualifiedName,
        column: ColumnModel,
        old: ColumnModel,
    },
    RenameColumn {
        table: QualifiedName,
        name: String,
        new_name: String,
    },
    AddPrimaryKey {
        table: QualifiedName,
        key: KeyModel,
    },
    DropPrimaryKey {
        table: QualifiedName,
        name: String,
    },
    AddUniqueConstraint {
        table: QualifiedName,
        key: KeyModel,
    },
    DropUniqueConstraint {
        table: QualifiedName,
        name: String,
    },
    AddForeignKey {
        table: QualifiedName,
        principal: QualifiedName,
        foreign_key: ForeignKeyModel,
    },
    DropForeignKey {
        table: QualifiedName,
        name: String,
    },
    CreateIndex {
        table: QualifiedName,
        index: IndexModel,
    },
    DropIndex {
        table: QualifiedName,
        name: String,
    },
}

impl MigrationOperation {
    /// Position of the operation's group in a plan. Within a group the
    /// differ's own order is kept.
    pub const fn phase(&self) -> u8 {
        match self {
            MigrationOperation::DropForeignKey { .. } => 0,
            MigrationOperation::DropIndex { .. }
            | MigrationOperation::DropUniqueConstraint { .. }
            | MigrationOperation::DropPrimaryKey { .. } => 1,
            MigrationOperation::DropColumn { .. } => 2,
            MigrationOperation::DropTable { .. } => 3,
            MigrationOperation::EnsureSchema { .. } => 4,
            MigrationOperation::RenameTable { .. } => 5,
            MigrationOperation::RenameColumn { .. } => 6,
            MigrationOperation::CreateTable { .. } => 7,
            MigrationOperation::AddColumn { .. } => 8,
            MigrationOperation::AlterColumn { .. } => 9,
            MigrationOperation::AddPrimaryKey { .. }
            | MigrationOperation::AddUniqueConstraint { .. } => 10,
            MigrationOperation::CreateIndex { .. } => 11,
            MigrationOperation::AddForeignKey { .. } => 12,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            MigrationOperation::EnsureSchema { .. } => "ensure_schema",
            MigrationOperation::CreateTable { .. } => "create_table",
            MigrationOperation::DropTable { .. } => "drop_table",
            MigrationOperation::RenameTable { .. } => "rename_table",
            MigrationOperation::AddColumn { .. } => "add_column",
            MigrationOperation::DropColumn { .. } => "drop_column",
            MigrationOperation::AlterColumn { .. } => "alter_column",
            MigrationOperation::RenameColumn { .. } => "rename_column",
            MigrationOperation::AddPrimaryKey { .. } => "add_primary_key",
            MigrationOperation::DropPrimaryKey { .. } => "drop_primary_key",
            MigrationOperation::AddUniqueConstraint { .. } => "add_unique_constraint",
            MigrationOperation::DropUniqueConstraint { .. } => "drop_unique_constraint",
            MigrationOperation::AddForeignKey { .. } => "add_foreign_key",
            MigrationOperation::DropForeignKey { .. } => "drop_foreign_key",
            MigrationOperation::CreateIndex { .. } => "create_index",
            MigrationOperation::DropIndex { .. } => "drop_index",
        }
    }
}

/// Why an operation may destroy data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LossyReason {
    DataLoss,
    /// The dropped object has the same shape as one being created. A rename
    /// hint on the new object would preserve the data.
    PossibleRename { from: String, to: String },
    TypeChange { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOperation {
    #[serde(flatten)]
    pub operation: MigrationOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lossy: Option<LossyReason>,
}

impl PlannedOperation {
    pub fn new(operation: MigrationOperation) -> Self {
        Self {
            operation,
            lossy: None,
        }
    }

    pub fn lossy(operation: MigrationOperation, reason: LossyReason) -> Self {
        Self {
            operation,
            lossy: Some(reason),
        }
    }
}

/// Ordered operations that evolve one model snapshot into another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationPlan {
    pub operations: Vec<PlannedOperation>,
}

impl MigrationPlan {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationOperation> {
        self.operations.iter().map(|p| &p.operation)
    }

    pub fn lossy(&self) -> impl Iterator<Item = &PlannedOperation> {
        self.operations.iter().filter(|p| p.lossy.is_some())
    }

    pub fn is_lossy(&self) -> bool {
        self.lossy().next().is_some()
    }

    /// Replays the plan on a copy of `model`.
    pub fn apply_to(&self, model: &Model) -> Result<Model, ModelError> {
        let mut next = model.clone();
        for op in self.iter() {
            next.apply(op)?;
        }
        next.validate()?;
        Ok(next)
    }
}

fn unknown_constraint(table: &TableModel, name: &str) -> ModelError {
    ModelError::UnknownConstraint {
        table: table.name.clone(),
        name: name.to_string(),
    }
}

fn rename_in(columns: &mut [String], from: &str, to: &str) {
    for c in columns.iter_mut().filter(|c| c.as_str() == from) {
        *c = to.to_string();
    }
}

impl Model {
    /// Applies one migration operation in memory, the way the database would.
    pub fn apply(&mut self, op: &MigrationOperation) -> Result<(), ModelError> {
        match op {
            MigrationOperation::EnsureSchema { .. } => {}
            MigrationOperation::CreateTable { table } => self.insert_table(table.clone())?,
            MigrationOperation::DropTable { table } => {
                if let Some((by, _)) = self
                    .referencing(&table.name)
                    .into_iter()
                    .find(|(t, _)| t.name != table.name)
                {
                    return Err(ModelError::Referenced {
                        table: table.name.clone(),
                        by: by.name.clone(),
                    });
                }
                self.remove_table(&table.name)?;
            }
            MigrationOperation::RenameTable {
                table,
                new_name,
                new_schema,
            } => {
                let mut renamed = self.remove_table(&table.name)?;
                renamed.name = new_name.clone();
                renamed.schema = new_schema.clone();
                self.insert_table(renamed)?;
                for t in self.tables_mut() {
                    for fk in t.foreign_keys.iter_mut() {
                        if fk.principal_table == table.name {
                            fk.principal_table = new_name.clone();
                        }
                    }
                }
            }
            MigrationOperation::AddColumn { table, column } => {
                let t = self.table_mut(&table.name)?;
                if t.find_column(&column.name).is_some() {
                    return Err(ModelError::DuplicateColumn {
                        table: t.name.clone(),
                        column: column.name.clone(),
                    });
                }
                t.columns.push(column.clone());
            }
            MigrationOperation::DropColumn { table, name } => {
                let t = self.table_mut(&table.name)?;
                let before = t.columns.len();
                t.columns.retain(|c| &c.name != name);
                if t.columns.len() == before {
                    return Err(ModelError::UnknownColumn {
                        table: t.name.clone(),
                        column: name.clone(),
                    });
                }
            }
            MigrationOperation::AlterColumn { table, column, .. } => {
                let t = self.table_mut(&table.name)?;
                let name = t.name.clone();
                let existing = t.find_column_mut(&column.name).ok_or(ModelError::UnknownColumn {
                    table: name,
                    column: column.name.clone(),
                })?;
                *existing = column.clone();
            }
            MigrationOperation::RenameColumn {
                table,
                name,
                new_name,
            } => self.rename_column(&table.name, name, new_name)?,
            MigrationOperation::AddPrimaryKey { table, key } => {
                self.table_mut(&table.name)?.primary_key = Some(key.clone());
            }
            MigrationOperation::DropPrimaryKey { table, name } => {
                let t = self.table_mut(&table.name)?;
                if !t.primary_key.as_ref().is_some_and(|pk| &pk.name == name) {
                    return Err(unknown_constraint(t, name));
                }
                t.primary_key = None;
            }
            MigrationOperation::AddUniqueConstraint { table, key } => {
                self.table_mut(&table.name)?.unique_constraints.push(key.clone());
            }
            MigrationOperation::DropUniqueConstraint { table, name } => {
                let t = self.table_mut(&table.name)?;
                let Some(pos) = t.unique_constraints.iter().position(|k| &k.name == name) else {
                    return Err(unknown_constraint(t, name));
                };
                t.unique_constraints.remove(pos);
            }
            MigrationOperation::AddForeignKey {
                table, foreign_key, ..
            } => {
                self.table(&foreign_key.principal_table)?;
                self.table_mut(&table.name)?.foreign_keys.push(foreign_key.clone());
            }
            MigrationOperation::DropForeignKey { table, name } => {
                let t = self.table_mut(&table.name)?;
                let Some(pos) = t.foreign_keys.iter().position(|fk| &fk.name == name) else {
                    return Err(unknown_constraint(t, name));
                };
                t.foreign_keys.remove(pos);
            }
            MigrationOperation::CreateIndex { table, index } => {
                self.table_mut(&table.name)?.indexes.push(index.clone());
            }
            MigrationOperation::DropIndex { table, name } => {
                let t = self.table_mut(&table.name)?;
                let Some(pos) = t.indexes.iter().position(|ix| &ix.name == name) else {
                    return Err(unknown_constraint(t, name));
                };
                t.indexes.remove(pos);
            }
        }
        Ok(())
    }

    /// Renames a column along with every key, index and foreign key naming it.
    fn rename_column(&mut self, table: &str, from: &str, to: &str) -> Result<(), ModelError> {
        let t = self.table_mut(table)?;
        if t.find_column(to).is_some() {
            return Err(ModelError::DuplicateColumn {
                table: t.name.clone(),
                column: to.to_string(),
            });
        }
        let name = t.name.clone();
        let column = t.find_column_mut(from).ok_or(ModelError::UnknownColumn {
            table: name,
            column: from.to_string(),
        })?;
        column.name = to.to_string();

        if let Some(pk) = t.primary_key.as_mut() {
            rename_in(&mut pk.columns, from, to);
        }
        for uc in t.unique_constraints.iter_mut() {
            rename_in(&mut uc.columns, from, to);
        }
        for ix in t.indexes.iter_mut() {
            rename_in(&mut ix.columns, from, to);
        }
        for fk in t.foreign_keys.iter_mut() {
            rename_in(&mut fk.columns, from, to);
        }
        for other in self.tables_mut() {
            for fk in other.foreign_keys.iter_mut() {
                if fk.principal_table == table {
                    rename_in(&mut fk.principal_columns, from, to);
                }
            }
        }
        Ok(())
    }
}
