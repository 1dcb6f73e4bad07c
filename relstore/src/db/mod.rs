mod batch;
mod command;
mod ddl;
mod executor;
mod graph;
mod migrations;
mod models;
mod operations;
mod preparer;
mod query;
mod store;
mod value;

pub use batch::{BatchFactory, CommandBatch};
pub use command::{
    ColumnModification, CommandId, EntityRef, EntityState, EntryChange, ModificationCommand,
    OperationKind, PropertyValue, ValueLink,
};
pub use ddl::{MigrationSqlGenerator, PgMigrationSqlGenerator};
pub use executor::*;
pub use graph::{Cycle, DependencyGraph};
pub use migrations::{column_shape, diff, table_shape, DiffError, ModelDiffer, StableHasher};
pub use models::{
    ColumnModel, ForeignKeyModel, IndexModel, KeyModel, Model, ModelError, QualifiedName,
    ReferentialAction, TableModel, ValueGenerated,
};
pub use operations::{LossyReason, MigrationOperation, MigrationPlan, PlannedOperation};
pub use preparer::{CommandBatchPreparer, DependencyReason};
pub use query::{quote_ident, ParameterRef, PgSqlGenerator, SqlGenerator, Statement, ValueVersion};
pub use store::{SaveSummary, Store, TrackedEntities};
pub use value::{ColumnValue, ValueKind};
