use std::collections::HashSet;
use std::hash::{BuildHasher, Hash, Hasher};

use thiserror::Error;
use twox_hash::XxHash64;

use crate::db::graph::DependencyGraph;
use crate::db::models::{ColumnModel, ForeignKeyModel, KeyModel, Model, TableModel};
use crate::db::operations::{LossyReason, MigrationOperation, MigrationPlan, PlannedOperation};

#[derive(Clone, Default)]
pub struct StableHasherBuilder;

impl BuildHasher for StableHasherBuilder {
    type Hasher = StableHasher;
    fn build_hasher(&self) -> Self::Hasher {
        StableHasher::new()
    }
}

/// Seeded xxhash, so shape keys are identical across runs and builds.
pub struct StableHasher(XxHash64);

impl StableHasher {
    const DEFAULT_SEED: u64 = 27;

    pub fn new() -> Self {
        Self(XxHash64::with_seed(Self::DEFAULT_SEED))
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for StableHasher {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes);
    }

    #[inline]
    fn finish(&self) -> u64 {
        self.0.finish()
    }
}

type StableHashMap<K, V> = std::collections::HashMap<K, V, StableHasherBuilder>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DiffError {
    #[error("{role} {name} is claimed as a rename by both {first} and {second}")]
    AmbiguousRename {
        role: String,
        name: String,
        first: String,
        second: String,
    },
}

impl DiffError {
    pub const fn code(&self) -> &'static str {
        match self {
            DiffError::AmbiguousRename { .. } => "ambiguous_rename",
        }
    }
}

const SEPARATOR: &str = "|--|";

fn hash_column(column: &ColumnModel, hasher: &mut StableHasher) {
    column.store_type.hash(hasher);
    SEPARATOR.hash(hasher);
    column.kind.hash(hasher);
    column.nullable.hash(hasher);
    column.default_sql.hash(hasher);
    column.generated.hash(hasher);
    SEPARATOR.hash(hasher);
}

/// Hash of a column's definition, ignoring its name.
pub fn column_shape(column: &ColumnModel) -> u64 {
    let mut hasher = StableHasher::new();
    hash_column(column, &mut hasher);
    hasher.finish()
}

/// Hash of a table's column definitions in declaration order, ignoring every name.
pub fn table_shape(table: &TableModel) -> u64 {
    let mut hasher = StableHasher::new();
    "table".hash(&mut hasher);
    SEPARATOR.hash(&mut hasher);
    for column in &table.columns {
        hash_column(column, &mut hasher);
    }
    table.key_columns().len().hash(&mut hasher);
    hasher.finish()
}

/// Columns whose definition changes need an ALTER.
fn same_definition(a: &ColumnModel, b: &ColumnModel) -> bool {
    a.store_type == b.store_type
        && a.kind == b.kind
        && a.nullable == b.nullable
        && a.default_sql == b.default_sql
        && a.generated == b.generated
}

fn ambiguous(role: &str, name: String, first: &str, second: &str) -> DiffError {
    DiffError::AmbiguousRename {
        role: role.to_string(),
        name,
        first: first.to_string(),
        second: second.to_string(),
    }
}

/// A source table and the target table it became.
struct TablePair<'a> {
    old: &'a TableModel,
    new: &'a TableModel,
    /// old column name -> new column name
    forward: StableHashMap<&'a str, &'a str>,
    /// new column name -> old column name
    reverse: StableHashMap<&'a str, &'a str>,
}

impl<'a> TablePair<'a> {
    fn new(old: &'a TableModel, new: &'a TableModel) -> Result<Self, DiffError> {
        let mut forward = StableHashMap::default();
        let mut reverse = StableHashMap::default();
        for col in &new.columns {
            let source = match old.find_column(&col.name) {
                Some(same) => Some(same),
                None => col
                    .renamed_from
                    .as_deref()
                    .filter(|hint| new.find_column(hint).is_none())
                    .and_then(|hint| old.find_column(hint)),
            };
            let Some(source) = source else {
                continue;
            };
            if let Some(first) = forward.insert(source.name.as_str(), col.name.as_str()) {
                let name = format!("{}.{}", old.name, source.name);
                return Err(ambiguous("column", name, first, &col.name));
            }
            reverse.insert(col.name.as_str(), source.name.as_str());
        }
        Ok(Self {
            old,
            new,
            forward,
            reverse,
        })
    }

    /// Old column names translated to their new names; `None` if one was dropped.
    fn map(&self, columns: &[String]) -> Option<Vec<String>> {
        columns
            .iter()
            .map(|c| self.forward.get(c.as_str()).map(|n| n.to_string()))
            .collect()
    }

    fn same_key(&self, old: &KeyModel, new: &KeyModel) -> bool {
        old.name == new.name && self.map(&old.columns).as_ref() == Some(&new.columns)
    }
}

/// Facts gathered while diffing tables that decide which foreign keys
/// have to be rebuilt.
#[derive(Default)]
struct Rebuilds {
    /// (new table, new column) whose store type changed
    altered: HashSet<(String, String)>,
    /// (new table, key columns) of keys that are dropped and added again
    keys: HashSet<(String, Vec<String>)>,
}

/// Computes the operations that turn one model snapshot into another.
/// Single use: build it for a pair of models, then call [`ModelDiffer::diff`].
pub struct ModelDiffer<'a> {
    source: &'a Model,
    target: &'a Model,
    pairs: Vec<TablePair<'a>>,
    created: Vec<&'a TableModel>,
    dropped: Vec<&'a TableModel>,
}

impl<'a> ModelDiffer<'a> {
    pub fn new(source: &'a Model, target: &'a Model) -> Result<Self, DiffError> {
        let mut pairs: Vec<TablePair<'a>> = Vec::new();
        let mut claims: StableHashMap<&str, &str> = StableHashMap::default();
        let mut created = Vec::new();

        for new in target.tables() {
            if let Some(old) = source.find_table(&new.name) {
                pairs.push(TablePair::new(old, new)?);
                continue;
            }
            let hinted = new
                .renamed_from
                .as_deref()
                .filter(|hint| target.find_table(hint).is_none())
                .and_then(|hint| source.find_table(hint));
            let Some(old) = hinted else {
                created.push(new);
                continue;
            };
            if let Some(first) = claims.insert(old.name.as_str(), new.name.as_str()) {
                return Err(ambiguous("table", old.name.clone(), first, &new.name));
            }
            pairs.push(TablePair::new(old, new)?);
        }

        let matched: HashSet<&str> = pairs.iter().map(|p| p.old.name.as_str()).collect();
        let dropped = source
            .tables()
            .filter(|t| !matched.contains(t.name.as_str()))
            .collect();

        Ok(Self {
            source,
            target,
            pairs,
            created,
            dropped,
        })
    }

    pub fn diff(self) -> MigrationPlan {
        let mut ops = Vec::new();
        let mut rebuilds = Rebuilds::default();

        for pair in &self.pairs {
            Self::diff_table(pair, &mut ops, &mut rebuilds);
        }
        for pair in &self.pairs {
            self.diff_foreign_keys(pair, &rebuilds, &mut ops);
        }
        self.drop_tables(&mut ops);
        self.ensure_schemas(&mut ops);
        self.create_tables(&mut ops);

        // stable, so each group keeps the order it was emitted in
        ops.sort_by_key(|p: &PlannedOperation| p.operation.phase());

        let plan = MigrationPlan { operations: ops };
        tracing::debug!(
            operations = plan.len(),
            lossy = plan.lossy().count(),
            "computed migration plan"
        );
        plan
    }

    fn diff_table(pair: &TablePair<'a>, ops: &mut Vec<PlannedOperation>, rebuilds: &mut Rebuilds) {
        let (old, new) = (pair.old, pair.new);
        let old_qn = old.qualified_name();
        let new_qn = new.qualified_name();

        if old.name != new.name || old.schema != new.schema {
            ops.push(PlannedOperation::new(MigrationOperation::RenameTable {
                table: old_qn.clone(),
                new_name: new.name.clone(),
                new_schema: new.schema.clone(),
            }));
        }

        let added: Vec<&ColumnModel> = new
            .columns
            .iter()
            .filter(|c| !pair.reverse.contains_key(c.name.as_str()))
            .collect();

        for col in old.columns.iter().filter(|c| !pair.forward.contains_key(c.name.as_str())) {
            let shape = column_shape(col);
            let reason = match added.iter().find(|a| column_shape(a) == shape) {
                Some(a) => LossyReason::PossibleRename {
                    from: col.name.clone(),
                    to: a.name.clone(),
                },
                None => LossyReason::DataLoss,
            };
            ops.push(PlannedOperation::lossy(
                MigrationOperation::DropColumn {
                    table: old_qn.clone(),
                    name: col.name.clone(),
                },
                reason,
            ));
        }

        for col in &new.columns {
            let Some(prev) = pair
                .reverse
                .get(col.name.as_str())
                .and_then(|name| old.find_column(name))
            else {
                ops.push(PlannedOperation::new(MigrationOperation::AddColumn {
                    table: new_qn.clone(),
                    column: col.clone(),
                }));
                continue;
            };
            if prev.name != col.name {
                ops.push(PlannedOperation::new(MigrationOperation::RenameColumn {
                    table: new_qn.clone(),
                    name: prev.name.clone(),
                    new_name: col.name.clone(),
                }));
            }
            if same_definition(prev, col) {
                continue;
            }
            let alter = MigrationOperation::AlterColumn {
                table: new_qn.clone(),
                column: col.clone(),
                old: prev.clone(),
            };
            if prev.store_type != col.store_type || prev.kind != col.kind {
                rebuilds.altered.insert((new.name.clone(), col.name.clone()));
                ops.push(PlannedOperation::lossy(
                    alter,
                    LossyReason::TypeChange {
                        from: prev.store_type.clone(),
                        to: col.store_type.clone(),
                    },
                ));
            } else {
                ops.push(PlannedOperation::new(alter));
            }
        }

        let pk_kept = match (&old.primary_key, &new.primary_key) {
            (Some(o), Some(n)) => pair.same_key(o, n),
            (None, None) => true,
            _ => false,
        };
        if !pk_kept {
            if let Some(pk) = &old.primary_key {
                ops.push(PlannedOperation::new(MigrationOperation::DropPrimaryKey {
                    table: old_qn.clone(),
                    name: pk.name.clone(),
                }));
            }
            if let Some(pk) = &new.primary_key {
                rebuilds.keys.insert((new.name.clone(), pk.columns.clone()));
                ops.push(PlannedOperation::new(MigrationOperation::AddPrimaryKey {
                    table: new_qn.clone(),
                    key: pk.clone(),
                }));
            }
        }

        for key in &old.unique_constraints {
            if !new.unique_constraints.iter().any(|n| pair.same_key(key, n)) {
                ops.push(PlannedOperation::new(MigrationOperation::DropUniqueConstraint {
                    table: old_qn.clone(),
                    name: key.name.clone(),
                }));
            }
        }
        for key in &new.unique_constraints {
            if !old.unique_constraints.iter().any(|o| pair.same_key(o, key)) {
                rebuilds.keys.insert((new.name.clone(), key.columns.clone()));
                ops.push(PlannedOperation::new(MigrationOperation::AddUniqueConstraint {
                    table: new_qn.clone(),
                    key: key.clone(),
                }));
            }
        }

        let same_index = |o: &crate::db::models::IndexModel, n: &crate::db::models::IndexModel| {
            o.name == n.name && o.unique == n.unique && pair.map(&o.columns).as_ref() == Some(&n.columns)
        };
        for ix in &old.indexes {
            if !new.indexes.iter().any(|n| same_index(ix, n)) {
                ops.push(PlannedOperation::new(MigrationOperation::DropIndex {
                    table: old_qn.clone(),
                    name: ix.name.clone(),
                }));
            }
        }
        for ix in &new.indexes {
            if !old.indexes.iter().any(|o| same_index(o, ix)) {
                ops.push(PlannedOperation::new(MigrationOperation::CreateIndex {
                    table: new_qn.clone(),
                    index: ix.clone(),
                }));
            }
        }
    }

    /// True when `old` on the source side still describes `new` after renames.
    fn maps_onto(&self, pair: &TablePair<'a>, old: &ForeignKeyModel, new: &ForeignKeyModel) -> bool {
        let Some(principal) = self.pairs.iter().find(|p| p.old.name == old.principal_table) else {
            return false;
        };
        old.name == new.name
            && old.on_delete == new.on_delete
            && principal.new.name == new.principal_table
            && pair.map(&old.columns).as_ref() == Some(&new.columns)
            && principal.map(&old.principal_columns).as_ref() == Some(&new.principal_columns)
    }

    fn needs_rebuild(table: &TableModel, fk: &ForeignKeyModel, rebuilds: &Rebuilds) -> bool {
        let altered = |t: &str, c: &String| rebuilds.altered.contains(&(t.to_string(), c.clone()));
        rebuilds
            .keys
            .contains(&(fk.principal_table.clone(), fk.principal_columns.clone()))
            || fk.columns.iter().any(|c| altered(&table.name, c))
            || fk.principal_columns.iter().any(|c| altered(&fk.principal_table, c))
    }

    fn diff_foreign_keys(
        &self,
        pair: &TablePair<'a>,
        rebuilds: &Rebuilds,
        ops: &mut Vec<PlannedOperation>,
    ) {
        let (old, new) = (pair.old, pair.new);
        let kept = |o: &ForeignKeyModel, n: &ForeignKeyModel| {
            self.maps_onto(pair, o, n) && !Self::needs_rebuild(new, n, rebuilds)
        };
        for fk in &old.foreign_keys {
            if !new.foreign_keys.iter().any(|n| kept(fk, n)) {
                ops.push(PlannedOperation::new(MigrationOperation::DropForeignKey {
                    table: old.qualified_name(),
                    name: fk.name.clone(),
                }));
            }
        }
        for fk in &new.foreign_keys {
            if !old.foreign_keys.iter().any(|o| kept(o, fk)) {
                ops.push(self.add_foreign_key(new, fk));
            }
        }
    }

    fn add_foreign_key(&self, table: &TableModel, fk: &ForeignKeyModel) -> PlannedOperation {
        let principal = match self.target.find_table(&fk.principal_table) {
            Some(p) => p.qualified_name(),
            None => crate::db::models::QualifiedName::new(None, &fk.principal_table),
        };
        PlannedOperation::new(MigrationOperation::AddForeignKey {
            table: table.qualified_name(),
            principal,
            foreign_key: fk.clone(),
        })
    }

    /// Drops unmatched source tables, dependents before their principals.
    fn drop_tables(&self, ops: &mut Vec<PlannedOperation>) {
        if self.dropped.is_empty() {
            return;
        }
        let index: StableHashMap<&str, usize> = self
            .dropped
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        let mut graph = DependencyGraph::new(self.dropped.len());
        for (i, t) in self.dropped.iter().enumerate() {
            for fk in &t.foreign_keys {
                if let Some(&p) = index.get(fk.principal_table.as_str()) {
                    graph.add_edge(i, p, fk.name.as_str());
                }
            }
        }

        let order = match graph.topological_sort() {
            Ok(order) => order,
            Err(_) => {
                // mutually referencing tables: cut the links first
                for t in &self.dropped {
                    for fk in &t.foreign_keys {
                        if fk.principal_table != t.name && index.contains_key(fk.principal_table.as_str()) {
                            ops.push(PlannedOperation::new(MigrationOperation::DropForeignKey {
                                table: t.qualified_name(),
                                name: fk.name.clone(),
                            }));
                        }
                    }
                }
                (0..self.dropped.len()).collect()
            }
        };

        for i in order {
            let table = self.dropped[i];
            let shape = table_shape(table);
            let reason = match self.created.iter().find(|c| table_shape(c) == shape) {
                Some(c) => LossyReason::PossibleRename {
                    from: table.name.clone(),
                    to: c.name.clone(),
                },
                None => LossyReason::DataLoss,
            };
            ops.push(PlannedOperation::lossy(
                MigrationOperation::DropTable {
                    table: table.qualified_name(),
                },
                reason,
            ));
        }
    }

    fn ensure_schemas(&self, ops: &mut Vec<PlannedOperation>) {
        let existing: HashSet<&str> = self
            .source
            .tables()
            .filter_map(|t| t.schema.as_deref())
            .collect();
        let mut seen = HashSet::new();
        for schema in self.target.tables().filter_map(|t| t.schema.as_deref()) {
            if !existing.contains(schema) && seen.insert(schema) {
                ops.push(PlannedOperation::new(MigrationOperation::EnsureSchema {
                    name: schema.to_string(),
                }));
            }
        }
    }

    /// Creates unmatched target tables, principals first. Foreign keys are
    /// added once every table exists.
    fn create_tables(&self, ops: &mut Vec<PlannedOperation>) {
        if self.created.is_empty() {
            return;
        }
        let index: StableHashMap<&str, usize> = self
            .created
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        let mut graph = DependencyGraph::new(self.created.len());
        for (i, t) in self.created.iter().enumerate() {
            for fk in &t.foreign_keys {
                if let Some(&p) = index.get(fk.principal_table.as_str()) {
                    graph.add_edge(p, i, fk.name.as_str());
                }
            }
        }
        let order = graph
            .topological_sort()
            .unwrap_or_else(|_| (0..self.created.len()).collect());

        for i in order {
            let mut table = self.created[i].clone();
            table.foreign_keys.clear();
            let indexes = std::mem::take(&mut table.indexes);
            let qn = table.qualified_name();
            ops.push(PlannedOperation::new(MigrationOperation::CreateTable { table }));
            for index in indexes {
                ops.push(PlannedOperation::new(MigrationOperation::CreateIndex {
                    table: qn.clone(),
                    index,
                }));
            }
        }
        for table in &self.created {
            for fk in &table.foreign_keys {
                ops.push(self.add_foreign_key(table, fk));
            }
        }
    }
}

/// Operations that turn `source` into `target`.
pub fn diff(source: &Model, target: &Model) -> Result<MigrationPlan, DiffError> {
    Ok(ModelDiffer::new(source, target)?.diff())
}
