use std::collections::HashMap;

use crate::conf::{ProviderCapabilities, SelfReferenceStrategy};
use crate::db::batch::{BatchFactory, CommandBatch};
use crate::db::command::{
    ColumnModification, CommandId, EntityRef, EntryChange, ModificationCommand, OperationKind,
    PropertyValue, ValueLink,
};
use crate::db::graph::DependencyGraph;
use crate::db::models::{ForeignKeyModel, Model};
use crate::db::query::SqlGenerator;
use crate::db::value::ColumnValue;
use crate::errors::{EntityAt, SaveError};

/// Why one command has to run before another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyReason {
    ForeignKey(String),
    UniqueSlot(String),
}

/// (table, columns, encoded values) identifying one row slot.
type SlotKey = (String, Vec<String>, String);

fn slot_key(table: &str, columns: &[String], values: &[ColumnValue]) -> SlotKey {
    // serde_json gives a deterministic, hashable encoding of the typed values
    let encoded = serde_json::to_string(values).unwrap_or_default();
    (table.to_string(), columns.to_vec(), encoded)
}

fn at(command: &ModificationCommand) -> EntityAt {
    EntityAt {
        entity: command.entity,
        table: command.table_name.clone(),
    }
}

/// Values `change` carries for `columns`, or `None` if one is missing or null.
fn values_of(
    change: &EntryChange,
    columns: &[String],
    pick: fn(&PropertyValue) -> &ColumnValue,
) -> Option<Vec<ColumnValue>> {
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let v = pick(change.find(column)?);
        if v.is_null() {
            return None;
        }
        values.push(v.clone());
    }
    Some(values)
}

fn current(v: &PropertyValue) -> &ColumnValue {
    &v.current
}

type Edges = Vec<(usize, usize, DependencyReason)>;

/// Turns change descriptors into ordered, batched commands.
pub struct CommandBatchPreparer<'a, G: SqlGenerator> {
    generator: &'a G,
    capabilities: &'a ProviderCapabilities,
}

impl<'a, G: SqlGenerator> CommandBatchPreparer<'a, G> {
    pub fn new(generator: &'a G, capabilities: &'a ProviderCapabilities) -> Self {
        Self {
            generator,
            capabilities,
        }
    }

    pub fn prepare(
        &self,
        changes: &[EntryChange],
        model: &Model,
    ) -> Result<Vec<CommandBatch>, SaveError> {
        let commands = self.build_commands(changes, model)?;
        let ordered = self.order(commands, changes, model)?;
        let batches = BatchFactory::new(self.generator, self.capabilities).create_batches(ordered);
        tracing::debug!(
            batches = batches.len(),
            commands = batches.iter().map(CommandBatch::len).sum::<usize>(),
            "prepared command batches"
        );
        Ok(batches)
    }

    pub fn build_commands(
        &self,
        changes: &[EntryChange],
        model: &Model,
    ) -> Result<Vec<ModificationCommand>, SaveError> {
        let mut commands = Vec::with_capacity(changes.len());
        for change in changes {
            let id = CommandId(commands.len());
            match ModificationCommand::from_change(id, change, model)? {
                Some(cmd) => commands.push(cmd),
                None => tracing::trace!(entity = %change.entity, "no changes to save"),
            }
        }
        Ok(commands)
    }

    /// Orders commands so every command follows the commands it depends on.
    /// Commands with no dependency between them keep their input order.
    pub fn order(
        &self,
        mut commands: Vec<ModificationCommand>,
        changes: &[EntryChange],
        model: &Model,
    ) -> Result<Vec<ModificationCommand>, SaveError> {
        let mut by_entity: HashMap<EntityRef, &EntryChange> = HashMap::new();
        for change in changes {
            by_entity.entry(change.entity).or_insert(change);
        }
        let sources: Vec<Option<&EntryChange>> = commands
            .iter()
            .map(|c| by_entity.get(&c.entity).copied())
            .collect();

        let mut edges = Edges::new();
        let deferred = self.capabilities.self_reference == SelfReferenceStrategy::DeferredConstraints;
        let self_refs = Self::link_principals(&mut commands, &sources, model, deferred, &mut edges);
        Self::order_removals(&commands, &sources, model, &mut edges);
        Self::order_unique_slots(&commands, &sources, model, &mut edges);
        for (ix, fk) in self_refs {
            let extra = self.split_self_reference(&mut commands, ix, &fk)?;
            edges.push((ix, extra, DependencyReason::ForeignKey(fk.name.clone())));
        }

        let mut graph = DependencyGraph::new(commands.len());
        for (from, to, reason) in edges {
            graph.add_edge(from, to, reason);
        }
        tracing::debug!(
            commands = graph.len(),
            edges = graph.edge_count(),
            "built command dependency graph"
        );

        let order = match graph.topological_sort() {
            Ok(order) => order,
            Err(cycle) => {
                let entities: Vec<EntityAt> =
                    cycle.vertices.iter().map(|v| at(&commands[*v])).collect();
                tracing::warn!(entities = entities.len(), "dependency cycle in change set");
                return Err(SaveError::DependencyCycle { entities });
            }
        };

        let mut slots: Vec<Option<ModificationCommand>> = commands.into_iter().map(Some).collect();
        Ok(order
            .into_iter()
            .filter_map(|ix| slots[ix].take())
            .collect())
    }

    /// Principal inserts run before dependents that point at them. Dependents of
    /// a store-generated key get their column linked to the principal's read-back.
    /// Returns rows that point at their own generated key.
    ///
    /// With `deferred` set, same-table references between client-known keys
    /// are checked at commit and add no ordering edge.
    fn link_principals(
        commands: &mut [ModificationCommand],
        sources: &[Option<&EntryChange>],
        model: &Model,
        deferred: bool,
        edges: &mut Edges,
    ) -> Vec<(usize, ForeignKeyModel)> {
        let mut added: HashMap<SlotKey, usize> = HashMap::new();
        for (ix, (cmd, source)) in commands.iter().zip(sources).enumerate() {
            let Some(change) = source else {
                continue;
            };
            if cmd.operation == OperationKind::Delete {
                continue;
            }
            for (_, fk) in model.referencing(&cmd.table_name) {
                let pc = &fk.principal_columns;
                if cmd.operation == OperationKind::Update && !cmd.writes_any(pc) {
                    continue;
                }
                if let Some(values) = values_of(change, pc, current) {
                    added.entry(slot_key(&cmd.table_name, pc, &values)).or_insert(ix);
                }
            }
        }

        let mut self_refs = Vec::new();
        for ix in 0..commands.len() {
            let Some(change) = sources[ix] else {
                continue;
            };
            let cmd = &commands[ix];
            if cmd.operation == OperationKind::Delete {
                continue;
            }
            let Ok(table) = model.table(&cmd.table_name) else {
                continue;
            };
            let mut links = Vec::new();
            for fk in &table.foreign_keys {
                if cmd.operation == OperationKind::Update && !cmd.writes_any(&fk.columns) {
                    continue;
                }
                let Some(values) = values_of(change, &fk.columns, current) else {
                    continue;
                };
                let key = slot_key(&fk.principal_table, &fk.principal_columns, &values);
                let Some(&principal) = added.get(&key) else {
                    continue;
                };
                let generated = fk
                    .principal_columns
                    .iter()
                    .any(|c| commands[principal].column(c).is_some_and(|m| m.is_read));
                if principal == ix {
                    if generated {
                        self_refs.push((ix, fk.clone()));
                    }
                    continue;
                }
                if deferred && !generated && fk.principal_table == table.name {
                    continue;
                }
                edges.push((principal, ix, DependencyReason::ForeignKey(fk.name.clone())));
                if generated {
                    for (dep, pc) in fk.columns.iter().zip(&fk.principal_columns) {
                        let link = ValueLink {
                            command: commands[principal].id,
                            column: pc.clone(),
                        };
                        links.push((dep.clone(), link));
                    }
                }
            }
            let cmd = &mut commands[ix];
            for (column, link) in links {
                if let Some(m) = cmd.column_mut(&column) {
                    m.link = Some(link);
                }
            }
        }
        self_refs
    }

    /// Dependents are deleted, or moved away, before the principal row goes.
    fn order_removals(
        commands: &[ModificationCommand],
        sources: &[Option<&EntryChange>],
        model: &Model,
        edges: &mut Edges,
    ) {
        let mut removed: HashMap<SlotKey, usize> = HashMap::new();
        for (ix, (cmd, source)) in commands.iter().zip(sources).enumerate() {
            let Some(change) = source else {
                continue;
            };
            for (_, fk) in model.referencing(&cmd.table_name) {
                let pc = &fk.principal_columns;
                let leaving = match cmd.operation {
                    OperationKind::Delete => true,
                    OperationKind::Update => cmd.writes_any(pc),
                    OperationKind::Insert => false,
                };
                if !leaving {
                    continue;
                }
                if let Some(values) = values_of(change, pc, PropertyValue::stored) {
                    removed.entry(slot_key(&cmd.table_name, pc, &values)).or_insert(ix);
                }
            }
        }
        if removed.is_empty() {
            return;
        }

        for (ix, (cmd, source)) in commands.iter().zip(sources).enumerate() {
            let Some(change) = source else {
                continue;
            };
            let Ok(table) = model.table(&cmd.table_name) else {
                continue;
            };
            for fk in &table.foreign_keys {
                let detaches = match cmd.operation {
                    OperationKind::Delete => true,
                    OperationKind::Update => cmd.writes_any(&fk.columns),
                    OperationKind::Insert => false,
                };
                if !detaches {
                    continue;
                }
                let Some(values) = values_of(change, &fk.columns, PropertyValue::stored) else {
                    continue;
                };
                let key = slot_key(&fk.principal_table, &fk.principal_columns, &values);
                if let Some(&principal) = removed.get(&key) {
                    edges.push((ix, principal, DependencyReason::ForeignKey(fk.name.clone())));
                }
            }
        }
    }

    /// A row giving up a unique value goes before the row that takes it.
    fn order_unique_slots(
        commands: &[ModificationCommand],
        sources: &[Option<&EntryChange>],
        model: &Model,
        edges: &mut Edges,
    ) {
        let mut vacated: HashMap<SlotKey, usize> = HashMap::new();
        for (ix, (cmd, source)) in commands.iter().zip(sources).enumerate() {
            let (Some(change), Ok(table)) = (source, model.table(&cmd.table_name)) else {
                continue;
            };
            for set in table.unique_column_sets() {
                let vacates = match cmd.operation {
                    OperationKind::Delete => true,
                    OperationKind::Update => cmd.writes_any(set),
                    OperationKind::Insert => false,
                };
                if !vacates {
                    continue;
                }
                if let Some(values) = values_of(change, set, PropertyValue::stored) {
                    vacated.entry(slot_key(&cmd.table_name, set, &values)).or_insert(ix);
                }
            }
        }
        if vacated.is_empty() {
            return;
        }

        for (ix, (cmd, source)) in commands.iter().zip(sources).enumerate() {
            let (Some(change), Ok(table)) = (source, model.table(&cmd.table_name)) else {
                continue;
            };
            for set in table.unique_column_sets() {
                let takes = match cmd.operation {
                    OperationKind::Insert => true,
                    OperationKind::Update => cmd.writes_any(set),
                    OperationKind::Delete => false,
                };
                if !takes {
                    continue;
                }
                let Some(values) = values_of(change, set, current) else {
                    continue;
                };
                if let Some(&owner) = vacated.get(&slot_key(&cmd.table_name, set, &values)) {
                    edges.push((owner, ix, DependencyReason::UniqueSlot(set.join(","))));
                }
            }
        }
    }

    /// Applies the provider's strategy for a row that references its own
    /// generated key. Returns the index of the follow-up update.
    fn split_self_reference(
        &self,
        commands: &mut Vec<ModificationCommand>,
        ix: usize,
        fk: &ForeignKeyModel,
    ) -> Result<usize, SaveError> {
        match self.capabilities.self_reference {
            SelfReferenceStrategy::TwoPhaseUpdate => {}
            // a deferred check still needs the key value up front
            SelfReferenceStrategy::DeferredConstraints | SelfReferenceStrategy::Unsupported => {
                return Err(SaveError::SelfReference(at(&commands[ix])));
            }
        }

        let insert = &mut commands[ix];
        let source = insert.id;
        let mut columns = Vec::new();
        for key in insert.columns.iter().filter(|c| c.is_key) {
            columns.push(ColumnModification {
                column_name: key.column_name.clone(),
                original_value: None,
                current_value: key.current_value.clone(),
                is_key: true,
                is_condition: true,
                is_write: false,
                is_read: false,
                link: key.is_read.then(|| ValueLink {
                    command: source,
                    column: key.column_name.clone(),
                }),
            });
        }
        for (dep, pc) in fk.columns.iter().zip(&fk.principal_columns) {
            let Some(column) = insert.column_mut(dep) else {
                continue;
            };
            let pending = column.current_value.clone();
            column.current_value = ColumnValue::Null(pending.kind());
            columns.push(ColumnModification {
                column_name: dep.clone(),
                original_value: None,
                current_value: pending,
                is_key: false,
                is_condition: false,
                is_write: true,
                is_read: false,
                link: Some(ValueLink {
                    command: source,
                    column: pc.clone(),
                }),
            });
        }

        let entity = insert.entity;
        let table_name = insert.table_name.clone();
        let schema = insert.schema.clone();
        tracing::debug!(%entity, table = %table_name, "splitting self-referencing insert");

        let extra = commands.len();
        commands.push(ModificationCommand {
            id: CommandId(extra),
            entity,
            table_name,
            schema,
            operation: OperationKind::Update,
            columns,
        });
        Ok(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::command::EntityState;
    use crate::db::models::{ColumnModel, TableModel, ValueGenerated};
    use crate::db::query::PgSqlGenerator;
    use crate::db::value::ValueKind;

    fn model() -> Model {
        let a = TableModel::new("a")
            .column(ColumnModel::new("id", "bigint", ValueKind::Int))
            .primary_key(&["id"]);
        let b = TableModel::new("b")
            .column(ColumnModel::new("id", "bigint", ValueKind::Int))
            .column(ColumnModel::new("a_id", "bigint", ValueKind::Int))
            .primary_key(&["id"])
            .foreign_key("fk_b_a", &["a_id"], "a", &["id"]);
        let c = TableModel::new("c")
            .column(ColumnModel::new("id", "bigint", ValueKind::Int))
            .column(ColumnModel::new("b_id", "bigint", ValueKind::Int))
            .primary_key(&["id"])
            .foreign_key("fk_c_b", &["b_id"], "b", &["id"]);
        Model::new(vec![a, b, c]).unwrap()
    }

    fn change(entity: u64, table: &str, state: EntityState, values: &[(&str, i64)]) -> EntryChange {
        let mut change = EntryChange::new(entity, table, state);
        for (column, v) in values {
            change = change.value(PropertyValue::new(column, *v));
        }
        change
    }

    fn tables(batches: &[CommandBatch]) -> Vec<String> {
        batches
            .iter()
            .flat_map(|b| b.commands().iter().map(|c| c.table_name.clone()))
            .collect()
    }

    #[test]
    fn test_inserts_follow_principals() {
        let changes = vec![
            change(3, "c", EntityState::Added, &[("id", 1), ("b_id", 1)]),
            change(2, "b", EntityState::Added, &[("id", 1), ("a_id", 1)]),
            change(1, "a", EntityState::Added, &[("id", 1)]),
        ];
        let caps = ProviderCapabilities::multi_statement();
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &caps);
        let batches = preparer.prepare(&changes, &model()).unwrap();
        assert_eq!(tables(&batches), vec!["a", "b", "c"]);
        // client-known keys need no read-back, so one batch is enough
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_deletes_run_dependents_first() {
        let changes = vec![
            change(1, "a", EntityState::Deleted, &[("id", 1)]),
            change(2, "b", EntityState::Deleted, &[("id", 1), ("a_id", 1)]),
        ];
        let caps = ProviderCapabilities::multi_statement();
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &caps);
        let batches = preparer.prepare(&changes, &model()).unwrap();
        assert_eq!(tables(&batches), vec!["b", "a"]);
    }

    #[test]
    fn test_unrelated_commands_keep_input_order() {
        let changes = vec![
            change(1, "c", EntityState::Added, &[("id", 9), ("b_id", 40)]),
            change(2, "a", EntityState::Added, &[("id", 7)]),
            change(3, "b", EntityState::Added, &[("id", 8), ("a_id", 50)]),
        ];
        let caps = ProviderCapabilities::multi_statement();
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &caps);
        let batches = preparer.prepare(&changes, &model()).unwrap();
        assert_eq!(tables(&batches), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_unique_slot_delete_precedes_insert() {
        let changes = vec![
            change(2, "a", EntityState::Added, &[("id", 1)]),
            change(1, "a", EntityState::Deleted, &[("id", 1)]),
        ];
        let caps = ProviderCapabilities::multi_statement();
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &caps);
        let batches = preparer.prepare(&changes, &model()).unwrap();
        let ops: Vec<_> = batches
            .iter()
            .flat_map(|b| b.commands().iter().map(|c| c.operation))
            .collect();
        assert_eq!(ops, vec![OperationKind::Delete, OperationKind::Insert]);
    }

    #[test]
    fn test_generated_key_links_dependent() {
        let mut m = model();
        let mut tables: Vec<TableModel> = m.tables().cloned().collect();
        tables[0].columns[0].generated = ValueGenerated::OnAdd;
        m = Model::new(tables).unwrap();

        let changes = vec![
            change(2, "b", EntityState::Added, &[("id", 5), ("a_id", -1)]),
            EntryChange::new(1, "a", EntityState::Added)
                .value(PropertyValue::new("id", -1i64).temporary()),
        ];
        let caps = ProviderCapabilities::multi_statement();
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &caps);
        let batches = preparer.prepare(&changes, &m).unwrap();
        assert_eq!(batches.len(), 2);
        let dependent = &batches[1].commands()[0];
        let link = dependent.column("a_id").unwrap().link.clone().unwrap();
        assert_eq!(link.column, "id");
        assert_eq!(link.command, batches[0].commands()[0].id);
    }

    #[test]
    fn test_reparenting_update_cycle_is_detected() {
        // b moves from a#1 to a#2 while a#1 is deleted and a#2 inserted with
        // a unique slot that a#1 frees: a#2 needs a#1 gone, a#1 needs b moved,
        // b needs a#2 present.
        let a = TableModel::new("a")
            .column(ColumnModel::new("id", "bigint", ValueKind::Int))
            .column(ColumnModel::new("code", "text", ValueKind::Text))
            .primary_key(&["id"])
            .unique("uq_a_code", &["code"]);
        let b = TableModel::new("b")
            .column(ColumnModel::new("id", "bigint", ValueKind::Int))
            .column(ColumnModel::new("a_id", "bigint", ValueKind::Int))
            .primary_key(&["id"])
            .foreign_key("fk_b_a", &["a_id"], "a", &["id"]);
        let m = Model::new(vec![a, b]).unwrap();
        let changes = vec![
            EntryChange::new(1, "a", EntityState::Deleted)
                .value(PropertyValue::new("id", 1i64))
                .value(PropertyValue::new("code", "x")),
            EntryChange::new(2, "a", EntityState::Added)
                .value(PropertyValue::new("id", 2i64))
                .value(PropertyValue::new("code", "x")),
            EntryChange::new(3, "b", EntityState::Modified)
                .value(PropertyValue::new("id", 9i64))
                .value(PropertyValue::new("a_id", 2i64).modified_from(1i64)),
        ];
        let caps = ProviderCapabilities::multi_statement();
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &caps);
        let err = preparer.prepare(&changes, &m).unwrap_err();
        let SaveError::DependencyCycle { entities } = err else {
            panic!("expected a dependency cycle");
        };
        assert_eq!(entities.len(), 3);
    }

    #[test]
    fn test_self_reference_is_split_into_insert_and_update() {
        let node = TableModel::new("node")
            .column(ColumnModel::new("id", "bigint", ValueKind::Int).generated(ValueGenerated::OnAdd))
            .column(ColumnModel::new("parent_id", "bigint", ValueKind::Int).nullable())
            .primary_key(&["id"])
            .foreign_key("fk_node_parent", &["parent_id"], "node", &["id"]);
        let m = Model::new(vec![node]).unwrap();
        let changes = vec![EntryChange::new(1, "node", EntityState::Added)
            .value(PropertyValue::new("id", -5i64).temporary())
            .value(PropertyValue::new("parent_id", -5i64))];

        let caps = ProviderCapabilities::multi_statement();
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &caps);
        let batches = preparer.prepare(&changes, &m).unwrap();
        assert_eq!(batches.len(), 2);
        let insert = &batches[0].commands()[0];
        assert!(insert.column("parent_id").unwrap().current_value.is_null());
        let update = &batches[1].commands()[0];
        assert_eq!(update.operation, OperationKind::Update);
        assert!(update.column("id").unwrap().is_condition);
        assert!(update.column("parent_id").unwrap().link.is_some());

        let strict = ProviderCapabilities {
            self_reference: SelfReferenceStrategy::Unsupported,
            ..ProviderCapabilities::multi_statement()
        };
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &strict);
        assert!(matches!(
            preparer.prepare(&changes, &m),
            Err(SaveError::SelfReference(_))
        ));
    }

    fn nodes(generated: ValueGenerated) -> Model {
        let node = TableModel::new("node")
            .column(ColumnModel::new("id", "bigint", ValueKind::Int).generated(generated))
            .column(ColumnModel::new("parent_id", "bigint", ValueKind::Int).nullable())
            .primary_key(&["id"])
            .foreign_key("fk_node_parent", &["parent_id"], "node", &["id"]);
        Model::new(vec![node]).unwrap()
    }

    #[test]
    fn test_deferred_constraints_allow_mutual_references() {
        let m = nodes(ValueGenerated::Never);
        let changes = vec![
            change(1, "node", EntityState::Added, &[("id", 1), ("parent_id", 2)]),
            change(2, "node", EntityState::Added, &[("id", 2), ("parent_id", 1)]),
        ];

        let caps = ProviderCapabilities::multi_statement();
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &caps);
        assert!(matches!(
            preparer.prepare(&changes, &m),
            Err(SaveError::DependencyCycle { .. })
        ));

        let deferred = ProviderCapabilities {
            self_reference: SelfReferenceStrategy::DeferredConstraints,
            ..ProviderCapabilities::multi_statement()
        };
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &deferred);
        let batches = preparer.prepare(&changes, &m).unwrap();
        assert_eq!(batches.len(), 1);
        let entities: Vec<_> = batches[0].commands().iter().map(|c| c.entity.0).collect();
        assert_eq!(entities, vec![1, 2]);
    }

    #[test]
    fn test_deferred_constraints_reject_own_generated_key() {
        let changes = vec![EntryChange::new(1, "node", EntityState::Added)
            .value(PropertyValue::new("id", -5i64).temporary())
            .value(PropertyValue::new("parent_id", -5i64))];
        let deferred = ProviderCapabilities {
            self_reference: SelfReferenceStrategy::DeferredConstraints,
            ..ProviderCapabilities::multi_statement()
        };
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &deferred);
        assert!(matches!(
            preparer.prepare(&changes, &nodes(ValueGenerated::OnAdd)),
            Err(SaveError::SelfReference(_))
        ));
    }

    #[test]
    fn test_postgres_plans_one_statement_per_batch() {
        let changes = vec![
            change(3, "c", EntityState::Added, &[("id", 1), ("b_id", 1)]),
            change(2, "b", EntityState::Added, &[("id", 1), ("a_id", 1)]),
            change(1, "a", EntityState::Added, &[("id", 1)]),
        ];
        let caps = ProviderCapabilities::postgres();
        let preparer = CommandBatchPreparer::new(&PgSqlGenerator, &caps);
        let batches = preparer.prepare(&changes, &model()).unwrap();
        assert_eq!(tables(&batches), vec!["a", "b", "c"]);
        assert_eq!(batches.len(), 3);
        for batch in &batches {
            assert_eq!(batch.len(), 1);
            assert!(!batch.command_text().contains(';'));
        }
    }
}
