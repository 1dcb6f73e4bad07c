use indexmap::IndexSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::conf::{ProviderCapabilities, RetryPolicy, StoreConf};
use crate::context::SaveContext;
use crate::db::command::{EntityRef, EntryChange};
use crate::db::executor::{BatchConnection, BatchExecutor, StoreValue};
use crate::db::models::Model;
use crate::db::preparer::CommandBatchPreparer;
use crate::db::query::{PgSqlGenerator, SqlGenerator};
use crate::db::value::ColumnValue;
use crate::errors::SaveError;

/// Receives the results of a committed save on behalf of the change tracker.
pub trait TrackedEntities {
    /// A value generated or propagated by the store for `entity`.
    fn set_store_value(&mut self, entity: EntityRef, column: &str, value: ColumnValue);

    /// Called once after commit with every entity that took part in the save.
    fn accept_changes(&mut self, entities: &[EntityRef]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveSummary {
    pub save_id: Uuid,
    pub batches: usize,
    pub commands: usize,
    pub rows_affected: u64,
    pub attempts: u32,
}

pub struct Store<G: SqlGenerator = PgSqlGenerator> {
    generator: G,
    capabilities: ProviderCapabilities,
    retry: RetryPolicy,
}

impl Store<PgSqlGenerator> {
    pub fn from_conf(conf: &StoreConf) -> Self {
        Self::new(PgSqlGenerator, conf.capabilities, conf.retry)
    }
}

impl<G: SqlGenerator> Store<G> {
    pub fn new(generator: G, capabilities: ProviderCapabilities, retry: RetryPolicy) -> Self {
        Self {
            generator,
            capabilities,
            retry,
        }
    }

    pub fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    pub fn preparer(&self) -> CommandBatchPreparer<'_, G> {
        CommandBatchPreparer::new(&self.generator, &self.capabilities)
    }

    /// Persists `changes` atomically. Tracked entities only hear about the
    /// save once it has committed; on any error they are left untouched.
    pub async fn save_changes<C, T>(
        &self,
        conn: &mut C,
        model: &Model,
        changes: &[EntryChange],
        tracked: &mut T,
        ctx: &SaveContext,
    ) -> Result<SaveSummary, SaveError>
    where
        C: BatchConnection,
        T: TrackedEntities,
    {
        let span = ctx.span().clone();
        async move {
            let batches = self.preparer().prepare(changes, model)?;
            let commands = batches.iter().map(|b| b.len()).sum();
            if batches.is_empty() {
                tracing::debug!("nothing to save");
                return Ok(SaveSummary {
                    save_id: ctx.id(),
                    batches: 0,
                    commands: 0,
                    rows_affected: 0,
                    attempts: 0,
                });
            }

            let mut executor = BatchExecutor::new(self.retry);
            let outcome = executor.execute(conn, &batches, ctx).await?;

            for StoreValue {
                entity,
                column,
                value,
            } in outcome.store_values
            {
                tracked.set_store_value(entity, &column, value);
            }
            let entities: IndexSet<EntityRef> = changes.iter().map(|c| c.entity).collect();
            let entities: Vec<EntityRef> = entities.into_iter().collect();
            tracked.accept_changes(&entities);

            Ok(SaveSummary {
                save_id: ctx.id(),
                batches: batches.len(),
                commands,
                rows_affected: outcome.rows_affected,
                attempts: outcome.attempts,
            })
        }
        .instrument(span)
        .await
    }
}
