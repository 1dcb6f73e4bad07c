use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use argh::FromArgs;
use serde::de::DeserializeOwned;

use crate::conf::StoreConf;
use crate::context::SaveContext;
use crate::db::{
    diff, ColumnValue, EntityRef, EntryChange, MigrationSqlGenerator, Model,
    PgBatchConnection, PgMigrationSqlGenerator, Store, TrackedEntities,
};

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
/// Relational store commands
pub struct StoreCommand {
    #[argh(subcommand)]
    pub nested: NestedCommand,

    #[argh(switch, short = 'v', long = "verbose")]
    /// enable verbose output
    pub verbose: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand)]
pub enum NestedCommand {
    Diff(DiffCommand),
    Plan(PlanCommand),
    Save(SaveCommand),
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand, name = "diff")]
/// Compare two model snapshots and print the migration plan
pub struct DiffCommand {
    #[argh(positional)]
    /// model snapshot the database currently has
    from: PathBuf,

    #[argh(positional)]
    /// model snapshot to migrate to
    to: PathBuf,

    #[argh(switch)]
    /// print PostgreSQL DDL instead of the JSON plan
    sql: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand, name = "plan")]
/// Print the batches a change set would be executed as
pub struct PlanCommand {
    #[argh(positional)]
    /// model snapshot
    model: PathBuf,

    #[argh(positional)]
    /// change descriptors
    changes: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug, Clone)]
#[argh(subcommand, name = "save")]
/// Apply a change set to the configured database
pub struct SaveCommand {
    #[argh(positional)]
    /// model snapshot
    model: PathBuf,

    #[argh(positional)]
    /// change descriptors
    changes: PathBuf,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Prints generated values as they are reported.
#[derive(Default)]
struct PrintTracker {
    accepted: usize,
}

impl TrackedEntities for PrintTracker {
    fn set_store_value(&mut self, entity: EntityRef, column: &str, value: ColumnValue) {
        println!("{entity}.{column} = {value}");
    }

    fn accept_changes(&mut self, entities: &[EntityRef]) {
        self.accepted += entities.len();
    }
}

pub async fn run(cmd: StoreCommand, conf: &StoreConf) -> anyhow::Result<()> {
    match cmd.nested {
        NestedCommand::Diff(args) => {
            let from: Model = read_json(&args.from)?;
            let to: Model = read_json(&args.to)?;
            let plan = diff(&from, &to)?;
            for op in plan.lossy() {
                tracing::warn!(
                    operation = op.operation.name(),
                    reason = ?op.lossy,
                    "operation may lose data"
                );
            }
            if args.sql {
                print!("{}", PgMigrationSqlGenerator.script(&plan));
            } else {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            }
        }
        NestedCommand::Plan(args) => {
            let model: Model = read_json(&args.model)?;
            let changes: Vec<EntryChange> = read_json(&args.changes)?;
            let store = Store::from_conf(conf);
            let batches = store.preparer().prepare(&changes, &model)?;
            for (ix, batch) in batches.iter().enumerate() {
                println!("-- batch {} ({} commands, {} parameters)", ix, batch.len(), batch.parameter_count());
                println!("{}", batch.command_text());
                if cmd.verbose {
                    for (pos, value) in batch.parameters().iter().enumerate() {
                        println!("--   ${} = {}", pos + 1, value);
                    }
                }
            }
        }
        NestedCommand::Save(args) => {
            let model: Model = read_json(&args.model)?;
            let changes: Vec<EntryChange> = read_json(&args.changes)?;
            let store = Store::from_conf(conf);
            let mut conn = PgBatchConnection::connect(&conf.database).await?;
            let ctx = SaveContext::new();
            let cancel = ctx.cancel_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let mut tracker = PrintTracker::default();
            let result = store
                .save_changes(&mut conn, &model, &changes, &mut tracker, &ctx)
                .await;
            match result {
                Ok(summary) => println!(
                    "saved {} entities in {} batches ({} rows, {} attempts)",
                    tracker.accepted, summary.batches, summary.rows_affected, summary.attempts
                ),
                Err(err) => {
                    tracing::error!(code = err.code(), status = ?err.status(), "save failed");
                    return Err(err.into());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diff_command() {
        let cmd = StoreCommand::from_args(&["relstore"], &["diff", "a.json", "b.json", "--sql"]).unwrap();
        match cmd.nested {
            NestedCommand::Diff(args) => {
                assert_eq!(args.from, PathBuf::from("a.json"));
                assert!(args.sql);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_plan_command_verbose() {
        let cmd = StoreCommand::from_args(&["relstore"], &["-v", "plan", "m.json", "c.json"]).unwrap();
        assert!(cmd.verbose);
        assert!(matches!(cmd.nested, NestedCommand::Plan(_)));
    }
}
