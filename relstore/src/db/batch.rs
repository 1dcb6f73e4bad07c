use std::collections::HashSet;

use crate::conf::ProviderCapabilities;
use crate::db::command::{CommandId, ModificationCommand};
use crate::db::query::{SqlGenerator, Statement};
use crate::db::value::ColumnValue;

/// Commands sent to the backend in one round trip.
#[derive(Debug, Clone, Default)]
pub struct CommandBatch {
    commands: Vec<ModificationCommand>,
    statements: Vec<Statement>,
    command_text: String,
    parameter_count: usize,
    members: HashSet<CommandId>,
}

impl CommandBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[ModificationCommand] {
        &self.commands
    }

    pub(crate) fn commands_mut(&mut self) -> &mut [ModificationCommand] {
        &mut self.commands
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Statement text of the whole batch, joined with the generator's separator.
    pub fn command_text(&self) -> &str {
        &self.command_text
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    /// Parameter values in placeholder order across every statement.
    pub fn parameters(&self) -> Vec<&ColumnValue> {
        self.commands
            .iter()
            .zip(&self.statements)
            .flat_map(|(cmd, stmt)| stmt.values(cmd))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn contains(&self, id: CommandId) -> bool {
        self.members.contains(&id)
    }

    /// True when `command` needs a value this batch only produces on execution.
    fn depends_on_read_back(&self, command: &ModificationCommand) -> bool {
        command.links().any(|link| self.contains(link.command))
    }

    fn fits(&self, statement: &Statement, capabilities: &ProviderCapabilities) -> bool {
        if self.commands.is_empty() {
            return true;
        }
        self.commands.len() < capabilities.effective_batch_size()
            && self.parameter_count + statement.params().len() <= capabilities.max_parameters
    }

    fn push(&mut self, command: ModificationCommand, statement: Statement, separator: &str) {
        if !self.command_text.is_empty() {
            self.command_text.push_str(separator);
        }
        self.command_text.push_str(statement.sql());
        self.parameter_count += statement.params().len();
        self.members.insert(command.id);
        self.commands.push(command);
        self.statements.push(statement);
    }
}

/// Groups already-ordered commands into batches without reordering them.
pub struct BatchFactory<'a, G: SqlGenerator> {
    generator: &'a G,
    capabilities: &'a ProviderCapabilities,
}

impl<'a, G: SqlGenerator> BatchFactory<'a, G> {
    pub fn new(generator: &'a G, capabilities: &'a ProviderCapabilities) -> Self {
        Self {
            generator,
            capabilities,
        }
    }

    pub fn create_batches(&self, commands: Vec<ModificationCommand>) -> Vec<CommandBatch> {
        let separator = self.generator.statement_separator();
        let mut batches = Vec::new();
        let mut current = CommandBatch::new();

        for command in commands {
            let statement = self.generator.generate(&command);
            let boundary = current.depends_on_read_back(&command)
                || !current.fits(&statement, self.capabilities);
            if boundary && !current.is_empty() {
                batches.push(std::mem::take(&mut current));
            }
            current.push(command, statement, separator);
        }

        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}
