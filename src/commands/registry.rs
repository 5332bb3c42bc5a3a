//! Command registry
//!
//! Static dispatch table from command name to [`CommandDescriptor`]. Built once
//! at startup, then shared read-only behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    CommandError, CommandOutput, ExecutionContext, ParsedCommand, PermissionLevel,
    ValidationResult,
};

/// Behaviour of one command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Command-specific argument checks, run after the generic arity checks.
    async fn validate_args(
        &self,
        _parsed: &ParsedCommand,
        _ctx: &ExecutionContext<'_>,
    ) -> ValidationResult {
        ValidationResult::ok()
    }

    async fn execute(
        &self,
        parsed: &ParsedCommand,
        ctx: &ExecutionContext<'_>,
        registry: &CommandRegistry,
    ) -> Result<CommandOutput, CommandError>;

    /// Suggestions for the argument currently being typed.
    fn complete(&self, _partial: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Registry entry: gating rules plus the handler.
#[derive(Clone)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: String,
    pub usage: String,
    pub required_permission: PermissionLevel,
    pub dangerous: bool,
    pub min_args: Option<usize>,
    pub max_args: Option<usize>,
    pub handler: Arc<dyn CommandHandler>,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        let name = name.into().to_lowercase();
        Self {
            usage: name.clone(),
            name,
            description: String::new(),
            required_permission: PermissionLevel::Public,
            dangerous: false,
            min_args: None,
            max_args: None,
            handler,
        }
    }

    pub fn describe(mut self, description: impl Into<String>, usage: impl Into<String>) -> Self {
        self.description = description.into();
        self.usage = usage.into();
        self
    }

    pub fn permission(mut self, level: PermissionLevel) -> Self {
        self.required_permission = level;
        self
    }

    pub fn dangerous(mut self) -> Self {
        self.dangerous = true;
        self
    }

    pub fn min_args(mut self, min: usize) -> Self {
        self.min_args = Some(min);
        self
    }

    pub fn max_args(mut self, max: usize) -> Self {
        self.max_args = Some(max);
        self
    }
}

impl std::fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("required_permission", &self.required_permission)
            .field("dangerous", &self.dangerous)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .finish_non_exhaustive()
    }
}

#[derive(Default, Debug)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandDescriptor>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. A second registration under the same name replaces
    /// the first.
    pub fn register(&mut self, descriptor: CommandDescriptor) {
        if self.commands.contains_key(&descriptor.name) {
            tracing::debug!(
                target: "commands",
                command = %descriptor.name,
                "overriding registered command"
            );
        }
        self.commands.insert(descriptor.name.clone(), descriptor);
    }

    pub fn lookup(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Names whose required permission is at most `level`, sorted.
    pub fn list_names(&self, level: PermissionLevel) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .commands
            .values()
            .filter(|d| level.satisfies(d.required_permission))
            .map(|d| d.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Descriptors visible at `level`, sorted by name.
    pub fn visible(&self, level: PermissionLevel) -> Vec<&CommandDescriptor> {
        self.list_names(level)
            .into_iter()
            .filter_map(|name| self.commands.get(name))
            .collect()
    }

    /// Autocomplete a partial input line.
    ///
    /// Without whitespace the partial is a command-name prefix. Otherwise the
    /// named command's own completion provider gets the last token.
    pub fn complete(&self, partial: &str, level: PermissionLevel) -> Vec<String> {
        let trimmed = partial.trim_start();
        match trimmed.split_once(char::is_whitespace) {
            None => {
                let prefix = trimmed.to_lowercase();
                self.list_names(level)
                    .into_iter()
                    .filter(|name| name.starts_with(&prefix))
                    .map(str::to_string)
                    .collect()
            }
            Some((name, rest)) => {
                let Some(descriptor) = self.lookup(&name.to_lowercase()) else {
                    return Vec::new();
                };
                if !level.satisfies(descriptor.required_permission) {
                    return Vec::new();
                }
                let last = if rest.ends_with(char::is_whitespace) {
                    ""
                } else {
                    rest.split_whitespace().last().unwrap_or("")
                };
                descriptor.handler.complete(last)
            }
        }
    }
}
