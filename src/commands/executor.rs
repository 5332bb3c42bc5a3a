//! Command dispatch.
//!
//! [`CommandProcessor::execute`] re-validates, runs the handler, measures the
//! elapsed time, and records every attempt in the audit trail. It never
//! returns an error: every failure mode becomes a `success=false`
//! [`CommandResult`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;

use super::registry::CommandRegistry;
use super::{validator, CommandResult, ExecutionContext, ParsedCommand, ValidationResult};
use crate::logging::audit::{AuditEvent, AuditSink};

pub struct CommandProcessor {
    registry: Arc<CommandRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl CommandProcessor {
    pub fn new(registry: Arc<CommandRegistry>, audit: Arc<dyn AuditSink>) -> Self {
        Self { registry, audit }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Side-effect free pre-check, usable for hinting.
    pub async fn validate(
        &self,
        parsed: &ParsedCommand,
        ctx: &ExecutionContext<'_>,
    ) -> ValidationResult {
        validator::validate(&self.registry, parsed, ctx).await
    }

    pub async fn execute(
        &self,
        parsed: &ParsedCommand,
        ctx: &ExecutionContext<'_>,
    ) -> CommandResult {
        let started = Instant::now();
        let dangerous = self
            .registry
            .lookup(&parsed.command)
            .is_some_and(|d| d.dangerous);

        // Session toggles may have changed since any earlier check.
        let verdict = validator::validate(&self.registry, parsed, ctx).await;
        let result = if !verdict.valid {
            let message = verdict
                .error
                .unwrap_or_else(|| "validation failed".to_string());
            CommandResult::failure(message, started.elapsed(), dangerous)
        } else {
            self.dispatch(parsed, ctx, started, dangerous).await
        };

        if result.success {
            tracing::debug!(
                target: "commands",
                user_id = %ctx.user_id,
                command = %parsed.command,
                elapsed_ms = result.execution_time_ms,
                "command executed"
            );
        } else {
            tracing::info!(
                target: "commands",
                user_id = %ctx.user_id,
                command = %parsed.command,
                error = result.error.as_deref().unwrap_or(""),
                "command failed"
            );
        }

        let event = AuditEvent::CommandExecuted {
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
            input: parsed.raw.clone(),
            success: result.success,
            elapsed_ms: result.execution_time_ms,
            dangerous,
            error: result.error.clone(),
        };
        if let Err(e) = self.audit.record(event) {
            tracing::warn!(target: "commands", error = %e, "failed to record audit entry");
        }

        result
    }

    async fn dispatch(
        &self,
        parsed: &ParsedCommand,
        ctx: &ExecutionContext<'_>,
        started: Instant,
        dangerous: bool,
    ) -> CommandResult {
        let Some(descriptor) = self.registry.lookup(&parsed.command) else {
            let message = format!("Unknown command: '{}'", parsed.command);
            return CommandResult::failure(message, started.elapsed(), dangerous);
        };

        let run = descriptor.handler.execute(parsed, ctx, &self.registry);
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(output)) => CommandResult::from_output(output, started.elapsed(), dangerous),
            Ok(Err(e)) => {
                tracing::warn!(
                    target: "commands",
                    command = %parsed.command,
                    error = %e,
                    "handler error"
                );
                CommandResult::failure(e.to_string(), started.elapsed(), dangerous)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    target: "commands",
                    command = %parsed.command,
                    panic = %message,
                    "handler panicked"
                );
                CommandResult::failure(message, started.elapsed(), dangerous)
            }
        }
    }
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("commands", &self.registry.len())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("command panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("command panicked: {s}")
    } else {
        "command panicked".to_string()
    }
}
