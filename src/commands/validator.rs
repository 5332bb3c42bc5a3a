//! Pre-execution checks.
//!
//! Order is fixed and short-circuits on the first failure:
//! 1. command exists
//! 2. caller permission >= required permission
//! 3. dangerous commands need dangerous mode on the session
//! 4. minimum argument count
//! 5. maximum argument count
//! 6. the command's own argument validator
//!
//! Validation has no side effects and may be called speculatively.

use super::registry::CommandRegistry;
use super::{ExecutionContext, ParsedCommand, ValidationResult};

pub async fn validate(
    registry: &CommandRegistry,
    parsed: &ParsedCommand,
    ctx: &ExecutionContext<'_>,
) -> ValidationResult {
    let Some(descriptor) = registry.lookup(&parsed.command) else {
        return ValidationResult::fail(format!(
            "Unknown command: '{}'. Type 'help' for available commands.",
            parsed.command
        ));
    };

    if !ctx
        .permission_level
        .satisfies(descriptor.required_permission)
    {
        return ValidationResult::fail(format!(
            "Insufficient permissions: '{}' requires {}, you have {}",
            descriptor.name, descriptor.required_permission, ctx.permission_level
        ));
    }

    if descriptor.dangerous && !ctx.dangerous_mode_enabled {
        return ValidationResult::fail(format!(
            "'{}' is a dangerous command. Enable dangerous mode first with 'dangerous-mode on'.",
            descriptor.name
        ));
    }

    let count = parsed.arguments.len();
    if let Some(min) = descriptor.min_args {
        if count < min {
            return ValidationResult::fail(format!(
                "'{}' requires at least {} argument(s), got {}. Usage: {}",
                descriptor.name, min, count, descriptor.usage
            ));
        }
    }
    if let Some(max) = descriptor.max_args {
        if count > max {
            return ValidationResult::fail(format!(
                "'{}' accepts at most {} argument(s), got {}. Usage: {}",
                descriptor.name, max, count, descriptor.usage
            ));
        }
    }

    descriptor.handler.validate_args(parsed, ctx).await
}
