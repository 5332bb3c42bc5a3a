//! Topic permission rules.
//!
//! Ordered glob rules (`*` any run, `?` one char), first match wins. Topics
//! matching no rule are denied.

use regex::Regex;
use thiserror::Error;

use crate::commands::PermissionLevel;
use crate::config::{ConfigError, TopicRuleConfig};

#[derive(Debug, Error)]
pub enum WsConfigError {
    #[error("invalid topic pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicDecision {
    Allowed,
    /// Matched a rule requiring more than the session has.
    Insufficient(PermissionLevel),
    NoRule,
}

#[derive(Debug)]
struct TopicRule {
    matcher: Regex,
    permission: PermissionLevel,
}

#[derive(Debug, Default)]
pub struct TopicPolicy {
    rules: Vec<TopicRule>,
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    out
}

impl TopicPolicy {
    pub fn from_rules(rules: &[TopicRuleConfig]) -> Result<Self, WsConfigError> {
        let rules = rules
            .iter()
            .map(|rule| {
                let matcher = Regex::new(&glob_to_regex(&rule.pattern)).map_err(|source| {
                    WsConfigError::InvalidPattern {
                        pattern: rule.pattern.clone(),
                        source,
                    }
                })?;
                Ok(TopicRule {
                    matcher,
                    permission: rule.permission,
                })
            })
            .collect::<Result<Vec<_>, WsConfigError>>()?;
        Ok(Self { rules })
    }

    /// Required level for `topic`, from the first matching rule.
    pub fn required_level(&self, topic: &str) -> Option<PermissionLevel> {
        self.rules
            .iter()
            .find(|rule| rule.matcher.is_match(topic))
            .map(|rule| rule.permission)
    }

    pub fn check(&self, topic: &str, level: PermissionLevel) -> TopicDecision {
        match self.required_level(topic) {
            None => TopicDecision::NoRule,
            Some(required) if level.satisfies(required) => TopicDecision::Allowed,
            Some(required) => TopicDecision::Insufficient(required),
        }
    }
}
