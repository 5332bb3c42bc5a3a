//! Shell-like input tokenizer.
//!
//! Splits on unquoted whitespace. Single and double quotes group text into one
//! token and are themselves dropped; an unterminated quote swallows the rest of
//! the line. Parsing is total: any input yields a [`ParsedCommand`].

use std::collections::BTreeMap;

use super::{FlagValue, ParsedCommand};

/// Split `input` into tokens, honoring `'...'` and `"..."` spans.
///
/// A quote only opens a span when no other span is open, so `"it's"` yields
/// `it's`. An empty quoted span (`""`) still produces an (empty) token.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for ch in input.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if in_token {
        tokens.push(current);
    }
    tokens
}

fn is_long_flag(token: &str) -> bool {
    token.len() > 2 && token.starts_with("--")
}

fn is_short_flag(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-') && !token.starts_with("--")
}

/// Parse one raw input line.
pub fn parse(raw: &str) -> ParsedCommand {
    let tokens = tokenize(raw);
    let mut iter = tokens.into_iter();

    let command = iter.next().map(|t| t.to_lowercase()).unwrap_or_default();
    let rest: Vec<String> = iter.collect();

    let subcommand = rest
        .first()
        .filter(|t| !is_short_flag(t) && !is_long_flag(t))
        .map(|t| t.to_lowercase());

    let mut arguments = Vec::new();
    let mut flags = BTreeMap::new();
    let mut i = 0;
    while i < rest.len() {
        let token = &rest[i];
        if is_long_flag(token) {
            let name = token[2..].to_string();
            match rest.get(i + 1) {
                Some(next) if !next.starts_with('-') => {
                    flags.insert(name, FlagValue::Value(next.clone()));
                    i += 2;
                    continue;
                }
                _ => {
                    flags.insert(name, FlagValue::Present(true));
                }
            }
        } else if is_short_flag(token) {
            flags.insert(token[1..].to_string(), FlagValue::Present(true));
        } else {
            arguments.push(token.clone());
        }
        i += 1;
    }

    ParsedCommand {
        command,
        subcommand,
        arguments,
        flags,
        raw: raw.to_string(),
    }
}
