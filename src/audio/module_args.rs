use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ModuleArgsError;

/// Parsed `key=value` arguments of a server-side routing module.
///
/// Both the parser and the renderer live here so that every idempotency check
/// compares arguments produced by the same code path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleArgs {
    pairs: Vec<(String, String)>,
}

impl ModuleArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert; replaces an existing key in place.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Comma-separated list value, e.g. the member list of an aggregate sink.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parse a space-separated argument string as the audio server reports it.
    ///
    /// Values may be wrapped in single or double quotes, which are stripped.
    /// Quotes may also appear mid-value (`props=device.description="A B"`).
    pub fn parse(raw: &str) -> Result<Self, ModuleArgsError> {
        let mut args = ModuleArgs::new();

        for token in tokenize(raw)? {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| ModuleArgsError::MissingSeparator(token.clone()))?;

            if key.is_empty() {
                return Err(ModuleArgsError::EmptyKey(token.clone()));
            }
            if args.get(key).is_some() {
                return Err(ModuleArgsError::DuplicateKey(key.to_string()));
            }

            args.pairs.push((key.to_string(), value.to_string()));
        }

        Ok(args)
    }

    /// Render as a list of `key=value` arguments, quoting values with spaces.
    pub fn to_arg_list(&self) -> Vec<String> {
        self.pairs
            .iter()
            .map(|(k, v)| {
                if v.chars().any(char::is_whitespace) {
                    format!("{k}=\"{v}\"")
                } else {
                    format!("{k}={v}")
                }
            })
            .collect()
    }
}

impl fmt::Display for ModuleArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_arg_list().join(" "))
    }
}

fn tokenize(raw: &str) -> Result<Vec<String>, ModuleArgsError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in raw.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }

    if quote.is_some() {
        return Err(ModuleArgsError::UnterminatedQuote(raw.to_string()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    Ok(tokens)
}
