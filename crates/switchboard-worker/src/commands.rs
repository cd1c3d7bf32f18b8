//! Prefix command framework.
//!
//! A message is a command invocation when its content starts with one of the
//! configured prefixes immediately followed by a command name or alias. The
//! longest matching name wins, and it must be followed by whitespace or the
//! end of the text, so `!pingpong` never runs `!ping`.
//!
//! The remainder is split by [`tokenize`] and converted parameter by
//! parameter according to the command's [`Param`] list.
//!
//! | Kind              | Accepts                                                  |
//! |-------------------|----------------------------------------------------------|
//! | [`ParamKind::Str`]     | any token                                           |
//! | [`ParamKind::Int`]     | `i64`                                               |
//! | [`ParamKind::Float`]   | `f64`                                               |
//! | [`ParamKind::Bool`]    | `yes/no`, `true/false`, `on/off`, `1/0`, …          |
//! | [`ParamKind::Mention`] | `<@id>`, `<@!id>`, `<#id>`, `<@&id>` or a raw id    |
//! | [`ParamKind::Rest`]    | every remaining token joined by one space (last)    |

use std::collections::BTreeMap;

use serde_json::Value;
use switchboard_types::{Args, BridgeError};
use tracing::{info, warn};

use crate::handler::Handler;

// ─────────────────────────────────────────────────────────────────────────────
// Tokenizer
// ─────────────────────────────────────────────────────────────────────────────

fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '\u{3000}' | '\t' | '\n')
}

/// Split command arguments.
///
/// Separators are space, ideographic space, tab and newline. `'` and `"`
/// open a quoted section that only the same quote character closes; inside
/// it separators are literal. A quoted empty string (`""`) is an empty
/// argument. An unterminated quote runs to the end of the text.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut quoted = false;

    for c in input.chars() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => current.push(c),
            None if is_separator(c) => {
                if !current.is_empty() || quoted {
                    args.push(std::mem::take(&mut current));
                    quoted = false;
                }
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                quoted = true;
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() || quoted {
        args.push(current);
    }
    args
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Int,
    Float,
    Bool,
    Mention,
    /// Swallows every remaining token; must be the last parameter.
    Rest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    /// Used when the token is missing. `None` makes the parameter required.
    pub default: Option<Value>,
}

impl Param {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind, default: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            default: Some(default),
        }
    }

    /// Trailing free text, empty when nothing is left.
    pub fn rest(name: impl Into<String>) -> Self {
        Self::optional(name, ParamKind::Rest, Value::String(String::new()))
    }

    fn conversion_error(&self, value: &str, reason: impl Into<String>) -> BridgeError {
        BridgeError::Conversion {
            param: self.name.clone(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn convert(&self, token: &str) -> Result<Value, BridgeError> {
        match self.kind {
            ParamKind::Str | ParamKind::Rest => Ok(Value::String(token.to_string())),
            ParamKind::Int => token
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| self.conversion_error(token, e.to_string())),
            ParamKind::Float => token
                .parse::<f64>()
                .map_err(|e| self.conversion_error(token, e.to_string()))
                .and_then(|f| {
                    serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .ok_or_else(|| self.conversion_error(token, "not a finite number"))
                }),
            ParamKind::Bool => match token.to_ascii_lowercase().as_str() {
                "yes" | "y" | "true" | "t" | "1" | "on" | "enable" => Ok(Value::Bool(true)),
                "no" | "n" | "false" | "f" | "0" | "off" | "disable" => Ok(Value::Bool(false)),
                _ => Err(self.conversion_error(token, "not a boolean")),
            },
            ParamKind::Mention => parse_mention(token)
                .map(Value::from)
                .ok_or_else(|| self.conversion_error(token, "not a mention or id")),
        }
    }

    fn fallback(&self) -> Result<Value, BridgeError> {
        self.default
            .clone()
            .ok_or_else(|| self.conversion_error("", "missing required argument"))
    }
}

/// Extract the id from `<@id>`, `<@!id>`, `<#id>`, `<@&id>` or a raw id.
pub fn parse_mention(token: &str) -> Option<u64> {
    let inner = match token.strip_prefix('<') {
        Some(rest) => {
            let rest = rest.strip_suffix('>')?;
            ["@!", "@&", "@", "#"]
                .iter()
                .find_map(|p| rest.strip_prefix(p))?
        }
        None => token,
    };
    inner.parse().ok()
}

/// Convert `tokens` into arguments for `params`. Extra tokens beyond the
/// declared parameters are ignored.
///
/// # Errors
///
/// [`BridgeError::Conversion`] naming the first parameter that failed.
pub fn convert_args(params: &[Param], tokens: &[String]) -> Result<Args, BridgeError> {
    let mut args = Args::with_capacity(params.len());
    for (index, param) in params.iter().enumerate() {
        if param.kind == ParamKind::Rest {
            let rest = tokens.get(index..).unwrap_or_default();
            if rest.is_empty() {
                args.push(param.fallback()?);
            } else {
                args.push(Value::String(rest.join(" ")));
            }
            break;
        }
        match tokens.get(index) {
            Some(token) => args.push(param.convert(token)?),
            None => args.push(param.fallback()?),
        }
    }
    Ok(args)
}

// ─────────────────────────────────────────────────────────────────────────────
// Command table
// ─────────────────────────────────────────────────────────────────────────────

/// Name, aliases and parameter list of one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub name: String,
    pub aliases: Vec<String>,
    pub params: Vec<Param>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

#[derive(Clone)]
pub(crate) struct CommandEntry {
    pub spec: CommandSpec,
    pub handler_name: String,
    pub owner: Option<String>,
    pub handler: Handler,
}

/// A resolved invocation: which command and the text after its name.
#[derive(Clone)]
pub struct CommandMatch {
    pub name: String,
    pub handler_name: String,
    pub params: Vec<Param>,
    pub handler: Handler,
    pub rest: String,
}

impl CommandMatch {
    /// Tokenize and convert the remaining text.
    pub fn arguments(&self) -> Result<Args, BridgeError> {
        convert_args(&self.params, &tokenize(&self.rest))
    }
}

/// Registered commands keyed by primary name.
#[derive(Default, Clone)]
pub struct CommandTable {
    commands: BTreeMap<String, CommandEntry>,
}

impl CommandTable {
    /// Register a command, replacing any previous one with the same name.
    pub(crate) fn add(&mut self, spec: CommandSpec, handler_name: &str, owner: Option<&str>, handler: Handler) {
        let name = spec.name.clone();
        if self.commands.contains_key(&name) {
            warn!(command = %name, "replacing existing command");
        }
        self.commands.insert(
            name.clone(),
            CommandEntry {
                spec,
                handler_name: handler_name.to_string(),
                owner: owner.map(str::to_string),
                handler,
            },
        );
        info!(command = %name, "added command");
    }

    pub(crate) fn remove(&mut self, name: &str) -> Result<(), BridgeError> {
        if self.commands.remove(name).is_none() {
            return Err(BridgeError::HandlerNotFound(format!("command {name}")));
        }
        info!(command = name, "removed command");
        Ok(())
    }

    pub(crate) fn remove_owned(&mut self, owner: &str) -> usize {
        let before = self.commands.len();
        self.commands.retain(|_, e| e.owner.as_deref() != Some(owner));
        before - self.commands.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.commands.keys().map(String::as_str).collect()
    }

    /// Find the command invoked by `content`, if any.
    pub fn resolve(&self, content: &str, prefixes: &[String]) -> Option<CommandMatch> {
        // (matched length, entry, rest)
        let mut best: Option<(usize, &CommandEntry, &str)> = None;
        for prefix in prefixes {
            let Some(after_prefix) = content.strip_prefix(prefix.as_str()) else {
                continue;
            };
            for entry in self.commands.values() {
                for name in entry.spec.names() {
                    let Some(rest) = after_prefix.strip_prefix(name) else {
                        continue;
                    };
                    if !(rest.is_empty() || rest.starts_with(is_separator)) {
                        continue;
                    }
                    let length = prefix.len() + name.len();
                    if best.is_none_or(|(l, _, _)| length > l) {
                        best = Some((length, entry, rest));
                    }
                }
            }
        }
        best.map(|(_, entry, rest)| CommandMatch {
            name: entry.spec.name.clone(),
            handler_name: entry.handler_name.clone(),
            params: entry.spec.params.clone(),
            handler: entry.handler.clone(),
            rest: rest.to_string(),
        })
    }
}
