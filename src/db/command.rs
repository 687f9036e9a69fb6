//! Command descriptors and the build step that turns them into backend SQL.
//!
//! A `Command` is a plain value: text, kind, ordered named parameters and a
//! timeout. Each executor operation consumes one, so no command state outlives
//! the call that used it.

use super::{DatabaseBackend, Value};
use crate::error::{Result, TrackerError};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Timeout applied when the caller does not set one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// How the command text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    /// Literal SQL text.
    #[default]
    Text,
    /// Name of a stored routine, invoked with the command's parameters.
    StoredProcedure,
}

/// A named parameter value.
///
/// Names may be written with or without their `@`/`:` prefix. An empty name
/// marks a positional parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: Value,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Creates an unnamed parameter bound by position.
    pub fn positional(value: impl Into<Value>) -> Self {
        Self::new(String::new(), value)
    }

    /// The parameter name without its placeholder prefix.
    pub fn key(&self) -> &str {
        self.name.trim_start_matches(['@', ':'])
    }
}

/// Describes a single database operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    text: String,
    kind: CommandKind,
    parameters: Vec<Parameter>,
    timeout: Duration,
}

impl Command {
    /// Creates a literal SQL command with the default timeout.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: CommandKind::Text,
            parameters: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Creates a stored routine invocation with the default timeout.
    pub fn stored_procedure(name: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::StoredProcedure,
            ..Self::new(name)
        }
    }

    /// Appends a named parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    /// Appends parameters in the order given.
    pub fn with_params(mut self, params: impl IntoIterator<Item = Parameter>) -> Self {
        self.parameters.extend(params);
        self
    }

    /// Sets the command timeout. A zero duration disables the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the command timeout in whole seconds. Zero disables the timeout.
    pub fn with_timeout_secs(self, secs: u64) -> Self {
        self.with_timeout(Duration::from_secs(secs))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds backend SQL and the ordered values to bind.
    pub(crate) fn render(self, backend: DatabaseBackend) -> Result<RenderedCommand> {
        let timeout = (!self.timeout.is_zero()).then_some(self.timeout);

        let (sql, values) = match self.kind {
            CommandKind::Text => render_text(&self.text, self.parameters, backend)?,
            CommandKind::StoredProcedure => {
                render_procedure(&self.text, self.parameters, backend)?
            }
        };

        Ok(RenderedCommand {
            sql,
            values,
            timeout,
        })
    }
}

/// Output of the build step: SQL in the backend's placeholder syntax plus the
/// values in bind order.
#[derive(Debug)]
pub(crate) struct RenderedCommand {
    pub sql: String,
    pub values: Vec<Value>,
    pub timeout: Option<Duration>,
}

fn render_text(
    text: &str,
    mut parameters: Vec<Parameter>,
    backend: DatabaseBackend,
) -> Result<(String, Vec<Value>)> {
    let mut references: Vec<String> = Vec::new();
    let mut numbers: HashMap<String, usize> = HashMap::new();

    let sql = rewrite_placeholders(text, |name| {
        let key = name.to_ascii_lowercase();
        let number = *numbers.entry(key.clone()).or_insert_with(|| {
            references.push(key);
            references.len()
        });
        backend.placeholder(number)
    });

    if references.is_empty() {
        let values = parameters.into_iter().map(|p| p.value).collect();
        return Ok((text.to_string(), values));
    }

    let mut used = vec![false; parameters.len()];
    let mut values = Vec::with_capacity(references.len());
    for reference in &references {
        // First parameter with a matching name wins.
        let index = parameters
            .iter()
            .position(|p| p.key().eq_ignore_ascii_case(reference))
            .ok_or_else(|| {
                TrackerError::command(format!(
                    "No value supplied for parameter '{reference}'"
                ))
            })?;
        used[index] = true;
        values.push(std::mem::take(&mut parameters[index].value));
    }

    for (param, _) in parameters.iter().zip(&used).filter(|(_, used)| !**used) {
        debug!("Parameter '{}' is not referenced by the command", param.name);
    }

    Ok((sql, values))
}

fn render_procedure(
    name: &str,
    parameters: Vec<Parameter>,
    backend: DatabaseBackend,
) -> Result<(String, Vec<Value>)> {
    if !backend.supports_stored_procedures() {
        return Err(TrackerError::command(format!(
            "{} does not support stored routines ('{name}')",
            backend.as_str()
        )));
    }

    let mut arguments = Vec::with_capacity(parameters.len());
    let mut values = Vec::with_capacity(parameters.len());
    for (i, param) in parameters.into_iter().enumerate() {
        let placeholder = backend.placeholder(i + 1);
        let key = param.key();
        if key.is_empty() {
            arguments.push(placeholder);
        } else if key.bytes().all(is_ident_byte) {
            arguments.push(format!("{key} => {placeholder}"));
        } else {
            return Err(TrackerError::command(format!(
                "Invalid parameter name '{}'",
                param.name
            )));
        }
        values.push(param.value);
    }

    Ok((format!("CALL {}({})", name.trim(), arguments.join(", ")), values))
}

/// Rewrites `:name` and `@name` placeholders, leaving string literals, quoted
/// identifiers, comments, `::` casts and `@@` variables untouched.
fn rewrite_placeholders(text: &str, mut placeholder: impl FnMut(&str) -> String) -> String {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len + 8);
    let mut copied = 0;
    let mut i = 0;

    while i < len {
        if let Some(end) = skip_literal_or_comment(text, i) {
            i = end;
            continue;
        }

        let next = bytes.get(i + 1).copied();
        match bytes[i] {
            b':' if next == Some(b':') => i += 2,
            b'@' if next == Some(b'@') => {
                i += 2;
                while i < len && is_ident_byte(bytes[i]) {
                    i += 1;
                }
            }
            b':' | b'@' if next.is_some_and(is_ident_start) => {
                let start = i + 1;
                let mut end = start;
                while end < len && is_ident_byte(bytes[end]) {
                    end += 1;
                }
                out.push_str(&text[copied..i]);
                out.push_str(&placeholder(&text[start..end]));
                copied = end;
                i = end;
            }
            _ => i += 1,
        }
    }

    out.push_str(&text[copied..]);
    out
}

/// Splits a batch at top-level `;` separators.
///
/// Pieces holding only whitespace or comments are dropped, matching the
/// statements a backend actually runs.
pub(crate) fn split_statements(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_code = false;
    let mut i = 0;

    while i < bytes.len() {
        if let Some(end) = skip_literal_or_comment(text, i) {
            has_code |= !bytes[i..].starts_with(b"--") && !bytes[i..].starts_with(b"/*");
            i = end;
            continue;
        }

        match bytes[i] {
            b';' => {
                if has_code {
                    statements.push(text[start..i].trim());
                }
                start = i + 1;
                has_code = false;
            }
            b if !b.is_ascii_whitespace() => has_code = true,
            _ => {}
        }
        i += 1;
    }

    if has_code {
        statements.push(text[start..].trim());
    }
    statements
}

/// If a quoted string or comment starts at `i`, returns the index just past it.
fn skip_literal_or_comment(text: &str, i: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let next = bytes.get(i + 1).copied();
    match bytes[i] {
        quote @ (b'\'' | b'"' | b'`') => Some(skip_quoted(bytes, i, quote)),
        b'-' if next == Some(b'-') => Some(
            bytes[i..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |p| i + p + 1),
        ),
        b'/' if next == Some(b'*') => {
            Some(text[i + 2..].find("*/").map_or(bytes.len(), |p| i + 2 + p + 2))
        }
        _ => None,
    }
}

/// Returns the index just past the closing delimiter; doubled delimiters
/// are escapes.
fn skip_quoted(bytes: &[u8], open: usize, close: u8) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == close {
            if bytes.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
