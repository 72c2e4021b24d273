//! Variable substitution in compose files
//!
//! Supported forms: `$NAME`, `${NAME}`, `${NAME:-default}`, `${NAME-default}`,
//! `${NAME:?error}`, `${NAME?error}`, `${NAME:+alt}`, `${NAME+alt}` and `$$`
//! for a literal dollar sign. Defaults and alternatives may themselves
//! contain substitutions.

use crate::error::{CtlError, Result};
use std::collections::BTreeMap;

/// Layered variable lookup
///
/// Layers are consulted in order: explicit `--env-file` contents, the
/// project `.env` file, then the process environment.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    explicit: BTreeMap<String, String>,
    dotenv: BTreeMap<String, String>,
    process: BTreeMap<String, String>,
}

impl Environment {
    /// Environment backed only by the given process variables
    pub fn new(process: BTreeMap<String, String>) -> Self {
        Self {
            process,
            ..Self::default()
        }
    }

    /// Add variables read from `--env-file`
    pub fn with_explicit(mut self, vars: BTreeMap<String, String>) -> Self {
        self.explicit.extend(vars);
        self
    }

    /// Add variables read from the project `.env`
    pub fn with_dotenv(mut self, vars: BTreeMap<String, String>) -> Self {
        self.dotenv.extend(vars);
        self
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.explicit
            .get(name)
            .or_else(|| self.dotenv.get(name))
            .or_else(|| self.process.get(name))
            .map(|s| s.as_str())
    }
}

/// Substitute variables in a string
pub fn interpolate(input: &str, env: &Environment) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = closing_brace(body).ok_or_else(|| {
                CtlError::ConfigInvalid(format!("invalid interpolation format for {:?}", input))
            })?;
            out.push_str(&expand(&body[..end], env)?);
            rest = &body[end + 1..];
        } else {
            let len = if after.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
                after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len())
            } else {
                0
            };
            if len == 0 {
                out.push('$');
                rest = after;
            } else {
                let name = &after[..len];
                out.push_str(lookup_or_blank(name, env));
                rest = &after[len..];
            }
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Substitute variables in every string scalar of a YAML tree
///
/// `path` names the position of `value` in the file and is used in error
/// messages.
pub fn interpolate_value(value: &mut serde_yaml::Value, env: &Environment, path: &str) -> Result<()> {
    match value {
        serde_yaml::Value::String(s) => {
            *s = interpolate(s, env).map_err(|e| match e {
                CtlError::ConfigInvalid(msg) => CtlError::ConfigInvalid(format!("{}: {}", path, msg)),
                other => other,
            })?;
        }
        serde_yaml::Value::Sequence(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                interpolate_value(item, env, &format!("{}[{}]", path, i))?;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (key, item) in map.iter_mut() {
                let key = key.as_str().unwrap_or("?");
                let child = if path.is_empty() {
                    key.to_string()
                } else {
                    format!("{}.{}", path, key)
                };
                interpolate_value(item, env, &child)?;
            }
        }
        serde_yaml::Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env, path)?,
        _ => {}
    }
    Ok(())
}

/// Index of the brace closing a `${` group, honoring nesting
fn closing_brace(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in body.char_indices() {
        match c {
            '{' => depth += 1,
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn lookup_or_blank<'a>(name: &str, env: &'a Environment) -> &'a str {
    match env.get(name) {
        Some(value) => value,
        None => {
            tracing::warn!("The {:?} variable is not set. Defaulting to a blank string.", name);
            ""
        }
    }
}

fn expand(body: &str, env: &Environment) -> Result<String> {
    let name_len = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(body.len());
    let (name, op) = body.split_at(name_len);

    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(CtlError::ConfigInvalid(format!(
            "invalid interpolation format for ${{{}}}",
            body
        )));
    }

    let value = env.get(name);
    let set_nonempty = value.is_some_and(|v| !v.is_empty());

    if op.is_empty() {
        return Ok(lookup_or_blank(name, env).to_string());
    }

    if let Some(default) = op.strip_prefix(":-") {
        return match value {
            Some(v) if !v.is_empty() => Ok(v.to_string()),
            _ => interpolate(default, env),
        };
    }
    if let Some(message) = op.strip_prefix(":?") {
        return match value {
            Some(v) if !v.is_empty() => Ok(v.to_string()),
            _ => Err(required(name, message, env)?),
        };
    }
    if let Some(alternative) = op.strip_prefix(":+") {
        return if set_nonempty {
            interpolate(alternative, env)
        } else {
            Ok(String::new())
        };
    }
    if let Some(default) = op.strip_prefix('-') {
        return match value {
            Some(v) => Ok(v.to_string()),
            None => interpolate(default, env),
        };
    }
    if let Some(message) = op.strip_prefix('?') {
        return match value {
            Some(v) => Ok(v.to_string()),
            None => Err(required(name, message, env)?),
        };
    }
    if let Some(alternative) = op.strip_prefix('+') {
        return if value.is_some() {
            interpolate(alternative, env)
        } else {
            Ok(String::new())
        };
    }

    Err(CtlError::ConfigInvalid(format!(
        "invalid interpolation format for ${{{}}}",
        body
    )))
}

fn required(name: &str, message: &str, env: &Environment) -> Result<CtlError> {
    let message = interpolate(message, env)?;
    Ok(CtlError::ConfigInvalid(if message.is_empty() {
        format!("required variable {} is missing a value", name)
    } else {
        format!("required variable {} is missing a value: {}", name, message)
    }))
}
