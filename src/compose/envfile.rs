//! Env file parsing
//!
//! Lines are `KEY=VALUE`, optionally prefixed with `export`. Values may be
//! single quoted (literal) or double quoted (with `\n`, `\t`, `\"` and `\\`
//! escapes). Unquoted values end at a ` #` comment. A bare `KEY` inherits
//! the value from the surrounding environment and is reported as `None`.

use crate::error::{CtlError, Result};
use indexmap::IndexMap;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").unwrap());

/// Read and parse an env file
pub fn read(path: &Path) -> Result<IndexMap<String, Option<String>>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CtlError::ConfigInvalid(format!("failed to read env file {}: {}", path.display(), e))
    })?;
    parse(&content).map_err(|e| match e {
        CtlError::ConfigInvalid(msg) => {
            CtlError::ConfigInvalid(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

/// Parse env file content
pub fn parse(content: &str) -> Result<IndexMap<String, Option<String>>> {
    let mut vars = IndexMap::new();

    for (number, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line
            .strip_prefix("export ")
            .map(str::trim_start)
            .unwrap_or(line);

        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), Some(parse_value(value.trim_start()))),
            None => (line, None),
        };

        if !KEY_PATTERN.is_match(key) {
            return Err(CtlError::ConfigInvalid(format!(
                "line {}: invalid variable name {:?}",
                number + 1,
                key
            )));
        }

        vars.insert(key.to_string(), value);
    }

    Ok(vars)
}

fn parse_value(value: &str) -> String {
    if let Some(rest) = value.strip_prefix('\'') {
        if let Some(end) = rest.find('\'') {
            return rest[..end].to_string();
        }
    }

    if let Some(rest) = value.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = rest.chars();
        while let Some(c) = chars.next() {
            match c {
                '"' => return out,
                '\\' => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(other) => out.push(other),
                    None => out.push('\\'),
                },
                other => out.push(other),
            }
        }
        // Unterminated quote: keep the raw text
        return value.to_string();
    }

    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.trim_end().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_env_file() {
        let content = r#"
# comment
TAG=1.19-alpine
export DB_HOST = db
EMPTY=
QUOTED="hello \"world\"\nbye"
SINGLE='no $expansion here'
INLINE=value # trailing comment
INHERIT
"#;

        let vars = parse(content).unwrap();
        assert_eq!(vars["TAG"].as_deref(), Some("1.19-alpine"));
        assert_eq!(vars["DB_HOST"].as_deref(), Some("db"));
        assert_eq!(vars["EMPTY"].as_deref(), Some(""));
        assert_eq!(vars["QUOTED"].as_deref(), Some("hello \"world\"\nbye"));
        assert_eq!(vars["SINGLE"].as_deref(), Some("no $expansion here"));
        assert_eq!(vars["INLINE"].as_deref(), Some("value"));
        assert_eq!(vars["INHERIT"], None);
        assert_eq!(vars.len(), 7);
    }

    #[test]
    fn test_invalid_key() {
        let err = parse("1BAD=x").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_read_missing_file() {
        let temp = tempdir().unwrap();
        let err = read(&temp.path().join("nope.env")).unwrap_err();
        assert!(matches!(err, CtlError::ConfigInvalid(_)));
    }
}
