//! List filters: `field eq|ne value` clauses joined by `and`

use crate::common::{Error, Result};
use crate::storage::StorageVolume;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Clause {
    field: String,
    op: Op,
    value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFilter {
    clauses: Vec<Clause>,
}

impl VolumeFilter {
    /// An empty expression matches everything
    pub fn parse(expr: &str) -> Result<Self> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Ok(Self::default());
        }

        let mut clauses = Vec::new();
        let mut rest = tokens.as_slice();
        loop {
            let (field, op, value) = match rest {
                [field, op, value, ..] => (field, op, value),
                _ => return Err(invalid(expr)),
            };
            let op = match op.as_str() {
                "eq" => Op::Eq,
                "ne" => Op::Ne,
                _ => return Err(invalid(expr)),
            };
            if !is_known_field(field) {
                return Err(Error::InvalidInput(format!(
                    "Invalid filter field {:?}",
                    field
                )));
            }
            clauses.push(Clause {
                field: field.clone(),
                op,
                value: value.clone(),
            });

            rest = &rest[3..];
            match rest {
                [] => break,
                [and, tail @ ..] if and == "and" && !tail.is_empty() => rest = tail,
                _ => return Err(invalid(expr)),
            }
        }
        Ok(Self { clauses })
    }

    pub fn matches(&self, vol: &StorageVolume) -> bool {
        self.clauses.iter().all(|c| {
            let actual = field_value(vol, &c.field);
            let equal = actual.as_deref() == Some(c.value.as_str());
            match c.op {
                Op::Eq => equal,
                Op::Ne => !equal,
            }
        })
    }
}

fn invalid(expr: &str) -> Error {
    Error::InvalidInput(format!("Invalid filter {:?}", expr))
}

fn is_known_field(field: &str) -> bool {
    matches!(field, "name" | "type" | "content_type" | "location" | "project")
        || field.strip_prefix("config.").is_some_and(|k| !k.is_empty())
}

fn field_value(vol: &StorageVolume, field: &str) -> Option<String> {
    match field {
        "name" => Some(vol.name.clone()),
        "type" => Some(vol.kind.as_str().to_string()),
        "content_type" => Some(vol.content_type.as_str().to_string()),
        "location" => Some(vol.location.clone()),
        "project" => Some(vol.project.clone()),
        other => other
            .strip_prefix("config.")
            .and_then(|k| vol.config.get(k).cloned()),
    }
}

/// Split on whitespace; double quotes group words
fn tokenize(expr: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                token.push(c);
            }
            if !closed {
                return Err(invalid(expr));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}
