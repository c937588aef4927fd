//! Parser for model definition text.
//!
//! ```text
//! [request_definition]
//! r = sub, obj, act
//!
//! [policy_definition]
//! p = sub, obj, act
//!
//! [role_definition]
//! g = _, _
//!
//! [policy_effect]
//! e = some(where (p.eft == allow))
//!
//! [matchers]
//! m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
//! ```

use std::collections::BTreeMap;

use super::Assertion;
use crate::error::{PolicyError, Result};

/// Section header name → section key.
const SECTIONS: [(&str, &str); 5] = [
    ("request_definition", "r"),
    ("policy_definition", "p"),
    ("role_definition", "g"),
    ("policy_effect", "e"),
    ("matchers", "m"),
];

/// Sections every model must define.
const REQUIRED_SECTIONS: [&str; 4] = ["r", "p", "e", "m"];

/// Parse model text into section key → entry key → assertion.
pub(super) fn parse(text: &str) -> Result<BTreeMap<String, BTreeMap<String, Assertion>>> {
    let mut sections: BTreeMap<String, BTreeMap<String, Assertion>> = BTreeMap::new();
    let mut current: Option<&str> = None;

    for (line_no, line) in logical_lines(text) {
        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .ok_or_else(|| invalid(line_no, format!("unterminated section header {line}")))?
                .trim();
            let sec = SECTIONS
                .iter()
                .find(|(header, _)| *header == name)
                .map(|(_, sec)| *sec)
                .ok_or_else(|| invalid(line_no, format!("unknown section [{name}]")))?;
            current = Some(sec);
            continue;
        }

        let sec = current.ok_or_else(|| invalid(line_no, "definition outside of a section"))?;
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| invalid(line_no, format!("expected `key = value`, got {line}")))?;
        let key = key.trim();
        let value = value.trim();

        if !key.starts_with(sec) || key.is_empty() || value.is_empty() {
            return Err(invalid(
                line_no,
                format!("invalid definition {key:?} in section {sec}"),
            ));
        }

        let tokens = match sec {
            "r" | "p" => value
                .split(',')
                .map(|field| format!("{key}_{}", field.trim()))
                .collect(),
            _ => Vec::new(),
        };

        let entries = sections.entry(sec.to_string()).or_default();
        if entries.contains_key(key) {
            return Err(invalid(line_no, format!("duplicate definition of {key}")));
        }
        entries.insert(key.to_string(), Assertion::new(key, value, tokens));
    }

    for sec in REQUIRED_SECTIONS {
        if !sections.contains_key(sec) {
            let header = SECTIONS
                .iter()
                .find(|(_, key)| *key == sec)
                .map(|(header, _)| *header)
                .unwrap_or(sec);
            return Err(PolicyError::InvalidModel(format!(
                "missing section [{header}]"
            )));
        }
    }

    Ok(sections)
}

/// Yield trimmed, non-empty, comment-free lines with `\` continuations
/// joined, paired with the 1-based number of their first physical line.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, raw) in text.lines().enumerate() {
        let content = raw.split_once('#').map_or(raw, |(before, _)| before).trim();

        let (line_no, mut buffer) = pending.take().unwrap_or((index + 1, String::new()));
        if let Some(continued) = content.strip_suffix('\\') {
            buffer.push_str(continued.trim_end());
            buffer.push(' ');
            pending = Some((line_no, buffer));
            continue;
        }
        buffer.push_str(content);

        let joined = buffer.trim();
        if !joined.is_empty() {
            lines.push((line_no, joined.to_string()));
        }
    }

    if let Some((line_no, buffer)) = pending {
        let joined = buffer.trim();
        if !joined.is_empty() {
            lines.push((line_no, joined.to_string()));
        }
    }

    lines
}

fn invalid(line_no: usize, msg: impl std::fmt::Display) -> PolicyError {
    PolicyError::InvalidModel(format!("line {line_no}: {msg}"))
}
