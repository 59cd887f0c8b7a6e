//! Recover batch job identifiers from a request's activity log.
//!
//! Two tiers per tool output: parse the embedded JSON object and read its
//! `calculation_id` (top level or one level down), falling back to text
//! patterns when the payload is not valid JSON. Every entry the unit of work
//! wrote is then also scanned for bare UUIDs. Engine `system` lines are
//! skipped; they carry the run's own execution token. This is a heuristic
//! and can both over-match and under-match; callers resolve the ids against
//! the job registry.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::store::traits::{ActivityLogEntry, LogKind};

const ID_KEY: &str = "calculation_id";

static EMBEDDED_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

static FALLBACK_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)"calculation_id":\s*"([^"]+)""#,
        r"(?i)'calculation_id':\s*'([^']+)'",
        r"(?i)calculation_id.*?([a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12})",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static UUID_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}")
        .unwrap()
});

/// Candidate job identifiers mentioned in `entries`, deduplicated in
/// first-seen order, never including `request_id` itself.
pub fn discover_job_ids(entries: &[ActivityLogEntry], request_id: Uuid) -> Vec<String> {
    let exclude = request_id.to_string();
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut push = |candidate: &str| {
        let candidate = candidate.trim();
        if candidate.is_empty() || candidate.eq_ignore_ascii_case(&exclude) {
            return;
        }
        if seen.insert(candidate.to_ascii_lowercase()) {
            ids.push(candidate.to_string());
        }
    };

    for entry in entries.iter().filter(|e| e.kind != LogKind::System) {
        if entry.kind == LogKind::ToolOutput {
            for id in structured_ids(&entry.content) {
                push(&id);
            }
        }
        for m in UUID_SHAPE.find_iter(&entry.content) {
            push(m.as_str());
        }
    }
    ids
}

/// Ids from a tool payload: JSON first, text patterns if that fails.
fn structured_ids(content: &str) -> Vec<String> {
    let Some(object) = EMBEDDED_OBJECT.find(content) else {
        return Vec::new();
    };
    match serde_json::from_str::<Value>(object.as_str()) {
        Ok(value) => ids_from_json(&value),
        Err(_) => FALLBACK_PATTERNS
            .iter()
            .flat_map(|re| re.captures_iter(content))
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect(),
    }
}

fn ids_from_json(value: &Value) -> Vec<String> {
    let Value::Object(map) = value else {
        return Vec::new();
    };
    if let Some(id) = map.get(ID_KEY).and_then(id_string) {
        return vec![id];
    }

    let mut ids = Vec::new();
    for nested in map.values() {
        match nested {
            Value::Object(inner) => ids.extend(inner.get(ID_KEY).and_then(id_string)),
            Value::Array(items) => ids.extend(
                items
                    .iter()
                    .filter_map(|item| item.get(ID_KEY))
                    .filter_map(id_string),
            ),
            _ => {}
        }
    }
    ids
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
