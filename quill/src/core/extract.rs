//! Turn free-form backend output into a batch of operations.
//!
//! Candidates for JSON are tried in order (whole text, fenced blocks, the
//! outermost bracketed span). For each candidate the shape matchers run in
//! priority order: structured, legacy, fallback. The first match wins.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::operation::{Operation, OperationError, OperationKind, Shape};

/// One entry of a parsed batch, converted or not.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub index: usize,
    /// The entry as found in the output, for failure records.
    pub snapshot: Value,
    pub operation: Result<Operation, OperationError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBatch {
    pub shape: Shape,
    pub entries: Vec<ParsedEntry>,
}

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("fence regex"));

const PATH_KEYS: [&str; 3] = ["filename", "path", "file"];
const VERB_KEYS: [&str; 3] = ["operation", "action", "type"];

/// Parse backend output. `None` means no shape matched any JSON candidate.
pub fn parse_output(raw: &str) -> Option<ParsedBatch> {
    json_candidates(raw)
        .into_iter()
        .filter_map(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .find_map(|value| match_shape(&value))
}

/// Candidate JSON texts in the order they are tried.
fn json_candidates(raw: &str) -> Vec<&str> {
    let mut candidates = vec![raw.trim()];
    for caps in FENCE_RE.captures_iter(raw) {
        if let Some(body) = caps.get(1) {
            candidates.push(body.as_str().trim());
        }
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (raw.find(open), raw.rfind(close))
            && start < end
        {
            candidates.push(&raw[start..=end]);
        }
    }
    candidates.retain(|c| !c.is_empty());
    candidates
}

fn match_shape(value: &Value) -> Option<ParsedBatch> {
    if let Some(entries) = match_structured(value) {
        return Some(batch(Shape::Structured, entries, operation_from_entry));
    }
    if let Some(entries) = match_legacy(value) {
        return Some(batch(Shape::Legacy, entries, operation_from_legacy));
    }
    match_fallback(value).map(|entries| batch(Shape::Fallback, entries, operation_from_fallback))
}

fn batch(
    shape: Shape,
    entries: Vec<Value>,
    convert: fn(&Value) -> Result<Operation, OperationError>,
) -> ParsedBatch {
    let entries = entries
        .into_iter()
        .enumerate()
        .map(|(index, snapshot)| ParsedEntry {
            index,
            operation: convert(&snapshot),
            snapshot,
        })
        .collect();
    ParsedBatch { shape, entries }
}

fn match_structured(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Object(map) => {
            if let Some(Value::Array(entries)) = map.get("file_operations") {
                return Some(entries.clone());
            }
            is_typed_entry(map).then(|| vec![value.clone()])
        }
        Value::Array(items) if !items.is_empty() && items.iter().all(is_typed_value) => {
            Some(items.clone())
        }
        _ => None,
    }
}

fn match_legacy(value: &Value) -> Option<Vec<Value>> {
    match value.get("files") {
        Some(Value::Array(entries)) => Some(entries.clone()),
        _ => None,
    }
}

fn match_fallback(value: &Value) -> Option<Vec<Value>> {
    let map = value.as_object()?;
    if map.is_empty() || !map.values().all(Value::is_string) {
        return None;
    }
    Some(
        map.iter()
            .map(|(path, content)| serde_json::json!({"path": path, "content": content}))
            .collect(),
    )
}

fn is_typed_value(value: &Value) -> bool {
    value.as_object().is_some_and(is_typed_entry)
}

fn is_typed_entry(map: &Map<String, Value>) -> bool {
    first_str(map, &VERB_KEYS).is_some() && first_str(map, &PATH_KEYS).is_some()
}

fn first_str<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| map.get(*key).and_then(Value::as_str))
}

fn optional_str(map: &Map<String, Value>, keys: &[&str]) -> Result<Option<String>, OperationError> {
    for key in keys {
        match map.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => return Ok(Some(s.clone())),
            Some(other) => {
                return Err(OperationError::InvalidEntry(format!(
                    "'{key}' must be a string, got {other}"
                )));
            }
        }
    }
    Ok(None)
}

fn entry_path(map: &Map<String, Value>) -> Result<String, OperationError> {
    match first_str(map, &PATH_KEYS).map(str::trim) {
        Some(path) if !path.is_empty() => Ok(path.to_string()),
        _ => Err(OperationError::InvalidEntry(
            "missing 'filename' or 'path'".to_string(),
        )),
    }
}

fn entry_line(map: &Map<String, Value>) -> Result<Option<i64>, OperationError> {
    match map.get("line") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| OperationError::InvalidEntry(format!("'line' must be an integer, got {n}"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| OperationError::InvalidEntry(format!("'line' must be an integer, got '{s}'"))),
        Some(other) => Err(OperationError::InvalidEntry(format!(
            "'line' must be an integer, got {other}"
        ))),
    }
}

/// Convert an explicitly typed entry.
fn operation_from_entry(entry: &Value) -> Result<Operation, OperationError> {
    let map = entry
        .as_object()
        .ok_or_else(|| OperationError::InvalidEntry("entry is not an object".to_string()))?;
    let path = entry_path(map)?;
    let verb = first_str(map, &VERB_KEYS)
        .ok_or_else(|| OperationError::InvalidEntry("missing 'operation'".to_string()))?;

    let kind = match verb.trim().to_ascii_lowercase().as_str() {
        "write" | "create" | "overwrite" => OperationKind::Write {
            content: optional_str(map, &["content"])?.unwrap_or_default(),
        },
        "append" => OperationKind::Append {
            content: optional_str(map, &["content"])?.unwrap_or_default(),
        },
        "delete" | "remove" => OperationKind::Delete,
        "create_dir" | "mkdir" | "create_directory" => OperationKind::CreateDir,
        "search" | "find" => {
            let text = optional_str(map, &["search", "content", "query"])?
                .filter(|text| !text.is_empty())
                .ok_or_else(|| OperationError::InvalidEntry("search needs 'search' text".to_string()))?;
            OperationKind::Search { text }
        }
        "replace" | "edit" => {
            let search = optional_str(map, &["search", "find"])?.filter(|s| !s.is_empty());
            let line = entry_line(map)?;
            if search.is_none() && line.is_none() {
                return Err(OperationError::InvalidEntry(
                    "replace needs 'search' text or a 'line'".to_string(),
                ));
            }
            OperationKind::Replace {
                search,
                replace: optional_str(map, &["replace", "replacement", "content"])?
                    .unwrap_or_default(),
                line,
            }
        }
        other => {
            return Err(OperationError::InvalidEntry(format!(
                "unknown operation '{other}'"
            )));
        }
    };
    Ok(Operation { path, kind })
}

/// Convert a legacy `{path, content, is_dir}` entry.
fn operation_from_legacy(entry: &Value) -> Result<Operation, OperationError> {
    let map = entry
        .as_object()
        .ok_or_else(|| OperationError::InvalidEntry("entry is not an object".to_string()))?;
    let path = entry_path(map)?;
    let is_dir = map.get("is_dir").and_then(Value::as_bool).unwrap_or(false);
    let kind = if is_dir {
        OperationKind::CreateDir
    } else {
        OperationKind::Write {
            content: optional_str(map, &["content"])?.unwrap_or_default(),
        }
    };
    Ok(Operation { path, kind })
}

/// Convert a synthesized `{path, content}` fallback pair.
fn operation_from_fallback(entry: &Value) -> Result<Operation, OperationError> {
    operation_from_legacy(entry)
}
