use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;
use uuid::Uuid;

use claude_relay_error::RelayError;

/// Fork a stored conversation for regeneration.
///
/// Drops the last real user turn and everything derived from it, then writes
/// the survivors to a new JSONL named by a fresh random UUID. The original
/// file is left untouched. Returns the new UUID, or `None` when the file has
/// no user turn to drop (nothing to regenerate).
pub fn fork_session_jsonl(session_file: &Path) -> Result<Option<String>, RelayError> {
    let raw = std::fs::read_to_string(session_file)?;
    let entries: Vec<Value> = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();

    let Some(cut_index) = last_real_user_index(&entries) else {
        return Ok(None);
    };

    // The cut entry plus every transitive descendant by parentUuid.
    let mut removed: HashSet<String> = HashSet::new();
    if let Some(uuid) = entry_uuid(&entries[cut_index]) {
        removed.insert(uuid.to_string());
    }
    loop {
        let before = removed.len();
        for entry in &entries[cut_index..] {
            let parent = entry.get("parentUuid").and_then(Value::as_str);
            if let (Some(parent), Some(uuid)) = (parent, entry_uuid(entry)) {
                if removed.contains(parent) {
                    removed.insert(uuid.to_string());
                }
            }
        }
        if removed.len() == before {
            break;
        }
    }

    let mut kept: Vec<&Value> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        if i >= cut_index {
            let is_removed = entry_uuid(entry)
                .map(|uuid| removed.contains(uuid))
                .unwrap_or(i == cut_index);
            if is_removed {
                continue;
            }
        }
        kept.push(entry);
    }

    // A file-history snapshot taken right before the dropped turn belongs to it.
    if let Some(last) = kept.last() {
        if last.get("type").and_then(Value::as_str) == Some("file-history-snapshot") {
            kept.pop();
        }
    }

    let new_uuid = Uuid::new_v4().to_string();
    let parent = session_file
        .parent()
        .ok_or_else(|| RelayError::internal("session file has no parent directory"))?;
    let fork_path = parent.join(format!("{new_uuid}.jsonl"));
    let mut body = String::new();
    for entry in &kept {
        body.push_str(&serde_json::to_string(entry)?);
        body.push('\n');
    }
    std::fs::write(&fork_path, body)?;
    tracing::info!(
        original = %session_file.display(),
        fork = %fork_path.display(),
        dropped = entries.len() - kept.len(),
        "forked session for regeneration"
    );
    Ok(Some(new_uuid))
}

/// Index of the last entry that is an actual user turn: role user, not a
/// compact summary, and not a pure tool_result carrier.
fn last_real_user_index(entries: &[Value]) -> Option<usize> {
    entries.iter().rposition(|entry| {
        entry.get("type").and_then(Value::as_str) == Some("user")
            && !is_compact_summary(entry)
            && !is_tool_result_carrier(entry)
    })
}

fn is_compact_summary(entry: &Value) -> bool {
    entry
        .get("isCompactSummary")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn is_tool_result_carrier(entry: &Value) -> bool {
    let content = entry
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array);
    match content {
        Some(blocks) if !blocks.is_empty() => blocks
            .iter()
            .all(|block| block.get("type").and_then(Value::as_str) == Some("tool_result")),
        _ => false,
    }
}

fn entry_uuid(entry: &Value) -> Option<&str> {
    entry.get("uuid").and_then(Value::as_str)
}
