use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use claude_relay_error::RelayError;

use crate::text::stable_system_text;

/// One known CLI session, addressed by session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Unix seconds of the last successful run.
    pub last_used: u64,
}

/// In-memory session-key -> session-UUID mapping with identity-based
/// migration, optionally persisted to disk so restarts keep continuity.
#[derive(Debug)]
pub struct SessionRegistry {
    path: Option<PathBuf>,
    ttl: Option<Duration>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new(path: Option<PathBuf>, ttl: Option<Duration>) -> Self {
        let sessions = path
            .as_deref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|raw| serde_json::from_str::<HashMap<String, SessionRecord>>(&raw).ok())
            .unwrap_or_default();
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "loaded persisted sessions");
        }
        Self {
            path,
            ttl,
            sessions: Mutex::new(sessions),
        }
    }

    /// Exact-match lookup. Expired records are evicted here when a TTL is
    /// configured.
    pub async fn lookup(&self, session_key: &str) -> Option<SessionRecord> {
        let mut sessions = self.sessions.lock().await;
        if let Some(ttl) = self.ttl {
            let record_expired = sessions
                .get(session_key)
                .map(|record| now_secs().saturating_sub(record.last_used) > ttl.as_secs())
                .unwrap_or(false);
            if record_expired {
                sessions.remove(session_key);
                return None;
            }
        }
        sessions.get(session_key).cloned()
    }

    /// Transfer a record with the same identity to a new session key. System
    /// prompts drift across deployments; identity is the durable handle, so
    /// "seen this identity before" means "reuse their session". Never
    /// performed without an identity.
    pub async fn migrate(&self, session_key: &str, identity: &str) -> Option<SessionRecord> {
        if identity.is_empty() {
            return None;
        }
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_key) {
            return sessions.get(session_key).cloned();
        }
        let old_key = sessions
            .iter()
            .find(|(_, record)| record.identity.as_deref() == Some(identity))
            .map(|(key, _)| key.clone())?;
        let record = sessions.remove(&old_key)?;
        tracing::info!(identity, "migrating session to new key");
        sessions.insert(session_key.to_string(), record.clone());
        drop(sessions);
        self.persist().await;
        Some(record)
    }

    /// Upsert after a successful run.
    pub async fn record(&self, session_key: &str, uuid: &str, identity: Option<&str>) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            session_key.to_string(),
            SessionRecord {
                uuid: uuid.to_string(),
                identity: identity.map(str::to_string),
                last_used: now_secs(),
            },
        );
        drop(sessions);
        self.persist().await;
    }

    pub async fn remove(&self, session_key: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(session_key);
        drop(sessions);
        self.persist().await;
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    async fn persist(&self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let snapshot = self.sessions.lock().await.clone();
        let result = serde_json::to_string_pretty(&snapshot)
            .map_err(RelayError::from)
            .and_then(|json| std::fs::write(path, json).map_err(RelayError::from));
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to persist session registry");
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Stable per-chat key: hash of the stable system-prompt text plus the
/// canonical identity. Survives per-message metadata churn.
pub fn session_key(system_text: &str, identity: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stable_system_text(system_text).as_bytes());
    if let Some(identity) = identity {
        hasher.update(b"\x1f");
        hasher.update(identity.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Deterministic session UUID for a key: SHA-256, first 16 bytes, canonical
/// 8-4-4-4-12 text with the version nibble forced to 4 and the variant
/// nibble to 8. Regeneration forks use a fresh random UUID instead.
pub fn derive_session_uuid(session_key: &str) -> String {
    let digest = Sha256::digest(session_key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&bytes[0..4]),
        hex::encode(&bytes[4..6]),
        hex::encode(&bytes[6..8]),
        hex::encode(&bytes[8..10]),
        hex::encode(&bytes[10..16]),
    )
}

fn sender_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[from:\s*[^(\]]*\(@([A-Za-z0-9_.\-]+)\)\s*\]").expect("valid sender tag regex")
    })
}

/// Extract the canonical identity for a request.
///
/// Precedence: sender handle from a `[from: Display Name (@handle)]` tag in
/// the last user message, then `chat_id` from the first fenced JSON metadata
/// block in the system prompt, then none. The alias map is applied last so a
/// secondary-channel identity can share its primary channel's session.
pub fn extract_identity(
    last_user_text: &str,
    system_text: &str,
    aliases: &HashMap<String, String>,
) -> Option<String> {
    let raw = sender_handle(last_user_text).or_else(|| chat_id_from_system(system_text))?;
    Some(aliases.get(&raw).cloned().unwrap_or(raw))
}

fn sender_handle(text: &str) -> Option<String> {
    sender_tag_re()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|handle| handle.as_str().to_lowercase())
}

fn chat_id_from_system(system_text: &str) -> Option<String> {
    let block = fenced_json_block(system_text)?;
    let value: Value = serde_json::from_str(&block).ok()?;
    match value.get("chat_id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// First ```json ... ``` (or bare ``` ... ```) block in the text.
pub fn fenced_json_block(text: &str) -> Option<String> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    let block = body[..close].trim();
    if block.is_empty() {
        None
    } else {
        Some(block.to_string())
    }
}

/// Load an identity-alias map from a JSON object file.
pub fn load_alias_map(path: &std::path::Path) -> Result<HashMap<String, String>, RelayError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
