use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Idle-timeout thresholds for a running child, by CLI phase, plus the spawn
/// failure-detection window and the SIGTERM grace period.
#[derive(Debug, Clone, Copy)]
pub struct RunTimeouts {
    /// Baseline inactivity budget while the CLI is producing text.
    pub idle: Duration,
    /// Extended budget while a tool is executing.
    pub tool: Duration,
    /// Extended budget during context compaction.
    pub compact: Duration,
    /// Window after spawn in which a non-zero exit counts as a spawn failure.
    pub spawn_window: Duration,
    /// Grace between SIGTERM and SIGKILL.
    pub term_grace: Duration,
}

impl Default for RunTimeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            tool: Duration::from_secs(5 * 60),
            compact: Duration::from_secs(10 * 60),
            spawn_window: Duration::from_secs(3),
            term_grace: Duration::from_secs(5),
        }
    }
}

/// Runtime configuration assembled by the CLI layer and shared with every
/// handler through the engine.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Path to the assistant CLI binary.
    pub claude_bin: PathBuf,
    /// Working directory the CLI runs in. Distinct from the CLI's own
    /// config/auth directory.
    pub workspace: PathBuf,
    /// Override for the CLI's config directory (session store root). Falls
    /// back to `~/.claude`.
    pub config_dir: Option<PathBuf>,
    /// HMAC secret for the deploy webhook. Webhook is rejected when unset.
    pub webhook_secret: Option<String>,
    /// Script launched (detached) by an accepted deploy webhook.
    pub update_script: Option<PathBuf>,
    /// Identity aliases: extracted identity -> canonical identity.
    pub aliases: HashMap<String, String>,
    /// Optional JSON file the session registry persists to.
    pub session_store: Option<PathBuf>,
    /// TTL for registry entries. `None` disables eviction.
    pub session_ttl: Option<Duration>,
    pub timeouts: RunTimeouts,
}

impl RelayConfig {
    pub fn new(claude_bin: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            workspace: workspace.into(),
            config_dir: None,
            webhook_secret: None,
            update_script: None,
            aliases: HashMap::new(),
            session_store: None,
            session_ttl: None,
            timeouts: RunTimeouts::default(),
        }
    }

    /// Root of the CLI's per-session JSONL store for the configured
    /// workspace: `<config-dir>/projects/<slugified workspace>`.
    pub fn session_file_dir(&self) -> PathBuf {
        let base = self
            .config_dir
            .clone()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".claude"));
        base.join("projects").join(slugify_path(&self.workspace))
    }

    pub fn session_file_path(&self, uuid: &str) -> PathBuf {
        self.session_file_dir().join(format!("{uuid}.jsonl"))
    }
}

/// The CLI names its per-project store by replacing path separators and dots
/// with dashes.
pub fn slugify_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut slug = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '/' | '\\' | '.' | ':' => slug.push('-'),
            other => slug.push(other),
        }
    }
    slug
}
