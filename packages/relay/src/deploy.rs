use std::path::Path;
use std::process::Stdio;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Verify a GitHub `x-hub-signature-256` header against the raw body.
///
/// Comparison happens inside `verify_slice`, which is constant-time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// True for a push to the main branch.
pub fn is_main_push(payload: &Value) -> bool {
    payload.get("ref").and_then(Value::as_str) == Some("refs/heads/main")
}

/// Launch the update script fully detached: no inherited stdio, no waiting.
/// The script replaces this process on its own schedule.
pub fn launch_update_script(script: &Path) -> std::io::Result<u32> {
    let child = std::process::Command::new(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    let pid = child.id();
    tracing::info!(script = %script.display(), pid, "launched update script");
    Ok(pid)
}
