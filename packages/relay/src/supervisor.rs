use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use claude_relay_error::RelayError;

use crate::config::RelayConfig;

/// Everything needed to launch one CLI turn.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub session_uuid: String,
    pub resume: bool,
    pub streaming: bool,
    pub model: Option<String>,
    /// Full system prompt, passed only for brand-new sessions. Passing it on
    /// resume would overwrite the stored prompt and erase history.
    pub system_prompt: Option<String>,
    /// Appended fragment for resumed sessions: current-turn metadata plus a
    /// standing reminder.
    pub append_system_prompt: Option<String>,
    /// User prompt, written to stdin to dodge argv length limits.
    pub prompt: String,
}

/// A spawned CLI child with its stdout handle and a background stderr
/// collector.
#[derive(Debug)]
pub struct RunningChild {
    pub child: Child,
    pub stdout: ChildStdout,
    /// Stdout bytes consumed while probing for spawn failures. The driver
    /// must process these before reading `stdout`.
    pub prefix: Vec<u8>,
    stderr: Arc<Mutex<String>>,
    _stderr_task: JoinHandle<()>,
}

impl RunningChild {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.lock().expect("stderr lock").clone()
    }

    /// Ask the child to exit. SIGTERM on unix so the CLI can flush its
    /// session file; safe to call repeatedly or after exit.
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            return;
        }
        #[cfg(not(unix))]
        {
            // No SIGTERM equivalent; the caller escalates via kill().
        }
    }

    pub async fn kill_now(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Result of the spawn-and-retry sequence.
#[derive(Debug)]
pub struct SpawnOutcome {
    pub run: RunningChild,
    /// True when a resume attempt failed and the caller should drop its
    /// session record (the run continued under a fresh session file).
    pub resume_dropped: bool,
}

fn build_command(config: &RelayConfig, spec: &SpawnSpec) -> Command {
    let mut cmd = Command::new(&config.claude_bin);
    cmd.arg("--print");
    if spec.streaming {
        cmd.arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages");
    } else {
        cmd.arg("--output-format").arg("json");
    }
    cmd.arg("--dangerously-skip-permissions");
    if let Some(model) = &spec.model {
        cmd.arg("--model").arg(model);
    }
    if spec.resume {
        cmd.arg("--resume").arg(&spec.session_uuid);
        if let Some(fragment) = &spec.append_system_prompt {
            cmd.arg("--append-system-prompt").arg(fragment);
        }
    } else {
        cmd.arg("--session-id").arg(&spec.session_uuid);
        if let Some(system) = &spec.system_prompt {
            cmd.arg("--system-prompt").arg(system);
        }
    }
    cmd.current_dir(&config.workspace);
    // The CLI must use its own login, never a key inherited from our env.
    cmd.env_remove("ANTHROPIC_API_KEY");
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

async fn spawn_once(config: &RelayConfig, spec: &SpawnSpec) -> Result<RunningChild, RelayError> {
    let mut cmd = build_command(config, spec);
    tracing::debug!(
        uuid = %spec.session_uuid,
        resume = spec.resume,
        streaming = spec.streaming,
        "spawning assistant CLI"
    );
    let mut child = cmd.spawn().map_err(|err| RelayError::SpawnFailed {
        message: format!("{}: {err}", config.claude_bin.display()),
    })?;

    let stdout = child.stdout.take().ok_or_else(|| RelayError::internal("child stdout missing"))?;
    let stderr = child.stderr.take().ok_or_else(|| RelayError::internal("child stderr missing"))?;
    let mut stdin = child.stdin.take().ok_or_else(|| RelayError::internal("child stdin missing"))?;

    let prompt = spec.prompt.clone();
    tokio::spawn(async move {
        if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
            tracing::debug!(error = %err, "failed writing prompt to child stdin");
        }
        // Dropping stdin closes the pipe, signalling end of input.
    });

    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let stderr_task = {
        let buf = Arc::clone(&stderr_buf);
        tokio::spawn(async move {
            let mut reader = stderr;
            let mut collected = String::new();
            if reader.read_to_string(&mut collected).await.is_ok() {
                *buf.lock().expect("stderr lock") = collected;
            }
        })
    };

    Ok(RunningChild {
        child,
        stdout,
        prefix: Vec::new(),
        stderr: stderr_buf,
        _stderr_task: stderr_task,
    })
}

/// Spawn the CLI, racing its first output against a short window to detect
/// immediate failures without delaying healthy turns.
///
/// Failure handling inside the window:
/// - stderr mentions "already in use": delete the session JSONL and respawn
///   with a fresh session under the same id (loses in-CLI history, unblocks).
/// - a resume attempt exited non-zero: respawn as a new session and tell the
///   caller to drop its record.
/// - anything else: clear the JSONL and retry once.
///
/// A fast exit with status zero is success, not failure; the CLI's output is
/// still buffered in the pipe.
pub async fn spawn_with_retry(
    config: &RelayConfig,
    spec: &SpawnSpec,
) -> Result<SpawnOutcome, RelayError> {
    let mut spec = spec.clone();
    let mut resume_dropped = false;
    let mut retried = false;

    loop {
        let mut run = spawn_once(config, &spec).await?;

        // First output means the CLI came up; EOF means it died before
        // producing anything. A silent-but-alive child passes once the
        // window elapses.
        let mut probe = vec![0u8; 8192];
        let early_exit = {
            match timeout(config.timeouts.spawn_window, run.stdout.read(&mut probe)).await {
                Err(_) => None,
                Ok(Ok(n)) if n > 0 => {
                    probe.truncate(n);
                    run.prefix = probe;
                    None
                }
                Ok(Ok(_)) | Ok(Err(_)) => {
                    match timeout(config.timeouts.spawn_window, run.child.wait()).await {
                        Ok(Ok(status)) => Some(status),
                        Ok(Err(err)) => return Err(err.into()),
                        Err(_) => None,
                    }
                }
            }
        };

        let Some(status) = early_exit else {
            return Ok(SpawnOutcome { run, resume_dropped });
        };
        if status.success() {
            return Ok(SpawnOutcome { run, resume_dropped });
        }

        // Give the stderr collector a beat to observe EOF.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stderr = run.stderr_text();
        tracing::warn!(
            uuid = %spec.session_uuid,
            code = status.code().unwrap_or(-1),
            stderr = %stderr,
            "assistant CLI exited immediately"
        );

        if retried {
            return Err(RelayError::SpawnFailed {
                message: format!(
                    "assistant CLI failed twice (exit {}): {}",
                    status.code().unwrap_or(-1),
                    stderr.lines().next().unwrap_or("no stderr")
                ),
            });
        }
        retried = true;

        if stderr.contains("already in use") {
            remove_session_file(config, &spec.session_uuid);
            spec.resume = false;
        } else if spec.resume {
            spec.resume = false;
            resume_dropped = true;
        } else {
            remove_session_file(config, &spec.session_uuid);
            spec.resume = false;
        }
    }
}

fn remove_session_file(config: &RelayConfig, uuid: &str) {
    let path = config.session_file_path(uuid);
    match std::fs::remove_file(&path) {
        Ok(()) => tracing::info!(path = %path.display(), "cleared stale session file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to clear session file"),
    }
}

/// SIGTERM, a grace period, then SIGKILL. Idempotent.
pub async fn graceful_kill(run: &mut RunningChild, grace: std::time::Duration) {
    run.terminate();
    if timeout(grace, run.child.wait()).await.is_err() {
        run.kill_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::Path;

    fn write_executable(path: &Path, script: &str) {
        let mut file = std::fs::File::create(path).expect("create script");
        file.write_all(script.as_bytes()).expect("write script");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path).expect("metadata").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(path, perms).expect("set mode");
        }
    }

    fn test_config(dir: &Path, bin: &Path) -> RelayConfig {
        let mut config = RelayConfig::new(bin, dir);
        config.config_dir = Some(dir.join("claude-home"));
        config.timeouts.spawn_window = std::time::Duration::from_millis(500);
        config
    }

    fn spec(resume: bool) -> SpawnSpec {
        SpawnSpec {
            session_uuid: "00000000-0000-4000-8000-000000000000".to_string(),
            resume,
            streaming: true,
            model: None,
            system_prompt: None,
            append_system_prompt: None,
            prompt: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn fast_clean_exit_is_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("claude");
        write_executable(&bin, "#!/usr/bin/env sh\ncat > /dev/null\necho '{\"type\":\"result\",\"result\":\"ok\"}'\n");

        let config = test_config(dir.path(), &bin);
        let outcome = spawn_with_retry(&config, &spec(false)).await.expect("spawn");
        assert!(!outcome.resume_dropped);
    }

    #[tokio::test]
    async fn failed_resume_falls_back_to_new_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("claude");
        // Fails whenever asked to resume, succeeds otherwise.
        write_executable(
            &bin,
            "#!/usr/bin/env sh\ncase \"$*\" in *--resume*) echo 'No conversation found' >&2; exit 1;; esac\ncat > /dev/null\necho '{\"type\":\"result\",\"result\":\"ok\"}'\n",
        );

        let config = test_config(dir.path(), &bin);
        let outcome = spawn_with_retry(&config, &spec(true)).await.expect("spawn");
        assert!(outcome.resume_dropped);
    }

    #[tokio::test]
    async fn already_in_use_clears_session_file_and_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("claude");
        let config = test_config(dir.path(), &bin);

        let session_file = config.session_file_path("00000000-0000-4000-8000-000000000000");
        std::fs::create_dir_all(session_file.parent().expect("parent")).expect("mkdir");
        std::fs::write(&session_file, "{}\n").expect("seed session file");

        // Fails while the session file exists, succeeds after it is cleared.
        let marker = session_file.display().to_string();
        write_executable(
            &bin,
            &format!(
                "#!/usr/bin/env sh\nif [ -f '{marker}' ]; then echo 'Session already in use' >&2; exit 1; fi\ncat > /dev/null\necho '{{\"type\":\"result\",\"result\":\"ok\"}}'\n"
            ),
        );

        let outcome = spawn_with_retry(&config, &spec(false)).await.expect("spawn");
        assert!(!session_file.exists());
        assert!(!outcome.resume_dropped);
    }

    #[tokio::test]
    async fn double_failure_surfaces_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("claude");
        write_executable(&bin, "#!/usr/bin/env sh\necho 'boom' >&2\nexit 7\n");

        let config = test_config(dir.path(), &bin);
        let err = spawn_with_retry(&config, &spec(false)).await.expect_err("should fail");
        assert!(err.to_string().contains("boom") || err.to_string().contains("twice"));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path(), &dir.path().join("nope"));
        let err = spawn_with_retry(&config, &spec(false)).await.expect_err("no binary");
        assert!(matches!(err, RelayError::SpawnFailed { .. }));
    }
}
