use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use claude_relay_cli_stream::{CliEvent, JsonStreamParser, ResultEvent};
use claude_relay_error::RelayError;

use crate::config::RelayConfig;
use crate::fork;
use crate::images::{append_image_paths, extract_images, ExtractedImages};
use crate::monitor::Monitor;
use crate::queue::SessionQueues;
use crate::router::types::{MessagesRequest, MessagesResponse, UsageInfo};
use crate::session::{self, SessionRegistry};
use crate::supervisor::{self, SpawnSpec};
use crate::text::{normalize_model, strip_gateway_tags};
use crate::translate::{Phase, SseFrame, TurnTranslator};

pub const FEATURES: &[&str] = &["sessions", "streaming", "regenerate", "monitor", "deploy"];

/// Shared gateway state, handed to every handler. Owns the session registry,
/// the per-key queues, and the monitor fan-out.
pub struct Engine {
    pub config: RelayConfig,
    pub registry: SessionRegistry,
    pub queues: SessionQueues,
    pub monitor: Monitor,
}

impl Engine {
    pub fn new(config: RelayConfig) -> Self {
        let registry = SessionRegistry::new(config.session_store.clone(), config.session_ttl);
        Self {
            config,
            registry,
            queues: SessionQueues::new(),
            monitor: Monitor::new(),
        }
    }

    /// Signal every active child; called from the shutdown path.
    pub fn shutdown(&self) {
        let killed = self.queues.preempt_all();
        if killed > 0 {
            tracing::info!(children = killed, "signalled children for shutdown");
        }
    }

    fn timeout_for(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Normal => self.config.timeouts.idle,
            Phase::Tool => self.config.timeouts.tool,
            Phase::Compacting => self.config.timeouts.compact,
        }
    }
}

/// What a parsed request asks the engine to do.
#[derive(Debug)]
pub enum TurnRequest {
    /// `/stop` pseudo-command: preempt without enqueuing.
    Stop { session_key: String },
    Run(Box<TurnPlan>),
}

/// Everything resolved about one turn before the queue is joined.
#[derive(Debug)]
pub struct TurnPlan {
    pub request_id: String,
    pub session_key: String,
    pub uuid: String,
    pub resume: bool,
    pub regenerate: bool,
    pub streaming: bool,
    /// Normalized model passed to the CLI.
    pub model: Option<String>,
    /// Model echoed back in responses.
    pub model_display: String,
    pub prompt: String,
    pub system_full: Option<String>,
    pub system_append: Option<String>,
    pub identity: Option<String>,
    pub images: Option<ExtractedImages>,
}

impl Engine {
    /// Steps 1-7 of the request flow: validate, derive identity and session
    /// key, resolve resume-vs-new, and detect the `/stop` pseudo-command.
    pub async fn prepare(
        &self,
        request: &MessagesRequest,
        session_key_override: Option<String>,
        regenerate: bool,
    ) -> Result<TurnRequest, RelayError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .ok_or_else(|| RelayError::invalid_request("at least one user message is required"))?;

        // The client gateway is authoritative for context; only the last user
        // message goes to the CLI, which keeps its own history via resume.
        let raw_prompt = last_user.content.text();
        let raw_system = request
            .system
            .as_ref()
            .map(|system| system.text())
            .unwrap_or_default();

        let identity = session::extract_identity(&raw_prompt, &raw_system, &self.config.aliases);
        let session_key = session_key_override
            .unwrap_or_else(|| session::session_key(&raw_system, identity.as_deref()));

        let prompt = strip_gateway_tags(&raw_prompt);
        if prompt.trim() == "/stop" {
            return Ok(TurnRequest::Stop { session_key });
        }

        let system = strip_gateway_tags(&raw_system);
        let model = request
            .model
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(normalize_model);
        let model_display = model.clone().unwrap_or_else(|| "claude".to_string());

        // Exact key match, then identity migration, then a fresh session.
        let record = match self.registry.lookup(&session_key).await {
            Some(record) => Some(record),
            None => match &identity {
                Some(identity) => self.registry.migrate(&session_key, identity).await,
                None => None,
            },
        };
        let uuid = record
            .map(|record| record.uuid)
            .unwrap_or_else(|| session::derive_session_uuid(&session_key));
        // The on-disk probe keeps resume working across gateway restarts even
        // with a cold registry.
        let resume = self.config.session_file_path(&uuid).exists();

        let images = extract_images(last_user.content.blocks())?;
        let prompt = match &images {
            Some(images) => append_image_paths(&prompt, images),
            None => prompt,
        };

        let request_id = format!("msg_{}", Uuid::new_v4().simple());
        let system_append = if resume {
            Some(build_append_fragment(&system))
        } else {
            None
        };

        self.monitor.publish(
            "request_received",
            json!({
                "requestId": request_id,
                "sessionKey": session_key,
                "resume": resume,
                "regenerate": regenerate,
                "streaming": request.stream,
            }),
        );

        Ok(TurnRequest::Run(Box::new(TurnPlan {
            request_id,
            session_key,
            uuid,
            resume,
            regenerate,
            streaming: request.stream,
            model,
            model_display,
            prompt,
            system_full: (!system.is_empty()).then_some(system),
            system_append,
            identity,
            images,
        })))
    }

    /// Handle `/stop`: kill the active run if any and report what happened.
    pub fn stop_active(&self, session_key: &str) -> &'static str {
        if self.queues.preempt(session_key) {
            self.monitor
                .publish("run_stopped", json!({"sessionKey": session_key}));
            "Stopped the active run."
        } else {
            "No active run to stop."
        }
    }

    /// Begin a streaming turn. Frames arrive on the returned channel; the
    /// driver task owns the child and tears everything down when the channel
    /// closes (client disconnect) or the child exits.
    pub fn start_stream(self: Arc<Self>, plan: TurnPlan) -> mpsc::Receiver<SseFrame> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            self.drive_stream(plan, tx).await;
        });
        rx
    }

    async fn drive_stream(self: Arc<Self>, mut plan: TurnPlan, tx: mpsc::Sender<SseFrame>) {
        let mut slot = self.queues.join(&plan.session_key);
        if plan.regenerate {
            // Explicit preemption only; a plain request waits its turn.
            self.queues.preempt(&plan.session_key);
        }

        tokio::select! {
            _ = slot.wait() => {}
            _ = tx.closed() => {
                self.monitor.publish(
                    "request_cancelled",
                    json!({"requestId": plan.request_id, "while": "queued"}),
                );
                return;
            }
        }

        if plan.regenerate {
            self.apply_fork(&mut plan).await;
        }

        let (run_guard, mut kill_rx) = self.queues.begin_run(
            &plan.session_key,
            &plan.request_id,
            plan.regenerate,
            plan.identity.clone(),
        );

        let outcome = match supervisor::spawn_with_retry(&self.config, &spawn_spec(&plan)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "spawn failed");
                self.monitor.publish(
                    "spawn_failed",
                    json!({"requestId": plan.request_id, "error": err.to_string()}),
                );
                let _ = tx
                    .send(SseFrame {
                        event: "error",
                        data: serde_json::to_value(err.to_error_body())
                            .unwrap_or_else(|_| json!({"type": "error"})),
                    })
                    .await;
                return;
            }
        };
        if outcome.resume_dropped {
            self.registry.remove(&plan.session_key).await;
        }
        let mut run = outcome.run;

        let mut translator = TurnTranslator::new(&plan.request_id, &plan.model_display);
        if tx.send(translator.start()).await.is_err() {
            supervisor::graceful_kill(&mut run, self.config.timeouts.term_grace).await;
            return;
        }

        let grace = self.config.timeouts.term_grace;
        let mut parser = JsonStreamParser::new();
        let mut buf = vec![0u8; 8192];
        let mut client_gone = false;

        // Events the spawn probe already pulled off stdout come first.
        let prefix = std::mem::take(&mut run.prefix);
        if !prefix.is_empty() {
            let values = parser.push(&prefix);
            client_gone = self.forward_values(&plan, &mut translator, &tx, values).await;
        }
        let mut deadline = Instant::now() + self.timeout_for(translator.phase());

        while !client_gone {
            tokio::select! {
                read = run.stdout.read(&mut buf) => {
                    let n = match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let values = parser.push(&buf[..n]);
                    if self.forward_values(&plan, &mut translator, &tx, values).await {
                        client_gone = true;
                        break;
                    }
                    // Any output resets the watchdog; a phase change applies
                    // its threshold here too.
                    deadline = Instant::now() + self.timeout_for(translator.phase());
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.monitor.publish(
                        "idle_timeout",
                        json!({"requestId": plan.request_id, "phase": format!("{:?}", translator.phase())}),
                    );
                    supervisor::graceful_kill(&mut run, grace).await;
                    break;
                }
                changed = kill_rx.changed() => {
                    if changed.is_err() || *kill_rx.borrow() {
                        self.monitor.publish(
                            "run_preempted",
                            json!({"requestId": plan.request_id}),
                        );
                        supervisor::graceful_kill(&mut run, grace).await;
                        break;
                    }
                }
                _ = tx.closed() => {
                    client_gone = true;
                    break;
                }
            }
        }
        if client_gone {
            supervisor::graceful_kill(&mut run, grace).await;
        }

        let status = match timeout(grace, run.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                run.kill_now().await;
                None
            }
        };
        let exited_cleanly = status.map(|s| s.success()).unwrap_or(false);

        if !client_gone {
            for frame in translator.finish() {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        }

        if exited_cleanly && translator.error().is_none() {
            self.registry
                .record(&plan.session_key, &plan.uuid, plan.identity.as_deref())
                .await;
        }

        let (input_tokens, output_tokens) = translator.usage();
        self.monitor.publish(
            "request_finished",
            json!({
                "requestId": plan.request_id,
                "exitOk": exited_cleanly,
                "inputTokens": input_tokens,
                "outputTokens": output_tokens,
                "cancelled": client_gone,
            }),
        );
        // Active slot, queue tail, and the temp image dir all release here.
        drop(run_guard);
        drop(slot);
        drop(plan);
    }

    /// Non-streaming turn: run the CLI in `json` output mode and collapse the
    /// final result into one Messages response.
    pub async fn run_json(&self, mut plan: TurnPlan) -> Result<MessagesResponse, RelayError> {
        let mut slot = self.queues.join(&plan.session_key);
        if plan.regenerate {
            self.queues.preempt(&plan.session_key);
        }
        slot.wait().await;

        if plan.regenerate {
            self.apply_fork(&mut plan).await;
        }

        let (run_guard, mut kill_rx) = self.queues.begin_run(
            &plan.session_key,
            &plan.request_id,
            plan.regenerate,
            plan.identity.clone(),
        );

        let result = self.collect_json_result(&plan, &mut kill_rx).await;
        drop(run_guard);
        drop(slot);

        let result = result?;
        self.registry
            .record(&plan.session_key, &plan.uuid, plan.identity.as_deref())
            .await;

        let text = result
            .result
            .as_deref()
            .map(strip_gateway_tags)
            .unwrap_or_default()
            .trim()
            .to_string();
        self.monitor.publish(
            "request_finished",
            json!({
                "requestId": plan.request_id,
                "exitOk": !result.is_error,
                "inputTokens": result.usage.total_input(),
                "outputTokens": result.usage.output_tokens,
            }),
        );
        Ok(MessagesResponse::assistant_text(
            &plan.request_id,
            &plan.model_display,
            text,
            UsageInfo {
                input_tokens: result.usage.total_input(),
                output_tokens: result.usage.output_tokens,
            },
        ))
    }

    async fn collect_json_result(
        &self,
        plan: &TurnPlan,
        kill_rx: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<ResultEvent, RelayError> {
        let outcome = supervisor::spawn_with_retry(&self.config, &spawn_spec(plan)).await?;
        if outcome.resume_dropped {
            self.registry.remove(&plan.session_key).await;
        }
        let mut run = outcome.run;

        let grace = self.config.timeouts.term_grace;
        let mut parser = JsonStreamParser::new();
        let mut buf = vec![0u8; 8192];
        let mut deadline = Instant::now() + self.config.timeouts.idle;
        let mut result: Option<ResultEvent> = None;

        let prefix = std::mem::take(&mut run.prefix);
        for value in parser.push(&prefix) {
            if let CliEvent::Result(event) = CliEvent::from_value(&value) {
                result = Some(event);
            }
        }

        loop {
            tokio::select! {
                read = run.stdout.read(&mut buf) => {
                    let n = match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    for value in parser.push(&buf[..n]) {
                        if let CliEvent::Result(event) = CliEvent::from_value(&value) {
                            result = Some(event);
                        }
                    }
                    deadline = Instant::now() + self.config.timeouts.idle;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    supervisor::graceful_kill(&mut run, grace).await;
                    break;
                }
                changed = kill_rx.changed() => {
                    if changed.is_err() || *kill_rx.borrow() {
                        supervisor::graceful_kill(&mut run, grace).await;
                        break;
                    }
                }
            }
        }
        if timeout(grace, run.child.wait()).await.is_err() {
            run.kill_now().await;
        }

        // A non-zero exit with a parseable result is how the CLI reports
        // quota and credit conditions; the text passes through as success.
        result.ok_or(RelayError::NoResult)
    }

    async fn apply_fork(&self, plan: &mut TurnPlan) {
        let path = self.config.session_file_path(&plan.uuid);
        if !path.exists() {
            return;
        }
        match fork::fork_session_jsonl(&path) {
            Ok(Some(new_uuid)) => {
                self.registry
                    .record(&plan.session_key, &new_uuid, plan.identity.as_deref())
                    .await;
                self.monitor.publish(
                    "session_forked",
                    json!({"sessionKey": plan.session_key, "uuid": new_uuid}),
                );
                plan.uuid = new_uuid;
                plan.resume = true;
                plan.system_full = None;
                if plan.system_append.is_none() {
                    plan.system_append = Some(build_append_fragment(""));
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "regeneration fork failed, continuing unforked");
            }
        }
    }

    /// Decode and forward a batch of parsed CLI values. Returns true when
    /// the client has gone away.
    async fn forward_values(
        &self,
        plan: &TurnPlan,
        translator: &mut TurnTranslator,
        tx: &mpsc::Sender<SseFrame>,
        values: Vec<serde_json::Value>,
    ) -> bool {
        for value in values {
            let event = CliEvent::from_value(&value);
            self.publish_cli_event(plan, &event, translator);
            for frame in translator.handle(&event) {
                if tx.send(frame).await.is_err() {
                    return true;
                }
            }
        }
        false
    }

    fn publish_cli_event(&self, plan: &TurnPlan, event: &CliEvent, translator: &TurnTranslator) {
        match event {
            CliEvent::Init { model, .. } => self.monitor.publish(
                "cli_init",
                json!({"requestId": plan.request_id, "model": model}),
            ),
            CliEvent::ContentBlockStart { block, .. } if block.block_type.is_tool_use() => {
                self.monitor.publish(
                    "tool_started",
                    json!({"requestId": plan.request_id, "tool": block.name}),
                );
            }
            CliEvent::ContentBlockStop { .. } if translator.in_tool_block() => {
                // Tool input is complete once its block closes.
                self.monitor.publish(
                    "tool_input",
                    json!({
                        "requestId": plan.request_id,
                        "tool": translator.current_tool(),
                        "input": translator.partial_tool_json(),
                    }),
                );
            }
            CliEvent::CompactBoundary { pre_tokens, .. } => self.monitor.publish(
                "compaction_started",
                json!({"requestId": plan.request_id, "preTokens": pre_tokens}),
            ),
            CliEvent::Result(result) => self.monitor.publish(
                "turn_completed",
                json!({
                    "requestId": plan.request_id,
                    "durationMs": result.duration_ms,
                    "numTurns": result.num_turns,
                    "costUsd": result.total_cost_usd,
                }),
            ),
            CliEvent::Error { message } => self.monitor.publish(
                "cli_error",
                json!({"requestId": plan.request_id, "error": message}),
            ),
            CliEvent::Unknown { event_type, .. } => {
                tracing::debug!(event_type = %event_type, "ignoring unknown CLI event");
            }
            _ => {}
        }
    }
}

fn spawn_spec(plan: &TurnPlan) -> SpawnSpec {
    SpawnSpec {
        session_uuid: plan.uuid.clone(),
        resume: plan.resume,
        streaming: plan.streaming,
        model: plan.model.clone(),
        system_prompt: if plan.resume { None } else { plan.system_full.clone() },
        append_system_prompt: plan.system_append.clone(),
        prompt: plan.prompt.clone(),
    }
}

/// Fragment appended to a resumed session's stored system prompt: the
/// current turn's metadata block plus a standing reminder. Never the full
/// system prompt, which would overwrite the stored one and erase history.
fn build_append_fragment(system_text: &str) -> String {
    let mut fragment = String::new();
    if let Some(block) = session::fenced_json_block(system_text) {
        fragment.push_str("Current turn metadata:\n```json\n");
        fragment.push_str(&block);
        fragment.push_str("\n```\n");
    }
    fragment.push_str(
        "Reminder: re-read the project instructions before answering if you have not done so in this session.",
    );
    fragment
}

/// Synthesize a complete SSE timeline around one canned text, used by the
/// `/stop` pseudo-command in streaming mode.
pub fn canned_frames(request_id: &str, model: &str, text: &str) -> Vec<SseFrame> {
    let mut translator = TurnTranslator::new(request_id, model);
    let mut frames = vec![translator.start()];
    frames.extend(translator.handle(&CliEvent::Result(ResultEvent {
        result: Some(text.to_string()),
        ..Default::default()
    })));
    frames.extend(translator.finish());
    frames
}
