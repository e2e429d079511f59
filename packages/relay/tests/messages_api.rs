use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use hmac::Mac;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use claude_relay::config::RelayConfig;
use claude_relay::router::{build_router_with_state, AppState};

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    dir: TempDir,
    config: RelayConfig,
}

impl TestApp {
    fn new(script_body: &str) -> Self {
        Self::with_config(script_body, |_| {})
    }

    fn with_config<F>(script_body: &str, tweak: F) -> Self
    where
        F: FnOnce(&mut RelayConfig),
    {
        let dir = tempfile::tempdir().expect("create temp dir");
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).expect("create workspace");

        let mut config = RelayConfig::new(dir.path().join("claude"), &workspace);
        config.config_dir = Some(dir.path().join("home"));
        config.timeouts.spawn_window = Duration::from_millis(400);
        config.timeouts.term_grace = Duration::from_millis(500);
        tweak(&mut config);

        write_mock_cli(&config, dir.path(), script_body);

        let state = Arc::new(AppState::new(config.clone()));
        let (app, state) = build_router_with_state(state);
        Self {
            app,
            state,
            dir,
            config,
        }
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn prompts(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("prompts.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Mock CLI: logs argv and the stdin prompt, creates the session JSONL the
/// real CLI would, then plays the scripted stdout.
fn write_mock_cli(config: &RelayConfig, dir: &Path, body: &str) {
    let script = format!(
        r#"#!/usr/bin/env sh
echo "$@" >> '{calls}'
prompt=$(cat)
printf '%s\n' "$prompt" >> '{prompts}'
uuid=''
prev=''
for a in "$@"; do
  case "$prev" in
    --session-id|--resume) uuid="$a";;
  esac
  prev="$a"
done
mkdir -p '{sessions}'
if [ -n "$uuid" ] && [ ! -f '{sessions}'/"$uuid".jsonl ]; then
  echo '{{"type":"user","uuid":"seed","message":{{"role":"user","content":"seed"}}}}' > '{sessions}'/"$uuid".jsonl
fi
{body}
"#,
        calls = dir.join("calls.log").display(),
        prompts = dir.join("prompts.log").display(),
        sessions = config.session_file_dir().display(),
        body = body,
    );
    write_executable(&config.claude_bin, &script);
}

fn write_executable(path: &Path, script: &str) {
    std::fs::write(path, script).expect("write executable");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).expect("set mode");
    }
}

const RESULT_ONLY: &str = r#"echo '{"type":"result","result":"All done.","usage":{"input_tokens":10,"cache_creation_input_tokens":20,"cache_read_input_tokens":70,"output_tokens":5}}'"#;

async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request_body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(request_body).expect("build request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    (status, headers, bytes.to_vec())
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("valid json body")
}

fn messages_body(prompt: &str, system: &str, stream: bool) -> Value {
    json!({
        "model": "claude-opus-4-6",
        "messages": [{"role": "user", "content": prompt}],
        "system": system,
        "stream": stream
    })
}

/// Read an entire SSE response into (event name, data) pairs.
async fn collect_sse(app: &Router, uri: &str, body: Value, headers: &[(&str, &str)]) -> (StatusCode, HeaderMap, Vec<(String, Value)>) {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::from(body.to_string())).expect("build request");
    let response = app.clone().oneshot(request).await.expect("sse response");
    let status = response.status();
    let response_headers = response.headers().clone();

    let mut stream = response.into_body().into_data_stream();
    let mut raw = String::new();
    let collected = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.expect("stream chunk");
            raw.push_str(&String::from_utf8_lossy(&bytes));
        }
        raw
    })
    .await
    .expect("sse stream completes");

    (status, response_headers, parse_sse(&collected))
}

fn parse_sse(raw: &str) -> Vec<(String, Value)> {
    raw.split("\n\n")
        .filter_map(|block| {
            let mut event = None;
            let mut data = Vec::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event: ") {
                    event = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("data: ") {
                    data.push(value);
                }
            }
            let event = event?;
            let payload = serde_json::from_str(&data.join("\n")).ok()?;
            Some((event, payload))
        })
        .collect()
}

fn uuid_after_flag(call: &str, flag: &str) -> Option<String> {
    let mut parts = call.split_whitespace();
    while let Some(part) = parts.next() {
        if part == flag {
            return parts.next().map(str::to_string);
        }
    }
    None
}

#[tokio::test]
async fn invalid_json_body_returns_400() {
    let app = TestApp::new(RESULT_ONLY);
    let (status, _, body) = send_request(
        &app.app,
        Method::POST,
        "/v1/messages",
        None,
        &[("content-type", "application/json")],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body = parse_json(&body);
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn missing_user_message_returns_400() {
    let app = TestApp::new(RESULT_ONLY);
    let (status, _, body) = send_request(
        &app.app,
        Method::POST,
        "/v1/messages",
        Some(json!({"model": "opus", "messages": []})),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(&body)["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = TestApp::new(RESULT_ONLY);
    let (status, _, body) = send_request(&app.app, Method::GET, "/v1/nope", None, &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse_json(&body)["error"]["type"], "not_found_error");
}

#[tokio::test]
async fn models_lists_three_ids() {
    let app = TestApp::new(RESULT_ONLY);
    let (status, _, body) = send_request(&app.app, Method::GET, "/v1/models", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let body = parse_json(&body);
    let ids: Vec<&str> = body["data"]
        .as_array()
        .expect("data array")
        .iter()
        .map(|m| m["id"].as_str().expect("id"))
        .collect();
    assert_eq!(ids, vec!["opus", "sonnet", "haiku"]);
}

#[tokio::test]
async fn health_reports_version_and_features() {
    let app = TestApp::new(RESULT_ONLY);
    let (status, _, body) = send_request(&app.app, Method::GET, "/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let body = parse_json(&body);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].as_str().expect("version").contains('.'));
    assert!(body["features"]
        .as_array()
        .expect("features")
        .iter()
        .any(|f| f == "sessions"));
    assert!(body["monitorClients"].is_number());
}

#[tokio::test]
async fn non_streaming_turn_returns_message_with_summed_usage() {
    let app = TestApp::new(RESULT_ONLY);
    let (status, headers, body) = send_request(
        &app.app,
        Method::POST,
        "/v1/messages",
        Some(messages_body("hello", "be brief", false)),
        &[],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-request-id"));

    let body = parse_json(&body);
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "All done.");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["stop_sequence"], Value::Null);
    // 10 base + 20 cache creation + 70 cache read.
    assert_eq!(body["usage"]["input_tokens"], 100);
    assert_eq!(body["usage"]["output_tokens"], 5);
}

#[tokio::test]
async fn streaming_filters_tool_blocks_and_renumbers() {
    let script = r#"echo '{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","name":"Bash","id":"t1"}}'
echo '{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"cmd\":\"ls\"}"}}'
echo '{"type":"content_block_stop","index":0}'
echo '{"type":"content_block_start","index":1,"content_block":{"type":"text"}}'
echo '{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Result"}}'
echo '{"type":"content_block_stop","index":1}'
echo '{"type":"result","result":"Result","usage":{"input_tokens":2,"output_tokens":3}}'"#;
    let app = TestApp::new(script);

    let (status, headers, events) = collect_sse(
        &app.app,
        "/v1/messages",
        messages_body("run ls", "sys", true),
        &[],
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-request-id"));

    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    // Exactly one message_start, message_stop last.
    assert_eq!(names.iter().filter(|n| **n == "message_start").count(), 1);

    // The surviving text block is renumbered to SSE index 0.
    assert_eq!(events[1].1["index"], 0);
    assert_eq!(events[2].1["delta"]["text"], "Result");
    assert_eq!(events[4].1["usage"]["output_tokens"], 3);

    for (_, data) in &events {
        let payload = data.to_string();
        assert!(!payload.contains("tool_use"), "tool event leaked: {payload}");
        assert!(!payload.contains("input_json_delta"), "tool delta leaked: {payload}");
    }
}

#[tokio::test]
async fn sequential_turns_resume_the_same_session() {
    let app = TestApp::new(RESULT_ONLY);

    for prompt in ["Remember the number 424242.", "What number?"] {
        let (status, _, _) = send_request(
            &app.app,
            Method::POST,
            "/v1/messages",
            Some(messages_body(prompt, "memory bot", false)),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let calls = app.calls();
    assert_eq!(calls.len(), 2);
    let first_uuid = uuid_after_flag(&calls[0], "--session-id").expect("new session flag");
    let second_uuid = uuid_after_flag(&calls[1], "--resume").expect("resume flag");
    assert_eq!(first_uuid, second_uuid);

    // Deterministic v4-shaped uuid: 8-4-4-4-12 hex, version 4, variant 8..b.
    let groups: Vec<&str> = first_uuid.split('-').collect();
    assert_eq!(groups.iter().map(|g| g.len()).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
    assert!(groups[2].starts_with('4'));
    assert!(matches!(&groups[3][..1], "8" | "9" | "a" | "b"));

    // Resumed turns get the appended fragment, never the full system prompt.
    assert!(calls[1].contains("--append-system-prompt"));
    assert!(!calls[1].contains("--system-prompt "));
}

#[tokio::test]
async fn distinct_chats_get_distinct_sessions() {
    let app = TestApp::new(RESULT_ONLY);

    for system in ["chat A", "chat B"] {
        let (status, _, _) = send_request(
            &app.app,
            Method::POST,
            "/v1/messages",
            Some(messages_body("Remember 'apple'.", system, false)),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let calls = app.calls();
    let uuid_a = uuid_after_flag(&calls[0], "--session-id").expect("first uuid");
    let uuid_b = uuid_after_flag(&calls[1], "--session-id").expect("second uuid");
    assert_ne!(uuid_a, uuid_b);
}

#[tokio::test]
async fn regenerate_forks_history_on_disk() {
    let app = TestApp::new(RESULT_ONLY);
    let body = messages_body("Secret is alpha.", "secrets bot", false);

    // Establish the session and find its uuid.
    let (status, _, _) = send_request(&app.app, Method::POST, "/v1/messages", Some(body.clone()), &[]).await;
    assert_eq!(status, StatusCode::OK);
    let uuid = uuid_after_flag(&app.calls()[0], "--session-id").expect("uuid");

    // Write a two-turn history the way the CLI would store it.
    let session_file = app.config.session_file_path(&uuid);
    let history = [
        json!({"type":"user","uuid":"u1","parentUuid":null,"message":{"role":"user","content":"Secret is alpha."}}),
        json!({"type":"assistant","uuid":"a1","parentUuid":"u1","message":{"role":"assistant","content":[{"type":"text","text":"Stored alpha."}]}}),
        json!({"type":"user","uuid":"u2","parentUuid":"a1","message":{"role":"user","content":"Secret is bravo."}}),
        json!({"type":"assistant","uuid":"a2","parentUuid":"u2","message":{"role":"assistant","content":[{"type":"text","text":"Stored bravo."}]}}),
    ];
    let jsonl: String = history.iter().map(|e| format!("{e}\n")).collect();
    std::fs::write(&session_file, &jsonl).expect("seed history");

    let (status, _, _) = send_request(
        &app.app,
        Method::POST,
        "/v1/messages",
        Some(messages_body("List all secrets.", "secrets bot", false)),
        &[("x-regenerate", "true")],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let calls = app.calls();
    let fork_uuid = uuid_after_flag(&calls[1], "--resume").expect("fork resumed");
    assert_ne!(fork_uuid, uuid, "fork must run under a fresh uuid");

    let fork_file = app.config.session_file_path(&fork_uuid);
    let fork_body = std::fs::read_to_string(&fork_file).expect("fork file");
    assert!(fork_body.contains("alpha"));
    assert!(!fork_body.contains("bravo"));

    // Original preserved for safety.
    assert_eq!(std::fs::read_to_string(&session_file).expect("original"), jsonl);
}

#[tokio::test]
async fn stop_without_active_run_returns_canned_message() {
    let app = TestApp::new(RESULT_ONLY);
    let (status, _, body) = send_request(
        &app.app,
        Method::POST,
        "/v1/messages",
        Some(messages_body("/stop", "sys", false)),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = parse_json(&body);
    assert_eq!(body["content"][0]["text"], "No active run to stop.");
    // No child was spawned.
    assert!(app.calls().is_empty());
}

#[tokio::test]
async fn gateway_tags_are_stripped_from_prompt_and_outbound_text() {
    let script = r#"echo '{"type":"result","result":"Sure. [[reply_to_message_id: 77]]"}'"#;
    let app = TestApp::new(script);

    let (_, _, body) = send_request(
        &app.app,
        Method::POST,
        "/v1/messages",
        Some(messages_body(
            "hi [[reply_to_message_id: 42]] there",
            "sys [[reply_to_message_id: 42]]",
            false,
        )),
        &[],
    )
    .await;

    assert_eq!(parse_json(&body)["content"][0]["text"], "Sure.");
    let prompts = app.prompts();
    assert_eq!(prompts[0], "hi there");
}

#[tokio::test]
async fn model_name_is_normalized_for_the_cli() {
    let app = TestApp::new(RESULT_ONLY);
    let (status, _, _) = send_request(
        &app.app,
        Method::POST,
        "/v1/messages",
        Some(json!({
            "model": "anthropic/claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(app.calls()[0].contains("--model sonnet"));
}

#[tokio::test]
async fn cors_preflight_allows_gateway_headers() {
    let app = TestApp::new(RESULT_ONLY);
    let (status, headers, _) = send_request(
        &app.app,
        Method::OPTIONS,
        "/v1/messages",
        None,
        &[
            ("origin", "http://dashboard.local"),
            ("access-control-request-method", "POST"),
            ("access-control-request-headers", "x-session-key,x-regenerate"),
        ],
    )
    .await;
    assert!(status.is_success());
    let allowed = headers
        .get("access-control-allow-headers")
        .and_then(|v| v.to_str().ok())
        .expect("allow headers")
        .to_lowercase();
    assert!(allowed.contains("x-session-key"));
    assert!(allowed.contains("x-regenerate"));
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn deploy_requires_a_valid_signature() {
    let app = TestApp::with_config(RESULT_ONLY, |config| {
        config.webhook_secret = Some("hook-secret".to_string());
    });

    let payload = json!({"ref": "refs/heads/main"});
    let (status, _, body) = send_request(
        &app.app,
        Method::POST,
        "/deploy",
        Some(payload.clone()),
        &[("x-hub-signature-256", "sha256=deadbeef")],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(parse_json(&body)["error"]["type"], "authentication_error");

    let (status, _, _) = send_request(&app.app, Method::POST, "/deploy", Some(payload), &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn deploy_runs_update_script_for_main_pushes_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("updated");
    let script = dir.path().join("update.sh");
    write_executable(
        &script,
        &format!("#!/usr/bin/env sh\ntouch '{}'\n", marker.display()),
    );

    let app = TestApp::with_config(RESULT_ONLY, |config| {
        config.webhook_secret = Some("hook-secret".to_string());
        config.update_script = Some(script.clone());
    });

    // Push to a feature branch is ignored.
    let feature = json!({"ref": "refs/heads/feature"}).to_string();
    let (status, _, body) = send_request_raw_signed(&app.app, &feature, "hook-secret").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(&body)["status"], "ignored");
    assert!(!marker.exists());

    // Push to main launches the script.
    let main_push = json!({"ref": "refs/heads/main"}).to_string();
    let (status, _, body) = send_request_raw_signed(&app.app, &main_push, "hook-secret").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(parse_json(&body)["status"], "accepted");

    tokio::time::timeout(Duration::from_secs(3), async {
        while !marker.exists() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("update script ran");
}

async fn send_request_raw_signed(app: &Router, body: &str, secret: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
    let signature = sign(secret, body.as_bytes());
    let request = Request::builder()
        .method(Method::POST)
        .uri("/deploy")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-hub-signature-256", signature)
        .body(Body::from(body.to_string()))
        .expect("build request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    (status, headers, bytes.to_vec())
}

#[tokio::test]
async fn monitor_stream_greets_with_connected_event() {
    let app = TestApp::new(RESULT_ONLY);
    let request = Request::builder()
        .method(Method::GET)
        .uri("/events")
        .body(Body::empty())
        .expect("build request");
    let response = app.app.clone().oneshot(request).await.expect("sse response");
    assert_eq!(response.status(), StatusCode::OK);

    let mut stream = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            let text = String::from_utf8_lossy(&chunk.expect("chunk")).to_string();
            if text.contains("data:") {
                return text;
            }
        }
        panic!("monitor stream ended before data");
    })
    .await
    .expect("timed out");

    assert!(first.contains("\"type\":\"connected\""));
    assert!(first.contains("timestamp"));

    // The health endpoint counts this live subscriber.
    let (_, _, body) = send_request(&app.app, Method::GET, "/health", None, &[]).await;
    assert_eq!(parse_json(&body)["monitorClients"], 1);
}

#[tokio::test]
async fn spawn_failure_ends_stream_with_error_event() {
    let app = TestApp::new(RESULT_ONLY);
    std::fs::remove_file(&app.config.claude_bin).expect("remove mock binary");

    let (status, _, events) = collect_sse(
        &app.app,
        "/v1/messages",
        messages_body("hi", "sys", true),
        &[],
    )
    .await;

    // Headers were already committed as a stream.
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"error"), "events: {names:?}");
    assert!(!names.contains(&"message_stop"));
    let (_, error) = events.iter().find(|(name, _)| name == "error").expect("error event");
    assert_eq!(error["error"]["type"], "api_error");

    // No stale state left behind.
    let engine = app.state.engine();
    assert!(!engine.queues.has_tail(&derived_key(&app, "sys")));
}

fn derived_key(_app: &TestApp, system: &str) -> String {
    claude_relay::session::session_key(system, None)
}
