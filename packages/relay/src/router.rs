use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::OpenApi;
use uuid::Uuid;

use claude_relay_error::{ErrorBody, ErrorType, RelayError};

use crate::config::RelayConfig;
use crate::deploy;
use crate::engine::{canned_frames, Engine, TurnRequest, FEATURES};
use crate::translate::SseFrame;

pub mod types;

use types::{
    HealthResponse, MessagesRequest, MessagesResponse, ModelInfo, ModelsResponse, UsageInfo,
};

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Engine>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            engine: Arc::new(Engine::new(config)),
        }
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("anthropic-version"),
            header::HeaderName::from_static("x-session-key"),
            header::HeaderName::from_static("x-regenerate"),
        ]);

    let mut router = Router::new()
        .route("/v1/messages", post(post_messages))
        .route("/v1/models", get(get_models))
        .route("/health", get(get_health))
        .route("/events", get(get_monitor_events))
        .route("/deploy", post(post_deploy))
        .fallback(not_found)
        .layer(cors)
        .with_state(shared.clone());

    let http_logging = match std::env::var("CLAUDE_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(post_messages, get_models, get_health, get_monitor_events, post_deploy),
    components(schemas(
        MessagesRequest,
        MessagesResponse,
        types::ChatMessage,
        types::MessageContent,
        types::SystemPrompt,
        types::ContentItem,
        UsageInfo,
        ModelInfo,
        ModelsResponse,
        HealthResponse,
        ErrorBody,
        claude_relay_error::ErrorDetail,
        ErrorType
    )),
    tags(
        (name = "messages", description = "Anthropic-style Messages API"),
        (name = "meta", description = "Service metadata and monitoring")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] RelayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.0.to_error_body();
        let status = StatusCode::from_u16(self.0.error_type().status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[utoipa::path(
    post,
    path = "/v1/messages",
    request_body = MessagesRequest,
    params(
        ("x-session-key" = Option<String>, Header, description = "Override for the derived session key"),
        ("x-regenerate" = Option<String>, Header, description = "\"true\" forks the session and preempts the active run")
    ),
    responses(
        (status = 200, description = "Messages response (JSON) or SSE stream per `stream`", body = MessagesResponse),
        (status = 400, body = ErrorBody)
    ),
    tag = "messages"
)]
async fn post_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|err| RelayError::invalid_request(format!("body is not valid JSON: {err}")))?;

    let session_key_override = header_str(&headers, "x-session-key").map(str::to_string);
    let regenerate = header_str(&headers, "x-regenerate")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let engine = state.engine();
    let turn = engine
        .prepare(&request, session_key_override, regenerate)
        .await?;

    match turn {
        TurnRequest::Stop { session_key } => {
            let text = engine.stop_active(&session_key);
            let request_id = format!("msg_{}", Uuid::new_v4().simple());
            let model = request.model.as_deref().unwrap_or("claude").to_string();
            if request.stream {
                let frames = canned_frames(&request_id, &model, text);
                Ok(sse_response(stream::iter(frames), &request_id))
            } else {
                let response = MessagesResponse::assistant_text(
                    &request_id,
                    &model,
                    text,
                    UsageInfo {
                        input_tokens: 0,
                        output_tokens: 0,
                    },
                );
                Ok(with_request_id(Json(response).into_response(), &request_id))
            }
        }
        TurnRequest::Run(plan) => {
            let request_id = plan.request_id.clone();
            if plan.streaming {
                let rx = engine.start_stream(*plan);
                Ok(sse_response(ReceiverStream::new(rx), &request_id))
            } else {
                let response = engine.run_json(*plan).await?;
                Ok(with_request_id(Json(response).into_response(), &request_id))
            }
        }
    }
}

fn sse_response<S>(frames: S, request_id: &str) -> Response
where
    S: futures::Stream<Item = SseFrame> + Send + 'static,
{
    let stream = frames.map(|frame| {
        Ok::<Event, Infallible>(Event::default().event(frame.event).data(frame.data.to_string()))
    });
    let response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keepalive"))
        .into_response();
    with_request_id(response, request_id)
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[utoipa::path(
    get,
    path = "/v1/models",
    responses((status = 200, body = ModelsResponse)),
    tag = "messages"
)]
async fn get_models() -> Json<ModelsResponse> {
    let data = [
        ("opus", "Claude Opus"),
        ("sonnet", "Claude Sonnet"),
        ("haiku", "Claude Haiku"),
    ]
    .into_iter()
    .map(|(id, display_name)| ModelInfo {
        id: id.to_string(),
        type_: "model".to_string(),
        display_name: display_name.to_string(),
    })
    .collect();
    Json(ModelsResponse { data })
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        features: FEATURES.iter().map(|f| f.to_string()).collect(),
        monitor_clients: state.engine.monitor.client_count(),
    })
}

#[utoipa::path(
    get,
    path = "/events",
    responses((status = 200, description = "SSE broadcast of internal gateway events")),
    tag = "meta"
)]
async fn get_monitor_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let monitor = &state.engine.monitor;
    let connected = monitor.connected_event();
    let receiver = monitor.subscribe();

    let initial = stream::once(async move { Ok::<Event, Infallible>(Event::default().data(connected.to_string())) });
    let live = BroadcastStream::new(receiver).filter_map(|result| async move {
        match result {
            Ok(event) => Some(Ok::<Event, Infallible>(Event::default().data(event.to_string()))),
            // A lagged subscriber just skips ahead.
            Err(_) => None,
        }
    });

    Sse::new(initial.chain(live))
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("keepalive"))
}

#[utoipa::path(
    post,
    path = "/deploy",
    responses(
        (status = 202, description = "Update accepted"),
        (status = 200, description = "Ignored (not a push to main)"),
        (status = 401, body = ErrorBody)
    ),
    tag = "meta"
)]
async fn post_deploy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let engine = state.engine();
    let secret = engine.config.webhook_secret.as_deref().ok_or_else(|| {
        RelayError::Unauthorized {
            message: "deploy webhook is not configured".to_string(),
        }
    })?;

    let signature = header_str(&headers, "x-hub-signature-256").unwrap_or("");
    if !deploy::verify_signature(secret, &body, signature) {
        return Err(RelayError::Unauthorized {
            message: "webhook signature mismatch".to_string(),
        }
        .into());
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|err| RelayError::invalid_request(format!("webhook body is not JSON: {err}")))?;
    if !deploy::is_main_push(&payload) {
        return Ok((StatusCode::OK, Json(json!({"status": "ignored"}))).into_response());
    }

    engine.monitor.publish("deploy_triggered", json!({}));
    if let Some(script) = engine.config.update_script.as_deref() {
        deploy::launch_update_script(script).map_err(RelayError::from)?;
    } else {
        tracing::warn!("deploy webhook accepted but no update script is configured");
    }
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response())
}

async fn not_found(uri: axum::http::Uri) -> Response {
    let body = ErrorBody::new(ErrorType::NotFoundError, format!("unknown route: {uri}"));
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}
