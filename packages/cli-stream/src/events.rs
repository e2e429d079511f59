use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token accounting as reported by the CLI. All fields default to zero so a
/// partial `usage` object still decodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    /// Billable input: base plus cache creation plus cache reads.
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }

    fn from_value(value: Option<&Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockType {
    Text,
    Thinking,
    ToolUse,
    Other(String),
}

impl BlockType {
    fn parse(value: &str) -> Self {
        match value {
            "text" => Self::Text,
            "thinking" => Self::Thinking,
            "tool_use" => Self::ToolUse,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse)
    }
}

#[derive(Debug, Clone)]
pub struct ContentBlockInfo {
    pub block_type: BlockType,
    /// Tool name for `tool_use` blocks.
    pub name: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum BlockDelta {
    Text(String),
    Thinking(String),
    /// Partial tool input JSON. Accumulated for monitoring, never forwarded.
    InputJson(String),
    Other(Value),
}

#[derive(Debug, Clone, Default)]
pub struct ResultEvent {
    pub is_error: bool,
    pub result: Option<String>,
    pub usage: Usage,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub session_id: Option<String>,
}

/// One event from the CLI's stdout stream.
///
/// Decoded from a raw [`Value`] by matching the `type` string; payload shapes
/// vary across CLI versions so anything unrecognized lands in `Unknown` and
/// is logged, never treated as an error.
#[derive(Debug, Clone)]
pub enum CliEvent {
    /// `system`/`init`: session id, model, tool list. Logged only.
    Init {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// `system`/`compact_boundary`: the CLI is summarizing history and may go
    /// quiet for minutes.
    CompactBoundary {
        pre_tokens: Option<u64>,
        trigger: Option<String>,
    },
    /// `system`/`status` with `status: compacting` (newer CLIs).
    StatusCompacting,
    SystemOther {
        subtype: String,
    },
    MessageStart {
        id: Option<String>,
        model: Option<String>,
        usage: Usage,
    },
    ContentBlockStart {
        index: u64,
        block: ContentBlockInfo,
    },
    ContentBlockDelta {
        index: u64,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u64,
    },
    MessageDelta {
        stop_reason: Option<String>,
        usage: Usage,
    },
    MessageStop,
    /// Complete assistant message (non-partial mode). Logged only.
    Assistant(Value),
    /// Tool-result carrier. Logged only.
    User(Value),
    /// Final turn summary.
    Result(ResultEvent),
    Error {
        message: String,
    },
    Unknown {
        event_type: String,
        raw: Value,
    },
}

impl CliEvent {
    pub fn from_value(event: &Value) -> Self {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            // Some CLI builds wrap partial-message events: unwrap and recurse.
            "stream_event" => match event.get("event") {
                Some(inner) => Self::from_value(inner),
                None => unknown(event_type, event),
            },
            "system" => system_from_value(event),
            "message_start" => {
                let message = event.get("message");
                CliEvent::MessageStart {
                    id: message
                        .and_then(|m| m.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    model: message
                        .and_then(|m| m.get("model"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    usage: Usage::from_value(message.and_then(|m| m.get("usage"))),
                }
            }
            "content_block_start" => {
                let block = event.get("content_block");
                CliEvent::ContentBlockStart {
                    index: index_of(event),
                    block: ContentBlockInfo {
                        block_type: block
                            .and_then(|b| b.get("type"))
                            .and_then(Value::as_str)
                            .map(BlockType::parse)
                            .unwrap_or(BlockType::Other(String::new())),
                        name: block
                            .and_then(|b| b.get("name"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        id: block
                            .and_then(|b| b.get("id"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    },
                }
            }
            "content_block_delta" => CliEvent::ContentBlockDelta {
                index: index_of(event),
                delta: delta_from_value(event.get("delta")),
            },
            "content_block_stop" => CliEvent::ContentBlockStop {
                index: index_of(event),
            },
            "message_delta" => CliEvent::MessageDelta {
                stop_reason: event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                usage: Usage::from_value(event.get("usage")),
            },
            "message_stop" => CliEvent::MessageStop,
            "assistant" => CliEvent::Assistant(event.clone()),
            "user" => CliEvent::User(event.clone()),
            "result" => CliEvent::Result(ResultEvent {
                is_error: event
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                result: event
                    .get("result")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                usage: Usage::from_value(event.get("usage")),
                duration_ms: event.get("duration_ms").and_then(Value::as_u64),
                num_turns: event.get("num_turns").and_then(Value::as_u64),
                total_cost_usd: event.get("total_cost_usd").and_then(Value::as_f64),
                session_id: event
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            "error" => CliEvent::Error {
                message: event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .or_else(|| event.get("message").and_then(Value::as_str))
                    .unwrap_or("unknown CLI error")
                    .to_string(),
            },
            other => unknown(other, event),
        }
    }
}

fn unknown(event_type: &str, event: &Value) -> CliEvent {
    CliEvent::Unknown {
        event_type: event_type.to_string(),
        raw: event.clone(),
    }
}

fn index_of(event: &Value) -> u64 {
    event.get("index").and_then(Value::as_u64).unwrap_or(0)
}

fn system_from_value(event: &Value) -> CliEvent {
    let subtype = event.get("subtype").and_then(Value::as_str).unwrap_or("");
    match subtype {
        "init" => CliEvent::Init {
            session_id: event
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            model: event
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "compact_boundary" => {
            let meta = event.get("compact_metadata");
            CliEvent::CompactBoundary {
                pre_tokens: meta.and_then(|m| m.get("pre_tokens")).and_then(Value::as_u64),
                trigger: meta
                    .and_then(|m| m.get("trigger"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        }
        "status" => {
            let status = event.get("status").and_then(Value::as_str).unwrap_or("");
            if status == "compacting" {
                CliEvent::StatusCompacting
            } else {
                CliEvent::SystemOther {
                    subtype: format!("status:{status}"),
                }
            }
        }
        other => CliEvent::SystemOther {
            subtype: other.to_string(),
        },
    }
}

fn delta_from_value(delta: Option<&Value>) -> BlockDelta {
    let Some(delta) = delta else {
        return BlockDelta::Other(Value::Null);
    };
    let delta_type = delta.get("type").and_then(Value::as_str).unwrap_or("");
    match delta_type {
        "text_delta" => BlockDelta::Text(
            delta
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        "thinking_delta" => BlockDelta::Thinking(
            delta
                .get("thinking")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        "input_json_delta" => BlockDelta::InputJson(
            delta
                .get("partial_json")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        _ => BlockDelta::Other(delta.clone()),
    }
}
