use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Accepted subset of the Anthropic Messages API request body.
#[derive(Debug, Clone, Deserialize, JsonSchema, ToSchema)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub stream: bool,
    /// Accepted for compatibility; the CLI manages its own budget.
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema, ToSchema)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// `content` is either a bare string or an array of content blocks.
#[derive(Debug, Clone, Deserialize, JsonSchema, ToSchema)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl MessageContent {
    /// Concatenated text of the message.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn blocks(&self) -> &[Value] {
        match self {
            Self::Text(_) => &[],
            Self::Blocks(blocks) => blocks,
        }
    }
}

/// `system` arrives as a string, an array of text blocks, or an object with a
/// `text` field, depending on the client.
#[derive(Debug, Clone, Deserialize, JsonSchema, ToSchema)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<Value>),
    Object(Value),
}

impl SystemPrompt {
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Object(value) => value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct UsageInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub type_: String,
    pub text: String,
}

/// Non-streaming Messages API response.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ContentItem>,
    pub stop_reason: String,
    pub stop_sequence: Option<String>,
    pub usage: UsageInfo,
}

impl MessagesResponse {
    pub fn assistant_text(
        id: impl Into<String>,
        model: impl Into<String>,
        text: impl Into<String>,
        usage: UsageInfo,
    ) -> Self {
        Self {
            id: id.into(),
            type_: "message".to_string(),
            role: "assistant".to_string(),
            model: model.into(),
            content: vec![ContentItem {
                type_: "text".to_string(),
                text: text.into(),
            }],
            stop_reason: "end_turn".to_string(),
            stop_sequence: None,
            usage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ModelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ModelsResponse {
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub features: Vec<String>,
    #[serde(rename = "monitorClients")]
    pub monitor_clients: usize,
}
