use serde_json::{json, Value};

use claude_relay_cli_stream::{BlockDelta, BlockType, CliEvent};

use crate::text::strip_gateway_tags;

/// One outbound SSE frame: `event: <name>\ndata: <json>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: Value,
}

impl SseFrame {
    fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }
}

/// Current CLI phase, used to pick the idle-timeout threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Normal,
    Tool,
    Compacting,
}

/// Translates the CLI's event stream for one turn into a well-formed
/// Anthropic SSE timeline.
///
/// Tool-use blocks are filtered entirely: the client gateway would otherwise
/// try to execute tools itself and fight the CLI, which is authoritative for
/// them. Forwarded blocks are renumbered so the client sees contiguous
/// indices starting at 0.
#[derive(Debug)]
pub struct TurnTranslator {
    message_id: String,
    model: String,
    next_sse_index: u64,
    /// SSE index of the currently open forwarded block.
    open_block: Option<u64>,
    /// The current CLI-side block is a tool_use block.
    in_tool_block: bool,
    tool_executing: bool,
    compacting: bool,
    text_sent: bool,
    message_started: bool,
    input_tokens: u64,
    output_tokens: u64,
    /// Partial tool input, accumulated for monitoring only.
    partial_tool_json: String,
    current_tool: Option<String>,
    error: Option<String>,
}

impl TurnTranslator {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            next_sse_index: 0,
            open_block: None,
            in_tool_block: false,
            tool_executing: false,
            compacting: false,
            text_sent: false,
            message_started: false,
            input_tokens: 0,
            output_tokens: 0,
            partial_tool_json: String::new(),
            current_tool: None,
            error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.compacting {
            Phase::Compacting
        } else if self.tool_executing {
            Phase::Tool
        } else {
            Phase::Normal
        }
    }

    pub fn usage(&self) -> (u64, u64) {
        (self.input_tokens, self.output_tokens)
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn current_tool(&self) -> Option<&str> {
        self.current_tool.as_deref()
    }

    pub fn in_tool_block(&self) -> bool {
        self.in_tool_block
    }

    pub fn partial_tool_json(&self) -> &str {
        &self.partial_tool_json
    }

    /// The opening `message_start` frame. Emitted once, before any CLI event.
    pub fn start(&mut self) -> SseFrame {
        self.message_started = true;
        SseFrame::new(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        )
    }

    pub fn handle(&mut self, event: &CliEvent) -> Vec<SseFrame> {
        match event {
            CliEvent::ContentBlockStart { block, .. } => match &block.block_type {
                BlockType::ToolUse => {
                    self.in_tool_block = true;
                    self.tool_executing = true;
                    self.current_tool = block.name.clone();
                    self.partial_tool_json.clear();
                    Vec::new()
                }
                BlockType::Text | BlockType::Thinking => {
                    self.in_tool_block = false;
                    self.tool_executing = false;
                    self.compacting = false;
                    let mut frames = self.close_open_block();
                    let index = self.alloc_index();
                    let content_block = match block.block_type {
                        BlockType::Thinking => json!({"type": "thinking", "thinking": ""}),
                        _ => json!({"type": "text", "text": ""}),
                    };
                    frames.push(SseFrame::new(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": content_block
                        }),
                    ));
                    self.open_block = Some(index);
                    frames
                }
                BlockType::Other(kind) => {
                    tracing::debug!(kind = %kind, "ignoring content block of unknown type");
                    self.in_tool_block = false;
                    Vec::new()
                }
            },
            CliEvent::ContentBlockDelta { delta, .. } => self.handle_delta(delta),
            CliEvent::ContentBlockStop { .. } => {
                if self.in_tool_block {
                    // Tool block never reached the client; keep tool_executing
                    // set until the next text/thinking block arrives.
                    self.in_tool_block = false;
                    Vec::new()
                } else {
                    self.close_open_block()
                }
            }
            CliEvent::MessageStart { usage, .. } => {
                if usage.total_input() > 0 {
                    self.input_tokens = usage.total_input();
                }
                Vec::new()
            }
            CliEvent::MessageDelta { usage, .. } => {
                // One turn can span several API messages (tool loops); the
                // per-message counts accumulate and the final `result` event
                // overrides with authoritative totals.
                self.output_tokens += usage.output_tokens;
                Vec::new()
            }
            CliEvent::CompactBoundary { pre_tokens, .. } => {
                let notice = match pre_tokens {
                    Some(tokens) => format!(
                        "[Auto context compaction ({tokens} tokens) — summarizing conversation history...]"
                    ),
                    None => "[Auto context compaction — summarizing conversation history...]".to_string(),
                };
                self.compacting = true;
                self.inject_notice(&notice)
            }
            CliEvent::StatusCompacting => {
                self.compacting = true;
                let mut frames = Vec::new();
                if !self.message_started {
                    frames.push(self.start());
                }
                frames.extend(self.inject_notice(
                    "[Context compaction in progress — this may take several minutes, please wait...]",
                ));
                frames
            }
            CliEvent::Result(result) => {
                if result.usage.total_input() > 0 {
                    self.input_tokens = result.usage.total_input();
                }
                if result.usage.output_tokens > 0 {
                    self.output_tokens = result.usage.output_tokens;
                }
                if !self.text_sent {
                    // Nothing streamed (json-only CLI output, or every block
                    // was filtered): surface the final text as one block.
                    let text = result
                        .result
                        .as_deref()
                        .map(strip_gateway_tags)
                        .unwrap_or_default();
                    let text = text.trim();
                    if !text.is_empty() {
                        let mut frames = self.close_open_block();
                        frames.extend(self.inject_notice(text));
                        self.text_sent = true;
                        return frames;
                    }
                }
                Vec::new()
            }
            CliEvent::Error { message } => {
                self.error = Some(message.clone());
                Vec::new()
            }
            CliEvent::Init { .. }
            | CliEvent::Assistant(_)
            | CliEvent::User(_)
            | CliEvent::MessageStop
            | CliEvent::SystemOther { .. }
            | CliEvent::Unknown { .. } => Vec::new(),
        }
    }

    /// Terminal frames after the child closed. With a preceding CLI error the
    /// stream ends on an `error` event and no `message_stop`.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if let Some(message) = self.error.take() {
            return vec![SseFrame::new(
                "error",
                json!({
                    "type": "error",
                    "error": {"type": "api_error", "message": message}
                }),
            )];
        }
        let mut frames = self.close_open_block();
        frames.push(SseFrame::new(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": self.output_tokens}
            }),
        ));
        frames.push(SseFrame::new("message_stop", json!({"type": "message_stop"})));
        frames
    }

    fn handle_delta(&mut self, delta: &BlockDelta) -> Vec<SseFrame> {
        if self.in_tool_block {
            if let BlockDelta::InputJson(partial) = delta {
                self.partial_tool_json.push_str(partial);
            }
            return Vec::new();
        }
        let Some(index) = self.open_block else {
            return Vec::new();
        };
        match delta {
            BlockDelta::Text(text) => {
                let text = strip_gateway_tags(text);
                if text.is_empty() {
                    return Vec::new();
                }
                self.text_sent = true;
                vec![SseFrame::new(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text}
                    }),
                )]
            }
            BlockDelta::Thinking(thinking) => vec![SseFrame::new(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "thinking_delta", "thinking": thinking}
                }),
            )],
            BlockDelta::InputJson(_) | BlockDelta::Other(_) => Vec::new(),
        }
    }

    fn alloc_index(&mut self) -> u64 {
        let index = self.next_sse_index;
        self.next_sse_index += 1;
        index
    }

    fn close_open_block(&mut self) -> Vec<SseFrame> {
        match self.open_block.take() {
            Some(index) => vec![SseFrame::new(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            )],
            None => Vec::new(),
        }
    }

    /// Synthesize a complete text block around `text`.
    fn inject_notice(&mut self, text: &str) -> Vec<SseFrame> {
        let index = self.alloc_index();
        vec![
            SseFrame::new(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "text", "text": ""}
                }),
            ),
            SseFrame::new(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "text_delta", "text": text}
                }),
            ),
            SseFrame::new(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> CliEvent {
        CliEvent::from_value(&value)
    }

    fn run_events(events: Vec<Value>) -> Vec<SseFrame> {
        let mut translator = TurnTranslator::new("msg_test", "opus");
        let mut frames = vec![translator.start()];
        for value in events {
            frames.extend(translator.handle(&event(value)));
        }
        frames.extend(translator.finish());
        frames
    }

    fn names(frames: &[SseFrame]) -> Vec<&'static str> {
        frames.iter().map(|f| f.event).collect()
    }

    #[test]
    fn tool_blocks_are_filtered_and_indices_renumbered() {
        let frames = run_events(vec![
            json!({"type":"content_block_start","index":0,"content_block":{"type":"tool_use","name":"Bash","id":"t1"}}),
            json!({"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"cmd\""}}),
            json!({"type":"content_block_stop","index":0}),
            json!({"type":"content_block_start","index":1,"content_block":{"type":"text"}}),
            json!({"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Result"}}),
            json!({"type":"content_block_stop","index":1}),
            json!({"type":"result","result":"Result"}),
        ]);

        assert_eq!(
            names(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        // The CLI-side index 1 is remapped to SSE index 0.
        assert_eq!(frames[1].data["index"], 0);
        assert_eq!(frames[2].data["delta"]["text"], "Result");
        assert_eq!(frames[3].data["index"], 0);
    }

    #[test]
    fn no_tool_use_or_input_json_ever_reaches_the_client() {
        let frames = run_events(vec![
            json!({"type":"content_block_start","index":0,"content_block":{"type":"tool_use","name":"Read","id":"t1"}}),
            json!({"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{}"}}),
            json!({"type":"content_block_stop","index":0}),
            json!({"type":"content_block_start","index":1,"content_block":{"type":"text"}}),
            json!({"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"ok"}}),
            json!({"type":"content_block_stop","index":1}),
        ]);
        for frame in &frames {
            let payload = frame.data.to_string();
            assert!(!payload.contains("tool_use"), "leaked: {payload}");
            assert!(!payload.contains("input_json_delta"), "leaked: {payload}");
        }
    }

    #[test]
    fn sse_indices_are_contiguous_across_mixed_blocks() {
        let frames = run_events(vec![
            json!({"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}),
            json!({"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}),
            json!({"type":"content_block_stop","index":0}),
            json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","name":"Bash"}}),
            json!({"type":"content_block_stop","index":1}),
            json!({"type":"content_block_start","index":2,"content_block":{"type":"text"}}),
            json!({"type":"content_block_delta","index":2,"delta":{"type":"text_delta","text":"done"}}),
            json!({"type":"content_block_stop","index":2}),
        ]);

        let starts: Vec<u64> = frames
            .iter()
            .filter(|f| f.event == "content_block_start")
            .map(|f| f.data["index"].as_u64().expect("index"))
            .collect();
        assert_eq!(starts, vec![0, 1]);
    }

    #[test]
    fn result_only_turn_synthesizes_one_text_block() {
        let frames = run_events(vec![json!({
            "type": "result",
            "result": "The answer is 42. [[reply_to_message_id: 9]]",
            "usage": {"input_tokens": 3, "output_tokens": 7}
        })]);

        assert_eq!(
            names(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(frames[2].data["delta"]["text"], "The answer is 42.");
        assert_eq!(frames[4].data["usage"]["output_tokens"], 7);
    }

    #[test]
    fn streamed_text_suppresses_result_synthesis() {
        let frames = run_events(vec![
            json!({"type":"content_block_start","index":0,"content_block":{"type":"text"}}),
            json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hello"}}),
            json!({"type":"content_block_stop","index":0}),
            json!({"type":"result","result":"hello"}),
        ]);
        let starts = frames.iter().filter(|f| f.event == "content_block_start").count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn compact_boundary_injects_notice_and_switches_phase() {
        let mut translator = TurnTranslator::new("msg_test", "opus");
        let _ = translator.start();
        let frames = translator.handle(&event(json!({
            "type": "system",
            "subtype": "compact_boundary",
            "compact_metadata": {"trigger": "auto", "pre_tokens": 155000}
        })));

        assert_eq!(
            names(&frames),
            vec!["content_block_start", "content_block_delta", "content_block_stop"]
        );
        assert!(frames[1].data["delta"]["text"]
            .as_str()
            .expect("notice text")
            .contains("155000 tokens"));
        assert_eq!(translator.phase(), Phase::Compacting);

        // The next text block ends the compaction phase.
        translator.handle(&event(
            json!({"type":"content_block_start","index":3,"content_block":{"type":"text"}}),
        ));
        assert_eq!(translator.phase(), Phase::Normal);
    }

    #[test]
    fn tool_phase_persists_until_next_text_block() {
        let mut translator = TurnTranslator::new("msg_test", "opus");
        let _ = translator.start();
        translator.handle(&event(
            json!({"type":"content_block_start","index":0,"content_block":{"type":"tool_use","name":"Bash"}}),
        ));
        assert_eq!(translator.phase(), Phase::Tool);
        translator.handle(&event(json!({"type":"content_block_stop","index":0})));
        // Tool result is still pending; the extended timeout must hold.
        assert_eq!(translator.phase(), Phase::Tool);
        translator.handle(&event(
            json!({"type":"content_block_start","index":1,"content_block":{"type":"text"}}),
        ));
        assert_eq!(translator.phase(), Phase::Normal);
    }

    #[test]
    fn cli_error_ends_stream_without_message_stop() {
        let mut translator = TurnTranslator::new("msg_test", "opus");
        let _ = translator.start();
        translator.handle(&event(
            json!({"type":"error","error":{"message":"overloaded"}}),
        ));
        let frames = translator.finish();
        assert_eq!(names(&frames), vec!["error"]);
        assert_eq!(frames[0].data["error"]["message"], "overloaded");
    }

    #[test]
    fn usage_accumulates_and_result_overrides() {
        let mut translator = TurnTranslator::new("msg_test", "opus");
        let _ = translator.start();
        translator.handle(&event(json!({"type":"message_delta","delta":{},"usage":{"output_tokens":10}})));
        translator.handle(&event(json!({"type":"message_delta","delta":{},"usage":{"output_tokens":5}})));
        assert_eq!(translator.usage().1, 15);
        translator.handle(&event(json!({
            "type":"result","result":"x",
            "usage":{"input_tokens":4,"cache_read_input_tokens":96,"output_tokens":40}
        })));
        assert_eq!(translator.usage(), (100, 40));
    }

    #[test]
    fn child_close_closes_open_block_before_terminal_frames() {
        let mut translator = TurnTranslator::new("msg_test", "opus");
        let _ = translator.start();
        translator.handle(&event(
            json!({"type":"content_block_start","index":0,"content_block":{"type":"text"}}),
        ));
        translator.handle(&event(
            json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial"}}),
        ));
        let frames = translator.finish();
        assert_eq!(
            names(&frames),
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
    }
}
