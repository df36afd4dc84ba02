//! Parser for JSON-lines event streams (`--output-format stream-json`)

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use super::{OutputParser, ParsedOutput, ToolCall};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    System {},
    Assistant { message: EventMessage },
    User { message: EventMessage },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        cost_usd: Option<f64>,
    },
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Flatten a tool-result payload (string or list of text parts)
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Default)]
pub struct StreamJsonParser {
    tool_calls: Vec<ToolCall>,
    index: HashMap<String, usize>,
    text_messages: Vec<String>,
    final_result: Option<String>,
    total_cost_usd: Option<f64>,
    stray: Vec<String>,
}

impl StreamJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_blocks(&mut self, blocks: Vec<ContentBlock>, fresh: &mut Vec<ToolCall>) {
        for block in blocks {
            match block {
                ContentBlock::Text { text } => {
                    if !text.trim().is_empty() {
                        self.text_messages.push(text);
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    // Replayed events carry the same id
                    if self.index.contains_key(&id) {
                        continue;
                    }
                    let call = ToolCall::new(id.clone(), name, input);
                    self.index.insert(id, self.tool_calls.len());
                    fresh.push(call.clone());
                    self.tool_calls.push(call);
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => match self.index.get(&tool_use_id) {
                    Some(&i) => {
                        self.tool_calls[i].result = Some(result_text(&content));
                        self.tool_calls[i].is_error = is_error;
                    }
                    None => trace!("Tool result for unknown call {}", tool_use_id),
                },
                ContentBlock::Other => {}
            }
        }
    }
}

impl OutputParser for StreamJsonParser {
    fn push_line(&mut self, line: &str) -> Vec<ToolCall> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let event = match serde_json::from_str::<StreamEvent>(trimmed) {
            Ok(event) => event,
            Err(_) => {
                // Not every line is an event (CLI warnings, unknown event types)
                if !trimmed.starts_with('{') {
                    self.stray.push(trimmed.to_string());
                }
                return Vec::new();
            }
        };

        let mut fresh = Vec::new();
        match event {
            StreamEvent::System {} => {}
            StreamEvent::Assistant { message } | StreamEvent::User { message } => {
                self.handle_blocks(message.content, &mut fresh);
            }
            StreamEvent::Result {
                result,
                total_cost_usd,
                cost_usd,
            } => {
                if let Some(result) = result {
                    self.final_result = Some(result);
                }
                if let Some(cost) = total_cost_usd.or(cost_usd) {
                    self.total_cost_usd = Some(cost);
                }
            }
        }
        fresh
    }

    fn finish(self: Box<Self>) -> ParsedOutput {
        let this = *self;
        let final_result = this
            .final_result
            .filter(|r| !r.trim().is_empty())
            .or_else(|| this.text_messages.last().cloned())
            .unwrap_or_else(|| this.stray.join("\n"));

        ParsedOutput {
            tool_calls: this.tool_calls,
            text_messages: this.text_messages,
            final_result: final_result.trim().to_string(),
            total_cost_usd: this.total_cost_usd,
        }
    }
}
