//! Output parsers for the agent CLIs
//!
//! Every provider's output is reduced to the same [`ParsedOutput`]. Parsers
//! are fed line by line so tool calls can be persisted while the agent is
//! still running.

use serde::{Deserialize, Serialize};

mod block_log;
mod stream_json;
mod text;

pub use block_log::BlockLogParser;
pub use stream_json::StreamJsonParser;
pub use text::TextParser;

/// Raw output shape of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON event per line
    StreamJson,
    /// Unstructured text; the whole output is the result
    Text,
    /// `[timestamp] header` lines opening blocks of free text
    BlockLog,
}

/// One tool invocation made by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    /// Joined in from a later tool-result entry, when the format has one
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            result: None,
            is_error: false,
        }
    }
}

/// Structured result of one agent invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub tool_calls: Vec<ToolCall>,
    pub text_messages: Vec<String>,
    pub final_result: String,
    pub total_cost_usd: Option<f64>,
}

impl ParsedOutput {
    /// The first tool call with the given name
    pub fn tool_call(&self, name: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|call| call.name == name)
    }
}

/// Incremental parser over one agent's stdout
pub trait OutputParser: Send {
    /// Consume one line; returns tool calls seen for the first time
    fn push_line(&mut self, line: &str) -> Vec<ToolCall>;

    /// End of stream
    fn finish(self: Box<Self>) -> ParsedOutput;
}

/// Create a parser for the given output format
pub fn create_parser(format: OutputFormat) -> Box<dyn OutputParser> {
    match format {
        OutputFormat::StreamJson => Box::new(StreamJsonParser::new()),
        OutputFormat::Text => Box::new(TextParser::new()),
        OutputFormat::BlockLog => Box::new(BlockLogParser::new()),
    }
}

/// Parse a complete, already captured output
pub fn parse_output(format: OutputFormat, raw: &str) -> ParsedOutput {
    let mut parser = create_parser(format);
    for line in raw.lines() {
        parser.push_line(line);
    }
    parser.finish()
}
