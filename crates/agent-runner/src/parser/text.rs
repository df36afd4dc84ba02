use super::{OutputParser, ParsedOutput, ToolCall};

/// Parser for providers without structured output
#[derive(Default)]
pub struct TextParser {
    lines: Vec<String>,
}

impl TextParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputParser for TextParser {
    fn push_line(&mut self, line: &str) -> Vec<ToolCall> {
        self.lines.push(line.to_string());
        Vec::new()
    }

    fn finish(self: Box<Self>) -> ParsedOutput {
        let text = self.lines.join("\n").trim().to_string();
        ParsedOutput {
            tool_calls: Vec::new(),
            text_messages: if text.is_empty() { Vec::new() } else { vec![text.clone()] },
            final_result: text,
            total_cost_usd: None,
        }
    }
}
