//! Parser for timestamped block logs (`codex exec` human output)
//!
//! A line starting with `[<timestamp>]` opens a new block; every following
//! line without a timestamp belongs to it. The block kind is inferred from
//! the header text after the timestamp.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::json;

use super::{OutputParser, ParsedOutput, ToolCall};

static RE_HEADER: OnceLock<Regex> = OnceLock::new();
static RE_EXEC: OnceLock<Regex> = OnceLock::new();
static RE_EXEC_DONE: OnceLock<Regex> = OnceLock::new();
static RE_PATCH_FILE: OnceLock<Regex> = OnceLock::new();

fn header_re() -> &'static Regex {
    RE_HEADER.get_or_init(|| {
        Regex::new(r"^\[(\d{4}-\d{2}-\d{2}T[^\]]*)\]\s?(.*)$").expect("valid header regex")
    })
}

fn exec_re() -> &'static Regex {
    RE_EXEC.get_or_init(|| Regex::new(r"^exec (.+?)(?: in (/\S*))?$").expect("valid exec regex"))
}

fn exec_done_re() -> &'static Regex {
    RE_EXEC_DONE.get_or_init(|| {
        Regex::new(r"(?:succeeded|exited (-?\d+)) in \d+(?:\.\d+)?m?s:?$").expect("valid exec-done regex")
    })
}

fn patch_file_re() -> &'static Regex {
    RE_PATCH_FILE.get_or_init(|| {
        Regex::new(r"^(?:[AMD] |\*\*\* (?:Add|Update|Delete) File: )(\S.*)$")
            .expect("valid patch-file regex")
    })
}

#[derive(Debug, Clone, PartialEq)]
enum BlockKind {
    Banner,
    Exec { command: String },
    ExecDone { failed: bool },
    PatchApply,
    TurnDiff,
    Note,
    Assistant,
}

impl BlockKind {
    fn classify(header: &str) -> Self {
        let lower = header.to_lowercase();
        if lower.contains("openai codex") {
            return Self::Banner;
        }
        if let Some(caps) = exec_re().captures(header) {
            return Self::Exec {
                command: caps[1].to_string(),
            };
        }
        if let Some(caps) = exec_done_re().captures(header) {
            let failed = caps
                .get(1)
                .and_then(|code| code.as_str().parse::<i64>().ok())
                .map(|code| code != 0)
                .unwrap_or(false);
            return Self::ExecDone { failed };
        }
        if lower.starts_with("apply_patch") || lower.starts_with("apply patch") {
            return Self::PatchApply;
        }
        if lower.starts_with("turn diff") {
            return Self::TurnDiff;
        }
        if lower.starts_with("thinking")
            || lower.starts_with("tokens used")
            || lower.starts_with("user instructions")
            || lower.starts_with("error")
        {
            return Self::Note;
        }
        Self::Assistant
    }
}

struct Block {
    kind: BlockKind,
    header: String,
    body: Vec<String>,
}

impl Block {
    fn body_text(&self) -> String {
        self.body.join("\n").trim().to_string()
    }
}

#[derive(Default)]
pub struct BlockLogParser {
    open: Option<Block>,
    blocks_seen: usize,
    tool_calls: Vec<ToolCall>,
    text_messages: Vec<String>,
    /// Output before the first timestamp line
    preamble: Vec<String>,
}

impl BlockLogParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.blocks_seen += 1;
        format!("{}-{}", prefix, self.blocks_seen)
    }

    /// Tool calls that are known once the header is read
    fn open_block(&mut self, header: String) -> Vec<ToolCall> {
        let kind = BlockKind::classify(&header);
        let mut fresh = Vec::new();
        if let BlockKind::Exec { command } = &kind {
            let call = ToolCall::new(self.next_id("exec"), "shell", json!({ "command": command }));
            fresh.push(call.clone());
            self.tool_calls.push(call);
        }
        self.open = Some(Block {
            kind,
            header,
            body: Vec::new(),
        });
        fresh
    }

    /// Tool calls that need the block body
    fn close_block(&mut self) -> Vec<ToolCall> {
        let Some(block) = self.open.take() else {
            return Vec::new();
        };

        let mut fresh = Vec::new();
        match &block.kind {
            BlockKind::PatchApply => {
                let files: Vec<String> = block
                    .body
                    .iter()
                    .filter_map(|line| patch_file_re().captures(line.trim_end()))
                    .map(|caps| caps[1].trim().to_string())
                    .collect();
                let input = match files.as_slice() {
                    [single] => json!({ "file_path": single }),
                    _ => json!({ "files": files }),
                };
                let call = ToolCall::new(self.next_id("patch"), "apply_patch", input);
                fresh.push(call.clone());
                self.tool_calls.push(call);
            }
            BlockKind::ExecDone { failed } => {
                if let Some(call) = self
                    .tool_calls
                    .iter_mut()
                    .rev()
                    .find(|c| c.name == "shell" && c.result.is_none())
                {
                    call.result = Some(block.body_text());
                    call.is_error = *failed;
                }
            }
            BlockKind::Assistant => {
                let mut text = String::new();
                if !block.header.eq_ignore_ascii_case("codex") {
                    text.push_str(block.header.trim());
                    text.push('\n');
                }
                text.push_str(&block.body_text());
                let text = text.trim().to_string();
                if !text.is_empty() {
                    self.text_messages.push(text);
                }
            }
            BlockKind::Banner | BlockKind::TurnDiff | BlockKind::Note | BlockKind::Exec { .. } => {}
        }
        fresh
    }
}

impl OutputParser for BlockLogParser {
    fn push_line(&mut self, line: &str) -> Vec<ToolCall> {
        if let Some(caps) = header_re().captures(line) {
            let header = caps[2].trim().to_string();
            let mut fresh = self.close_block();
            fresh.extend(self.open_block(header));
            return fresh;
        }

        match self.open.as_mut() {
            Some(block) => block.body.push(line.to_string()),
            None => {
                if !line.trim().is_empty() {
                    self.preamble.push(line.to_string());
                }
            }
        }
        Vec::new()
    }

    fn finish(self: Box<Self>) -> ParsedOutput {
        let mut this = *self;
        this.close_block();

        let final_result = this
            .text_messages
            .last()
            .cloned()
            .unwrap_or_else(|| this.preamble.join("\n").trim().to_string());

        ParsedOutput {
            tool_calls: this.tool_calls,
            text_messages: this.text_messages,
            final_result,
            total_cost_usd: None,
        }
    }
}
