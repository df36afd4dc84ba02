//! Human-readable rendering of agent tool calls

use serde_json::Value;

use crate::parser::ToolCall;

/// Longest parameter value shown before truncation
const MAX_VALUE_CHARS: usize = 120;

/// Split `mcp__<server>__<tool>` into its parts
pub fn mcp_origin(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix("mcp__")?;
    let (server, tool) = rest.split_once("__")?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

fn truncate(text: &str, max: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max {
        return single_line;
    }
    let mut out: String = single_line.chars().take(max).collect();
    out.push('…');
    out
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Icon and verb for a tool with exactly one parameter
fn single_param_label(tool: &str, key: &str) -> (&'static str, String) {
    match key {
        "file_path" | "path" | "notebook_path" | "files" => {
            let lower = tool.to_lowercase();
            if lower.contains("read") || lower == "view" {
                ("📖", "Read".to_string())
            } else if lower.contains("write") || lower.contains("create") {
                ("📝", "Write".to_string())
            } else if lower.contains("edit") || lower.contains("patch") {
                ("✏️", "Edit".to_string())
            } else {
                ("📄", tool.to_string())
            }
        }
        "command" | "cmd" => ("💻", "Run".to_string()),
        "pattern" | "query" | "regex" => ("🔍", "Search".to_string()),
        "url" => ("🌐", "Fetch".to_string()),
        "prompt" | "description" => ("🤖", tool.to_string()),
        "plan" => ("📋", "Plan".to_string()),
        _ => ("🔧", tool.to_string()),
    }
}

/// Render one tool call as a single message line
pub fn render_tool_call(call: &ToolCall) -> String {
    let (prefix, tool) = match mcp_origin(&call.name) {
        Some((server, tool)) => (format!("🔌 [{}] ", server), tool),
        None => (String::new(), call.name.as_str()),
    };

    let params: Vec<(&String, &Value)> = match &call.input {
        Value::Object(map) => map.iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => Vec::new(),
    };

    let body = match params.as_slice() {
        [] => format!("🔧 {}", tool),
        [(key, value)] if prefix.is_empty() => {
            let (icon, verb) = single_param_label(tool, key);
            format!("{} {}: {}", icon, verb, truncate(&value_text(value), MAX_VALUE_CHARS))
        }
        many => {
            let flat = many
                .iter()
                .map(|(k, v)| format!("{}={}", k, truncate(&value_text(v), MAX_VALUE_CHARS)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("🔧 {} ({})", tool, flat)
        }
    };

    format!("{}{}", prefix, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, input: Value) -> ToolCall {
        ToolCall::new("id", name, input)
    }

    #[test]
    fn test_single_param_file_tools() {
        assert_eq!(render_tool_call(&call("Read", json!({"file_path": "/a.py"}))), "📖 Read: /a.py");
        assert_eq!(render_tool_call(&call("Write", json!({"file_path": "/b.py"}))), "📝 Write: /b.py");
        assert_eq!(
            render_tool_call(&call("apply_patch", json!({"file_path": "/c.py"}))),
            "✏️ Edit: /c.py"
        );
    }

    #[test]
    fn test_single_param_other_tools() {
        assert_eq!(render_tool_call(&call("Bash", json!({"command": "cargo test"}))), "💻 Run: cargo test");
        assert_eq!(render_tool_call(&call("Grep", json!({"pattern": "TODO"}))), "🔍 Search: TODO");
        assert_eq!(
            render_tool_call(&call("WebFetch", json!({"url": "https://example.com"}))),
            "🌐 Fetch: https://example.com"
        );
    }

    #[test]
    fn test_multi_param_flattened() {
        let rendered = render_tool_call(&call(
            "Edit",
            json!({"file_path": "/a.py", "old_string": "x", "new_string": "y"}),
        ));
        assert!(rendered.starts_with("🔧 Edit ("));
        assert!(rendered.contains("file_path=/a.py"));
        assert!(rendered.contains("old_string=x"));
    }

    #[test]
    fn test_mcp_tools_labeled_by_server() {
        assert_eq!(mcp_origin("mcp__linear__create_issue"), Some(("linear", "create_issue")));
        assert_eq!(mcp_origin("Read"), None);

        let rendered = render_tool_call(&call("mcp__linear__create_issue", json!({"title": "Bug"})));
        assert_eq!(rendered, "🔌 [linear] 🔧 create_issue (title=Bug)");
    }

    #[test]
    fn test_long_values_truncated() {
        let long = "x".repeat(500);
        let rendered = render_tool_call(&call("Bash", json!({ "command": long })));
        assert!(rendered.ends_with('…'));
        assert!(rendered.chars().count() < 200);
    }

    #[test]
    fn test_no_params() {
        assert_eq!(render_tool_call(&call("TodoRead", json!({}))), "🔧 TodoRead");
    }
}
