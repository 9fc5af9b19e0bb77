//! Parsing of the CLI's line-oriented output.
//!
//! The CLI is run in `stream-json` mode: assistant messages become output
//! chunks and the final `result` object becomes the structured result.
//! Lines that are not JSON are passed through verbatim.

use serde_json::Value;

use crate::core::execution::ExecutionResult;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    /// Text to append to the execution's output.
    Text(String),
    /// Final structured result.
    Result(ExecutionResult),
    /// Protocol noise (system/tool events).
    Ignored,
}

pub fn parse_stream_line(line: &str) -> StreamLine {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return StreamLine::Text(format!("{}\n", line));
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return StreamLine::Text(format!("{}\n", line)),
    };

    match value.get("type").and_then(Value::as_str) {
        Some("result") => StreamLine::Result(parse_result(&value)),
        Some("assistant") => {
            let text = assistant_text(&value);
            if text.is_empty() {
                StreamLine::Ignored
            } else {
                StreamLine::Text(format!("{}\n", text))
            }
        }
        Some(_) => StreamLine::Ignored,
        None => StreamLine::Text(format!("{}\n", line)),
    }
}

fn assistant_text(value: &Value) -> String {
    let Some(blocks) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return String::new();
    };

    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_result(value: &Value) -> ExecutionResult {
    let subtype = value.get("subtype").and_then(Value::as_str);
    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| subtype != Some("success"));

    ExecutionResult {
        output: value
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        session_id: value
            .get("session_id")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        duration_ms: value.get("duration_ms").and_then(Value::as_u64),
        cost_usd: value
            .get("total_cost_usd")
            .or_else(|| value.get("cost_usd"))
            .and_then(Value::as_f64),
        is_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_pass_through() {
        assert_eq!(parse_stream_line("hello"), StreamLine::Text("hello\n".into()));
        assert_eq!(parse_stream_line(""), StreamLine::Text("\n".into()));
        assert_eq!(
            parse_stream_line("{not json"),
            StreamLine::Text("{not json\n".into())
        );
    }

    #[test]
    fn assistant_text_blocks_become_chunks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking"},{"type":"tool_use","name":"Read"},{"type":"text","text":"done"}]}}"#;
        assert_eq!(parse_stream_line(line), StreamLine::Text("Looking\ndone\n".into()));

        let tool_only = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash"}]}}"#;
        assert_eq!(parse_stream_line(tool_only), StreamLine::Ignored);
        assert_eq!(parse_stream_line(r#"{"type":"system","subtype":"init"}"#), StreamLine::Ignored);
    }

    #[test]
    fn result_line_is_structured() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"duration_ms":1500,"total_cost_usd":0.25,"session_id":"s-1","result":"All done"}"#;
        let StreamLine::Result(result) = parse_stream_line(line) else {
            panic!("expected result");
        };
        assert_eq!(result.output, "All done");
        assert_eq!(result.session_id.as_deref(), Some("s-1"));
        assert_eq!(result.duration_ms, Some(1500));
        assert_eq!(result.cost_usd, Some(0.25));
        assert!(!result.is_error);
    }

    #[test]
    fn error_subtype_without_flag_is_an_error() {
        let line = r#"{"type":"result","subtype":"error_max_turns","session_id":"s-2"}"#;
        let StreamLine::Result(result) = parse_stream_line(line) else {
            panic!("expected result");
        };
        assert!(result.is_error);
        assert_eq!(result.output, "");
    }
}
