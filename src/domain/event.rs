use serde_json::Value;
use std::ops::Range;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    User,
    Assistant,
    System,
    Progress,
    Summary,
    QueueOperation,
    Other(String),
}

impl EventKind {
    pub fn from_type(line_type: &str) -> Self {
        match line_type {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            "progress" => Self::Progress,
            "summary" => Self::Summary,
            "queue-operation" => Self::QueueOperation,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Progress => "progress",
            Self::Summary => "summary",
            Self::QueueOperation => "queue-operation",
            Self::Other(other) => other,
        }
    }

    /// Events that never anchor a turn and never decide status.
    pub fn is_bookkeeping(&self) -> bool {
        !matches!(self, Self::User | Self::Assistant)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueOperation {
    Enqueue,
    Dequeue,
    Remove,
    Other,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolUseBlock {
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ToolResultBlock {
    pub tool_use_id: Option<String>,
    pub content: String,
    pub is_error: bool,
}

/// One JSON object line of a session log.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    kind: EventKind,
    value: Value,
    line_no: u64,
    byte_range: Range<usize>,
}

impl Event {
    pub fn from_value(value: Value, line_no: u64, byte_range: Range<usize>) -> Self {
        let kind = EventKind::from_type(value.get("type").and_then(|v| v.as_str()).unwrap_or(""));
        Self {
            kind,
            value,
            line_no,
            byte_range,
        }
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// 1-based line number in the source text.
    pub fn line_no(&self) -> u64 {
        self.line_no
    }

    /// Byte range of the source line, trailing newline included when present.
    pub fn byte_range(&self) -> Range<usize> {
        self.byte_range.clone()
    }

    pub fn uuid(&self) -> Option<&str> {
        self.value.get("uuid").and_then(|v| v.as_str())
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.value.get("timestamp").and_then(|v| v.as_str())
    }

    pub fn is_meta(&self) -> bool {
        self.value
            .get("isMeta")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Non-meta `user` record, including tool-result carriers.
    pub fn is_user_originated(&self) -> bool {
        self.kind == EventKind::User && !self.is_meta()
    }

    /// A user-originated record that starts a turn: anything but a pure tool-result carrier.
    pub fn is_prompt(&self) -> bool {
        self.is_user_originated() && !self.is_tool_result_only()
    }

    fn is_tool_result_only(&self) -> bool {
        match self.content().as_array() {
            Some(blocks) if !blocks.is_empty() => blocks
                .iter()
                .all(|block| block_type(block) == "tool_result"),
            _ => false,
        }
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.value
            .get("message")
            .and_then(|m| m.get("stop_reason"))
            .and_then(|v| v.as_str())
    }

    pub fn tool_uses(&self) -> Vec<ToolUseBlock> {
        if self.kind != EventKind::Assistant {
            return Vec::new();
        }
        let Some(blocks) = self.content().as_array() else {
            return Vec::new();
        };
        blocks
            .iter()
            .filter(|block| block_type(block) == "tool_use")
            .map(|block| ToolUseBlock {
                id: block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                name: block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("tool")
                    .to_string(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            })
            .collect()
    }

    pub fn tool_results(&self) -> Vec<ToolResultBlock> {
        if self.kind != EventKind::User {
            return Vec::new();
        }
        let Some(blocks) = self.content().as_array() else {
            return Vec::new();
        };
        blocks
            .iter()
            .filter(|block| block_type(block) == "tool_result")
            .map(|block| ToolResultBlock {
                tool_use_id: block
                    .get("tool_use_id")
                    .or_else(|| block.get("toolUseId"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                content: tool_result_text(block),
                is_error: block
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            })
            .collect()
    }

    pub fn queue_operation(&self) -> Option<QueueOperation> {
        if self.kind != EventKind::QueueOperation {
            return None;
        }
        let op = match self.value.get("operation").and_then(|v| v.as_str()) {
            Some("enqueue") => QueueOperation::Enqueue,
            Some("dequeue") => QueueOperation::Dequeue,
            Some("remove") => QueueOperation::Remove,
            _ => QueueOperation::Other,
        };
        Some(op)
    }

    /// Text blocks of a user or assistant message, joined by newlines.
    pub fn text(&self) -> String {
        extract_text_blocks(self.content())
    }

    fn content(&self) -> &Value {
        self.value
            .get("message")
            .and_then(|m| m.get("content"))
            .unwrap_or(&Value::Null)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedLog {
    pub events: Vec<Event>,
    pub skipped_lines: usize,
}

pub fn parse_events(raw: &str) -> Vec<Event> {
    parse_log(raw).events
}

/// Parses line-delimited JSON, dropping any line that is not a JSON object.
///
/// Logs are often read while the runtime is still writing them, so a torn last line is normal.
pub fn parse_log(raw: &str) -> ParsedLog {
    let mut events = Vec::new();
    let mut skipped_lines = 0usize;
    let mut offset = 0usize;
    let mut line_no: u64 = 0;

    for line in raw.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        line_no = line_no.saturating_add(1);

        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.is_object() => {
                events.push(Event::from_value(value, line_no, start..offset));
            }
            Ok(_) | Err(_) => {
                skipped_lines += 1;
                tracing::debug!(line_no, "skipping unparseable log line");
            }
        }
    }

    ParsedLog {
        events,
        skipped_lines,
    }
}

/// Compact JSON, one event per line.
pub fn serialize_events(events: &[Event]) -> String {
    let mut out = String::new();
    for event in events {
        out.push_str(&event.value.to_string());
        out.push('\n');
    }
    out
}

fn block_type(block: &Value) -> &str {
    block.get("type").and_then(|v| v.as_str()).unwrap_or("")
}

fn extract_text_blocks(value: &Value) -> String {
    match value {
        Value::String(text) => text.to_string(),
        Value::Array(items) => items
            .iter()
            .filter(|block| block_type(block) == "text")
            .filter_map(|block| block.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn tool_result_text(block: &Value) -> String {
    let content = block.get("content").unwrap_or(&Value::Null);
    match content {
        Value::String(text) => text.trim_end().to_string(),
        Value::Array(_) => extract_text_blocks(content),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
