use crate::domain::{Event, ToolResultBlock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::ops::Range;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Pending,
    Completed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
    pub result: Option<String>,
    pub is_error: bool,
    pub state: ToolCallState,
}

/// One prompt plus everything that follows it up to the next prompt.
#[derive(Clone, Debug, PartialEq)]
pub struct Turn {
    pub index: usize,
    pub prompt: Option<Event>,
    pub responses: Vec<Event>,
    pub tool_calls: Vec<ToolCall>,
    /// Bytes of the raw log owned by this turn. Ranges of consecutive turns are contiguous and
    /// together cover the whole text, malformed lines included.
    pub byte_range: Range<usize>,
}

impl Turn {
    fn empty(index: usize, start: usize) -> Self {
        Self {
            index,
            prompt: None,
            responses: Vec::new(),
            tool_calls: Vec::new(),
            byte_range: start..start,
        }
    }

    pub fn event_count(&self) -> usize {
        self.responses.len() + usize::from(self.prompt.is_some())
    }

    pub fn prompt_text(&self) -> Option<String> {
        self.prompt.as_ref().map(Event::text)
    }

    pub fn pending_tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.tool_calls
            .iter()
            .filter(|call| call.state == ToolCallState::Pending)
    }
}

/// Groups events into turns. `text_len` is the byte length of the text `events` came from, so
/// the last turn also owns any trailing unparseable bytes.
pub fn segment_turns(events: &[Event], text_len: usize) -> Vec<Turn> {
    if events.is_empty() {
        return Vec::new();
    }

    let results = index_tool_results(events);
    let mut turns: Vec<Turn> = Vec::new();
    let mut current: Option<Turn> = None;

    for event in events {
        if event.is_prompt() {
            match current.take() {
                // Leading bookkeeping is folded into turn 0 instead of forming its own turn.
                Some(mut turn) if turn.prompt.is_none() && turn.index == 0 => {
                    turn.prompt = Some(event.clone());
                    current = Some(turn);
                    continue;
                }
                Some(turn) => turns.push(turn),
                None => {}
            }
            let start = if turns.is_empty() {
                0
            } else {
                event.byte_range().start
            };
            let mut turn = Turn::empty(turns.len(), start);
            turn.prompt = Some(event.clone());
            current = Some(turn);
            continue;
        }

        let turn = current.get_or_insert_with(|| Turn::empty(turns.len(), 0));
        for tool_use in event.tool_uses() {
            let result = tool_use
                .id
                .as_deref()
                .and_then(|id| first_result_after(&results, id, event.line_no()));
            turn.tool_calls.push(ToolCall {
                state: if result.is_some() {
                    ToolCallState::Completed
                } else {
                    ToolCallState::Pending
                },
                is_error: result.is_some_and(|r| r.is_error),
                result: result.map(|r| r.content.clone()),
                id: tool_use.id,
                name: tool_use.name,
                input: tool_use.input,
            });
        }
        turn.responses.push(event.clone());
    }

    if let Some(turn) = current {
        turns.push(turn);
    }

    let starts: Vec<usize> = turns.iter().map(|turn| turn.byte_range.start).collect();
    for (i, turn) in turns.iter_mut().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text_len);
        turn.byte_range = turn.byte_range.start..end.max(turn.byte_range.start);
    }

    turns
}

/// Segments events parsed from a text whose length is not at hand.
pub fn segment(events: &[Event]) -> Vec<Turn> {
    let text_len = events.last().map(|e| e.byte_range().end).unwrap_or(0);
    segment_turns(events, text_len)
}

/// Start offset of each turn; turn `k` ends where turn `k + 1` starts, the last at `text_len`.
pub fn turn_boundaries(events: &[Event], text_len: usize) -> Vec<usize> {
    segment_turns(events, text_len)
        .iter()
        .map(|turn| turn.byte_range.start)
        .collect()
}

/// Byte offset right after turn `turn_index`, or `None` when the turn does not exist.
pub fn prefix_end(turns: &[Turn], turn_index: usize) -> Option<usize> {
    turns.get(turn_index).map(|turn| turn.byte_range.end)
}

fn index_tool_results(events: &[Event]) -> HashMap<String, Vec<(u64, ToolResultBlock)>> {
    let mut out: HashMap<String, Vec<(u64, ToolResultBlock)>> = HashMap::new();
    for event in events {
        for block in event.tool_results() {
            if let Some(id) = block.tool_use_id.clone() {
                out.entry(id).or_default().push((event.line_no(), block));
            }
        }
    }
    out
}

fn first_result_after<'a>(
    results: &'a HashMap<String, Vec<(u64, ToolResultBlock)>>,
    id: &str,
    line_no: u64,
) -> Option<&'a ToolResultBlock> {
    results
        .get(id)?
        .iter()
        .find(|(result_line, _)| *result_line > line_no)
        .map(|(_, block)| block)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnsView {
    pub turns: Vec<TurnView>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnView {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub event_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    pub tool_calls: Vec<ToolCallView>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub state: ToolCallState,
    pub is_error: bool,
}

impl TurnsView {
    pub fn from_turns(turns: &[Turn]) -> Self {
        Self {
            turns: turns.iter().map(TurnView::from_turn).collect(),
        }
    }
}

impl TurnView {
    pub fn from_turn(turn: &Turn) -> Self {
        let reply = turn
            .responses
            .iter()
            .rev()
            .filter(|event| event.kind() == &crate::domain::EventKind::Assistant)
            .map(Event::text)
            .find(|text| !text.trim().is_empty())
            .and_then(|text| first_non_empty_line(&text));

        Self {
            index: turn.index,
            prompt: turn
                .prompt_text()
                .and_then(|text| first_non_empty_line(&text)),
            timestamp: turn
                .prompt
                .as_ref()
                .or_else(|| turn.responses.first())
                .and_then(|event| event.timestamp())
                .map(str::to_string),
            event_count: turn.event_count(),
            reply,
            tool_calls: turn
                .tool_calls
                .iter()
                .map(|call| ToolCallView {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    state: call.state,
                    is_error: call.is_error,
                })
                .collect(),
        }
    }
}

fn first_non_empty_line(text: &str) -> Option<String> {
    text.lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}
