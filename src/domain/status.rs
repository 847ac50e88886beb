use crate::domain::{Event, EventKind, QueueOperation, parse_events};
use serde::Serialize;
use std::ops::ControlFlow;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    #[default]
    Idle,
    Thinking,
    ToolUse,
    Processing,
    Completed,
}

impl StatusKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::ToolUse => "tool_use",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub status: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub pending_queue: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// Scans newest to oldest and stops at the first assistant or non-meta user event.
///
/// Queue operations seen before that point adjust the pending queue; bookkeeping never decides
/// the status. The result depends on nothing but `events`.
pub fn derive_status(events: &[Event]) -> SessionStatus {
    let scan = events
        .iter()
        .enumerate()
        .rev()
        .try_fold(0i64, |queue_delta, (position, event)| {
            match event.kind() {
                EventKind::Assistant => {
                    ControlFlow::Break((decide_assistant(event, &events[..position]), queue_delta))
                }
                EventKind::User if !event.is_meta() => {
                    ControlFlow::Break(((StatusKind::Processing, None), queue_delta))
                }
                EventKind::QueueOperation => {
                    ControlFlow::Continue(queue_delta + queue_step(event.queue_operation()))
                }
                _ => ControlFlow::Continue(queue_delta),
            }
        });

    let ((status, tool_name), queue_delta) = match scan {
        ControlFlow::Break(found) => found,
        ControlFlow::Continue(queue_delta) => ((StatusKind::Idle, None), queue_delta),
    };

    if queue_delta < 0 {
        tracing::debug!(queue_delta, "queue dequeues outnumber enqueues; clamping to zero");
    }

    SessionStatus {
        status,
        tool_name,
        pending_queue: usize::try_from(queue_delta.max(0)).unwrap_or(0),
    }
}

fn decide_assistant(event: &Event, earlier: &[Event]) -> (StatusKind, Option<String>) {
    match event.stop_reason() {
        Some("end_turn") => {
            if earlier.iter().any(Event::is_user_originated) {
                (StatusKind::Completed, None)
            } else {
                (StatusKind::Idle, None)
            }
        }
        Some("tool_use") => {
            let tool_name = event.tool_uses().pop().map(|tool| tool.name);
            (StatusKind::ToolUse, tool_name)
        }
        _ => (StatusKind::Thinking, None),
    }
}

fn queue_step(op: Option<QueueOperation>) -> i64 {
    match op {
        Some(QueueOperation::Enqueue) => 1,
        Some(QueueOperation::Dequeue) | Some(QueueOperation::Remove) => -1,
        Some(QueueOperation::Other) | None => 0,
    }
}

pub fn derive_status_from_text(raw: &str) -> SessionStatus {
    derive_status(&parse_events(raw))
}

/// Suffix of `raw` no longer than `max_bytes`, starting on a line boundary.
///
/// Deriving status from the tail agrees with the full log as long as the tail still contains
/// the deciding event (and, for `end_turn`, an earlier user event).
pub fn tail_window(raw: &str, max_bytes: usize) -> &str {
    if raw.len() <= max_bytes {
        return raw;
    }
    let cut = raw.len() - max_bytes;
    match raw.as_bytes()[cut..].iter().position(|b| *b == b'\n') {
        Some(newline) => &raw[cut + newline + 1..],
        None => "",
    }
}
