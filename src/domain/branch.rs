use crate::domain::{parse_events, prefix_end, segment_turns, turn_boundaries};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOrigin {
    /// Suffix removed by a restore.
    Restore,
    /// Live suffix displaced when another branch was re-attached.
    Swap,
    /// Tail of a branch that was only partially re-attached.
    Remainder,
}

impl BranchOrigin {
    pub fn label(self) -> &'static str {
        match self {
            Self::Restore => "restore",
            Self::Swap => "swap",
            Self::Remainder => "remainder",
        }
    }
}

/// Metadata for one archived suffix.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    pub id: String,
    pub turn_index: usize,
    pub created_at: String,
    pub origin: BranchOrigin,
    pub byte_len: u64,
    pub turn_count: usize,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CutError {
    #[error("turn {turn_index} is out of range (log has {turn_count} turns)")]
    TurnOutOfRange {
        turn_index: usize,
        turn_count: usize,
    },

    #[error("branch diverges at turn {turn_index} but the live log has {turn_count} turns")]
    DivergenceMissing {
        turn_index: usize,
        turn_count: usize,
    },
}

/// Split of a live log at the end of a turn.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RestoreCut<'a> {
    pub kept: &'a [u8],
    pub removed: &'a [u8],
    pub turn_count: usize,
}

/// Splits `log` right after turn `turn_index`.
///
/// Turns are located on a lossy UTF-8 view; the split itself happens on the raw bytes, so an
/// undecodable sequence ends up unaltered on one side.
pub fn cut_after_turn(log: &[u8], turn_index: usize) -> Result<RestoreCut<'_>, CutError> {
    let view = String::from_utf8_lossy(log);
    let boundaries = turn_boundaries(&parse_events(&view), view.len());
    if turn_index >= boundaries.len() {
        return Err(CutError::TurnOutOfRange {
            turn_index,
            turn_count: boundaries.len(),
        });
    }
    let end = boundaries
        .get(turn_index + 1)
        .map_or(log.len(), |&offset| raw_offset(log, &view, offset));
    Ok(RestoreCut {
        kept: &log[..end],
        removed: &log[end..],
        turn_count: boundaries.len(),
    })
}

/// Result of re-attaching a branch onto a live log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MaterializeCut {
    pub live: Vec<u8>,
    /// Former live suffix after the divergence turn; archive at the divergence turn.
    pub displaced: Vec<u8>,
    /// Part of the branch beyond the requested turn; archive at that turn.
    pub remainder: Vec<u8>,
}

/// Builds `live prefix through divergence + branch content`, optionally keeping the branch only
/// through global turn `through_turn`.
pub fn cut_for_materialize(
    live_log: &[u8],
    branch_log: &[u8],
    divergence: usize,
    through_turn: Option<usize>,
) -> Result<MaterializeCut, CutError> {
    let live_view = String::from_utf8_lossy(live_log);
    let live_turns = segment_turns(&parse_events(&live_view), live_view.len());
    let split = prefix_end(&live_turns, divergence)
        .map(|offset| raw_offset(live_log, &live_view, offset))
        .ok_or(CutError::DivergenceMissing {
            turn_index: divergence,
            turn_count: live_turns.len(),
        })?;

    let branch_view = String::from_utf8_lossy(branch_log);
    let branch_turns = segment_turns(&parse_events(&branch_view), branch_view.len());
    let keep_len = match through_turn {
        None => branch_log.len(),
        Some(turn_index) => {
            let out_of_range = CutError::TurnOutOfRange {
                turn_index,
                turn_count: divergence + 1 + branch_turns.len(),
            };
            let local = turn_index
                .checked_sub(divergence + 1)
                .ok_or_else(|| out_of_range.clone())?;
            prefix_end(&branch_turns, local)
                .map(|offset| raw_offset(branch_log, &branch_view, offset))
                .ok_or(out_of_range)?
        }
    };

    let mut live = Vec::with_capacity(split + keep_len + 1);
    live.extend_from_slice(&live_log[..split]);
    if !live.is_empty() && !live.ends_with(b"\n") && keep_len > 0 {
        // A torn final line must not swallow the first re-attached event.
        live.push(b'\n');
    }
    live.extend_from_slice(&branch_log[..keep_len]);

    Ok(MaterializeCut {
        live,
        displaced: live_log[split..].to_vec(),
        remainder: branch_log[keep_len..].to_vec(),
    })
}

/// Maps a line-start offset in the lossy view of `raw` back onto `raw`.
///
/// Replacement characters never stand in for `\n`, so line `k` starts after the `k`-th newline
/// in both.
fn raw_offset(raw: &[u8], view: &str, offset: usize) -> usize {
    if offset >= view.len() {
        return raw.len();
    }
    let line = view.as_bytes()[..offset]
        .iter()
        .filter(|&&b| b == b'\n')
        .count();
    if line == 0 {
        return 0;
    }
    raw.iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .nth(line - 1)
        .map_or(raw.len(), |(i, _)| i + 1)
}

/// First line of the first prompt in `text`, used to label a branch.
pub fn branch_preview(text: &str) -> Option<String> {
    parse_events(text)
        .iter()
        .find(|event| event.is_prompt())
        .map(|event| event.text())
        .and_then(|text| {
            text.lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
        })
}

pub fn count_turns(text: &str) -> usize {
    segment_turns(&parse_events(text), text.len()).len()
}
