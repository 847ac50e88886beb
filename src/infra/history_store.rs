use crate::domain::{HistoryStack, SessionIdentity};
use crate::infra::write_atomic;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const HISTORY_STORAGE_KEY: &str = "session-history";

#[derive(Debug, Error)]
pub enum LoadHistoryError {
    #[error("failed to read session history: {0}")]
    Read(#[from] io::Error),

    #[error("failed to parse session history: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SaveHistoryError {
    #[error("failed to encode session history: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write session history: {0}")]
    Write(#[from] io::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    entries: Vec<SessionIdentity>,
    /// Present while a back/forward cycle is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor: Option<usize>,
    /// Set right after a commit until the visit it caused has been recorded.
    #[serde(default, rename = "skipNextPush", skip_serializing_if = "std::ops::Not::not")]
    skip_next_push: bool,
}

pub fn history_path(state_dir: &Path) -> PathBuf {
    state_dir.join(format!("{HISTORY_STORAGE_KEY}.json"))
}

pub fn load_history(state_dir: &Path, capacity: usize) -> Result<HistoryStack, LoadHistoryError> {
    let path = history_path(state_dir);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Ok(HistoryStack::with_capacity(capacity));
        }
        Err(error) => return Err(error.into()),
    };

    let file: HistoryFile = serde_json::from_str(&raw)?;
    let entries = file
        .entries
        .into_iter()
        .filter(SessionIdentity::is_well_formed)
        .collect();
    let mut stack = HistoryStack::from_entries(entries, capacity);
    if let Some(cursor) = file.cursor {
        stack.resume_navigation(cursor);
    }
    if file.skip_next_push {
        stack.suppress_next_push();
    }
    Ok(stack)
}

pub fn save_history(state_dir: &Path, stack: &HistoryStack) -> Result<(), SaveHistoryError> {
    let file = HistoryFile {
        version: 1,
        entries: stack.entries().to_vec(),
        cursor: stack.is_navigating().then_some(stack.cursor()),
        skip_next_push: stack.skips_next_push(),
    };
    let text = serde_json::to_string_pretty(&file)?;
    write_atomic(&history_path(state_dir), text.as_bytes())?;
    Ok(())
}

/// [`HistoryStack`] backed by `<state_dir>/session-history.json`, saved after every change.
///
/// Storage problems never surface to the caller: a bad file loads as an empty list and failed
/// saves are logged.
#[derive(Debug)]
pub struct PersistentHistory {
    state_dir: PathBuf,
    stack: HistoryStack,
}

impl PersistentHistory {
    pub fn load(state_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        let state_dir = state_dir.into();
        let stack = match load_history(&state_dir, capacity) {
            Ok(stack) => stack,
            Err(error) => {
                tracing::warn!(path = %history_path(&state_dir).display(), %error, "ignoring unreadable session history");
                HistoryStack::with_capacity(capacity)
            }
        };
        Self { state_dir, stack }
    }

    pub fn stack(&self) -> &HistoryStack {
        &self.stack
    }

    pub fn push(&mut self, identity: SessionIdentity) -> bool {
        let was_skipping = self.stack.skips_next_push();
        let changed = self.stack.push(identity);
        if changed || was_skipping {
            self.save();
        }
        changed
    }

    pub fn go_back(&mut self) -> Option<SessionIdentity> {
        let target = self.stack.go_back().cloned();
        if target.is_some() {
            self.save();
        }
        target
    }

    pub fn go_forward(&mut self) -> Option<SessionIdentity> {
        let target = self.stack.go_forward().cloned();
        if target.is_some() {
            self.save();
        }
        target
    }

    pub fn commit_navigation(&mut self) -> bool {
        let was_navigating = self.stack.is_navigating();
        let changed = self.stack.commit_navigation();
        if changed || was_navigating {
            self.save();
        }
        changed
    }

    pub fn forget(&mut self, identity: &SessionIdentity) -> bool {
        let changed = self.stack.forget(identity);
        if changed {
            self.save();
        }
        changed
    }

    fn save(&self) {
        if let Err(error) = save_history(&self.state_dir, &self.stack) {
            tracing::warn!(path = %history_path(&self.state_dir).display(), %error, "failed to save session history");
        }
    }
}
