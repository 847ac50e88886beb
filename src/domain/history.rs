use crate::domain::SessionIdentity;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Most-recently-used session list with two-phase navigation.
///
/// `go_back`/`go_forward` only move a cursor over the current order; nothing is reordered until
/// `commit_navigation` promotes the entry under the cursor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HistoryStack {
    entries: Vec<SessionIdentity>,
    cursor: usize,
    navigating: bool,
    skip_next_push: bool,
    capacity: usize,
}

impl Default for HistoryStack {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryStack {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            navigating: false,
            skip_next_push: false,
            capacity: capacity.max(1),
        }
    }

    pub fn from_entries(entries: Vec<SessionIdentity>, capacity: usize) -> Self {
        let mut stack = Self::with_capacity(capacity);
        for entry in entries {
            if !stack.entries.contains(&entry) {
                stack.entries.push(entry);
            }
        }
        stack.entries.truncate(stack.capacity);
        stack
    }

    pub fn entries(&self) -> &[SessionIdentity] {
        &self.entries
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_navigating(&self) -> bool {
        self.navigating
    }

    pub fn current(&self) -> Option<&SessionIdentity> {
        self.entries.get(self.cursor)
    }

    /// Whether the next `push` will be swallowed by a just-committed navigation.
    pub fn skips_next_push(&self) -> bool {
        self.skip_next_push
    }

    /// Re-arms the one-shot push suppression, e.g. after reloading persisted state.
    pub fn suppress_next_push(&mut self) {
        self.skip_next_push = true;
    }

    /// Records a visit. Returns whether the list changed.
    ///
    /// The first push after a navigation commit is the visit that commit caused and is dropped.
    /// A push in the middle of a cycle is applied and ends the cycle.
    pub fn push(&mut self, identity: SessionIdentity) -> bool {
        if self.skip_next_push {
            self.skip_next_push = false;
            return false;
        }

        self.navigating = false;
        self.entries.retain(|entry| entry != &identity);
        self.entries.insert(0, identity);
        self.entries.truncate(self.capacity);
        self.cursor = 0;
        true
    }

    /// Steps to the next older entry, wrapping to the newest.
    pub fn go_back(&mut self) -> Option<&SessionIdentity> {
        if self.entries.is_empty() {
            return None;
        }
        self.navigating = true;
        self.cursor = (self.cursor + 1) % self.entries.len();
        self.entries.get(self.cursor)
    }

    /// Steps to the next newer entry, wrapping to the oldest.
    pub fn go_forward(&mut self) -> Option<&SessionIdentity> {
        if self.entries.is_empty() {
            return None;
        }
        self.navigating = true;
        let len = self.entries.len();
        self.cursor = (self.cursor + len - 1) % len;
        self.entries.get(self.cursor)
    }

    /// Ends a navigation cycle, promoting the entry under the cursor. Returns whether the list
    /// changed.
    pub fn commit_navigation(&mut self) -> bool {
        if !self.navigating {
            return false;
        }
        self.navigating = false;
        self.skip_next_push = true;
        if self.cursor == 0 || self.cursor >= self.entries.len() {
            self.cursor = 0;
            return false;
        }

        let promoted = self.entries.remove(self.cursor);
        self.entries.insert(0, promoted);
        self.cursor = 0;
        true
    }

    /// Re-enters a navigation cycle at `cursor`; out-of-range cursors are ignored.
    pub fn resume_navigation(&mut self, cursor: usize) {
        if cursor < self.entries.len() {
            self.navigating = true;
            self.cursor = cursor;
        }
    }

    /// Drops a session that no longer exists. Returns whether the list changed.
    pub fn forget(&mut self, identity: &SessionIdentity) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry != identity);
        if self.cursor >= self.entries.len() {
            self.cursor = 0;
        }
        before != self.entries.len()
    }
}
