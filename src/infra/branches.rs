use crate::domain::{
    BranchOrigin, BranchRecord, CutError, ErrorKind, LogFingerprint, SessionIdentity,
    cut_after_turn, cut_for_materialize,
};
use crate::infra::{
    BranchIndex, BranchStore, BranchStoreError, CoreConfig, LockError, LogStoreError,
    SessionLocks, SessionLogStore, SessionSnapshot,
};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Log(LogStoreError),

    #[error(transparent)]
    Branch(BranchStoreError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Error)]
pub enum BranchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BranchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<LogStoreError> for BranchError {
    fn from(error: LogStoreError) -> Self {
        match error {
            LogStoreError::NotFound(identity) => Self::NotFound(format!("session {identity}")),
            LogStoreError::InvalidIdentity(identity) => {
                Self::NotFound(format!("invalid session identity {identity}"))
            }
            other => Self::Storage(StorageError::Log(other)),
        }
    }
}

impl From<BranchStoreError> for BranchError {
    fn from(error: BranchStoreError) -> Self {
        match error {
            BranchStoreError::NotFound(id) => Self::NotFound(format!("branch {id}")),
            other => Self::Storage(StorageError::Branch(other)),
        }
    }
}

impl From<LockError> for BranchError {
    fn from(error: LockError) -> Self {
        Self::Storage(StorageError::Lock(error))
    }
}

fn from_cut(error: CutError) -> BranchError {
    match error {
        CutError::TurnOutOfRange { .. } => BranchError::NotFound(error.to_string()),
        CutError::DivergenceMissing { .. } => BranchError::Conflict(error.to_string()),
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RestoreOutcome {
    pub snapshot: SessionSnapshot,
    /// `None` when the log already ended at the requested turn.
    pub branch: Option<BranchRecord>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MaterializeOutcome {
    pub snapshot: SessionSnapshot,
    /// Branches created to hold the displaced live suffix and any cut-off remainder.
    pub archived: Vec<BranchRecord>,
    /// The re-attached branch. It stays archived.
    pub source: BranchRecord,
}

/// A structural change ready to publish.
struct Publish<'a> {
    /// The live log as read under the lock; the swap only happens while it is unchanged.
    read_log: &'a [u8],
    new_live: &'a [u8],
    original_index: &'a BranchIndex,
    index: &'a BranchIndex,
    written: &'a [BranchRecord],
}

/// Truncates, duplicates and re-attaches session logs without ever discarding bytes.
///
/// Cuts operate on the raw log bytes. Mutations hold the session's exclusive lock; reads of the
/// log and its branches hold the shared lock and never observe a half-published change.
#[derive(Debug)]
pub struct BranchManager {
    logs: SessionLogStore,
    branches: BranchStore,
    locks: SessionLocks,
}

impl BranchManager {
    pub fn new(config: &CoreConfig) -> Self {
        let branches_dir = config.branches_dir();
        Self {
            logs: SessionLogStore::new(&config.projects_dir),
            branches: BranchStore::new(&branches_dir),
            locks: SessionLocks::new(&branches_dir),
        }
    }

    pub fn logs(&self) -> &SessionLogStore {
        &self.logs
    }

    pub fn read_session(&self, identity: &SessionIdentity) -> Result<SessionSnapshot, BranchError> {
        self.logs.path_for(identity)?;
        let _guard = self.locks.acquire_shared(identity)?;
        Ok(self.logs.read_snapshot(identity)?)
    }

    /// Keeps turns `0..=turn_index`; the rest becomes a branch at `turn_index`.
    pub fn restore_to_turn(
        &self,
        identity: &SessionIdentity,
        turn_index: usize,
        expected: Option<&LogFingerprint>,
    ) -> Result<RestoreOutcome, BranchError> {
        self.logs.path_for(identity)?;
        let _guard = self.locks.acquire(identity)?;
        let log = self.logs.read_log_bytes(identity)?;
        check_fingerprint(identity, expected, &log)?;

        let cut = cut_after_turn(&log, turn_index).map_err(from_cut)?;
        if cut.removed.is_empty() {
            return Ok(RestoreOutcome {
                snapshot: SessionSnapshot::from_log(identity.clone(), &log),
                branch: None,
            });
        }

        let original_index = self.branches.load_index(identity)?;
        let record =
            self.branches
                .write_branch(identity, turn_index, BranchOrigin::Restore, cut.removed)?;
        let written = vec![record.clone()];

        let mut index = original_index.clone();
        index.insert(record.clone());
        self.commit(
            identity,
            Publish {
                read_log: &log,
                new_live: cut.kept,
                original_index: &original_index,
                index: &index,
                written: &written,
            },
        )?;

        tracing::info!(
            session = %identity,
            turn_index,
            branch_id = %record.id,
            removed_bytes = record.byte_len,
            "restored session to turn"
        );

        Ok(RestoreOutcome {
            snapshot: SessionSnapshot::from_log(identity.clone(), cut.kept),
            branch: Some(record),
        })
    }

    /// Copies the log, or its prefix through `turn_index`, into a new session of the same scope.
    pub fn duplicate_session(
        &self,
        identity: &SessionIdentity,
        turn_index: Option<usize>,
    ) -> Result<SessionIdentity, BranchError> {
        self.logs.path_for(identity)?;
        let log = {
            let _guard = self.locks.acquire_shared(identity)?;
            self.logs.read_log_bytes(identity)?
        };
        let content = match turn_index {
            Some(turn_index) => cut_after_turn(&log, turn_index).map_err(from_cut)?.kept,
            None => log.as_slice(),
        };

        let session_id = Uuid::new_v4().to_string();
        let target = SessionIdentity::new(identity.dir_name.clone(), format!("{session_id}.jsonl"));
        self.logs
            .create_log(&target, rewrite_session_id(content, &session_id))?;

        tracing::info!(source = %identity, target = %target, ?turn_index, "duplicated session");
        Ok(target)
    }

    /// Branches archived at `turn_index`, newest first.
    pub fn list_branches(
        &self,
        identity: &SessionIdentity,
        turn_index: usize,
    ) -> Result<Vec<BranchRecord>, BranchError> {
        self.logs.path_for(identity)?;
        let _guard = self.locks.acquire_shared(identity)?;
        Ok(self.branches.load_index(identity)?.at_turn(turn_index))
    }

    pub fn list_all_branches(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Vec<BranchRecord>, BranchError> {
        self.logs.path_for(identity)?;
        let _guard = self.locks.acquire_shared(identity)?;
        Ok(self.branches.load_index(identity)?.all())
    }

    pub fn read_branch(
        &self,
        identity: &SessionIdentity,
        branch_id: &str,
    ) -> Result<String, BranchError> {
        self.logs.path_for(identity)?;
        let _guard = self.locks.acquire_shared(identity)?;
        let index = self.branches.load_index(identity)?;
        if index.find(branch_id).is_none() {
            return Err(BranchError::NotFound(format!("branch {branch_id}")));
        }
        Ok(self.branches.read_branch(identity, branch_id)?)
    }

    /// Re-attaches a branch after its divergence turn, optionally only through `through_turn`.
    ///
    /// The displaced live suffix and any cut-off branch tail are archived before the swap. The
    /// source branch itself stays in the arena and the index.
    pub fn materialize_branch(
        &self,
        identity: &SessionIdentity,
        branch_id: &str,
        through_turn: Option<usize>,
        expected: Option<&LogFingerprint>,
    ) -> Result<MaterializeOutcome, BranchError> {
        self.logs.path_for(identity)?;
        let _guard = self.locks.acquire(identity)?;
        let log = self.logs.read_log_bytes(identity)?;
        check_fingerprint(identity, expected, &log)?;

        let original_index = self.branches.load_index(identity)?;
        let source = original_index
            .find(branch_id)
            .cloned()
            .ok_or_else(|| BranchError::NotFound(format!("branch {branch_id}")))?;
        let branch_log = self.branches.read_branch_bytes(identity, branch_id)?;
        let cut = cut_for_materialize(&log, &branch_log, source.turn_index, through_turn)
            .map_err(from_cut)?;

        let mut written: Vec<BranchRecord> = Vec::new();
        if !cut.displaced.is_empty() {
            written.push(self.branches.write_branch(
                identity,
                source.turn_index,
                BranchOrigin::Swap,
                &cut.displaced,
            )?);
        }
        if let Some(turn_index) = through_turn
            && !cut.remainder.is_empty()
        {
            match self.branches.write_branch(
                identity,
                turn_index,
                BranchOrigin::Remainder,
                &cut.remainder,
            ) {
                Ok(record) => written.push(record),
                Err(error) => {
                    self.discard_files(identity, &written);
                    return Err(error.into());
                }
            }
        }

        let mut index = original_index.clone();
        for record in &written {
            index.insert(record.clone());
        }
        self.commit(
            identity,
            Publish {
                read_log: &log,
                new_live: &cut.live,
                original_index: &original_index,
                index: &index,
                written: &written,
            },
        )?;

        tracing::info!(
            session = %identity,
            branch_id,
            ?through_turn,
            archived = written.len(),
            "materialized branch"
        );

        Ok(MaterializeOutcome {
            snapshot: SessionSnapshot::from_log(identity.clone(), &cut.live),
            archived: written,
            source,
        })
    }

    /// Publishes a structural change: index first, live log last. Any failure rolls back to
    /// the original index and removes freshly written branch files.
    fn commit(&self, identity: &SessionIdentity, change: Publish<'_>) -> Result<(), BranchError> {
        self.commit_with(identity, change, |_| {})
    }

    /// `commit`, running `before_swap` between publishing the index and re-reading the log.
    fn commit_with(
        &self,
        identity: &SessionIdentity,
        change: Publish<'_>,
        before_swap: impl FnOnce(&SessionLogStore),
    ) -> Result<(), BranchError> {
        if let Err(error) = self.branches.save_index(identity, change.index) {
            self.discard_files(identity, change.written);
            return Err(error.into());
        }

        before_swap(&self.logs);

        // The runtime appends without our lock; anything it wrote since the read must survive.
        let outcome = match self.logs.read_log_bytes(identity) {
            Ok(current) if current == change.read_log => self
                .logs
                .replace_log(identity, change.new_live)
                .map_err(BranchError::from),
            Ok(_) => Err(BranchError::Conflict(format!(
                "session {identity} changed during the operation"
            ))),
            Err(error) => Err(error.into()),
        };

        if let Err(error) = outcome {
            if let Err(rollback) = self.branches.save_index(identity, change.original_index) {
                tracing::warn!(session = %identity, error = %rollback, "failed to roll back branch index");
            }
            self.discard_files(identity, change.written);
            if matches!(error, BranchError::Conflict(_)) {
                tracing::warn!(session = %identity, "structural change aborted by concurrent write");
            }
            return Err(error);
        }
        Ok(())
    }

    fn discard_files(&self, identity: &SessionIdentity, written: &[BranchRecord]) {
        for record in written {
            if let Err(error) = self.branches.remove_branch_file(identity, &record.id) {
                tracing::warn!(session = %identity, branch_id = %record.id, %error, "failed to remove orphan branch file");
            }
        }
    }
}

fn check_fingerprint(
    identity: &SessionIdentity,
    expected: Option<&LogFingerprint>,
    log: &[u8],
) -> Result<(), BranchError> {
    match expected {
        Some(fingerprint) if !fingerprint.is_prefix_of(log) => {
            tracing::warn!(session = %identity, "session log changed since it was read");
            Err(BranchError::Conflict(format!(
                "session {identity} changed since it was read"
            )))
        }
        _ => Ok(()),
    }
}

/// Points every parseable line at `session_id`; other lines are copied byte for byte.
fn rewrite_session_id(log: &[u8], session_id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(log.len());
    for line in log.split_inclusive(|&b| b == b'\n') {
        let body_len = line
            .iter()
            .rposition(|&b| b != b'\n' && b != b'\r')
            .map_or(0, |i| i + 1);
        let (body, ending) = line.split_at(body_len);
        let rewritten = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(mut object)) if object.get("sessionId").is_some_and(Value::is_string) => {
                object.insert("sessionId".to_string(), Value::String(session_id.to_string()));
                Some(Value::Object(object).to_string())
            }
            _ => None,
        };
        match rewritten {
            Some(body) => {
                out.extend_from_slice(body.as_bytes());
                out.extend_from_slice(ending);
            }
            None => out.extend_from_slice(line),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{count_turns, parse_events, segment};
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    fn session_text(prompts: &[&str]) -> String {
        prompts
            .iter()
            .flat_map(|p| {
                [
                    json!({ "type": "user", "sessionId": "orig", "message": { "content": p } }),
                    json!({ "type": "assistant", "sessionId": "orig", "message": {
                        "stop_reason": "end_turn",
                        "content": [{ "type": "text", "text": format!("re: {p}") }]
                    } }),
                ]
            })
            .map(|v| format!("{v}\n"))
            .collect()
    }

    fn setup(text: &str) -> (TempDir, BranchManager, SessionIdentity) {
        let dir = tempdir().expect("tempdir");
        let config = CoreConfig::new(dir.path().join("projects"), dir.path().join("state"));
        let manager = BranchManager::new(&config);
        let identity = SessionIdentity::new("-tmp-project", "orig.jsonl");
        manager.logs().create_log(&identity, text).expect("seed");
        (dir, manager, identity)
    }

    fn live_prompts(manager: &BranchManager, identity: &SessionIdentity) -> Vec<String> {
        let text = manager.logs().read_log(identity).expect("read");
        segment(&parse_events(&text))
            .iter()
            .filter_map(|turn| turn.prompt_text())
            .collect()
    }

    #[test]
    fn restore_keeps_prefix_and_archives_suffix() {
        let original = session_text(&["t0", "t1", "t2", "t3", "t4"]);
        let (_dir, manager, id) = setup(&original);

        let outcome = manager.restore_to_turn(&id, 2, None).expect("restore");
        let live = manager.logs().read_log(&id).expect("read");
        assert_eq!(count_turns(&live), 3);
        assert!(original.starts_with(&live));
        assert_eq!(outcome.snapshot.text, live);

        let branches = manager.list_branches(&id, 2).expect("list");
        assert_eq!(branches.len(), 1);
        let branch = outcome.branch.expect("branch");
        assert_eq!(branches[0], branch);
        assert_eq!(branch.turn_count, 2);
        assert_eq!(branch.origin, BranchOrigin::Restore);

        let archived = manager.read_branch(&id, &branch.id).expect("branch text");
        assert_eq!(format!("{live}{archived}"), original);
        assert_eq!(live_prompts(&manager, &id), vec!["t0", "t1", "t2"]);
    }

    #[test]
    fn restore_to_last_turn_changes_nothing() {
        let original = session_text(&["t0", "t1"]);
        let (_dir, manager, id) = setup(&original);
        let outcome = manager.restore_to_turn(&id, 1, None).expect("restore");
        assert!(outcome.branch.is_none());
        assert_eq!(manager.logs().read_log(&id).expect("read"), original);
        assert!(manager.list_all_branches(&id).expect("list").is_empty());
    }

    #[test]
    fn restore_out_of_range_is_not_found() {
        let original = session_text(&["t0", "t1"]);
        let (_dir, manager, id) = setup(&original);
        let error = manager.restore_to_turn(&id, 2, None).expect_err("error");
        assert_eq!(error.kind(), ErrorKind::NotFound);
        assert_eq!(manager.logs().read_log(&id).expect("read"), original);

        let missing = SessionIdentity::new("-tmp-project", "missing.jsonl");
        let error = manager.restore_to_turn(&missing, 0, None).expect_err("error");
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn stale_fingerprint_is_a_conflict() {
        let original = session_text(&["t0", "t1", "t2"]);
        let (_dir, manager, id) = setup(&original);
        let snapshot = manager.read_session(&id).expect("read");

        manager.restore_to_turn(&id, 1, None).expect("first restore");
        let error = manager
            .restore_to_turn(&id, 0, Some(&snapshot.fingerprint))
            .expect_err("conflict");
        assert_eq!(error.kind(), ErrorKind::Conflict);
        assert_eq!(count_turns(&manager.logs().read_log(&id).expect("read")), 2);
        assert_eq!(manager.list_all_branches(&id).expect("list").len(), 1);
    }

    #[test]
    fn appends_after_read_are_archived_not_rejected() {
        let original = session_text(&["t0", "t1"]);
        let (dir, manager, id) = setup(&original);
        let snapshot = manager.read_session(&id).expect("read");

        let appended = format!("{original}{}", session_text(&["t2"]));
        let path = dir.path().join("projects").join(&id.dir_name).join(&id.file_name);
        fs::write(&path, &appended).expect("append");

        let outcome = manager
            .restore_to_turn(&id, 0, Some(&snapshot.fingerprint))
            .expect("restore");
        let branch = outcome.branch.expect("branch");
        assert_eq!(branch.turn_count, 2);
        let archived = manager.read_branch(&id, &branch.id).expect("read");
        assert_eq!(format!("{}{archived}", outcome.snapshot.text), appended);
    }

    #[test]
    fn duplicate_copies_prefix_into_new_identity() {
        let original = session_text(&["t0", "t1", "t2"]);
        let (_dir, manager, id) = setup(&original);

        let full = manager.duplicate_session(&id, None).expect("dup");
        let partial = manager.duplicate_session(&id, Some(0)).expect("branch");
        assert_ne!(full, id);
        assert_eq!(full.dir_name, id.dir_name);
        assert_ne!(full, partial);

        let full_text = manager.logs().read_log(&full).expect("full");
        assert_eq!(count_turns(&full_text), 3);
        let partial_text = manager.logs().read_log(&partial).expect("partial");
        assert_eq!(count_turns(&partial_text), 1);
        for event in parse_events(&partial_text) {
            assert_eq!(
                event.value().get("sessionId").and_then(|v| v.as_str()),
                Some(partial.session_id())
            );
        }

        assert_eq!(manager.logs().read_log(&id).expect("source"), original);
        assert!(manager.list_all_branches(&id).expect("list").is_empty());
        assert_eq!(
            manager.duplicate_session(&id, Some(9)).expect_err("range").kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn materialize_swaps_and_archives_live_suffix() {
        let original = session_text(&["t0", "t1", "t2", "t3"]);
        let (_dir, manager, id) = setup(&original);
        let restored = manager.restore_to_turn(&id, 1, None).expect("restore");
        let branch = restored.branch.expect("branch");

        // The runtime continues the conversation differently after the restore.
        let diverged = format!("{}{}", restored.snapshot.text, session_text(&["x2"]));
        manager.logs().replace_log(&id, &diverged).expect("diverge");

        let outcome = manager
            .materialize_branch(&id, &branch.id, None, None)
            .expect("materialize");
        assert_eq!(manager.logs().read_log(&id).expect("read"), original);
        assert_eq!(outcome.source, branch);
        assert_eq!(outcome.archived.len(), 1);
        assert_eq!(outcome.archived[0].origin, BranchOrigin::Swap);
        assert_eq!(outcome.archived[0].turn_index, 1);

        let at_one = manager.list_branches(&id, 1).expect("list");
        assert_eq!(at_one.len(), 2);
        assert_eq!(at_one[0], outcome.archived[0]);
        assert_eq!(at_one[1], branch);
        assert_eq!(
            manager.read_branch(&id, &at_one[0].id).expect("read"),
            session_text(&["x2"])
        );
        assert_eq!(
            manager.read_branch(&id, &branch.id).expect("source kept"),
            session_text(&["t2", "t3"])
        );
    }

    #[test]
    fn materialize_through_turn_archives_remainder() {
        let original = session_text(&["t0", "t1", "t2", "t3"]);
        let (_dir, manager, id) = setup(&original);
        let branch = manager
            .restore_to_turn(&id, 0, None)
            .expect("restore")
            .branch
            .expect("branch");

        let outcome = manager
            .materialize_branch(&id, &branch.id, Some(2), None)
            .expect("materialize");
        assert_eq!(live_prompts(&manager, &id), vec!["t0", "t1", "t2"]);
        assert_eq!(outcome.archived.len(), 1);
        assert_eq!(outcome.archived[0].origin, BranchOrigin::Remainder);
        assert_eq!(outcome.archived[0].turn_index, 2);

        let live = manager.logs().read_log(&id).expect("live");
        let rest = manager
            .read_branch(&id, &outcome.archived[0].id)
            .expect("rest");
        assert_eq!(format!("{live}{rest}"), original);
    }

    #[test]
    fn materialize_then_restore_is_a_noop_on_turns() {
        let original = session_text(&["t0", "t1", "t2"]);
        let (_dir, manager, id) = setup(&original);
        let branch = manager
            .restore_to_turn(&id, 0, None)
            .expect("restore")
            .branch
            .expect("branch");
        let before = live_prompts(&manager, &id);

        manager
            .materialize_branch(&id, &branch.id, None, None)
            .expect("materialize");
        manager.restore_to_turn(&id, 0, None).expect("restore again");

        assert_eq!(live_prompts(&manager, &id), before);
        let ids: Vec<String> = manager
            .list_branches(&id, 0)
            .expect("list")
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1], branch.id);
        assert_eq!(
            manager.read_branch(&id, &ids[0]).expect("new"),
            manager.read_branch(&id, &ids[1]).expect("source")
        );
    }

    #[test]
    fn materialize_unknown_branch_is_not_found() {
        let original = session_text(&["t0"]);
        let (_dir, manager, id) = setup(&original);
        let error = manager
            .materialize_branch(&id, "0190aaaa-0000-7000-8000-000000000000", None, None)
            .expect_err("error");
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn materialize_without_divergence_turn_is_a_conflict() {
        let original = session_text(&["t0", "t1", "t2"]);
        let (_dir, manager, id) = setup(&original);
        let branch = manager
            .restore_to_turn(&id, 1, None)
            .expect("restore")
            .branch
            .expect("branch");
        manager.restore_to_turn(&id, 0, None).expect("shrink");

        let error = manager
            .materialize_branch(&id, &branch.id, None, None)
            .expect_err("conflict");
        assert_eq!(error.kind(), ErrorKind::Conflict);
        assert!(manager.read_branch(&id, &branch.id).is_ok());
    }

    #[test]
    fn rewrites_session_ids_but_keeps_malformed_lines() {
        let log: &[u8] = b"{\"sessionId\":\"a\",\"type\":\"user\"}\r\n{torn\n{\"type\":\"summary\"}\n\xe2\x82";
        let out = rewrite_session_id(log, "b");
        let lines: Vec<&[u8]> = out.split_inclusive(|&b| b == b'\n').collect();
        assert_eq!(lines.len(), 4);
        assert!(String::from_utf8_lossy(lines[0]).contains("\"sessionId\":\"b\""));
        assert!(lines[0].ends_with(b"\r\n"));
        assert_eq!(lines[1], b"{torn\n");
        assert_eq!(lines[2], b"{\"type\":\"summary\"}\n");
        assert_eq!(lines[3], b"\xe2\x82");
    }

    #[test]
    fn restore_archives_undecodable_bytes_unaltered() {
        let mut original = b"{\"type\":\"summary\",\"summary\":\"caf\xe9\"}\n".to_vec();
        original.extend_from_slice(session_text(&["t0", "t1"]).as_bytes());
        original.extend_from_slice(b"{\"type\":\"assistant\",\"partial\":\"\xe2\x82");
        let (_dir, manager, id) = setup("");
        manager.logs().replace_log(&id, &original).expect("seed");

        let snapshot = manager.read_session(&id).expect("read");
        assert_eq!(snapshot.fingerprint, LogFingerprint::of(&original));
        let outcome = manager
            .restore_to_turn(&id, 0, Some(&snapshot.fingerprint))
            .expect("restore");
        let branch = outcome.branch.expect("branch");

        let live = manager.logs().read_log_bytes(&id).expect("live");
        let archived = manager
            .branches
            .read_branch_bytes(&id, &branch.id)
            .expect("archived");
        assert_eq!(branch.byte_len, archived.len() as u64);
        assert_eq!([live.as_slice(), archived.as_slice()].concat(), original);
        assert!(archived.ends_with(b"\xe2\x82"));
        assert_eq!(outcome.snapshot.fingerprint, LogFingerprint::of(&live));

        manager
            .materialize_branch(&id, &branch.id, None, None)
            .expect("materialize");
        assert_eq!(manager.logs().read_log_bytes(&id).expect("back"), original);
    }

    #[test]
    fn log_changed_before_swap_is_a_conflict_and_rolls_back() {
        let original = session_text(&["t0", "t1", "t2"]);
        let (dir, manager, id) = setup(&original);
        let earlier = manager
            .restore_to_turn(&id, 1, None)
            .expect("restore")
            .branch
            .expect("branch");

        let read = manager.logs().read_log_bytes(&id).expect("read");
        let cut = cut_after_turn(&read, 0).expect("cut");
        let original_index = manager.branches.load_index(&id).expect("index");
        let record = manager
            .branches
            .write_branch(&id, 0, BranchOrigin::Restore, cut.removed)
            .expect("write");
        let mut index = original_index.clone();
        index.insert(record.clone());
        let written = vec![record.clone()];

        let appended = [read.as_slice(), session_text(&["late"]).as_bytes()].concat();
        let error = manager
            .commit_with(
                &id,
                Publish {
                    read_log: &read,
                    new_live: cut.kept,
                    original_index: &original_index,
                    index: &index,
                    written: &written,
                },
                |logs| logs.replace_log(&id, &appended).expect("concurrent append"),
            )
            .expect_err("conflict");

        assert_eq!(error.kind(), ErrorKind::Conflict);
        assert_eq!(manager.logs().read_log_bytes(&id).expect("live"), appended);
        assert_eq!(manager.branches.load_index(&id).expect("index"), original_index);
        assert_eq!(manager.list_all_branches(&id).expect("list"), vec![earlier.clone()]);

        let arena = dir
            .path()
            .join("state")
            .join("branches")
            .join(&id.dir_name)
            .join(&id.file_name);
        let mut files: Vec<String> = fs::read_dir(&arena)
            .expect("arena")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        let mut expected = vec!["index.json".to_string(), format!("{}.jsonl", earlier.id)];
        expected.sort();
        assert_eq!(files, expected);
    }

    #[test]
    fn branch_files_live_under_state_dir() {
        let original = session_text(&["t0", "t1"]);
        let (dir, manager, id) = setup(&original);
        let branch = manager
            .restore_to_turn(&id, 0, None)
            .expect("restore")
            .branch
            .expect("branch");
        let path: &Path = &dir
            .path()
            .join("state")
            .join("branches")
            .join(&id.dir_name)
            .join(&id.file_name)
            .join(format!("{}.jsonl", branch.id));
        assert!(path.is_file());
    }
}
