use crate::domain::{
    BranchRecord, ErrorBody, ErrorKind, Event, LogFingerprint, SessionIdentity, SessionStatus,
    Turn, derive_status, parse_events, segment_turns,
};
use crate::infra::{BranchError, BranchManager, SessionSnapshot};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Unavailable(_) => ErrorKind::Unavailable,
        }
    }
}

impl From<BranchError> for ApiError {
    fn from(error: BranchError) -> Self {
        let message = error.to_string();
        match error.kind() {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::Conflict => Self::Conflict(message),
            ErrorKind::Storage => Self::Storage(message),
            ErrorKind::Unavailable => Self::Unavailable(message),
        }
    }
}

impl From<ErrorBody> for ApiError {
    fn from(body: ErrorBody) -> Self {
        match body.kind {
            ErrorKind::NotFound => Self::NotFound(body.message),
            ErrorKind::Conflict => Self::Conflict(body.message),
            ErrorKind::Storage => Self::Storage(body.message),
            ErrorKind::Unavailable => Self::Unavailable(body.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("no session is open")]
    NoActiveSession,

    #[error("result arrived for a session or request that is no longer current")]
    Stale,

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Operations the controller needs from whatever stores the logs.
pub trait BranchApi {
    fn read_session(&self, identity: &SessionIdentity) -> Result<SessionSnapshot, ApiError>;

    fn restore_to_turn(
        &self,
        identity: &SessionIdentity,
        turn_index: usize,
        expected: Option<&LogFingerprint>,
    ) -> Result<SessionSnapshot, ApiError>;

    fn materialize_branch(
        &self,
        identity: &SessionIdentity,
        branch_id: &str,
        through_turn: Option<usize>,
        expected: Option<&LogFingerprint>,
    ) -> Result<SessionSnapshot, ApiError>;

    fn list_branches(
        &self,
        identity: &SessionIdentity,
        turn_index: usize,
    ) -> Result<Vec<BranchRecord>, ApiError>;
}

impl BranchApi for BranchManager {
    fn read_session(&self, identity: &SessionIdentity) -> Result<SessionSnapshot, ApiError> {
        Ok(BranchManager::read_session(self, identity)?)
    }

    fn restore_to_turn(
        &self,
        identity: &SessionIdentity,
        turn_index: usize,
        expected: Option<&LogFingerprint>,
    ) -> Result<SessionSnapshot, ApiError> {
        Ok(BranchManager::restore_to_turn(self, identity, turn_index, expected)?.snapshot)
    }

    fn materialize_branch(
        &self,
        identity: &SessionIdentity,
        branch_id: &str,
        through_turn: Option<usize>,
        expected: Option<&LogFingerprint>,
    ) -> Result<SessionSnapshot, ApiError> {
        Ok(
            BranchManager::materialize_branch(self, identity, branch_id, through_turn, expected)?
                .snapshot,
        )
    }

    fn list_branches(
        &self,
        identity: &SessionIdentity,
        turn_index: usize,
    ) -> Result<Vec<BranchRecord>, ApiError> {
        Ok(BranchManager::list_branches(self, identity, turn_index)?)
    }
}

impl<T: BranchApi + ?Sized> BranchApi for Arc<T> {
    fn read_session(&self, identity: &SessionIdentity) -> Result<SessionSnapshot, ApiError> {
        (**self).read_session(identity)
    }

    fn restore_to_turn(
        &self,
        identity: &SessionIdentity,
        turn_index: usize,
        expected: Option<&LogFingerprint>,
    ) -> Result<SessionSnapshot, ApiError> {
        (**self).restore_to_turn(identity, turn_index, expected)
    }

    fn materialize_branch(
        &self,
        identity: &SessionIdentity,
        branch_id: &str,
        through_turn: Option<usize>,
        expected: Option<&LogFingerprint>,
    ) -> Result<SessionSnapshot, ApiError> {
        (**self).materialize_branch(identity, branch_id, through_turn, expected)
    }

    fn list_branches(
        &self,
        identity: &SessionIdentity,
        turn_index: usize,
    ) -> Result<Vec<BranchRecord>, ApiError> {
        (**self).list_branches(identity, turn_index)
    }
}

/// A session as the client currently shows it.
#[derive(Clone, Debug)]
pub struct SessionView {
    pub identity: SessionIdentity,
    pub fingerprint: LogFingerprint,
    pub events: Vec<Event>,
    pub turns: Vec<Turn>,
    pub status: SessionStatus,
}

impl SessionView {
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let events = parse_events(&snapshot.text);
        let turns = segment_turns(&events, snapshot.text.len());
        let status = derive_status(&events);
        Self {
            identity: snapshot.identity,
            fingerprint: snapshot.fingerprint,
            events,
            turns,
            status,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MutationKind {
    Restore {
        turn_index: usize,
    },
    SwitchBranch {
        branch_id: String,
        through_turn: Option<usize>,
    },
}

/// A mutation captured against one loaded view; safe to run off the controller's thread.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingMutation {
    identity: SessionIdentity,
    generation: u64,
    fingerprint: LogFingerprint,
    kind: MutationKind,
}

impl PendingMutation {
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn execute<A: BranchApi + ?Sized>(&self, api: &A) -> Result<SessionSnapshot, ApiError> {
        match &self.kind {
            MutationKind::Restore { turn_index } => {
                api.restore_to_turn(&self.identity, *turn_index, Some(&self.fingerprint))
            }
            MutationKind::SwitchBranch {
                branch_id,
                through_turn,
            } => api.materialize_branch(
                &self.identity,
                branch_id,
                *through_turn,
                Some(&self.fingerprint),
            ),
        }
    }
}

/// Drives restore and branch switching for the active session.
///
/// After any structural change the view is rebuilt from a fresh read, never patched.
#[derive(Debug)]
pub struct UndoRedoController<A> {
    api: A,
    active: Option<SessionIdentity>,
    view: Option<SessionView>,
    branch_cache: BTreeMap<usize, Vec<BranchRecord>>,
    generation: u64,
}

impl<A: BranchApi> UndoRedoController<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            active: None,
            view: None,
            branch_cache: BTreeMap::new(),
            generation: 0,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn active(&self) -> Option<&SessionIdentity> {
        self.active.as_ref()
    }

    pub fn view(&self) -> Option<&SessionView> {
        self.view.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn open(&mut self, identity: SessionIdentity) -> Result<&SessionView, ControllerError> {
        self.generation += 1;
        self.active = Some(identity);
        self.view = None;
        self.branch_cache.clear();
        self.reload()
    }

    pub fn reload(&mut self) -> Result<&SessionView, ControllerError> {
        let identity = self.active.clone().ok_or(ControllerError::NoActiveSession)?;
        let snapshot = self
            .api
            .read_session(&identity)
            .map_err(|error| report("read", &identity, error))?;
        Ok(self.view.insert(SessionView::from_snapshot(snapshot)))
    }

    pub fn request_restore(&mut self, turn_index: usize) -> Result<&SessionView, ControllerError> {
        let pending = self.begin(MutationKind::Restore { turn_index })?;
        let result = pending.execute(&self.api);
        self.complete(pending, result)
    }

    pub fn request_branch_switch(
        &mut self,
        branch_id: &str,
        through_turn: Option<usize>,
    ) -> Result<&SessionView, ControllerError> {
        let pending = self.begin(MutationKind::SwitchBranch {
            branch_id: branch_id.to_string(),
            through_turn,
        })?;
        let result = pending.execute(&self.api);
        self.complete(pending, result)
    }

    /// `None` until [`Self::refresh_branches`] has fetched that turn.
    pub fn branches_at_turn(&self, turn_index: usize) -> Option<&[BranchRecord]> {
        self.branch_cache.get(&turn_index).map(Vec::as_slice)
    }

    pub fn refresh_branches(&mut self, turn_index: usize) -> Result<&[BranchRecord], ControllerError> {
        let identity = self.active.clone().ok_or(ControllerError::NoActiveSession)?;
        let branches = self
            .api
            .list_branches(&identity, turn_index)
            .map_err(|error| report("list branches", &identity, error))?;
        let slot = self.branch_cache.entry(turn_index).or_default();
        *slot = branches;
        Ok(slot)
    }

    /// Captures the loaded view for a mutation. Supersedes any mutation begun earlier.
    pub fn begin(&mut self, kind: MutationKind) -> Result<PendingMutation, ControllerError> {
        let view = self.view.as_ref().ok_or(ControllerError::NoActiveSession)?;
        self.generation += 1;
        Ok(PendingMutation {
            identity: view.identity.clone(),
            generation: self.generation,
            fingerprint: view.fingerprint.clone(),
            kind,
        })
    }

    pub fn complete(
        &mut self,
        pending: PendingMutation,
        result: Result<SessionSnapshot, ApiError>,
    ) -> Result<&SessionView, ControllerError> {
        if self.active.as_ref() != Some(&pending.identity) || self.generation != pending.generation
        {
            tracing::debug!(session = %pending.identity, generation = pending.generation, "discarding stale mutation result");
            return Err(ControllerError::Stale);
        }

        if let Err(error) = result {
            return Err(report("mutation", &pending.identity, error));
        }
        self.branch_cache.clear();
        self.reload()
    }
}

fn report(operation: &str, identity: &SessionIdentity, error: ApiError) -> ControllerError {
    tracing::warn!(session = %identity, operation, %error, "branch api call failed");
    ControllerError::Api(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BranchOrigin, StatusKind, cut_after_turn};
    use crate::infra::CoreConfig;
    use serde_json::json;
    use std::cell::RefCell;
    use tempfile::tempdir;

    fn transcript(prompts: &[&str]) -> String {
        prompts
            .iter()
            .flat_map(|p| {
                [
                    json!({ "type": "user", "message": { "content": p } }),
                    json!({ "type": "assistant", "message": {
                        "stop_reason": "end_turn",
                        "content": [{ "type": "text", "text": "ok" }]
                    } }),
                ]
            })
            .map(|v| format!("{v}\n"))
            .collect()
    }

    #[derive(Default)]
    struct FakeApi {
        logs: RefCell<BTreeMap<SessionIdentity, String>>,
        branches: Vec<BranchRecord>,
        fail_with: Option<ApiError>,
        seen_fingerprints: RefCell<Vec<Option<LogFingerprint>>>,
    }

    impl FakeApi {
        fn with(identity: &SessionIdentity, text: &str) -> Self {
            let api = Self::default();
            api.logs
                .borrow_mut()
                .insert(identity.clone(), text.to_string());
            api
        }
    }

    impl BranchApi for FakeApi {
        fn read_session(&self, identity: &SessionIdentity) -> Result<SessionSnapshot, ApiError> {
            let logs = self.logs.borrow();
            let text = logs
                .get(identity)
                .ok_or_else(|| ApiError::NotFound(identity.to_string()))?;
            Ok(SessionSnapshot::new(identity.clone(), text.clone()))
        }

        fn restore_to_turn(
            &self,
            identity: &SessionIdentity,
            turn_index: usize,
            expected: Option<&LogFingerprint>,
        ) -> Result<SessionSnapshot, ApiError> {
            self.seen_fingerprints.borrow_mut().push(expected.cloned());
            if let Some(error) = &self.fail_with {
                return Err(error.clone());
            }
            let mut logs = self.logs.borrow_mut();
            let text = logs
                .get_mut(identity)
                .ok_or_else(|| ApiError::NotFound(identity.to_string()))?;
            let cut = cut_after_turn(text.as_bytes(), turn_index)
                .map_err(|error| ApiError::NotFound(error.to_string()))?;
            let kept = String::from_utf8_lossy(cut.kept).into_owned();
            *text = kept.clone();
            Ok(SessionSnapshot::new(identity.clone(), kept))
        }

        fn materialize_branch(
            &self,
            _identity: &SessionIdentity,
            branch_id: &str,
            _through_turn: Option<usize>,
            _expected: Option<&LogFingerprint>,
        ) -> Result<SessionSnapshot, ApiError> {
            Err(ApiError::Unavailable(format!("cannot switch to {branch_id}")))
        }

        fn list_branches(
            &self,
            _identity: &SessionIdentity,
            turn_index: usize,
        ) -> Result<Vec<BranchRecord>, ApiError> {
            Ok(self
                .branches
                .iter()
                .filter(|b| b.turn_index == turn_index)
                .cloned()
                .collect())
        }
    }

    fn record(id: &str, turn_index: usize) -> BranchRecord {
        BranchRecord {
            id: id.to_string(),
            turn_index,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            origin: BranchOrigin::Restore,
            byte_len: 1,
            turn_count: 1,
            sha256: String::new(),
            preview: None,
        }
    }

    fn id(name: &str) -> SessionIdentity {
        SessionIdentity::new("scope", format!("{name}.jsonl"))
    }

    #[test]
    fn open_builds_the_view() {
        let api = FakeApi::with(&id("a"), &transcript(&["one", "two"]));
        let mut controller = UndoRedoController::new(api);
        let view = controller.open(id("a")).expect("open");
        assert_eq!(view.turns.len(), 2);
        assert_eq!(view.status.status, StatusKind::Completed);
        assert_eq!(controller.active(), Some(&id("a")));
    }

    #[test]
    fn restore_sends_loaded_fingerprint_and_reloads() {
        let text = transcript(&["one", "two", "three"]);
        let api = FakeApi::with(&id("a"), &text);
        let mut controller = UndoRedoController::new(api);
        controller.open(id("a")).expect("open");

        let view = controller.request_restore(0).expect("restore");
        assert_eq!(view.turns.len(), 1);
        assert_eq!(
            controller.api().seen_fingerprints.borrow().as_slice(),
            &[Some(LogFingerprint::of(&text))]
        );
    }

    #[test]
    fn results_for_a_previous_session_are_stale() {
        let api = FakeApi::with(&id("a"), &transcript(&["one", "two"]));
        api.logs
            .borrow_mut()
            .insert(id("b"), transcript(&["other"]));
        let mut controller = UndoRedoController::new(api);
        controller.open(id("a")).expect("open a");

        let pending = controller
            .begin(MutationKind::Restore { turn_index: 0 })
            .expect("begin");
        controller.open(id("b")).expect("open b");
        let result = pending.execute(controller.api());

        assert!(matches!(
            controller.complete(pending, result),
            Err(ControllerError::Stale)
        ));
        let view = controller.view().expect("view");
        assert_eq!(view.identity, id("b"));
        assert_eq!(view.turns.len(), 1);
    }

    #[test]
    fn a_newer_request_supersedes_an_older_one() {
        let api = FakeApi::with(&id("a"), &transcript(&["one", "two", "three"]));
        let mut controller = UndoRedoController::new(api);
        controller.open(id("a")).expect("open");

        let first = controller
            .begin(MutationKind::Restore { turn_index: 1 })
            .expect("first");
        let second = controller
            .begin(MutationKind::Restore { turn_index: 0 })
            .expect("second");
        let second_result = second.execute(controller.api());
        let first_result = first.execute(controller.api());

        assert!(controller.complete(second, second_result).is_ok());
        assert!(matches!(
            controller.complete(first, first_result),
            Err(ControllerError::Stale)
        ));
    }

    #[test]
    fn failures_leave_the_view_untouched() {
        let text = transcript(&["one", "two"]);
        let mut api = FakeApi::with(&id("a"), &text);
        api.fail_with = Some(ApiError::Conflict("changed".to_string()));
        let mut controller = UndoRedoController::new(api);
        controller.open(id("a")).expect("open");

        let error = controller.request_restore(0).expect_err("conflict");
        assert!(matches!(error, ControllerError::Api(ApiError::Conflict(_))));
        assert_eq!(controller.view().expect("view").turns.len(), 2);

        let error = controller
            .request_branch_switch("b1", None)
            .expect_err("unavailable");
        assert!(matches!(
            error,
            ControllerError::Api(ref e) if e.kind() == ErrorKind::Unavailable
        ));
        assert_eq!(
            controller.view().expect("view").fingerprint,
            LogFingerprint::of(&text)
        );
    }

    #[test]
    fn branch_cache_is_filled_on_demand_and_cleared_by_mutations() {
        let mut api = FakeApi::with(&id("a"), &transcript(&["one", "two"]));
        api.branches = vec![record("b1", 0), record("b2", 1)];
        let mut controller = UndoRedoController::new(api);
        controller.open(id("a")).expect("open");

        assert!(controller.branches_at_turn(0).is_none());
        assert_eq!(controller.refresh_branches(0).expect("refresh").len(), 1);
        assert_eq!(controller.branches_at_turn(0).map(<[_]>::len), Some(1));

        controller.request_restore(1).expect("restore");
        assert!(controller.branches_at_turn(0).is_none());
    }

    #[test]
    fn nothing_open_is_an_error() {
        let mut controller = UndoRedoController::new(FakeApi::default());
        assert!(matches!(
            controller.request_restore(0),
            Err(ControllerError::NoActiveSession)
        ));
        assert!(matches!(
            controller.refresh_branches(0),
            Err(ControllerError::NoActiveSession)
        ));
    }

    #[test]
    fn undo_and_redo_against_disk() {
        let dir = tempdir().expect("tempdir");
        let config = CoreConfig::new(dir.path().join("projects"), dir.path().join("state"));
        let manager = Arc::new(BranchManager::new(&config));
        let text = transcript(&["one", "two", "three"]);
        manager.logs().create_log(&id("a"), &text).expect("seed");

        let mut controller = UndoRedoController::new(Arc::clone(&manager));
        controller.open(id("a")).expect("open");
        assert_eq!(controller.request_restore(0).expect("undo").turns.len(), 1);

        let branch_id = controller.refresh_branches(0).expect("branches")[0].id.clone();
        let view = controller
            .request_branch_switch(&branch_id, None)
            .expect("redo");
        assert_eq!(view.turns.len(), 3);
        assert_eq!(manager.logs().read_log(&id("a")).expect("read"), text);
        assert_eq!(controller.refresh_branches(0).expect("kept")[0].id, branch_id);
    }
}
