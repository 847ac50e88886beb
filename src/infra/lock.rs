use crate::domain::SessionIdentity;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to lock {path}: {source}")]
    Acquire {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Holders {
    Readers(usize),
    Writer,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct Held {
    sessions: Mutex<HashMap<SessionIdentity, Holders>>,
    released: Condvar,
}

impl Held {
    fn release(&self, identity: &SessionIdentity) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(identity).copied() {
            Some(Holders::Readers(count)) if count > 1 => {
                sessions.insert(identity.clone(), Holders::Readers(count - 1));
            }
            _ => {
                sessions.remove(identity);
            }
        }
        self.released.notify_all();
    }
}

/// Per-session reader/writer locks, in-process and across processes.
///
/// Structural mutations hold the exclusive lock from their first read to the live-log swap;
/// readers of the log and its branches hold the shared lock, so they never see a half-applied
/// mutation.
#[derive(Debug)]
pub struct SessionLocks {
    root: PathBuf,
    held: Arc<Held>,
}

/// Releases both the in-process and the file lock on drop.
#[derive(Debug)]
pub struct SessionLockGuard {
    identity: SessionIdentity,
    held: Arc<Held>,
    _file: File,
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        self.held.release(&self.identity);
    }
}

impl SessionLocks {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            held: Arc::new(Held::default()),
        }
    }

    pub fn lock_path(&self, identity: &SessionIdentity) -> PathBuf {
        self.root
            .join(&identity.dir_name)
            .join(format!("{}.lock", identity.file_name))
    }

    /// Blocks until every other holder, in this process or another, has released the session.
    pub fn acquire(&self, identity: &SessionIdentity) -> Result<SessionLockGuard, LockError> {
        self.lock(identity, LockMode::Exclusive)
    }

    /// Blocks only while a mutation holds the session.
    pub fn acquire_shared(&self, identity: &SessionIdentity) -> Result<SessionLockGuard, LockError> {
        self.lock(identity, LockMode::Shared)
    }

    fn lock(&self, identity: &SessionIdentity, mode: LockMode) -> Result<SessionLockGuard, LockError> {
        {
            let mut sessions = self
                .held
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            loop {
                match (mode, sessions.get(identity).copied()) {
                    (_, None) | (LockMode::Shared, Some(Holders::Readers(_))) => break,
                    _ => {
                        sessions = self
                            .held
                            .released
                            .wait(sessions)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
            let holders = match (mode, sessions.get(identity).copied()) {
                (LockMode::Shared, Some(Holders::Readers(count))) => Holders::Readers(count + 1),
                (LockMode::Shared, _) => Holders::Readers(1),
                (LockMode::Exclusive, _) => Holders::Writer,
            };
            sessions.insert(identity.clone(), holders);
        }

        let path = self.lock_path(identity);
        let file = match open_lock_file(&path) {
            Ok(file) => file,
            Err(error) => {
                self.held.release(identity);
                return Err(error);
            }
        };
        let locked = match mode {
            LockMode::Shared => file.lock_shared(),
            LockMode::Exclusive => file.lock_exclusive(),
        };
        if let Err(source) = locked {
            self.held.release(identity);
            return Err(LockError::Acquire { path, source });
        }

        Ok(SessionLockGuard {
            identity: identity.clone(),
            held: Arc::clone(&self.held),
            _file: file,
        })
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })
}
