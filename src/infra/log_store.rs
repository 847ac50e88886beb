use crate::domain::{LogFingerprint, SessionIdentity};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("invalid session identity: {0}")]
    InvalidIdentity(SessionIdentity),

    #[error("session log not found: {0}")]
    NotFound(SessionIdentity),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A log as read at one moment, plus the fingerprint mutations must present.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionSnapshot {
    pub identity: SessionIdentity,
    pub text: String,
    pub fingerprint: LogFingerprint,
}

impl SessionSnapshot {
    pub fn new(identity: SessionIdentity, text: String) -> Self {
        let fingerprint = LogFingerprint::of(&text);
        Self {
            identity,
            text,
            fingerprint,
        }
    }

    /// Fingerprints the raw bytes; `text` is their lossy UTF-8 view.
    pub fn from_log(identity: SessionIdentity, log: &[u8]) -> Self {
        Self {
            identity,
            text: String::from_utf8_lossy(log).into_owned(),
            fingerprint: LogFingerprint::of(log),
        }
    }
}

/// Read/replace access to live session logs under a projects root.
#[derive(Clone, Debug)]
pub struct SessionLogStore {
    projects_dir: PathBuf,
}

impl SessionLogStore {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    pub fn path_for(&self, identity: &SessionIdentity) -> Result<PathBuf, LogStoreError> {
        if !identity.is_well_formed() {
            return Err(LogStoreError::InvalidIdentity(identity.clone()));
        }
        Ok(self
            .projects_dir
            .join(&identity.dir_name)
            .join(&identity.file_name))
    }

    pub fn exists(&self, identity: &SessionIdentity) -> bool {
        self.path_for(identity).is_ok_and(|path| path.is_file())
    }

    /// Lossy UTF-8 view of the log; a torn multi-byte tail shows as U+FFFD.
    pub fn read_log(&self, identity: &SessionIdentity) -> Result<String, LogStoreError> {
        let bytes = self.read_log_bytes(identity)?;
        Ok(String::from_utf8(bytes)
            .unwrap_or_else(|error| String::from_utf8_lossy(error.as_bytes()).into_owned()))
    }

    /// The log exactly as stored.
    pub fn read_log_bytes(&self, identity: &SessionIdentity) -> Result<Vec<u8>, LogStoreError> {
        let path = self.path_for(identity)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(LogStoreError::NotFound(identity.clone()))
            }
            Err(source) => Err(LogStoreError::Read { path, source }),
        }
    }

    pub fn read_snapshot(&self, identity: &SessionIdentity) -> Result<SessionSnapshot, LogStoreError> {
        let log = self.read_log_bytes(identity)?;
        Ok(SessionSnapshot::from_log(identity.clone(), &log))
    }

    /// Replaces the live log in one rename; readers see the old or the new file, never a mix.
    pub fn replace_log(
        &self,
        identity: &SessionIdentity,
        log: impl AsRef<[u8]>,
    ) -> Result<(), LogStoreError> {
        let path = self.path_for(identity)?;
        write_atomic(&path, log.as_ref()).map_err(|source| LogStoreError::Write { path, source })
    }

    pub fn create_log(
        &self,
        identity: &SessionIdentity,
        log: impl AsRef<[u8]>,
    ) -> Result<(), LogStoreError> {
        let path = self.path_for(identity)?;
        if path.exists() {
            return Err(LogStoreError::Write {
                path,
                source: io::Error::new(io::ErrorKind::AlreadyExists, "session log already exists"),
            });
        }
        write_atomic(&path, log.as_ref()).map_err(|source| LogStoreError::Write { path, source })
    }

    /// `.jsonl` sessions of one scope, most recently modified first.
    pub fn list_sessions(&self, dir_name: &str) -> Result<Vec<SessionIdentity>, LogStoreError> {
        let scope_check = SessionIdentity::new(dir_name, "session.jsonl");
        if !scope_check.is_well_formed() {
            return Err(LogStoreError::InvalidIdentity(scope_check));
        }
        let dir = self.projects_dir.join(dir_name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(LogStoreError::Read { path: dir, source }),
        };

        let mut sessions: Vec<(Option<SystemTime>, SessionIdentity)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            sessions.push((
                metadata.modified().ok(),
                SessionIdentity::new(dir_name, file_name),
            ));
        }

        sessions.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(sessions.into_iter().map(|(_, identity)| identity).collect())
    }
}

/// Writes to a sibling temp file, syncs, then renames over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no parent: {}", path.display()),
        ));
    };
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
