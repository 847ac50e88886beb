use crate::domain::{
    BranchOrigin, BranchRecord, SessionIdentity, branch_preview, count_turns, sha256_hex,
};
use crate::infra::write_atomic;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BranchStoreError {
    #[error("branch not found: {0}")]
    NotFound(String),

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

    #[error("failed to parse branch index {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode branch index: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to format timestamp: {0}")]
    FormatTimestamp(String),
}

/// Branch records of one session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BranchIndex {
    branches: Vec<BranchRecord>,
}

impl BranchIndex {
    pub fn all(&self) -> Vec<BranchRecord> {
        let mut out = self.branches.clone();
        sort_newest_first(&mut out);
        out
    }

    pub fn at_turn(&self, turn_index: usize) -> Vec<BranchRecord> {
        let mut out: Vec<BranchRecord> = self
            .branches
            .iter()
            .filter(|record| record.turn_index == turn_index)
            .cloned()
            .collect();
        sort_newest_first(&mut out);
        out
    }

    pub fn find(&self, branch_id: &str) -> Option<&BranchRecord> {
        self.branches.iter().find(|record| record.id == branch_id)
    }

    pub fn insert(&mut self, record: BranchRecord) {
        self.branches.push(record);
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

fn sort_newest_first(records: &mut [BranchRecord]) {
    records.sort_by_key(|record| {
        let created = OffsetDateTime::parse(&record.created_at, &Rfc3339)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Reverse((created, record.id.clone()))
    });
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BranchIndexFile {
    version: u32,
    branches: Vec<BranchRecord>,
}

/// Arena of archived suffixes: `<root>/<dirName>/<fileName>/<branchId>.jsonl` plus `index.json`.
///
/// Branch files are written once and never modified.
#[derive(Clone, Debug)]
pub struct BranchStore {
    root: PathBuf,
}

impl BranchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, identity: &SessionIdentity) -> PathBuf {
        self.root
            .join(&identity.dir_name)
            .join(&identity.file_name)
    }

    fn index_path(&self, identity: &SessionIdentity) -> PathBuf {
        self.session_dir(identity).join("index.json")
    }

    fn branch_path(&self, identity: &SessionIdentity, branch_id: &str) -> PathBuf {
        self.session_dir(identity).join(format!("{branch_id}.jsonl"))
    }

    pub fn load_index(&self, identity: &SessionIdentity) -> Result<BranchIndex, BranchStoreError> {
        let path = self.index_path(identity);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(BranchIndex::default());
            }
            Err(source) => return Err(BranchStoreError::Read { path, source }),
        };
        let file: BranchIndexFile = serde_json::from_str(&raw)
            .map_err(|source| BranchStoreError::Parse { path, source })?;
        Ok(BranchIndex {
            branches: file.branches,
        })
    }

    pub fn save_index(
        &self,
        identity: &SessionIdentity,
        index: &BranchIndex,
    ) -> Result<(), BranchStoreError> {
        let path = self.index_path(identity);
        let file = BranchIndexFile {
            version: 1,
            branches: index.branches.clone(),
        };
        let text = serde_json::to_string_pretty(&file)?;
        write_atomic(&path, text.as_bytes()).map_err(|source| BranchStoreError::Write { path, source })
    }

    /// Archives `log` as a new immutable branch file and returns its record (not yet indexed).
    pub fn write_branch(
        &self,
        identity: &SessionIdentity,
        turn_index: usize,
        origin: BranchOrigin,
        log: &[u8],
    ) -> Result<BranchRecord, BranchStoreError> {
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|error| BranchStoreError::FormatTimestamp(error.to_string()))?;
        let view = String::from_utf8_lossy(log);
        let record = BranchRecord {
            id: Uuid::now_v7().to_string(),
            turn_index,
            created_at,
            origin,
            byte_len: log.len() as u64,
            turn_count: count_turns(&view),
            sha256: sha256_hex(log),
            preview: branch_preview(&view),
        };

        let path = self.branch_path(identity, &record.id);
        write_atomic(&path, log).map_err(|source| BranchStoreError::Write { path, source })?;
        Ok(record)
    }

    /// Lossy UTF-8 view of a branch, for display.
    pub fn read_branch(
        &self,
        identity: &SessionIdentity,
        branch_id: &str,
    ) -> Result<String, BranchStoreError> {
        let bytes = self.read_branch_bytes(identity, branch_id)?;
        Ok(String::from_utf8(bytes)
            .unwrap_or_else(|error| String::from_utf8_lossy(error.as_bytes()).into_owned()))
    }

    pub fn read_branch_bytes(
        &self,
        identity: &SessionIdentity,
        branch_id: &str,
    ) -> Result<Vec<u8>, BranchStoreError> {
        if !is_valid_branch_id(branch_id) {
            return Err(BranchStoreError::NotFound(branch_id.to_string()));
        }
        let path = self.branch_path(identity, branch_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(BranchStoreError::NotFound(branch_id.to_string()))
            }
            Err(source) => Err(BranchStoreError::Read { path, source }),
        }
    }

    pub fn remove_branch_file(
        &self,
        identity: &SessionIdentity,
        branch_id: &str,
    ) -> Result<(), BranchStoreError> {
        if !is_valid_branch_id(branch_id) {
            return Err(BranchStoreError::NotFound(branch_id.to_string()));
        }
        let path = self.branch_path(identity, branch_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BranchStoreError::Write { path, source }),
        }
    }
}

fn is_valid_branch_id(branch_id: &str) -> bool {
    !branch_id.is_empty()
        && branch_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}
