use crate::domain::{BranchRecord, LogFingerprint, SessionIdentity};
use serde::{Deserialize, Serialize};

/// Structural mutation requests, transport-agnostic.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum MutationRequest {
    /// Duplicate when `turn_index` is omitted, branch-from-here when given.
    #[serde(rename_all = "camelCase")]
    BranchSession {
        dir_name: String,
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_index: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Restore {
        dir_name: String,
        file_name: String,
        turn_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<LogFingerprint>,
    },
    #[serde(rename_all = "camelCase")]
    Materialize {
        dir_name: String,
        file_name: String,
        branch_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<LogFingerprint>,
    },
    #[serde(rename_all = "camelCase")]
    ListBranches {
        dir_name: String,
        file_name: String,
        turn_index: usize,
    },
}

impl MutationRequest {
    pub fn identity(&self) -> SessionIdentity {
        match self {
            Self::BranchSession {
                dir_name,
                file_name,
                ..
            }
            | Self::Restore {
                dir_name,
                file_name,
                ..
            }
            | Self::Materialize {
                dir_name,
                file_name,
                ..
            }
            | Self::ListBranches {
                dir_name,
                file_name,
                ..
            } => SessionIdentity::new(dir_name.clone(), file_name.clone()),
        }
    }
}

/// Identity plus the fresh content a client must reload from.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContent {
    pub dir_name: String,
    pub file_name: String,
    pub content: String,
    pub fingerprint: LogFingerprint,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archived_branch_ids: Vec<String>,
}

/// Untagged; variants are tried in order, so the bare identity shape stays last.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationResponse {
    Error { error: ErrorBody },
    Content(SessionContent),
    Branches { branches: Vec<BranchRecord> },
    Identity(SessionIdentity),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Storage,
    Unavailable,
}
