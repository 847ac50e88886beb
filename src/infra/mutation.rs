use crate::domain::{ErrorBody, MutationRequest, MutationResponse, SessionContent};
use crate::infra::{BranchError, BranchManager, SessionSnapshot};

/// Runs one contract request against the branch manager. Failures become error responses.
pub fn dispatch(manager: &BranchManager, request: MutationRequest) -> MutationResponse {
    let identity = request.identity();
    let result = match request {
        MutationRequest::BranchSession { turn_index, .. } => manager
            .duplicate_session(&identity, turn_index)
            .map(MutationResponse::Identity),
        MutationRequest::Restore {
            turn_index,
            fingerprint,
            ..
        } => manager
            .restore_to_turn(&identity, turn_index, fingerprint.as_ref())
            .map(|outcome| {
                content_response(
                    outcome.snapshot,
                    outcome.branch.into_iter().map(|r| r.id).collect(),
                )
            }),
        MutationRequest::Materialize {
            branch_id,
            turn_index,
            fingerprint,
            ..
        } => manager
            .materialize_branch(&identity, &branch_id, turn_index, fingerprint.as_ref())
            .map(|outcome| {
                content_response(
                    outcome.snapshot,
                    outcome.archived.into_iter().map(|r| r.id).collect(),
                )
            }),
        MutationRequest::ListBranches { turn_index, .. } => manager
            .list_branches(&identity, turn_index)
            .map(|branches| MutationResponse::Branches { branches }),
    };

    result.unwrap_or_else(|error| {
        tracing::debug!(session = %identity, %error, "mutation request failed");
        error_response(&error)
    })
}

pub fn error_response(error: &BranchError) -> MutationResponse {
    MutationResponse::Error {
        error: ErrorBody {
            kind: error.kind(),
            message: error.to_string(),
        },
    }
}

fn content_response(snapshot: SessionSnapshot, archived_branch_ids: Vec<String>) -> MutationResponse {
    MutationResponse::Content(SessionContent {
        dir_name: snapshot.identity.dir_name,
        file_name: snapshot.identity.file_name,
        content: snapshot.text,
        fingerprint: snapshot.fingerprint,
        archived_branch_ids,
    })
}
