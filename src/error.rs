//! Engine error types
//!
//! Every engine operation fails with an [`EngineError`]. Callers that need to
//! translate errors into their own protocol (HTTP status codes, S3 error codes)
//! should match on [`EngineError::kind`] rather than on individual variants.

use thiserror::Error;

use crate::model::BlockedAction;
use crate::store::KvError;

/// Coarse classification of engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// bad input, rejected before storage is touched
    Validation,
    /// lost a compare-and-swap race or the target already exists
    Conflict,
    NotFound,
    /// blocked by branch protection, nothing was mutated
    PolicyDenied,
    /// the KV backend failed
    BackendUnavailable,
    /// a stored record failed its invariant checks
    Corruption,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    #[error("invalid key material ({context}): {source}")]
    InvalidKey {
        context: String,
        #[source]
        source: KvError,
    },

    #[error("no changes to commit: repository={repository}, branch={branch}")]
    NoChanges { repository: String, branch: String },

    #[error("cannot delete default branch: repository={repository}, branch={branch}")]
    CannotDeleteDefaultBranch { repository: String, branch: String },

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("branch not found: repository={repository}, branch={branch}")]
    BranchNotFound { repository: String, branch: String },

    #[error("tag not found: repository={repository}, tag={tag}")]
    TagNotFound { repository: String, tag: String },

    #[error("commit not found: repository={repository}, commit={commit}")]
    CommitNotFound { repository: String, commit: String },

    #[error("reference not found: repository={repository}, ref={reference}")]
    RefNotFound { repository: String, reference: String },

    #[error("key not found: repository={repository}, ref={reference}, key={key}")]
    KeyNotFound {
        repository: String,
        reference: String,
        key: String,
    },

    #[error("garbage collection rules not set: repository={0}")]
    GcRulesNotFound(String),

    #[error("garbage collection run not found: repository={repository}, run={run_id}")]
    GcRunNotFound { repository: String, run_id: String },

    #[error("branch protection rule not found: repository={repository}, pattern={pattern}")]
    ProtectionRuleNotFound { repository: String, pattern: String },

    #[error("repository already exists: {0}")]
    RepositoryAlreadyExists(String),

    #[error("branch already exists: repository={repository}, branch={branch}")]
    BranchAlreadyExists { repository: String, branch: String },

    #[error("tag already exists: repository={repository}, tag={tag} points at {commit}")]
    TagAlreadyExists {
        repository: String,
        tag: String,
        commit: String,
    },

    /// A compare-and-swap lost against a concurrent writer. Re-read and retry.
    #[error("concurrent modification: repository={repository}, {entity} was updated by another writer")]
    ConcurrentModification { repository: String, entity: String },

    #[error("merge conflict: repository={repository}, {} conflicting keys", keys.len())]
    MergeConflict { repository: String, keys: Vec<String> },

    #[error("branch has uncommitted changes: repository={repository}, branch={branch}")]
    DirtyBranch { repository: String, branch: String },

    #[error("action {action} is blocked by branch protection: repository={repository}, branch={branch}")]
    PolicyDenied {
        repository: String,
        branch: String,
        action: BlockedAction,
    },

    #[error("storage backend failed ({context})")]
    Backend {
        context: String,
        #[source]
        source: KvError,
    },

    #[error("corrupted {entity} record {id}: {reason}")]
    Corruption {
        entity: &'static str,
        id: String,
        reason: String,
    },
}

impl EngineError {
    /// Wrap a KV failure. Validation failures stay validation failures; everything
    /// else is reported as a backend failure with `context` as the primary signal.
    pub fn kv(context: impl Into<String>, source: KvError) -> Self {
        let context = context.into();
        if source.is_validation() {
            EngineError::InvalidKey { context, source }
        } else {
            EngineError::Backend { context, source }
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    /// Build a corruption error and log it; corruption is never repaired silently.
    pub fn corruption(entity: &'static str, id: impl Into<String>, reason: impl Into<String>) -> Self {
        let id = id.into();
        let reason = reason.into();
        log::error!("corrupted {} record {}: {}", entity, id, reason);
        EngineError::Corruption { entity, id, reason }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidArgument { .. }
            | EngineError::InvalidKey { .. }
            | EngineError::NoChanges { .. }
            | EngineError::CannotDeleteDefaultBranch { .. } => ErrorKind::Validation,

            EngineError::RepositoryNotFound(_)
            | EngineError::BranchNotFound { .. }
            | EngineError::TagNotFound { .. }
            | EngineError::CommitNotFound { .. }
            | EngineError::RefNotFound { .. }
            | EngineError::KeyNotFound { .. }
            | EngineError::GcRulesNotFound(_)
            | EngineError::GcRunNotFound { .. }
            | EngineError::ProtectionRuleNotFound { .. } => ErrorKind::NotFound,

            EngineError::RepositoryAlreadyExists(_)
            | EngineError::BranchAlreadyExists { .. }
            | EngineError::TagAlreadyExists { .. }
            | EngineError::ConcurrentModification { .. }
            | EngineError::MergeConflict { .. }
            | EngineError::DirtyBranch { .. } => ErrorKind::Conflict,

            EngineError::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            EngineError::Backend { .. } => ErrorKind::BackendUnavailable,
            EngineError::Corruption { .. } => ErrorKind::Corruption,
        }
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// check if the caller may succeed by re-reading and retrying
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::ConcurrentModification { .. })
    }
}

/// result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = EngineError::BranchNotFound {
            repository: "repo1".to_string(),
            branch: "main".to_string(),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let race = EngineError::ConcurrentModification {
            repository: "repo1".to_string(),
            entity: "branch main".to_string(),
        };
        assert!(race.is_conflict());
        assert!(race.is_retriable());

        let tag = EngineError::TagAlreadyExists {
            repository: "repo1".to_string(),
            tag: "v1".to_string(),
            commit: "abc".to_string(),
        };
        assert!(tag.is_conflict());
        assert!(!tag.is_retriable());
    }

    #[test]
    fn test_kv_errors_keep_validation_kind() {
        let err = EngineError::kv("get branch", KvError::MissingKey);
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = EngineError::kv("get branch", KvError::OperationFailed("socket closed".into()));
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        // backend text is not the primary message
        assert_eq!(err.to_string(), "storage backend failed (get branch)");
    }
}
