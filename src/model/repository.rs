use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_instance_uid, generate_staging_token, Id};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: Id,
    /// Object storage location of the repository data. Never changes after creation.
    pub storage_namespace: String,
    pub default_branch_id: Id,
    pub creation_date: DateTime<Utc>,
    /// Distinguishes this incarnation from a deleted repository with the same id
    pub instance_uid: Id,
}

impl Repository {
    pub fn new(id: Id, storage_namespace: String, default_branch_id: Id) -> Self {
        Self {
            id,
            storage_namespace,
            default_branch_id,
            creation_date: Utc::now(),
            instance_uid: generate_instance_uid(),
        }
    }

    /// KV partition holding every record of this repository
    pub fn partition(&self) -> String {
        format!("repo-{}-{}", self.id, self.instance_uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Id,
    /// Empty for a branch of a bare repository that has never been committed to
    #[serde(default)]
    pub commit_id: Id,
    pub staging_token: Id,
    /// Frozen staging areas awaiting consolidation, oldest first
    #[serde(default)]
    pub sealed_tokens: Vec<Id>,
}

impl Branch {
    pub fn new(id: Id, commit_id: Id) -> Self {
        Self {
            id,
            commit_id,
            staging_token: generate_staging_token(),
            sealed_tokens: Vec::new(),
        }
    }

    pub fn has_commit(&self) -> bool {
        !self.commit_id.is_empty()
    }

    /// Staging token first, then sealed tokens newest to oldest. This is the
    /// order in which a read consults the uncommitted layers.
    pub fn tokens_newest_first(&self) -> Vec<&str> {
        std::iter::once(self.staging_token.as_str())
            .chain(self.sealed_tokens.iter().rev().map(String::as_str))
            .collect()
    }

    /// Move the staging token to the end of the sealed list and allocate a fresh one
    pub fn seal(&self) -> Branch {
        let mut sealed = self.clone();
        sealed.sealed_tokens.push(self.staging_token.clone());
        sealed.staging_token = generate_staging_token();
        sealed
    }
}
