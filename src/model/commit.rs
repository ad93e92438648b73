use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::Id;

/// Current commit record version
pub const COMMIT_VERSION: u32 = 1;

/// An immutable node of the commit DAG
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commit {
    /// SHA-256 of the commit content
    pub id: Id,
    pub committer: String,
    pub message: String,
    pub creation_date: DateTime<Utc>,
    /// Consolidated data of the commit
    pub meta_range_id: Id,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// First parent is the branch the commit was made on
    #[serde(default)]
    pub parents: Vec<Id>,
    pub version: u32,
    /// 1 for roots, otherwise one more than the highest parent generation
    pub generation: u64,
}

/// Commit creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCommit {
    pub committer: String,
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub allow_empty: bool,
}

impl Commit {
    /// Build a commit over `meta_range_id`. `parents` pairs each parent id with its
    /// generation, in parent order.
    pub fn new(
        committer: String,
        message: String,
        meta_range_id: Id,
        metadata: BTreeMap<String, String>,
        parents: &[(Id, u64)],
    ) -> Self {
        let mut commit = Self {
            id: String::new(),
            committer,
            message,
            creation_date: Utc::now(),
            meta_range_id,
            metadata,
            parents: parents.iter().map(|(id, _)| id.clone()).collect(),
            version: COMMIT_VERSION,
            generation: Self::next_generation(parents.iter().map(|(_, gen)| *gen)),
        };
        commit.id = commit.compute_id();
        commit
    }

    pub fn next_generation(parent_generations: impl IntoIterator<Item = u64>) -> u64 {
        parent_generations
            .into_iter()
            .max()
            .map_or(1, |highest| highest + 1)
    }

    /// Calculate SHA-256 hash for the commit. Every field is length-prefixed so
    /// that no two distinct commits share an encoding.
    pub fn compute_id(&self) -> String {
        use sha2::{Digest, Sha256};

        fn field(hasher: &mut Sha256, name: &str, value: &[u8]) {
            hasher.update(name.as_bytes());
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value);
        }

        let mut hasher = Sha256::new();
        field(&mut hasher, "version", &self.version.to_be_bytes());
        field(&mut hasher, "committer", self.committer.as_bytes());
        field(&mut hasher, "message", self.message.as_bytes());
        field(
            &mut hasher,
            "creation_date",
            &self.creation_date.timestamp().to_be_bytes(),
        );
        field(
            &mut hasher,
            "creation_nanos",
            &self.creation_date.timestamp_subsec_nanos().to_be_bytes(),
        );
        field(&mut hasher, "meta_range", self.meta_range_id.as_bytes());
        for (key, value) in &self.metadata {
            field(&mut hasher, "metadata_key", key.as_bytes());
            field(&mut hasher, "metadata_value", value.as_bytes());
        }
        for parent in &self.parents {
            field(&mut hasher, "parent", parent.as_bytes());
        }
        field(&mut hasher, "generation", &self.generation.to_be_bytes());

        hex::encode(hasher.finalize())
    }

    /// True when the stored id matches the content
    pub fn verify_id(&self) -> bool {
        self.id == self.compute_id()
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}
