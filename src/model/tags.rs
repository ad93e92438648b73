use serde::{Deserialize, Serialize};

use crate::model::Id;

/// Immutable name for a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Id,
    pub commit_id: Id,
}

impl Tag {
    pub fn new(id: Id, commit_id: Id) -> Self {
        Self { id, commit_id }
    }
}
