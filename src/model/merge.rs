use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    Added,
    Removed,
    Changed,
}

/// One key that differs between two sides. Identities are absent on the side
/// where the key does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub key: String,
    pub diff_type: DiffType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_identity: Option<String>,
}

/// How a merge settles keys changed on both sides.
///
/// `None` surfaces every such key as a conflict; the other two pick a side.
/// Content is never inspected to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    #[default]
    None,
    DestWins,
    SourceWins,
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(MergeStrategy::None),
            "dest-wins" => Ok(MergeStrategy::DestWins),
            "source-wins" => Ok(MergeStrategy::SourceWins),
            _ => Err(format!("Unknown merge strategy: {}", s)),
        }
    }
}

/// Merge request: `source` is any ref, the destination is the branch in the path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub source: String,
    pub committer: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub strategy: MergeStrategy,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}
