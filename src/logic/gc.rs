use serde::{Deserialize, Serialize};

use crate::logic::protection::glob_match;
use crate::model::{GarbageCollectionRules, Id};

/// Retention in days for `branch_id`: the first override whose pattern matches,
/// in insertion order, else the default.
pub fn effective_retention(rules: &GarbageCollectionRules, branch_id: &str) -> i32 {
    rules
        .branch_retention_days
        .iter()
        .find(|rule| glob_match(&rule.pattern, branch_id))
        .map_or(rules.default_retention_days, |rule| rule.days)
}

/// Retention the sweeper should apply to one branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRetentionReport {
    pub branch_id: Id,
    pub commit_id: Id,
    pub retention_days: i32,
}

pub fn retention_report<'a>(
    rules: &GarbageCollectionRules,
    branches: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Vec<BranchRetentionReport> {
    branches
        .into_iter()
        .map(|(branch_id, commit_id)| BranchRetentionReport {
            branch_id: branch_id.to_string(),
            commit_id: commit_id.to_string(),
            retention_days: effective_retention(rules, branch_id),
        })
        .collect()
}

/// Request body for recording a garbage collection run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordGcRun {
    #[serde(default)]
    pub run_id: Option<Id>,
    pub commits_location: String,
    pub address_location: String,
}
