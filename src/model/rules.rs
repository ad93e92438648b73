use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EngineError, EngineResult};
use crate::logic::protection::compile_pattern;
use crate::model::Id;

/// Mutations a branch protection rule can block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockedAction {
    StagingWrite,
    Commit,
}

impl std::fmt::Display for BlockedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BlockedAction::StagingWrite => write!(f, "STAGING_WRITE"),
            BlockedAction::Commit => write!(f, "COMMIT"),
        }
    }
}

impl std::str::FromStr for BlockedAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STAGING_WRITE" => Ok(BlockedAction::StagingWrite),
            "COMMIT" => Ok(BlockedAction::Commit),
            _ => Err(format!("Unknown blocked action: {}", s)),
        }
    }
}

/// Branch name glob -> actions blocked on matching branches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchProtectionRules {
    #[serde(default)]
    pub rules: BTreeMap<String, BTreeSet<BlockedAction>>,
}

impl BranchProtectionRules {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn validate(&self) -> EngineResult<()> {
        for (pattern, actions) in &self.rules {
            if pattern.is_empty() {
                return Err(EngineError::invalid("branch protection pattern", "must not be empty"));
            }
            compile_pattern(pattern).map_err(|e| {
                EngineError::invalid("branch protection pattern", format!("'{}': {}", pattern, e))
            })?;
            if actions.is_empty() {
                return Err(EngineError::invalid(
                    "branch protection rule",
                    format!("pattern '{}' blocks no actions", pattern),
                ));
            }
        }
        Ok(())
    }
}

/// Retention override for branches matching `pattern`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRetention {
    pub pattern: String,
    pub days: i32,
}

/// Retention policy handed to the external sweeper.
///
/// Branch overrides are kept as an ordered list: when several patterns match a
/// branch, the first one in insertion order decides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarbageCollectionRules {
    pub default_retention_days: i32,
    #[serde(default)]
    pub branch_retention_days: Vec<BranchRetention>,
}

impl GarbageCollectionRules {
    pub fn new(default_retention_days: i32) -> Self {
        Self {
            default_retention_days,
            branch_retention_days: Vec::new(),
        }
    }

    /// Append a branch override. Later overrides never shadow earlier ones.
    pub fn with_branch(mut self, pattern: impl Into<String>, days: i32) -> Self {
        self.branch_retention_days.push(BranchRetention {
            pattern: pattern.into(),
            days,
        });
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.default_retention_days < 0 {
            return Err(EngineError::invalid(
                "default retention days",
                format!("{} is negative", self.default_retention_days),
            ));
        }
        for rule in &self.branch_retention_days {
            if rule.pattern.is_empty() {
                return Err(EngineError::invalid("retention pattern", "must not be empty"));
            }
            compile_pattern(&rule.pattern).map_err(|e| {
                EngineError::invalid("retention pattern", format!("'{}': {}", rule.pattern, e))
            })?;
            if rule.days < 0 {
                return Err(EngineError::invalid(
                    "branch retention days",
                    format!("'{}' has negative retention {}", rule.pattern, rule.days),
                ));
            }
        }
        Ok(())
    }
}

/// Where a garbage collection run left its inputs for the sweeper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcRunMetadata {
    pub run_id: Id,
    pub commits_location: String,
    pub address_location: String,
    pub creation_date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_action_wire_names() {
        let json = serde_json::to_string(&BlockedAction::StagingWrite).unwrap();
        assert_eq!(json, "\"STAGING_WRITE\"");
        assert_eq!("COMMIT".parse::<BlockedAction>(), Ok(BlockedAction::Commit));
        assert!("commit".parse::<BlockedAction>().is_err());
    }

    #[test]
    fn test_gc_rules_validation() {
        assert!(GarbageCollectionRules::new(7).with_branch("main", 30).validate().is_ok());
        assert!(GarbageCollectionRules::new(-1).validate().is_err());
        assert!(GarbageCollectionRules::new(7).with_branch("dev-*", -3).validate().is_err());
        assert!(GarbageCollectionRules::new(7).with_branch("", 3).validate().is_err());
        assert!(GarbageCollectionRules::new(7).with_branch("dev-[", 3).validate().is_err());
    }

    #[test]
    fn test_protection_rules_reject_bad_patterns() {
        let mut rules = BranchProtectionRules::default();
        rules
            .rules
            .insert("release-*".to_string(), [BlockedAction::Commit].into_iter().collect());
        assert!(rules.validate().is_ok());

        rules
            .rules
            .insert("hotfix-[".to_string(), [BlockedAction::Commit].into_iter().collect());
        let err = rules.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_gc_rules_keep_insertion_order_through_json() {
        let rules = GarbageCollectionRules::new(7)
            .with_branch("release-*", 90)
            .with_branch("*", 1);
        let decoded: GarbageCollectionRules =
            serde_json::from_str(&serde_json::to_string(&rules).unwrap()).unwrap();
        assert_eq!(decoded.branch_retention_days[0].pattern, "release-*");
        assert_eq!(decoded.branch_retention_days[1].pattern, "*");
    }
}
