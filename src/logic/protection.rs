use glob::{Pattern, PatternError};
use std::collections::BTreeSet;

use crate::model::{BlockedAction, BranchProtectionRules};

/// Compile a branch pattern. `*` spans any run of characters and `?` exactly one.
pub fn compile_pattern(pattern: &str) -> Result<Pattern, PatternError> {
    Pattern::new(pattern)
}

/// Whole-string, case-sensitive match of `input` against a branch pattern.
/// Patterns that do not compile match nothing; stored rules are validated on write.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    compile_pattern(pattern)
        .map(|pat| pat.matches(input))
        .unwrap_or(false)
}

/// Union of the actions blocked on `branch_id` by every matching pattern
pub fn blocked_actions(rules: &BranchProtectionRules, branch_id: &str) -> BTreeSet<BlockedAction> {
    rules
        .rules
        .iter()
        .filter(|(pattern, _)| glob_match(pattern, branch_id))
        .flat_map(|(_, actions)| actions.iter().copied())
        .collect()
}

pub fn is_blocked(rules: &BranchProtectionRules, branch_id: &str, action: BlockedAction) -> bool {
    rules
        .rules
        .iter()
        .any(|(pattern, actions)| actions.contains(&action) && glob_match(pattern, branch_id))
}
