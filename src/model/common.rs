use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

pub type Id = String;

/// Name of the branch created with every repository unless the caller picks one
pub const DEFAULT_BRANCH: &str = "main";

const MAX_REPOSITORY_ID_LEN: usize = 63;
const MAX_REF_ID_LEN: usize = 255;

/// Generate a fresh staging token. Tokens are never reused.
pub fn generate_staging_token() -> Id {
    format!("staging-{}", Uuid::new_v4().simple())
}

/// Generate the per-incarnation uid of a repository
pub fn generate_instance_uid() -> Id {
    Uuid::new_v4().simple().to_string()
}

/// Generate a garbage collection run id
pub fn generate_run_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Repository ids are DNS-label-like: `[a-z0-9][a-z0-9-]{2,62}`
pub fn validate_repository_id(id: &str) -> EngineResult<()> {
    let mut chars = id.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false);
    if !first_ok {
        return Err(EngineError::invalid(
            "repository id",
            format!("'{}' must start with a lowercase letter or digit", id),
        ));
    }
    if id.len() < 3 || id.len() > MAX_REPOSITORY_ID_LEN {
        return Err(EngineError::invalid(
            "repository id",
            format!("'{}' must be 3 to {} characters", id, MAX_REPOSITORY_ID_LEN),
        ));
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err(EngineError::invalid(
            "repository id",
            format!("'{}' may only contain lowercase letters, digits and '-'", id),
        ));
    }
    Ok(())
}

pub fn validate_branch_id(id: &str) -> EngineResult<()> {
    validate_ref_id("branch id", id)
}

pub fn validate_tag_id(id: &str) -> EngineResult<()> {
    validate_ref_id("tag id", id)
}

fn validate_ref_id(field: &'static str, id: &str) -> EngineResult<()> {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => {
            return Err(EngineError::invalid(
                field,
                format!("'{}' must start with a letter or digit", id),
            ))
        }
    }
    if id.len() > MAX_REF_ID_LEN {
        return Err(EngineError::invalid(
            field,
            format!("must be at most {} characters", MAX_REF_ID_LEN),
        ));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(EngineError::invalid(
            field,
            format!("'{}' may only contain letters, digits, '_', '.' and '-'", id),
        ));
    }
    Ok(())
}

/// Object keys are arbitrary non-empty UTF-8 paths
pub fn validate_object_key(key: &str) -> EngineResult<()> {
    if key.is_empty() {
        return Err(EngineError::invalid("object key", "must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_ids() {
        assert!(validate_repository_id("repo1").is_ok());
        assert!(validate_repository_id("my-data-lake").is_ok());
        assert!(validate_repository_id("ab").is_err());
        assert!(validate_repository_id("-repo").is_err());
        assert!(validate_repository_id("Repo").is_err());
        assert!(validate_repository_id("repo_1").is_err());
        assert!(validate_repository_id(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_ref_ids() {
        assert!(validate_branch_id("main").is_ok());
        assert!(validate_branch_id("release-1.0").is_ok());
        assert!(validate_branch_id("feature_x").is_ok());
        assert!(validate_branch_id("").is_err());
        assert!(validate_branch_id(".hidden").is_err());
        assert!(validate_branch_id("a/b").is_err());
        assert!(validate_tag_id("v1.2.3").is_ok());
    }

    #[test]
    fn test_staging_tokens_are_unique() {
        let a = generate_staging_token();
        let b = generate_staging_token();
        assert_ne!(a, b);
        assert!(a.starts_with("staging-"));
    }
}
