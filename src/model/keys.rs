//! KV layout.
//!
//! The global partition holds one record per repository. Everything else a
//! repository owns lives in its own partition (see [`Repository::partition`]),
//! and every staging token is a partition of its own, keyed by object key.
//!
//! [`Repository::partition`]: crate::model::Repository::partition

/// Partition holding the repository records
pub const REPOSITORIES_PARTITION: &str = "lakeref";

pub const REPOSITORIES_PREFIX: &str = "repos/";
pub const BRANCHES_PREFIX: &str = "branches/";
pub const TAGS_PREFIX: &str = "tags/";
pub const COMMITS_PREFIX: &str = "commits/";
pub const META_RANGES_PREFIX: &str = "metaranges/";
pub const GC_RUNS_PREFIX: &str = "gc_runs/";

pub const GC_RULES_KEY: &str = "settings/gc_rules";
pub const BRANCH_PROTECTION_KEY: &str = "settings/branch_protection";

pub fn repository_key(repository_id: &str) -> String {
    format!("{}{}", REPOSITORIES_PREFIX, repository_id)
}

pub fn branch_key(branch_id: &str) -> String {
    format!("{}{}", BRANCHES_PREFIX, branch_id)
}

pub fn tag_key(tag_id: &str) -> String {
    format!("{}{}", TAGS_PREFIX, tag_id)
}

pub fn commit_key(commit_id: &str) -> String {
    format!("{}{}", COMMITS_PREFIX, commit_id)
}

pub fn meta_range_key(meta_range_id: &str) -> String {
    format!("{}{}", META_RANGES_PREFIX, meta_range_id)
}

pub fn gc_run_key(run_id: &str) -> String {
    format!("{}{}", GC_RUNS_PREFIX, run_id)
}

/// Strip `prefix` from a scanned key, returning the id part
pub fn id_from_key<'a>(prefix: &str, key: &'a [u8]) -> Option<&'a str> {
    std::str::from_utf8(key).ok()?.strip_prefix(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefixes_do_not_overlap() {
        let prefixes = [
            REPOSITORIES_PREFIX,
            BRANCHES_PREFIX,
            TAGS_PREFIX,
            COMMITS_PREFIX,
            META_RANGES_PREFIX,
            GC_RUNS_PREFIX,
        ];
        for a in prefixes {
            for b in prefixes {
                if a != b {
                    assert!(!a.starts_with(b));
                }
            }
            assert!(!GC_RULES_KEY.starts_with(a));
            assert!(!BRANCH_PROTECTION_KEY.starts_with(a));
        }
    }

    #[test]
    fn test_id_from_key() {
        assert_eq!(id_from_key(BRANCHES_PREFIX, b"branches/main"), Some("main"));
        assert_eq!(id_from_key(BRANCHES_PREFIX, b"tags/v1"), None);
    }
}
