//! Committed data.
//!
//! A commit points at a meta-range: the full key -> value snapshot of the
//! repository at that commit, stored as one content-addressed record. Because
//! meta-ranges never change once written they are cached freely.

use itertools::{EitherOrBoth, Itertools};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::model::{codec, keys, DiffEntry, DiffType, Id, MergeStrategy, Repository, Value};
use crate::store::{KvError, RecordCache, Store};

pub type MetaRange = BTreeMap<String, Value>;

/// Uncommitted changes keyed by object key. `None` deletes the key.
pub type ChangeSet = BTreeMap<String, Option<Value>>;

pub struct CommittedManager {
    store: Arc<dyn Store>,
    cache: RecordCache<Arc<MetaRange>>,
}

impl CommittedManager {
    pub fn new(store: Arc<dyn Store>, cache_ttl: Duration, cache_capacity: usize) -> Self {
        Self {
            store,
            cache: RecordCache::new(cache_ttl, cache_capacity),
        }
    }

    pub async fn get(&self, repository: &Repository, meta_range_id: &str) -> EngineResult<Arc<MetaRange>> {
        let partition = repository.partition();
        if let Some(cached) = self.cache.get(&partition, meta_range_id).await {
            return Ok(cached);
        }

        let stored = self
            .store
            .get(partition.as_bytes(), keys::meta_range_key(meta_range_id).as_bytes())
            .await
            .map_err(|err| match err {
                // a commit that references a missing meta-range is broken
                KvError::NotFound => EngineError::corruption(
                    "meta-range",
                    meta_range_id,
                    format!("missing from repository {}", repository.id),
                ),
                other => EngineError::kv(format!("get meta-range {}", meta_range_id), other),
            })?;

        let ranges: MetaRange = codec::decode("meta-range", meta_range_id, &stored.value)?;
        if meta_range_id_of(&ranges)? != meta_range_id {
            return Err(EngineError::corruption(
                "meta-range",
                meta_range_id,
                "content does not match its id",
            ));
        }

        let ranges = Arc::new(ranges);
        self.cache.put(&partition, meta_range_id, ranges.clone()).await;
        Ok(ranges)
    }

    /// Store a meta-range and return its id. Writing an existing meta-range is a no-op.
    pub async fn put(&self, repository: &Repository, ranges: MetaRange) -> EngineResult<Id> {
        let id = meta_range_id_of(&ranges)?;
        let partition = repository.partition();
        let bytes = codec::encode(&ranges)?;

        match self
            .store
            .set_if(
                partition.as_bytes(),
                keys::meta_range_key(&id).as_bytes(),
                &bytes,
                None,
            )
            .await
        {
            Ok(()) | Err(KvError::PredicateFailed) => {}
            Err(err) => return Err(EngineError::kv(format!("put meta-range {}", id), err)),
        }

        self.cache.put(&partition, &id, Arc::new(ranges)).await;
        Ok(id)
    }

    pub async fn forget_repository(&self, repository: &Repository) {
        self.cache.remove_partition(&repository.partition()).await;
    }
}

/// Content address of a meta-range
pub fn meta_range_id_of(ranges: &MetaRange) -> EngineResult<Id> {
    use sha2::{Digest, Sha256};

    let canonical = serde_json::to_vec(ranges)
        .map_err(|e| EngineError::invalid("meta-range", e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

pub fn apply_changes(base: &MetaRange, changes: &ChangeSet) -> MetaRange {
    let mut result = base.clone();
    for (key, change) in changes {
        match change {
            Some(value) => {
                result.insert(key.clone(), value.clone());
            }
            None => {
                result.remove(key);
            }
        }
    }
    result
}

/// Keys that differ between `left` and `right`, in key order
pub fn diff(left: &MetaRange, right: &MetaRange) -> Vec<DiffEntry> {
    left.iter()
        .merge_join_by(right.iter(), |(l, _), (r, _)| l.cmp(r))
        .filter_map(|pair| match pair {
            EitherOrBoth::Left((key, value)) => Some(DiffEntry {
                key: key.clone(),
                diff_type: DiffType::Removed,
                left_identity: Some(value.identity.clone()),
                right_identity: None,
            }),
            EitherOrBoth::Right((key, value)) => Some(DiffEntry {
                key: key.clone(),
                diff_type: DiffType::Added,
                left_identity: None,
                right_identity: Some(value.identity.clone()),
            }),
            EitherOrBoth::Both((key, l), (_, r)) if l.identity != r.identity => Some(DiffEntry {
                key: key.clone(),
                diff_type: DiffType::Changed,
                left_identity: Some(l.identity.clone()),
                right_identity: Some(r.identity.clone()),
            }),
            EitherOrBoth::Both(..) => None,
        })
        .collect()
}

/// Diff of a change set against the data it would be applied to
pub fn diff_changes(base: &MetaRange, changes: &ChangeSet) -> Vec<DiffEntry> {
    changes
        .iter()
        .filter_map(|(key, change)| {
            let before = base.get(key).map(|v| v.identity.clone());
            let after = change.as_ref().map(|v| v.identity.clone());
            let diff_type = match (&before, &after) {
                (None, None) => return None,
                (None, Some(_)) => DiffType::Added,
                (Some(_), None) => DiffType::Removed,
                (Some(b), Some(a)) if a == b => return None,
                (Some(_), Some(_)) => DiffType::Changed,
            };
            Some(DiffEntry {
                key: key.clone(),
                diff_type,
                left_identity: before,
                right_identity: after,
            })
        })
        .collect()
}

/// Three-way merge of `source` into `dest` with common ancestor `base`.
///
/// A key changed on only one side takes that side. A key changed on both sides
/// to different identities is a conflict, settled by `strategy` or returned as
/// the list of conflicting keys.
pub fn three_way_merge(
    base: &MetaRange,
    dest: &MetaRange,
    source: &MetaRange,
    strategy: MergeStrategy,
) -> Result<MetaRange, Vec<String>> {
    let keys: BTreeSet<&String> = base.keys().chain(dest.keys()).chain(source.keys()).collect();
    let identity = |side: &MetaRange, key: &str| side.get(key).map(|v| v.identity.clone());

    let mut merged = MetaRange::new();
    let mut conflicts = Vec::new();
    for key in keys {
        let (b, d, s) = (identity(base, key), identity(dest, key), identity(source, key));
        let take_source = if d == s || s == b {
            false
        } else if d == b {
            true
        } else {
            match strategy {
                MergeStrategy::None => {
                    conflicts.push(key.clone());
                    continue;
                }
                MergeStrategy::DestWins => false,
                MergeStrategy::SourceWins => true,
            }
        };

        let chosen = if take_source { source.get(key) } else { dest.get(key) };
        if let Some(value) = chosen {
            merged.insert(key.clone(), value.clone());
        }
    }

    if conflicts.is_empty() {
        Ok(merged)
    } else {
        Err(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ranges(entries: &[(&str, &str)]) -> MetaRange {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Value::new(v.as_bytes().to_vec())))
            .collect()
    }

    #[test]
    fn test_apply_changes() {
        let base = ranges(&[("a", "1"), ("b", "2")]);
        let mut changes = ChangeSet::new();
        changes.insert("a".to_string(), None);
        changes.insert("c".to_string(), Some(Value::new(b"3".to_vec())));
        let result = apply_changes(&base, &changes);
        assert_eq!(result, ranges(&[("b", "2"), ("c", "3")]));
    }

    #[test]
    fn test_diff() {
        let left = ranges(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let right = ranges(&[("b", "2"), ("c", "30"), ("d", "4")]);
        let entries = diff(&left, &right);
        let summary: Vec<_> = entries.iter().map(|e| (e.key.as_str(), e.diff_type)).collect();
        assert_eq!(
            summary,
            vec![
                ("a", DiffType::Removed),
                ("c", DiffType::Changed),
                ("d", DiffType::Added)
            ]
        );
    }

    #[test]
    fn test_three_way_merge() {
        let base = ranges(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let dest = ranges(&[("a", "10"), ("b", "2"), ("c", "3")]);
        let source = ranges(&[("a", "1"), ("c", "3"), ("d", "4")]);
        let merged = three_way_merge(&base, &dest, &source, MergeStrategy::None).unwrap();
        assert_eq!(merged, ranges(&[("a", "10"), ("c", "3"), ("d", "4")]));
    }

    #[test]
    fn test_conflicts_and_strategies() {
        let base = ranges(&[("a", "1")]);
        let dest = ranges(&[("a", "dest")]);
        let source = ranges(&[("a", "source")]);

        let conflicts = three_way_merge(&base, &dest, &source, MergeStrategy::None).unwrap_err();
        assert_eq!(conflicts, vec!["a".to_string()]);

        let merged = three_way_merge(&base, &dest, &source, MergeStrategy::DestWins).unwrap();
        assert_eq!(merged, dest);
        let merged = three_way_merge(&base, &dest, &source, MergeStrategy::SourceWins).unwrap();
        assert_eq!(merged, source);

        // identical change on both sides is not a conflict
        let merged = three_way_merge(&base, &dest, &dest, MergeStrategy::None).unwrap();
        assert_eq!(merged, dest);
    }

    #[test]
    fn test_delete_versus_modify_conflicts() {
        let base = ranges(&[("a", "1")]);
        let dest = ranges(&[]);
        let source = ranges(&[("a", "2")]);
        assert!(three_way_merge(&base, &dest, &source, MergeStrategy::None).is_err());
        let merged = three_way_merge(&base, &dest, &source, MergeStrategy::DestWins).unwrap();
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn test_put_is_content_addressed() {
        let store = Arc::new(MemoryStore::new());
        let manager = CommittedManager::new(store.clone(), Duration::from_secs(60), 16);
        let repo = Repository::new("repo1".into(), "mem://repo1".into(), "main".into());

        let id1 = manager.put(&repo, ranges(&[("a", "1")])).await.unwrap();
        let id2 = manager.put(&repo, ranges(&[("a", "1")])).await.unwrap();
        assert_eq!(id1, id2);

        // read through a fresh manager to bypass the cache
        let fresh = CommittedManager::new(store, Duration::from_secs(60), 16);
        let loaded = fresh.get(&repo, &id1).await.unwrap();
        assert_eq!(*loaded, ranges(&[("a", "1")]));

        let missing = fresh.get(&repo, "deadbeef").await.unwrap_err();
        assert_eq!(missing.kind(), crate::error::ErrorKind::Corruption);
    }
}
