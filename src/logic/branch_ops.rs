//! Staging, commit and merge operations.
//!
//! A branch record is the only thing two writers of the same branch contend on.
//! Committing takes two compare-and-swaps on it:
//!
//! 1. seal: move the staging token to the sealed list and allocate a new one,
//! 2. advance: point the branch at the new commit and drop the sealed tokens.
//!
//! If anything fails between the two the sealed tokens stay on the branch. Their
//! data is still visible to reads and the next commit picks it up.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::logic::committed::{self, MetaRange};
use crate::logic::engine::{ResolvedRef, VersionEngine};
use crate::model::{
    keys, validate_branch_id, validate_object_key, BlockedAction, Branch, Commit, DiffEntry, Id,
    MergeRequest, NewCommit, Repository, StagedEntry, Value,
};

/// Listing entry for an object visible at a ref
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStat {
    pub key: String,
    pub identity: String,
    pub size_bytes: u64,
}

impl VersionEngine {
    // --- staging ---

    /// Stage `data` under `key` on a branch
    pub async fn stage_object(
        &self,
        repository_id: &str,
        branch_id: &str,
        key: &str,
        data: Vec<u8>,
    ) -> EngineResult<Value> {
        validate_branch_id(branch_id)?;
        validate_object_key(key)?;
        let repository = self.get_repository(repository_id).await?;
        self.check_protection(&repository, branch_id, BlockedAction::StagingWrite)
            .await?;

        let value = Value::new(data);
        self.stage_entry(&repository, branch_id, StagedEntry::write(key.to_string(), value.clone()))
            .await?;
        log::debug!("staged {} on {}/{}", key, repository_id, branch_id);
        Ok(value)
    }

    /// Stage a delete of an object visible on the branch
    pub async fn stage_delete(&self, repository_id: &str, branch_id: &str, key: &str) -> EngineResult<()> {
        validate_branch_id(branch_id)?;
        validate_object_key(key)?;
        let repository = self.get_repository(repository_id).await?;
        self.check_protection(&repository, branch_id, BlockedAction::StagingWrite)
            .await?;

        let (branch, _) = self.get_branch_record(&repository, branch_id).await?;
        if self.lookup_on_branch(&repository, &branch, key).await?.is_none() {
            return Err(EngineError::KeyNotFound {
                repository: repository_id.to_string(),
                reference: branch_id.to_string(),
                key: key.to_string(),
            });
        }

        self.stage_entry(&repository, branch_id, StagedEntry::tombstone(key.to_string()))
            .await?;
        log::debug!("staged delete of {} on {}/{}", key, repository_id, branch_id);
        Ok(())
    }

    /// Write into the branch's current staging token. A commit may seal the token
    /// while we write; if the token changed under us the write is repeated on the
    /// new one so it is never stranded in an already consolidated area.
    async fn stage_entry(&self, repository: &Repository, branch_id: &str, entry: StagedEntry) -> EngineResult<()> {
        let (mut branch, _) = self.get_branch_record(repository, branch_id).await?;
        for attempt in 0..=self.options.staging_write_retries {
            self.staging.set(&branch.staging_token, &entry).await?;

            let (current, _) = self.get_branch_record(repository, branch_id).await?;
            if current.staging_token == branch.staging_token {
                return Ok(());
            }
            log::debug!(
                "staging token of {}/{} moved during write (attempt {}), re-applying {}",
                repository.id,
                branch_id,
                attempt + 1,
                entry.key
            );
            branch = current;
        }

        Err(EngineError::ConcurrentModification {
            repository: repository.id.clone(),
            entity: format!("staging area of branch {}", branch_id),
        })
    }

    /// Uncommitted layers first (staging, then sealed newest to oldest), then the
    /// branch commit. None when the key is absent or deleted.
    async fn lookup_on_branch(&self, repository: &Repository, branch: &Branch, key: &str) -> EngineResult<Option<Value>> {
        for token in branch.tokens_newest_first() {
            if let Some(entry) = self.staging.get(token, key).await? {
                return Ok(entry.value());
            }
        }
        let ranges = self.committed_ranges(repository, &branch.commit_id).await?;
        Ok(ranges.get(key).cloned())
    }

    /// Meta-range of a commit; empty for the empty commit id of a bare branch
    async fn committed_ranges(&self, repository: &Repository, commit_id: &str) -> EngineResult<Arc<MetaRange>> {
        if commit_id.is_empty() {
            return Ok(Arc::new(MetaRange::new()));
        }
        let commit = self.graph.get(repository, commit_id).await?;
        self.committed.get(repository, &commit.meta_range_id).await
    }

    pub async fn get_object(&self, repository_id: &str, reference: &str, key: &str) -> EngineResult<Value> {
        validate_object_key(key)?;
        let repository = self.get_repository(repository_id).await?;
        let resolved = self.resolve_ref_in(&repository, reference).await?;

        let found = match &resolved.branch {
            Some(branch) => self.lookup_on_branch(&repository, branch, key).await?,
            None => self
                .committed_ranges(&repository, &resolved.commit_id)
                .await?
                .get(key)
                .cloned(),
        };
        found.ok_or_else(|| EngineError::KeyNotFound {
            repository: repository_id.to_string(),
            reference: reference.to_string(),
            key: key.to_string(),
        })
    }

    /// Objects visible at `reference` whose key starts with `prefix`, in key order.
    /// On a branch this includes uncommitted changes.
    pub async fn list_objects(&self, repository_id: &str, reference: &str, prefix: &str) -> EngineResult<Vec<ObjectStat>> {
        let repository = self.get_repository(repository_id).await?;
        let resolved = self.resolve_ref_in(&repository, reference).await?;
        let ranges = self.view_of(&repository, &resolved).await?;

        Ok(ranges
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| ObjectStat {
                key: key.clone(),
                identity: value.identity.clone(),
                size_bytes: value.data.len() as u64,
            })
            .collect())
    }

    async fn view_of(&self, repository: &Repository, resolved: &ResolvedRef) -> EngineResult<Arc<MetaRange>> {
        let base = self.committed_ranges(repository, &resolved.commit_id).await?;
        match &resolved.branch {
            Some(branch) => {
                let changes = self.staging.materialize(&uncommitted_tokens(branch)).await?;
                if changes.is_empty() {
                    Ok(base)
                } else {
                    Ok(Arc::new(committed::apply_changes(&base, &changes)))
                }
            }
            None => Ok(base),
        }
    }

    /// Uncommitted changes of a branch relative to its commit
    pub async fn diff_uncommitted(&self, repository_id: &str, branch_id: &str) -> EngineResult<Vec<DiffEntry>> {
        let repository = self.get_repository(repository_id).await?;
        let (branch, _) = self.get_branch_record(&repository, branch_id).await?;
        let base = self.committed_ranges(&repository, &branch.commit_id).await?;
        let changes = self.staging.materialize(&uncommitted_tokens(&branch)).await?;
        Ok(committed::diff_changes(&base, &changes))
    }

    /// Drop every uncommitted change of a branch
    pub async fn reset_branch(&self, repository_id: &str, branch_id: &str) -> EngineResult<Branch> {
        let repository = self.get_repository(repository_id).await?;
        self.check_protection(&repository, branch_id, BlockedAction::StagingWrite)
            .await?;
        let (branch, predicate) = self.get_branch_record(&repository, branch_id).await?;

        let reset = Branch::new(branch.id.clone(), branch.commit_id.clone());
        if !self
            .write_record_if(
                &repository.partition(),
                &keys::branch_key(branch_id),
                &reset,
                Some(&predicate),
            )
            .await?
        {
            return Err(branch_race(&repository, branch_id));
        }

        self.drop_tokens_best_effort(&repository, branch.tokens_newest_first())
            .await;
        log::info!("reset branch {} in {}", branch_id, repository_id);
        Ok(reset)
    }

    // --- commits ---

    pub async fn commit(&self, repository_id: &str, branch_id: &str, request: NewCommit) -> EngineResult<Commit> {
        if request.message.is_empty() {
            return Err(EngineError::invalid("commit message", "must not be empty"));
        }
        validate_branch_id(branch_id)?;
        let repository = self.get_repository(repository_id).await?;
        self.check_protection(&repository, branch_id, BlockedAction::Commit)
            .await?;

        let partition = repository.partition();
        let branch_key = keys::branch_key(branch_id);
        let (branch, predicate) = self.get_branch_record(&repository, branch_id).await?;

        if !request.allow_empty
            && branch.sealed_tokens.is_empty()
            && self.staging.is_empty(&branch.staging_token).await?
        {
            return Err(EngineError::NoChanges {
                repository: repository_id.to_string(),
                branch: branch_id.to_string(),
            });
        }

        // Seal. Losing here means another commit or reset got there first.
        let sealed = branch.seal();
        if !self
            .write_record_if(&partition, &branch_key, &sealed, Some(&predicate))
            .await?
        {
            return Err(branch_race(&repository, branch_id));
        }

        // From here on a failure leaves the sealed tokens on the branch.
        let commit = match self.consolidate(&repository, &sealed, request).await {
            Ok(commit) => commit,
            Err(err) => {
                log::warn!(
                    "commit on {}/{} aborted after sealing {:?}: {}",
                    repository_id,
                    branch_id,
                    sealed.sealed_tokens,
                    err
                );
                return Err(err);
            }
        };

        // Advance only if the branch is still exactly what we sealed.
        let advanced = Branch {
            id: sealed.id.clone(),
            commit_id: commit.id.clone(),
            staging_token: sealed.staging_token.clone(),
            sealed_tokens: Vec::new(),
        };
        let swapped = match self
            .read_record::<Branch>(&partition, &branch_key, "branch", branch_id)
            .await?
        {
            Some((current, current_predicate)) if current == sealed => {
                self.write_record_if(&partition, &branch_key, &advanced, Some(&current_predicate))
                    .await?
            }
            _ => false,
        };
        if !swapped {
            log::warn!(
                "commit {} on {}/{} aborted: branch changed after sealing, sealed tokens kept",
                commit.id,
                repository_id,
                branch_id
            );
            return Err(branch_race(&repository, branch_id));
        }

        self.drop_tokens_best_effort(&repository, sealed.sealed_tokens.iter().map(String::as_str))
            .await;

        log::info!(
            "committed {} on {}/{} (generation {})",
            commit.id,
            repository_id,
            branch_id,
            commit.generation
        );
        Ok(commit)
    }

    /// Materialize the sealed tokens on top of the branch commit and store the result
    async fn consolidate(&self, repository: &Repository, sealed: &Branch, request: NewCommit) -> EngineResult<Commit> {
        let changes = self.staging.materialize(&sealed.sealed_tokens).await?;

        let (base, parents) = if sealed.has_commit() {
            let parent = self.graph.get(repository, &sealed.commit_id).await?;
            let base = self.committed.get(repository, &parent.meta_range_id).await?;
            (base, vec![(parent.id.clone(), parent.generation)])
        } else {
            (Arc::new(MetaRange::new()), Vec::new())
        };

        let ranges = committed::apply_changes(&base, &changes);
        let meta_range_id = self.committed.put(repository, ranges).await?;

        let commit = Commit::new(
            request.committer,
            request.message,
            meta_range_id,
            request.metadata,
            &parents,
        );
        self.graph.put(repository, &commit).await?;
        Ok(commit)
    }

    /// Merge `request.source` into `dest_branch_id`. The destination must have no
    /// uncommitted changes.
    pub async fn merge(&self, repository_id: &str, dest_branch_id: &str, request: MergeRequest) -> EngineResult<Commit> {
        validate_branch_id(dest_branch_id)?;
        let repository = self.get_repository(repository_id).await?;
        self.check_protection(&repository, dest_branch_id, BlockedAction::Commit)
            .await?;

        let (dest, predicate) = self.get_branch_record(&repository, dest_branch_id).await?;
        if !dest.sealed_tokens.is_empty() || !self.staging.is_empty(&dest.staging_token).await? {
            return Err(EngineError::DirtyBranch {
                repository: repository_id.to_string(),
                branch: dest_branch_id.to_string(),
            });
        }

        let source = self.resolve_ref_in(&repository, &request.source).await?;
        let no_changes = || EngineError::NoChanges {
            repository: repository_id.to_string(),
            branch: dest_branch_id.to_string(),
        };
        if source.commit_id.is_empty() {
            return Err(no_changes());
        }
        if dest.has_commit()
            && self
                .graph
                .is_ancestor(&repository, &source.commit_id, &dest.commit_id)
                .await?
        {
            return Err(no_changes());
        }

        let source_commit = self.graph.get(&repository, &source.commit_id).await?;
        let source_ranges = self.committed.get(&repository, &source_commit.meta_range_id).await?;
        let (dest_ranges, base_ranges, mut parents) = if dest.has_commit() {
            let dest_commit = self.graph.get(&repository, &dest.commit_id).await?;
            let dest_ranges = self.committed.get(&repository, &dest_commit.meta_range_id).await?;
            let base_ranges = match self
                .graph
                .merge_base(&repository, &dest.commit_id, &source.commit_id)
                .await?
            {
                Some(base) => self.committed.get(&repository, &base.meta_range_id).await?,
                None => Arc::new(MetaRange::new()),
            };
            (
                dest_ranges,
                base_ranges,
                vec![(dest_commit.id.clone(), dest_commit.generation)],
            )
        } else {
            (Arc::new(MetaRange::new()), Arc::new(MetaRange::new()), Vec::new())
        };
        parents.push((source_commit.id.clone(), source_commit.generation));

        let merged = committed::three_way_merge(&base_ranges, &dest_ranges, &source_ranges, request.strategy)
            .map_err(|keys| {
                log::info!(
                    "merge of {} into {}/{} has {} conflicts",
                    request.source,
                    repository_id,
                    dest_branch_id,
                    keys.len()
                );
                EngineError::MergeConflict {
                    repository: repository_id.to_string(),
                    keys,
                }
            })?;
        let meta_range_id = self.committed.put(&repository, merged).await?;

        let message = request
            .message
            .unwrap_or_else(|| format!("Merge '{}' into '{}'", request.source, dest_branch_id));
        let commit = Commit::new(request.committer, message, meta_range_id, request.metadata, &parents);
        self.graph.put(&repository, &commit).await?;

        let advanced = Branch {
            commit_id: commit.id.clone(),
            ..dest
        };
        if !self
            .write_record_if(
                &repository.partition(),
                &keys::branch_key(dest_branch_id),
                &advanced,
                Some(&predicate),
            )
            .await?
        {
            return Err(branch_race(&repository, dest_branch_id));
        }

        log::info!(
            "merged {} into {}/{} as {}",
            request.source,
            repository_id,
            dest_branch_id,
            commit.id
        );
        Ok(commit)
    }

    pub async fn get_commit(&self, repository_id: &str, commit_id: &str) -> EngineResult<Commit> {
        if commit_id.is_empty() {
            return Err(EngineError::invalid("commit id", "must not be empty"));
        }
        let repository = self.get_repository(repository_id).await?;
        let commit = self.graph.get(&repository, commit_id).await?;
        Ok(commit.as_ref().clone())
    }

    /// Commits reachable from `reference`, highest generation first
    pub async fn log(&self, repository_id: &str, reference: &str, limit: usize) -> EngineResult<Vec<Commit>> {
        let repository = self.get_repository(repository_id).await?;
        let resolved = self.resolve_ref_in(&repository, reference).await?;
        if resolved.commit_id.is_empty() {
            return Ok(Vec::new());
        }
        let commits = self.graph.log(&repository, &resolved.commit_id, limit).await?;
        Ok(commits.iter().map(|c| c.as_ref().clone()).collect())
    }

    /// Committed difference between two refs (uncommitted data is ignored)
    pub async fn diff(&self, repository_id: &str, left_ref: &str, right_ref: &str) -> EngineResult<Vec<DiffEntry>> {
        let repository = self.get_repository(repository_id).await?;
        let left = self.resolve_ref_in(&repository, left_ref).await?;
        let right = self.resolve_ref_in(&repository, right_ref).await?;
        let left_ranges = self.committed_ranges(&repository, &left.commit_id).await?;
        let right_ranges = self.committed_ranges(&repository, &right.commit_id).await?;
        Ok(committed::diff(&left_ranges, &right_ranges))
    }
}

/// Sealed tokens oldest first, then the staging token
fn uncommitted_tokens(branch: &Branch) -> Vec<Id> {
    let mut tokens = branch.sealed_tokens.clone();
    tokens.push(branch.staging_token.clone());
    tokens
}

fn branch_race(repository: &Repository, branch_id: &str) -> EngineError {
    EngineError::ConcurrentModification {
        repository: repository.id.clone(),
        entity: format!("branch {}", branch_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::logic::engine::{EngineOptions, NewRepository};
    use crate::model::{DiffType, MergeStrategy};
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    async fn engine_with_repo() -> VersionEngine {
        let engine = VersionEngine::new(Arc::new(MemoryStore::new()), EngineOptions::default());
        engine
            .create_repository(NewRepository {
                id: "repo1".to_string(),
                storage_namespace: "s3://bucket/repo1".to_string(),
                default_branch: None,
                bare: false,
            })
            .await
            .unwrap();
        engine
    }

    fn commit_request(message: &str) -> NewCommit {
        NewCommit {
            committer: "tester".to_string(),
            message: message.to_string(),
            metadata: BTreeMap::new(),
            allow_empty: false,
        }
    }

    #[tokio::test]
    async fn test_read_your_writes_across_layers() {
        let engine = engine_with_repo().await;
        engine.stage_object("repo1", "main", "a.txt", b"v1".to_vec()).await.unwrap();
        assert_eq!(engine.get_object("repo1", "main", "a.txt").await.unwrap().data, b"v1".to_vec());

        engine.commit("repo1", "main", commit_request("first")).await.unwrap();
        engine.stage_object("repo1", "main", "a.txt", b"v2".to_vec()).await.unwrap();
        assert_eq!(engine.get_object("repo1", "main", "a.txt").await.unwrap().data, b"v2".to_vec());

        engine.stage_delete("repo1", "main", "a.txt").await.unwrap();
        let err = engine.get_object("repo1", "main", "a.txt").await.unwrap_err();
        assert!(err.is_not_found());

        let err = engine.stage_delete("repo1", "main", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_commit_requires_changes() {
        let engine = engine_with_repo().await;
        let err = engine.commit("repo1", "main", commit_request("empty")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut request = commit_request("empty");
        request.allow_empty = true;
        let commit = engine.commit("repo1", "main", request).await.unwrap();
        assert_eq!(commit.generation, 2);
    }

    #[tokio::test]
    async fn test_list_and_diff_uncommitted() {
        let engine = engine_with_repo().await;
        engine.stage_object("repo1", "main", "data/a", b"1".to_vec()).await.unwrap();
        engine.stage_object("repo1", "main", "data/b", b"2".to_vec()).await.unwrap();
        engine.stage_object("repo1", "main", "other", b"3".to_vec()).await.unwrap();
        engine.commit("repo1", "main", commit_request("base")).await.unwrap();

        engine.stage_object("repo1", "main", "data/b", b"22".to_vec()).await.unwrap();
        engine.stage_object("repo1", "main", "data/c", b"333".to_vec()).await.unwrap();
        engine.stage_delete("repo1", "main", "data/a").await.unwrap();

        let listed = engine.list_objects("repo1", "main", "data/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["data/b", "data/c"]);
        assert_eq!(listed[1].size_bytes, 3);

        let diff = engine.diff_uncommitted("repo1", "main").await.unwrap();
        let summary: Vec<_> = diff.iter().map(|d| (d.key.as_str(), d.diff_type)).collect();
        assert_eq!(
            summary,
            vec![
                ("data/a", DiffType::Removed),
                ("data/b", DiffType::Changed),
                ("data/c", DiffType::Added)
            ]
        );

        let reset = engine.reset_branch("repo1", "main").await.unwrap();
        assert!(reset.sealed_tokens.is_empty());
        assert!(engine.diff_uncommitted("repo1", "main").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_three_way() {
        let engine = engine_with_repo().await;
        engine.stage_object("repo1", "main", "shared", b"base".to_vec()).await.unwrap();
        engine.commit("repo1", "main", commit_request("base")).await.unwrap();
        engine.create_branch("repo1", "feature", "main").await.unwrap();

        engine.stage_object("repo1", "feature", "new", b"f".to_vec()).await.unwrap();
        let feature_head = engine.commit("repo1", "feature", commit_request("feature work")).await.unwrap();
        engine.stage_object("repo1", "main", "main-only", b"m".to_vec()).await.unwrap();
        let main_head = engine.commit("repo1", "main", commit_request("main work")).await.unwrap();

        let merge = engine
            .merge(
                "repo1",
                "main",
                MergeRequest {
                    source: "feature".to_string(),
                    committer: "tester".to_string(),
                    message: None,
                    strategy: MergeStrategy::None,
                    metadata: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(merge.parents, vec![main_head.id.clone(), feature_head.id.clone()]);
        assert_eq!(merge.generation, 4);
        assert!(engine.get_object("repo1", "main", "new").await.is_ok());
        assert!(engine.get_object("repo1", "main", "main-only").await.is_ok());

        // merging again has nothing to do
        let err = engine
            .merge(
                "repo1",
                "main",
                MergeRequest {
                    source: "feature".to_string(),
                    committer: "tester".to_string(),
                    message: None,
                    strategy: MergeStrategy::None,
                    metadata: BTreeMap::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoChanges { .. }));
    }

    #[tokio::test]
    async fn test_merge_conflict_and_dirty_destination() {
        let engine = engine_with_repo().await;
        engine.stage_object("repo1", "main", "k", b"base".to_vec()).await.unwrap();
        engine.commit("repo1", "main", commit_request("base")).await.unwrap();
        engine.create_branch("repo1", "feature", "main").await.unwrap();

        engine.stage_object("repo1", "feature", "k", b"feature".to_vec()).await.unwrap();
        engine.commit("repo1", "feature", commit_request("f")).await.unwrap();
        engine.stage_object("repo1", "main", "k", b"main".to_vec()).await.unwrap();

        let request = |strategy| MergeRequest {
            source: "feature".to_string(),
            committer: "tester".to_string(),
            message: None,
            strategy,
            metadata: BTreeMap::new(),
        };

        let err = engine.merge("repo1", "main", request(MergeStrategy::None)).await.unwrap_err();
        assert!(matches!(err, EngineError::DirtyBranch { .. }));

        engine.commit("repo1", "main", commit_request("m")).await.unwrap();
        let err = engine.merge("repo1", "main", request(MergeStrategy::None)).await.unwrap_err();
        match err {
            EngineError::MergeConflict { keys, .. } => assert_eq!(keys, vec!["k".to_string()]),
            other => panic!("unexpected error: {other}"),
        }

        engine.merge("repo1", "main", request(MergeStrategy::SourceWins)).await.unwrap();
        assert_eq!(engine.get_object("repo1", "main", "k").await.unwrap().data, b"feature".to_vec());
    }

    #[tokio::test]
    async fn test_log_and_diff_between_refs() {
        let engine = engine_with_repo().await;
        engine.stage_object("repo1", "main", "a", b"1".to_vec()).await.unwrap();
        let first = engine.commit("repo1", "main", commit_request("first")).await.unwrap();
        engine.stage_object("repo1", "main", "b", b"2".to_vec()).await.unwrap();
        let second = engine.commit("repo1", "main", commit_request("second")).await.unwrap();

        let log = engine.log("repo1", "main", 10).await.unwrap();
        let ids: Vec<_> = log.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids[0], second.id);
        assert_eq!(ids[1], first.id);
        assert_eq!(log.len(), 3);

        let diff = engine.diff("repo1", &first.id, &second.id).await.unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].key, "b");
        assert_eq!(diff[0].diff_type, DiffType::Added);
    }
}
