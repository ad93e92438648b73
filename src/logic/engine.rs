use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::logic::committed::CommittedManager;
use crate::logic::gc::{self, BranchRetentionReport, RecordGcRun};
use crate::logic::graph::CommitGraph;
use crate::logic::protection;
use crate::logic::staging::StagingManager;
use crate::model::{
    codec, generate_run_id, keys, validate_branch_id, validate_repository_id, validate_tag_id,
    BlockedAction, Branch, BranchProtectionRules, Commit, GarbageCollectionRules, GcRunMetadata,
    Id, Repository, Tag, DEFAULT_BRANCH,
};
use crate::store::{scan_prefix, Entry, KvError, Predicate, Store};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub staging_write_retries: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache_capacity: config.cache_capacity,
            staging_write_retries: config.staging_write_retries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Branch,
    Tag,
    Commit,
}

/// A ref resolved to the commit it names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRef {
    pub ref_type: RefType,
    /// Empty only for a branch that was never committed to
    pub commit_id: Id,
    /// Set when the ref is a branch, whose uncommitted data is part of its view
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
}

/// Repository creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRepository {
    pub id: Id,
    pub storage_namespace: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    /// Skip the initial empty commit
    #[serde(default)]
    pub bare: bool,
}

/// Versioning engine over a KV store.
///
/// Every mutation of shared state is a single-key compare-and-swap; there is
/// no lock, so independent branches never wait on each other. A lost CAS is
/// reported as [`EngineError::ConcurrentModification`] and never retried here.
pub struct VersionEngine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) staging: StagingManager,
    pub(crate) committed: CommittedManager,
    pub(crate) graph: CommitGraph,
    pub(crate) options: EngineOptions,
}

impl VersionEngine {
    pub fn new(store: Arc<dyn Store>, options: EngineOptions) -> Self {
        Self {
            staging: StagingManager::new(store.clone()),
            committed: CommittedManager::new(store.clone(), options.cache_ttl, options.cache_capacity),
            graph: CommitGraph::new(store.clone(), options.cache_ttl, options.cache_capacity),
            store,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // --- record helpers ---

    pub(crate) async fn read_record<T: DeserializeOwned + Send>(
        &self,
        partition: &str,
        key: &str,
        entity: &'static str,
        id: &str,
    ) -> EngineResult<Option<(T, Predicate)>> {
        match self.store.get(partition.as_bytes(), key.as_bytes()).await {
            Ok(stored) => Ok(Some((codec::decode(entity, id, &stored.value)?, stored.predicate))),
            Err(KvError::NotFound) => Ok(None),
            Err(err) => Err(EngineError::kv(format!("get {} {}", entity, id), err)),
        }
    }

    /// Conditional write. Returns false when the predicate no longer matches.
    pub(crate) async fn write_record_if<T: Serialize + Sync>(
        &self,
        partition: &str,
        key: &str,
        record: &T,
        predicate: Option<&Predicate>,
    ) -> EngineResult<bool> {
        let bytes = codec::encode(record)?;
        match self
            .store
            .set_if(partition.as_bytes(), key.as_bytes(), &bytes, predicate)
            .await
        {
            Ok(()) => Ok(true),
            Err(KvError::PredicateFailed) => Ok(false),
            Err(err) => Err(EngineError::kv(format!("conditional write {}", key), err)),
        }
    }

    pub(crate) async fn write_record<T: Serialize + Sync>(
        &self,
        partition: &str,
        key: &str,
        record: &T,
    ) -> EngineResult<()> {
        let bytes = codec::encode(record)?;
        self.store
            .set(partition.as_bytes(), key.as_bytes(), &bytes)
            .await
            .map_err(|err| EngineError::kv(format!("write {}", key), err))
    }

    pub(crate) async fn remove_record(&self, partition: &str, key: &str) -> EngineResult<()> {
        self.store
            .delete(partition.as_bytes(), key.as_bytes())
            .await
            .map_err(|err| EngineError::kv(format!("delete {}", key), err))
    }

    async fn list_records<T: DeserializeOwned + Send>(
        &self,
        partition: &str,
        prefix: &str,
        entity: &'static str,
    ) -> EngineResult<Vec<T>> {
        let entries = scan_prefix(self.store.as_ref(), partition.as_bytes(), prefix.as_bytes())
            .await
            .map_err(|err| EngineError::kv(format!("list {}", prefix), err))?;
        entries
            .iter()
            .map(|Entry { key, value }| {
                let id = keys::id_from_key(prefix, key).unwrap_or_default();
                codec::decode(entity, id, value)
            })
            .collect()
    }

    // --- repositories ---

    pub async fn create_repository(&self, request: NewRepository) -> EngineResult<Repository> {
        validate_repository_id(&request.id)?;
        if request.storage_namespace.is_empty() {
            return Err(EngineError::invalid("storage namespace", "must not be empty"));
        }
        let default_branch = request
            .default_branch
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        validate_branch_id(&default_branch)?;

        let repo_key = keys::repository_key(&request.id);
        if self
            .read_record::<Repository>(keys::REPOSITORIES_PARTITION, &repo_key, "repository", &request.id)
            .await?
            .is_some()
        {
            return Err(EngineError::RepositoryAlreadyExists(request.id));
        }

        let repository = Repository::new(request.id, request.storage_namespace, default_branch.clone());
        let partition = repository.partition();

        let commit_id = if request.bare {
            String::new()
        } else {
            let meta_range_id = self
                .committed
                .put(&repository, Default::default())
                .await?;
            let commit = Commit::new(
                String::new(),
                "Repository created".to_string(),
                meta_range_id,
                Default::default(),
                &[],
            );
            self.graph.put(&repository, &commit).await?;
            commit.id
        };

        // The partition is fresh, so the branch can be written unconditionally.
        // The repository record goes last: readers never see a repository
        // without its default branch.
        let branch = Branch::new(default_branch, commit_id);
        self.write_record(&partition, &keys::branch_key(&branch.id), &branch)
            .await?;

        if !self
            .write_record_if(keys::REPOSITORIES_PARTITION, &repo_key, &repository, None)
            .await?
        {
            return Err(EngineError::RepositoryAlreadyExists(repository.id));
        }

        log::info!(
            "created repository {} (namespace={}, default branch={}, bare={})",
            repository.id,
            repository.storage_namespace,
            repository.default_branch_id,
            request.bare
        );
        Ok(repository)
    }

    /// Create a repository whose default branch has no commit yet.
    pub async fn create_bare_repository(
        &self,
        mut request: NewRepository,
    ) -> EngineResult<Repository> {
        request.bare = true;
        self.create_repository(request).await
    }

    pub async fn get_repository(&self, repository_id: &str) -> EngineResult<Repository> {
        validate_repository_id(repository_id)?;
        self.read_record(
            keys::REPOSITORIES_PARTITION,
            &keys::repository_key(repository_id),
            "repository",
            repository_id,
        )
        .await?
        .map(|(repository, _)| repository)
        .ok_or_else(|| EngineError::RepositoryNotFound(repository_id.to_string()))
    }

    pub async fn list_repositories(&self) -> EngineResult<Vec<Repository>> {
        self.list_records(
            keys::REPOSITORIES_PARTITION,
            keys::REPOSITORIES_PREFIX,
            "repository",
        )
        .await
    }

    /// Remove the repository record, then clean up its partition and staging
    /// areas. Cleanup is best effort: leftovers are unreachable because a
    /// re-created repository gets a new partition.
    pub async fn delete_repository(&self, repository_id: &str) -> EngineResult<()> {
        let repository = self.get_repository(repository_id).await?;
        self.remove_record(keys::REPOSITORIES_PARTITION, &keys::repository_key(repository_id))
            .await?;

        if let Err(err) = self.purge_repository(&repository).await {
            log::warn!(
                "repository {} deleted but cleanup failed: {}",
                repository_id,
                err
            );
        }
        self.graph.forget_repository(&repository).await;
        self.committed.forget_repository(&repository).await;

        log::info!("deleted repository {}", repository_id);
        Ok(())
    }

    async fn purge_repository(&self, repository: &Repository) -> EngineResult<()> {
        let partition = repository.partition();
        let branches: Vec<Branch> = self
            .list_records(&partition, keys::BRANCHES_PREFIX, "branch")
            .await?;
        for branch in &branches {
            for token in branch.tokens_newest_first() {
                self.staging.drop_token(token).await?;
            }
        }

        let entries = scan_prefix(self.store.as_ref(), partition.as_bytes(), b"")
            .await
            .map_err(|err| EngineError::kv(format!("scan {}", partition), err))?;
        for entry in entries {
            self.store
                .delete(partition.as_bytes(), &entry.key)
                .await
                .map_err(|err| EngineError::kv(format!("purge {}", partition), err))?;
        }
        Ok(())
    }

    // --- branches ---

    pub(crate) async fn get_branch_record(
        &self,
        repository: &Repository,
        branch_id: &str,
    ) -> EngineResult<(Branch, Predicate)> {
        validate_branch_id(branch_id)?;
        self.read_record(
            &repository.partition(),
            &keys::branch_key(branch_id),
            "branch",
            branch_id,
        )
        .await?
        .ok_or_else(|| EngineError::BranchNotFound {
            repository: repository.id.clone(),
            branch: branch_id.to_string(),
        })
    }

    pub async fn create_branch(
        &self,
        repository_id: &str,
        branch_id: &str,
        source_ref: &str,
    ) -> EngineResult<Branch> {
        validate_branch_id(branch_id)?;
        let repository = self.get_repository(repository_id).await?;
        let source = self.resolve_ref_in(&repository, source_ref).await?;

        let branch = Branch::new(branch_id.to_string(), source.commit_id);
        if !self
            .write_record_if(&repository.partition(), &keys::branch_key(branch_id), &branch, None)
            .await?
        {
            return Err(EngineError::BranchAlreadyExists {
                repository: repository_id.to_string(),
                branch: branch_id.to_string(),
            });
        }

        log::info!(
            "created branch {} in {} from {} ({})",
            branch_id,
            repository_id,
            source_ref,
            branch.commit_id
        );
        Ok(branch)
    }

    pub async fn get_branch(&self, repository_id: &str, branch_id: &str) -> EngineResult<Branch> {
        let repository = self.get_repository(repository_id).await?;
        let (branch, _) = self.get_branch_record(&repository, branch_id).await?;
        Ok(branch)
    }

    pub async fn list_branches(&self, repository_id: &str) -> EngineResult<Vec<Branch>> {
        let repository = self.get_repository(repository_id).await?;
        self.list_records(&repository.partition(), keys::BRANCHES_PREFIX, "branch")
            .await
    }

    pub async fn delete_branch(&self, repository_id: &str, branch_id: &str) -> EngineResult<()> {
        let repository = self.get_repository(repository_id).await?;
        if repository.default_branch_id == branch_id {
            return Err(EngineError::CannotDeleteDefaultBranch {
                repository: repository_id.to_string(),
                branch: branch_id.to_string(),
            });
        }

        let (branch, _) = self.get_branch_record(&repository, branch_id).await?;
        self.remove_record(&repository.partition(), &keys::branch_key(branch_id))
            .await?;
        self.drop_tokens_best_effort(&repository, branch.tokens_newest_first())
            .await;

        log::info!("deleted branch {} in {}", branch_id, repository_id);
        Ok(())
    }

    pub(crate) async fn drop_tokens_best_effort<'a>(
        &self,
        repository: &Repository,
        tokens: impl IntoIterator<Item = &'a str>,
    ) {
        for token in tokens {
            if let Err(err) = self.staging.drop_token(token).await {
                log::warn!(
                    "failed to drop staging area {} of {}: {}",
                    token,
                    repository.id,
                    err
                );
            }
        }
    }

    // --- refs ---

    pub async fn resolve_ref(&self, repository_id: &str, reference: &str) -> EngineResult<ResolvedRef> {
        let repository = self.get_repository(repository_id).await?;
        self.resolve_ref_in(&repository, reference).await
    }

    /// Branch first, then tag, then commit id
    pub(crate) async fn resolve_ref_in(
        &self,
        repository: &Repository,
        reference: &str,
    ) -> EngineResult<ResolvedRef> {
        if reference.is_empty() {
            return Err(EngineError::invalid("ref", "must not be empty"));
        }
        let partition = repository.partition();

        if validate_branch_id(reference).is_ok() {
            if let Some((branch, _)) = self
                .read_record::<Branch>(&partition, &keys::branch_key(reference), "branch", reference)
                .await?
            {
                return Ok(ResolvedRef {
                    ref_type: RefType::Branch,
                    commit_id: branch.commit_id.clone(),
                    branch: Some(branch),
                });
            }
            if let Some((tag, _)) = self
                .read_record::<Tag>(&partition, &keys::tag_key(reference), "tag", reference)
                .await?
            {
                return Ok(ResolvedRef {
                    ref_type: RefType::Tag,
                    commit_id: tag.commit_id,
                    branch: None,
                });
            }
        }

        match self.graph.get(repository, reference).await {
            Ok(commit) => Ok(ResolvedRef {
                ref_type: RefType::Commit,
                commit_id: commit.id.clone(),
                branch: None,
            }),
            Err(EngineError::CommitNotFound { .. }) | Err(EngineError::InvalidKey { .. }) => {
                Err(EngineError::RefNotFound {
                    repository: repository.id.clone(),
                    reference: reference.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    // --- tags ---

    /// Tags are immutable. Re-creating a tag for the same commit succeeds;
    /// for another commit it conflicts.
    pub async fn create_tag(&self, repository_id: &str, tag_id: &str, target_ref: &str) -> EngineResult<Tag> {
        validate_tag_id(tag_id)?;
        let repository = self.get_repository(repository_id).await?;
        let target = self.resolve_ref_in(&repository, target_ref).await?;
        if target.commit_id.is_empty() {
            return Err(EngineError::invalid(
                "tag target",
                format!("'{}' has no commit", target_ref),
            ));
        }

        let partition = repository.partition();
        let key = keys::tag_key(tag_id);
        let tag = Tag::new(tag_id.to_string(), target.commit_id);
        if self.write_record_if(&partition, &key, &tag, None).await? {
            log::info!("created tag {} in {} at {}", tag_id, repository_id, tag.commit_id);
            return Ok(tag);
        }

        match self.read_record::<Tag>(&partition, &key, "tag", tag_id).await? {
            Some((existing, _)) if existing.commit_id == tag.commit_id => Ok(existing),
            Some((existing, _)) => Err(EngineError::TagAlreadyExists {
                repository: repository_id.to_string(),
                tag: tag_id.to_string(),
                commit: existing.commit_id,
            }),
            // deleted between our write and read
            None => Err(EngineError::ConcurrentModification {
                repository: repository_id.to_string(),
                entity: format!("tag {}", tag_id),
            }),
        }
    }

    pub async fn get_tag(&self, repository_id: &str, tag_id: &str) -> EngineResult<Tag> {
        validate_tag_id(tag_id)?;
        let repository = self.get_repository(repository_id).await?;
        self.read_record(&repository.partition(), &keys::tag_key(tag_id), "tag", tag_id)
            .await?
            .map(|(tag, _)| tag)
            .ok_or_else(|| EngineError::TagNotFound {
                repository: repository_id.to_string(),
                tag: tag_id.to_string(),
            })
    }

    pub async fn list_tags(&self, repository_id: &str) -> EngineResult<Vec<Tag>> {
        let repository = self.get_repository(repository_id).await?;
        self.list_records(&repository.partition(), keys::TAGS_PREFIX, "tag")
            .await
    }

    pub async fn delete_tag(&self, repository_id: &str, tag_id: &str) -> EngineResult<()> {
        let repository = self.get_repository(repository_id).await?;
        self.get_tag(repository_id, tag_id).await?;
        self.remove_record(&repository.partition(), &keys::tag_key(tag_id))
            .await?;
        log::info!("deleted tag {} in {}", tag_id, repository_id);
        Ok(())
    }

    // --- garbage collection settings ---

    pub async fn get_gc_rules(&self, repository_id: &str) -> EngineResult<GarbageCollectionRules> {
        let repository = self.get_repository(repository_id).await?;
        self.read_record(
            &repository.partition(),
            keys::GC_RULES_KEY,
            "gc rules",
            repository_id,
        )
        .await?
        .map(|(rules, _)| rules)
        .ok_or_else(|| EngineError::GcRulesNotFound(repository_id.to_string()))
    }

    pub async fn set_gc_rules(&self, repository_id: &str, rules: &GarbageCollectionRules) -> EngineResult<()> {
        rules.validate()?;
        let repository = self.get_repository(repository_id).await?;
        self.write_record(&repository.partition(), keys::GC_RULES_KEY, rules)
            .await?;
        log::info!(
            "set gc rules of {} (default {} days, {} branch rules)",
            repository_id,
            rules.default_retention_days,
            rules.branch_retention_days.len()
        );
        Ok(())
    }

    pub async fn delete_gc_rules(&self, repository_id: &str) -> EngineResult<()> {
        let repository = self.get_repository(repository_id).await?;
        self.remove_record(&repository.partition(), keys::GC_RULES_KEY)
            .await
    }

    pub async fn effective_retention(&self, repository_id: &str, branch_id: &str) -> EngineResult<i32> {
        validate_branch_id(branch_id)?;
        let rules = self.get_gc_rules(repository_id).await?;
        Ok(gc::effective_retention(&rules, branch_id))
    }

    /// Every branch with the retention the sweeper must honour for it
    pub async fn retention_report(&self, repository_id: &str) -> EngineResult<Vec<BranchRetentionReport>> {
        let rules = self.get_gc_rules(repository_id).await?;
        let branches = self.list_branches(repository_id).await?;
        Ok(gc::retention_report(
            &rules,
            branches
                .iter()
                .map(|b| (b.id.as_str(), b.commit_id.as_str())),
        ))
    }

    /// Record where a run left its inputs. Re-recording a run id overwrites it.
    pub async fn record_gc_run(&self, repository_id: &str, run: RecordGcRun) -> EngineResult<GcRunMetadata> {
        if run.commits_location.is_empty() {
            return Err(EngineError::invalid("commits location", "must not be empty"));
        }
        if run.address_location.is_empty() {
            return Err(EngineError::invalid("address location", "must not be empty"));
        }
        let run_id = match run.run_id {
            Some(id) if id.is_empty() => return Err(EngineError::invalid("run id", "must not be empty")),
            Some(id) => id,
            None => generate_run_id(),
        };

        let repository = self.get_repository(repository_id).await?;
        let metadata = GcRunMetadata {
            run_id,
            commits_location: run.commits_location,
            address_location: run.address_location,
            creation_date: chrono::Utc::now(),
        };
        self.write_record(
            &repository.partition(),
            &keys::gc_run_key(&metadata.run_id),
            &metadata,
        )
        .await?;
        log::info!("recorded gc run {} for {}", metadata.run_id, repository_id);
        Ok(metadata)
    }

    pub async fn get_gc_run(&self, repository_id: &str, run_id: &str) -> EngineResult<GcRunMetadata> {
        let repository = self.get_repository(repository_id).await?;
        if run_id.is_empty() {
            return Err(EngineError::invalid("run id", "must not be empty"));
        }
        self.read_record(
            &repository.partition(),
            &keys::gc_run_key(run_id),
            "gc run",
            run_id,
        )
        .await?
        .map(|(run, _)| run)
        .ok_or_else(|| EngineError::GcRunNotFound {
            repository: repository_id.to_string(),
            run_id: run_id.to_string(),
        })
    }

    // --- branch protection ---

    async fn read_protection(
        &self,
        repository: &Repository,
    ) -> EngineResult<(BranchProtectionRules, Option<Predicate>)> {
        Ok(self
            .read_record(
                &repository.partition(),
                keys::BRANCH_PROTECTION_KEY,
                "branch protection",
                &repository.id,
            )
            .await?
            .map_or_else(
                || (BranchProtectionRules::default(), None),
                |(rules, predicate)| (rules, Some(predicate)),
            ))
    }

    /// Refuse `action` on `branch_id` if any matching rule blocks it
    pub(crate) async fn check_protection(
        &self,
        repository: &Repository,
        branch_id: &str,
        action: BlockedAction,
    ) -> EngineResult<()> {
        let (rules, _) = self.read_protection(repository).await?;
        if protection::is_blocked(&rules, branch_id, action) {
            log::info!(
                "{} on {}/{} denied by branch protection",
                action,
                repository.id,
                branch_id
            );
            return Err(EngineError::PolicyDenied {
                repository: repository.id.clone(),
                branch: branch_id.to_string(),
                action,
            });
        }
        Ok(())
    }

    pub async fn get_branch_protection_rules(&self, repository_id: &str) -> EngineResult<BranchProtectionRules> {
        let repository = self.get_repository(repository_id).await?;
        let (rules, _) = self.read_protection(&repository).await?;
        Ok(rules)
    }

    pub async fn set_branch_protection_rules(
        &self,
        repository_id: &str,
        rules: &BranchProtectionRules,
    ) -> EngineResult<()> {
        rules.validate()?;
        let repository = self.get_repository(repository_id).await?;
        self.write_record(&repository.partition(), keys::BRANCH_PROTECTION_KEY, rules)
            .await?;
        log::info!(
            "set {} branch protection rules on {}",
            rules.rules.len(),
            repository_id
        );
        Ok(())
    }

    /// Add or replace the rule for `pattern`. One CAS attempt.
    pub async fn add_branch_protection_rule(
        &self,
        repository_id: &str,
        pattern: &str,
        actions: impl IntoIterator<Item = BlockedAction>,
    ) -> EngineResult<BranchProtectionRules> {
        let repository = self.get_repository(repository_id).await?;
        let (mut rules, predicate) = self.read_protection(&repository).await?;
        rules
            .rules
            .insert(pattern.to_string(), actions.into_iter().collect());
        rules.validate()?;

        self.swap_protection(&repository, &rules, predicate.as_ref())
            .await?;
        Ok(rules)
    }

    pub async fn delete_branch_protection_rule(
        &self,
        repository_id: &str,
        pattern: &str,
    ) -> EngineResult<BranchProtectionRules> {
        let repository = self.get_repository(repository_id).await?;
        let (mut rules, predicate) = self.read_protection(&repository).await?;
        if rules.rules.remove(pattern).is_none() {
            return Err(EngineError::ProtectionRuleNotFound {
                repository: repository_id.to_string(),
                pattern: pattern.to_string(),
            });
        }

        self.swap_protection(&repository, &rules, predicate.as_ref())
            .await?;
        Ok(rules)
    }

    async fn swap_protection(
        &self,
        repository: &Repository,
        rules: &BranchProtectionRules,
        predicate: Option<&Predicate>,
    ) -> EngineResult<()> {
        if !self
            .write_record_if(
                &repository.partition(),
                keys::BRANCH_PROTECTION_KEY,
                rules,
                predicate,
            )
            .await?
        {
            return Err(EngineError::ConcurrentModification {
                repository: repository.id.clone(),
                entity: "branch protection rules".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;

    fn engine() -> VersionEngine {
        VersionEngine::new(Arc::new(MemoryStore::new()), EngineOptions::default())
    }

    fn new_repo(id: &str) -> NewRepository {
        NewRepository {
            id: id.to_string(),
            storage_namespace: format!("s3://bucket/{}", id),
            default_branch: None,
            bare: false,
        }
    }

    #[tokio::test]
    async fn test_create_repository_with_initial_commit() {
        let engine = engine();
        let repo = engine.create_repository(new_repo("repo1")).await.unwrap();
        assert_eq!(repo.default_branch_id, "main");

        let main = engine.get_branch("repo1", "main").await.unwrap();
        assert!(main.has_commit());
        let commit = engine.graph.get(&repo, &main.commit_id).await.unwrap();
        assert_eq!(commit.generation, 1);

        let err = engine.create_repository(new_repo("repo1")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_bare_repository_has_empty_default_branch() {
        let engine = engine();
        let mut request = new_repo("bare1");
        request.bare = true;
        request.default_branch = Some("trunk".to_string());
        engine.create_repository(request).await.unwrap();

        let trunk = engine.get_branch("bare1", "trunk").await.unwrap();
        assert!(!trunk.has_commit());
        assert!(engine.log("bare1", "trunk", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_bare_repository_forces_bare() {
        let engine = engine();
        engine.create_bare_repository(new_repo("bare2")).await.unwrap();
        let main = engine.get_branch("bare2", DEFAULT_BRANCH).await.unwrap();
        assert!(!main.has_commit());
    }

    #[tokio::test]
    async fn test_repository_lifecycle() {
        let engine = engine();
        engine.create_repository(new_repo("repo-a")).await.unwrap();
        engine.create_repository(new_repo("repo-b")).await.unwrap();
        let ids: Vec<_> = engine
            .list_repositories()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["repo-a".to_string(), "repo-b".to_string()]);

        engine.delete_repository("repo-a").await.unwrap();
        assert!(engine.get_repository("repo-a").await.unwrap_err().is_not_found());

        // a re-created repository starts empty
        engine.create_repository(new_repo("repo-a")).await.unwrap();
        assert_eq!(engine.list_branches("repo-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_ids_are_rejected_before_storage() {
        let engine = engine();
        let err = engine.create_repository(new_repo("X")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = engine.get_branch("repo1", "bad/branch").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_branches() {
        let engine = engine();
        engine.create_repository(new_repo("repo1")).await.unwrap();
        let main = engine.get_branch("repo1", "main").await.unwrap();

        let dev = engine.create_branch("repo1", "dev", "main").await.unwrap();
        assert_eq!(dev.commit_id, main.commit_id);
        assert_ne!(dev.staging_token, main.staging_token);

        let err = engine.create_branch("repo1", "dev", "main").await.unwrap_err();
        assert!(err.is_conflict());
        let err = engine.create_branch("repo1", "x", "missing").await.unwrap_err();
        assert!(err.is_not_found());

        let err = engine.delete_branch("repo1", "main").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        engine.delete_branch("repo1", "dev").await.unwrap();
        assert_eq!(engine.list_branches("repo1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_ref_order() {
        let engine = engine();
        engine.create_repository(new_repo("repo1")).await.unwrap();
        let main = engine.get_branch("repo1", "main").await.unwrap();
        engine.create_tag("repo1", "v1", "main").await.unwrap();

        let resolved = engine.resolve_ref("repo1", "main").await.unwrap();
        assert_eq!(resolved.ref_type, RefType::Branch);
        let resolved = engine.resolve_ref("repo1", "v1").await.unwrap();
        assert_eq!(resolved.ref_type, RefType::Tag);
        let resolved = engine.resolve_ref("repo1", &main.commit_id).await.unwrap();
        assert_eq!(resolved.ref_type, RefType::Commit);
        assert_eq!(resolved.commit_id, main.commit_id);
    }

    #[tokio::test]
    async fn test_gc_settings() {
        let engine = engine();
        engine.create_repository(new_repo("repo1")).await.unwrap();
        assert!(engine.get_gc_rules("repo1").await.unwrap_err().is_not_found());

        let rules = GarbageCollectionRules::new(7).with_branch("main", 30);
        engine.set_gc_rules("repo1", &rules).await.unwrap();
        assert_eq!(engine.get_gc_rules("repo1").await.unwrap(), rules);
        assert_eq!(engine.effective_retention("repo1", "main").await.unwrap(), 30);
        assert_eq!(engine.effective_retention("repo1", "dev").await.unwrap(), 7);

        let report = engine.retention_report("repo1").await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].retention_days, 30);

        let run = engine
            .record_gc_run(
                "repo1",
                RecordGcRun {
                    run_id: None,
                    commits_location: "s3://bucket/_gc/commits.csv".into(),
                    address_location: "s3://bucket/_gc/addresses/".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(engine.get_gc_run("repo1", &run.run_id).await.unwrap(), run);

        engine.delete_gc_rules("repo1").await.unwrap();
        assert!(engine.get_gc_rules("repo1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_protection_rule_edits() {
        let engine = engine();
        engine.create_repository(new_repo("repo1")).await.unwrap();
        assert!(engine.get_branch_protection_rules("repo1").await.unwrap().is_empty());

        engine
            .add_branch_protection_rule("repo1", "main", [BlockedAction::StagingWrite])
            .await
            .unwrap();
        let rules = engine
            .add_branch_protection_rule("repo1", "release-*", [BlockedAction::Commit])
            .await
            .unwrap();
        assert_eq!(rules.rules.len(), 2);

        let rules = engine
            .delete_branch_protection_rule("repo1", "main")
            .await
            .unwrap();
        assert_eq!(rules.rules.len(), 1);
        let err = engine
            .delete_branch_protection_rule("repo1", "main")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
