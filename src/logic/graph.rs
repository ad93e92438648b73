use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::model::{codec, keys, Commit, Repository};
use crate::store::{KvError, RecordCache, Store};

/// Read and write access to the commit DAG. Commits are immutable, so lookups
/// go through a cache.
pub struct CommitGraph {
    store: Arc<dyn Store>,
    cache: RecordCache<Arc<Commit>>,
}

impl CommitGraph {
    pub fn new(store: Arc<dyn Store>, cache_ttl: Duration, cache_capacity: usize) -> Self {
        Self {
            store,
            cache: RecordCache::new(cache_ttl, cache_capacity),
        }
    }

    pub async fn get(&self, repository: &Repository, commit_id: &str) -> EngineResult<Arc<Commit>> {
        let partition = repository.partition();
        if let Some(cached) = self.cache.get(&partition, commit_id).await {
            return Ok(cached);
        }

        let stored = self
            .store
            .get(partition.as_bytes(), keys::commit_key(commit_id).as_bytes())
            .await
            .map_err(|err| match err {
                KvError::NotFound => EngineError::CommitNotFound {
                    repository: repository.id.clone(),
                    commit: commit_id.to_string(),
                },
                other => EngineError::kv(format!("get commit {}", commit_id), other),
            })?;

        let commit: Commit = codec::decode("commit", commit_id, &stored.value)?;
        if commit.id != commit_id || !commit.verify_id() {
            return Err(EngineError::corruption(
                "commit",
                commit_id,
                "content does not match its id",
            ));
        }

        let commit = Arc::new(commit);
        self.cache.put(&partition, commit_id, commit.clone()).await;
        Ok(commit)
    }

    /// Store a commit. Commits are content addressed, so finding one already in
    /// place means an earlier attempt wrote the same commit.
    pub async fn put(&self, repository: &Repository, commit: &Commit) -> EngineResult<()> {
        let partition = repository.partition();
        let bytes = codec::encode(commit)?;
        match self
            .store
            .set_if(
                partition.as_bytes(),
                keys::commit_key(&commit.id).as_bytes(),
                &bytes,
                None,
            )
            .await
        {
            Ok(()) => {}
            Err(KvError::PredicateFailed) => {
                log::debug!("commit {} already stored in {}", commit.id, repository.id);
            }
            Err(err) => return Err(EngineError::kv(format!("put commit {}", commit.id), err)),
        }
        self.cache
            .put(&partition, &commit.id, Arc::new(commit.clone()))
            .await;
        Ok(())
    }

    /// Commits reachable from `start`, highest generation first, at most `limit`.
    /// Verifies every visited commit's generation against its parents.
    pub async fn log(
        &self,
        repository: &Repository,
        start: &str,
        limit: usize,
    ) -> EngineResult<Vec<Arc<Commit>>> {
        let mut walker = CommitWalker::default();
        walker.push(self.get(repository, start).await?);

        let mut out = Vec::new();
        while out.len() < limit {
            let Some(commit) = walker.pop() else { break };
            let parents = self.parents_of(repository, &commit).await?;
            for parent in parents {
                walker.push(parent);
            }
            out.push(commit);
        }
        Ok(out)
    }

    /// True when `ancestor` is reachable from `descendant` (a commit is its own ancestor)
    pub async fn is_ancestor(
        &self,
        repository: &Repository,
        ancestor: &str,
        descendant: &str,
    ) -> EngineResult<bool> {
        let target = self.get(repository, ancestor).await?;
        let mut walker = CommitWalker::default();
        walker.push(self.get(repository, descendant).await?);

        while let Some(commit) = walker.pop() {
            if commit.id == target.id {
                return Ok(true);
            }
            // nothing below the target's generation can reach it
            if commit.generation <= target.generation {
                continue;
            }
            for parent in self.parents_of(repository, &commit).await? {
                walker.push(parent);
            }
        }
        Ok(false)
    }

    /// Best common ancestor of two commits: the reachable-from-both commit with the
    /// highest generation. None when the histories are unrelated.
    pub async fn merge_base(
        &self,
        repository: &Repository,
        left: &str,
        right: &str,
    ) -> EngineResult<Option<Arc<Commit>>> {
        let mut left_ancestors = HashSet::new();
        let mut walker = CommitWalker::default();
        walker.push(self.get(repository, left).await?);
        while let Some(commit) = walker.pop() {
            for parent in self.parents_of(repository, &commit).await? {
                walker.push(parent);
            }
            left_ancestors.insert(commit.id.clone());
        }

        let mut walker = CommitWalker::default();
        walker.push(self.get(repository, right).await?);
        while let Some(commit) = walker.pop() {
            if left_ancestors.contains(&commit.id) {
                return Ok(Some(commit));
            }
            for parent in self.parents_of(repository, &commit).await? {
                walker.push(parent);
            }
        }
        Ok(None)
    }

    /// Load the parents of `commit` and check its generation against them
    async fn parents_of(&self, repository: &Repository, commit: &Commit) -> EngineResult<Vec<Arc<Commit>>> {
        let mut parents = Vec::with_capacity(commit.parents.len());
        for parent_id in &commit.parents {
            let parent = self.get(repository, parent_id).await.map_err(|err| match err {
                EngineError::CommitNotFound { .. } => EngineError::corruption(
                    "commit",
                    commit.id.as_str(),
                    format!("parent {} is missing", parent_id),
                ),
                other => other,
            })?;
            parents.push(parent);
        }

        let expected = Commit::next_generation(parents.iter().map(|p| p.generation));
        if commit.generation != expected {
            return Err(EngineError::corruption(
                "commit",
                commit.id.as_str(),
                format!("generation {} but parents imply {}", commit.generation, expected),
            ));
        }
        Ok(parents)
    }

    pub async fn forget_repository(&self, repository: &Repository) {
        self.cache.remove_partition(&repository.partition()).await;
    }
}

/// Max-heap over commits ordered by (generation, creation date, id), visiting
/// each commit once.
#[derive(Default)]
pub struct CommitWalker {
    queue: BinaryHeap<ByGeneration>,
    seen: HashSet<String>,
}

impl CommitWalker {
    pub fn push(&mut self, commit: Arc<Commit>) {
        if self.seen.insert(commit.id.clone()) {
            self.queue.push(ByGeneration(commit));
        }
    }

    pub fn pop(&mut self) -> Option<Arc<Commit>> {
        self.queue.pop().map(|entry| entry.0)
    }
}

struct ByGeneration(Arc<Commit>);

impl ByGeneration {
    fn sort_key(&self) -> (u64, chrono::DateTime<chrono::Utc>, &str) {
        (self.0.generation, self.0.creation_date, self.0.id.as_str())
    }
}

impl PartialEq for ByGeneration {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ByGeneration {}

impl PartialOrd for ByGeneration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByGeneration {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}
