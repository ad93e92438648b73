use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::logic::committed::ChangeSet;
use crate::model::{codec, StagedEntry};
use crate::store::{scan_prefix, KvError, Store};

/// Staging areas. Each staging token is its own KV partition keyed by object key,
/// so a token can be listed or dropped without touching anything else.
pub struct StagingManager {
    store: Arc<dyn Store>,
}

impl StagingManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Last write per key wins
    pub async fn set(&self, token: &str, entry: &StagedEntry) -> EngineResult<()> {
        let bytes = codec::encode(entry)?;
        self.store
            .set(token.as_bytes(), entry.key.as_bytes(), &bytes)
            .await
            .map_err(|err| EngineError::kv(format!("stage {} in {}", entry.key, token), err))
    }

    pub async fn get(&self, token: &str, key: &str) -> EngineResult<Option<StagedEntry>> {
        match self.store.get(token.as_bytes(), key.as_bytes()).await {
            Ok(stored) => Ok(Some(codec::decode("staged entry", key, &stored.value)?)),
            Err(KvError::NotFound) => Ok(None),
            Err(err) => Err(EngineError::kv(format!("get staged {} in {}", key, token), err)),
        }
    }

    /// Every entry of a staging area in key order
    pub async fn list(&self, token: &str) -> EngineResult<Vec<StagedEntry>> {
        let entries = scan_prefix(self.store.as_ref(), token.as_bytes(), b"")
            .await
            .map_err(|err| EngineError::kv(format!("list staging {}", token), err))?;

        entries
            .iter()
            .map(|entry| {
                let key = String::from_utf8_lossy(&entry.key);
                codec::decode("staged entry", &key, &entry.value)
            })
            .collect()
    }

    pub async fn is_empty(&self, token: &str) -> EngineResult<bool> {
        let mut entries = self
            .store
            .scan(token.as_bytes(), b"")
            .await
            .map_err(|err| EngineError::kv(format!("scan staging {}", token), err))?;
        let first = entries.next_entry().await;
        entries.close();
        let first = first.map_err(|err| EngineError::kv(format!("scan staging {}", token), err))?;
        Ok(first.is_none())
    }

    /// Fold staging areas, oldest first, into one change set
    pub async fn materialize(&self, tokens_oldest_first: &[String]) -> EngineResult<ChangeSet> {
        let mut changes = ChangeSet::new();
        for token in tokens_oldest_first {
            for entry in self.list(token).await? {
                changes.insert(entry.key.clone(), entry.value());
            }
        }
        Ok(changes)
    }

    /// Delete every entry of a staging area
    pub async fn drop_token(&self, token: &str) -> EngineResult<()> {
        let entries = scan_prefix(self.store.as_ref(), token.as_bytes(), b"")
            .await
            .map_err(|err| EngineError::kv(format!("list staging {}", token), err))?;
        for entry in entries {
            self.store
                .delete(token.as_bytes(), &entry.key)
                .await
                .map_err(|err| EngineError::kv(format!("drop staging {}", token), err))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;
    use crate::store::MemoryStore;

    fn write(key: &str, data: &str) -> StagedEntry {
        StagedEntry::write(key.to_string(), Value::new(data.as_bytes().to_vec()))
    }

    #[tokio::test]
    async fn test_last_write_wins_within_token() {
        let staging = StagingManager::new(Arc::new(MemoryStore::new()));
        staging.set("t1", &write("a", "1")).await.unwrap();
        staging.set("t1", &write("a", "2")).await.unwrap();

        let entry = staging.get("t1", "a").await.unwrap().unwrap();
        assert_eq!(entry.data, b"2".to_vec());
        assert_eq!(staging.list("t1").await.unwrap().len(), 1);
        assert!(staging.get("t1", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_materialize_newer_tokens_override() {
        let staging = StagingManager::new(Arc::new(MemoryStore::new()));
        staging.set("old", &write("a", "old")).await.unwrap();
        staging.set("old", &write("b", "keep")).await.unwrap();
        staging.set("new", &write("a", "new")).await.unwrap();
        staging
            .set("new", &StagedEntry::tombstone("b".to_string()))
            .await
            .unwrap();

        let changes = staging
            .materialize(&["old".to_string(), "new".to_string()])
            .await
            .unwrap();
        assert_eq!(changes["a"].as_ref().unwrap().data, b"new".to_vec());
        assert_eq!(changes["b"], None);
    }

    #[tokio::test]
    async fn test_drop_token() {
        let store = Arc::new(MemoryStore::new());
        let staging = StagingManager::new(store.clone());
        staging.set("t1", &write("a", "1")).await.unwrap();
        staging.set("t1", &write("b", "2")).await.unwrap();
        staging.set("t2", &write("a", "1")).await.unwrap();
        assert!(!staging.is_empty("t1").await.unwrap());

        staging.drop_token("t1").await.unwrap();
        assert!(staging.is_empty("t1").await.unwrap());
        assert!(!staging.is_empty("t2").await.unwrap());
    }
}
