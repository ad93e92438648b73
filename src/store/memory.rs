use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::store::iterator::{PageSource, PagedEntries};
use crate::store::traits::{
    validate_key, validate_write, EntriesIterator, Entry, KvError, KvResult, Predicate, Store,
    ValueWithPredicate,
};

pub const DEFAULT_SCAN_PAGE_SIZE: usize = 1000;

type Partitions = HashMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>;

/// In-process store. Every operation is linearizable under a single lock.
///
/// The CAS predicate is the stored value itself.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    partitions: Arc<RwLock<Partitions>>,
    scan_page_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_SCAN_PAGE_SIZE)
    }

    pub fn with_page_size(scan_page_size: usize) -> Self {
        Self {
            partitions: Arc::new(RwLock::new(HashMap::new())),
            scan_page_size: scan_page_size.max(1),
        }
    }

    /// Number of keys currently stored in `partition_key`.
    pub fn partition_len(&self, partition_key: &[u8]) -> usize {
        self.partitions
            .read()
            .get(partition_key)
            .map(|p| p.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, partition_key: &[u8], key: &[u8]) -> KvResult<ValueWithPredicate> {
        validate_key(partition_key, key)?;
        let partitions = self.partitions.read();
        let value = partitions
            .get(partition_key)
            .and_then(|p| p.get(key))
            .ok_or(KvError::NotFound)?;
        Ok(ValueWithPredicate {
            value: value.clone(),
            predicate: Predicate::new(value.clone()),
        })
    }

    async fn set(&self, partition_key: &[u8], key: &[u8], value: &[u8]) -> KvResult<()> {
        validate_write(partition_key, key, value)?;
        self.partitions
            .write()
            .entry(partition_key.to_vec())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn set_if(
        &self,
        partition_key: &[u8],
        key: &[u8],
        value: &[u8],
        predicate: Option<&Predicate>,
    ) -> KvResult<()> {
        validate_write(partition_key, key, value)?;
        let mut partitions = self.partitions.write();
        let partition = partitions.entry(partition_key.to_vec()).or_default();
        let matches = match (partition.get(key), predicate) {
            (None, None) => true,
            (Some(current), Some(expected)) => current.as_slice() == expected.as_bytes(),
            _ => false,
        };
        if !matches {
            return Err(KvError::PredicateFailed);
        }
        partition.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, partition_key: &[u8], key: &[u8]) -> KvResult<()> {
        validate_key(partition_key, key)?;
        let mut partitions = self.partitions.write();
        if let Some(partition) = partitions.get_mut(partition_key) {
            partition.remove(key);
            if partition.is_empty() {
                partitions.remove(partition_key);
            }
        }
        Ok(())
    }

    async fn scan(&self, partition_key: &[u8], start: &[u8]) -> KvResult<Box<dyn EntriesIterator>> {
        if partition_key.is_empty() {
            return Err(KvError::MissingPartitionKey);
        }
        Ok(Box::new(PagedEntries::new(
            Arc::new(self.clone()),
            partition_key,
            start,
            self.scan_page_size,
        )))
    }
}

#[async_trait]
impl PageSource for MemoryStore {
    async fn fetch_page(
        &self,
        partition_key: &[u8],
        from: &[u8],
        inclusive: bool,
        limit: usize,
    ) -> KvResult<Vec<Entry>> {
        let partitions = self.partitions.read();
        let Some(partition) = partitions.get(partition_key) else {
            return Ok(Vec::new());
        };
        let lower = if inclusive {
            Bound::Included(from.to_vec())
        } else {
            Bound::Excluded(from.to_vec())
        };
        Ok(partition
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(key, value)| Entry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }
}
