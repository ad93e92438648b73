use async_trait::async_trait;
use thiserror::Error;

/// Failure taxonomy of the key-value substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    #[error("missing partition key")]
    MissingPartitionKey,

    #[error("missing key")]
    MissingKey,

    #[error("missing value")]
    MissingValue,

    #[error("not found")]
    NotFound,

    #[error("predicate failed")]
    PredicateFailed,

    /// Backend or transport failure. The message is diagnostic only.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("iterator used after close")]
    ClosedEntries,

    #[error("store setup failed: {0}")]
    SetupFailed(String),
}

impl KvError {
    /// True for errors raised before a request reaches the backend.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            KvError::MissingPartitionKey | KvError::MissingKey | KvError::MissingValue
        )
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Opaque compare-and-swap token. Only the backend that issued it knows what is inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate(Vec<u8>);

impl Predicate {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueWithPredicate {
    pub value: Vec<u8>,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Partitioned, byte-oriented key-value store.
///
/// Every method validates its key material before touching the backend. Dropping
/// a returned future cancels the in-flight backend call.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, partition_key: &[u8], key: &[u8]) -> KvResult<ValueWithPredicate>;

    /// Unconditional upsert.
    async fn set(&self, partition_key: &[u8], key: &[u8], value: &[u8]) -> KvResult<()>;

    /// Writes `value` only if the stored value still matches `predicate`.
    /// `None` means the key must be absent. Fails with [`KvError::PredicateFailed`].
    async fn set_if(
        &self,
        partition_key: &[u8],
        key: &[u8],
        value: &[u8],
        predicate: Option<&Predicate>,
    ) -> KvResult<()>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, partition_key: &[u8], key: &[u8]) -> KvResult<()>;

    /// Ascending scan of one partition starting at `start` (inclusive). An empty
    /// `start` scans from the first key.
    async fn scan(&self, partition_key: &[u8], start: &[u8]) -> KvResult<Box<dyn EntriesIterator>>;

    async fn close(&self) {}
}

/// Pull-based cursor over scan results. Page boundaries are invisible to callers.
///
/// Not safe for concurrent advancement. Call [`EntriesIterator::close`] when done;
/// implementations also release their resources on drop.
#[async_trait]
pub trait EntriesIterator: Send {
    /// Moves to the next entry. Returns false at the end or on error.
    async fn advance(&mut self) -> bool;

    fn current(&self) -> Option<&Entry>;

    fn err(&self) -> Option<&KvError>;

    fn close(&mut self);

    async fn next_entry(&mut self) -> KvResult<Option<Entry>> {
        if self.advance().await {
            return Ok(self.current().cloned());
        }
        match self.err() {
            Some(err) => Err(err.clone()),
            None => Ok(None),
        }
    }
}

pub(crate) fn validate_key(partition_key: &[u8], key: &[u8]) -> KvResult<()> {
    if partition_key.is_empty() {
        return Err(KvError::MissingPartitionKey);
    }
    if key.is_empty() {
        return Err(KvError::MissingKey);
    }
    Ok(())
}

pub(crate) fn validate_write(partition_key: &[u8], key: &[u8], value: &[u8]) -> KvResult<()> {
    validate_key(partition_key, key)?;
    if value.is_empty() {
        return Err(KvError::MissingValue);
    }
    Ok(())
}

/// Collects every entry of `partition_key` whose key starts with `prefix`.
///
/// The iterator is closed on every path, including errors.
pub async fn scan_prefix(
    store: &dyn Store,
    partition_key: &[u8],
    prefix: &[u8],
) -> KvResult<Vec<Entry>> {
    let mut entries = store.scan(partition_key, prefix).await?;
    let mut out = Vec::new();
    let result = loop {
        match entries.next_entry().await {
            Ok(Some(entry)) if entry.key.starts_with(prefix) => out.push(entry),
            Ok(_) => break Ok(out),
            Err(err) => break Err(err),
        }
    };
    entries.close();
    result
}
