use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use crate::store::traits::{EntriesIterator, Entry, KvError, KvResult};

/// Backend hook used by [`PagedEntries`] to fetch one ordered page.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Returns at most `limit` entries of `partition_key` in ascending key order,
    /// starting at `from` (inclusive when `inclusive`, otherwise strictly after).
    async fn fetch_page(
        &self,
        partition_key: &[u8],
        from: &[u8],
        inclusive: bool,
        limit: usize,
    ) -> KvResult<Vec<Entry>>;
}

/// Lazily paginated scan cursor shared by every backend.
pub struct PagedEntries {
    source: Arc<dyn PageSource>,
    partition_key: Vec<u8>,
    next_from: Vec<u8>,
    inclusive: bool,
    page_size: usize,
    page: VecDeque<Entry>,
    exhausted: bool,
    current: Option<Entry>,
    err: Option<KvError>,
}

impl PagedEntries {
    pub fn new(
        source: Arc<dyn PageSource>,
        partition_key: &[u8],
        start: &[u8],
        page_size: usize,
    ) -> Self {
        Self {
            source,
            partition_key: partition_key.to_vec(),
            next_from: start.to_vec(),
            inclusive: true,
            page_size: page_size.max(1),
            page: VecDeque::new(),
            exhausted: false,
            current: None,
            err: None,
        }
    }

    async fn fill(&mut self) -> KvResult<()> {
        let page = self
            .source
            .fetch_page(&self.partition_key, &self.next_from, self.inclusive, self.page_size)
            .await?;
        log::debug!(
            "fetched scan page of {} entries (partition={})",
            page.len(),
            String::from_utf8_lossy(&self.partition_key)
        );
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.next_from = last.key.clone();
            self.inclusive = false;
        }
        self.page.extend(page);
        Ok(())
    }
}

#[async_trait]
impl EntriesIterator for PagedEntries {
    async fn advance(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        while self.page.is_empty() {
            if self.exhausted {
                self.current = None;
                return false;
            }
            if let Err(err) = self.fill().await {
                self.err = Some(err);
                self.current = None;
                return false;
            }
        }
        self.current = self.page.pop_front();
        self.current.is_some()
    }

    fn current(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    fn err(&self) -> Option<&KvError> {
        self.err.as_ref()
    }

    fn close(&mut self) {
        self.page.clear();
        self.current = None;
        self.exhausted = true;
        self.err = Some(KvError::ClosedEntries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct VecSource {
        entries: Vec<Entry>,
        fetches: Mutex<usize>,
        fail_after: Option<usize>,
    }

    impl VecSource {
        fn new(n: usize, fail_after: Option<usize>) -> Self {
            let entries = (0..n)
                .map(|i| Entry {
                    key: format!("k{:03}", i).into_bytes(),
                    value: vec![i as u8 + 1],
                })
                .collect();
            Self {
                entries,
                fetches: Mutex::new(0),
                fail_after,
            }
        }
    }

    #[async_trait]
    impl PageSource for VecSource {
        async fn fetch_page(
            &self,
            _partition_key: &[u8],
            from: &[u8],
            inclusive: bool,
            limit: usize,
        ) -> KvResult<Vec<Entry>> {
            let fetches = {
                let mut count = self.fetches.lock();
                *count += 1;
                *count
            };
            if let Some(n) = self.fail_after {
                if fetches > n {
                    return Err(KvError::OperationFailed("page fetch".to_string()));
                }
            }
            Ok(self
                .entries
                .iter()
                .filter(|e| if inclusive { e.key.as_slice() >= from } else { e.key.as_slice() > from })
                .take(limit)
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn test_crosses_page_boundaries() {
        let source = Arc::new(VecSource::new(10, None));
        let mut it = PagedEntries::new(source.clone(), b"p", b"", 3);

        let mut keys = Vec::new();
        while it.advance().await {
            keys.push(it.current().unwrap().key.clone());
        }
        assert!(it.err().is_none());
        assert_eq!(keys.len(), 10);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        // 3 + 3 + 3 + 1
        assert_eq!(*source.fetches.lock(), 4);
    }

    #[tokio::test]
    async fn test_start_key_is_inclusive() {
        let source = Arc::new(VecSource::new(5, None));
        let mut it = PagedEntries::new(source, b"p", b"k002", 2);
        let first = it.next_entry().await.unwrap().unwrap();
        assert_eq!(first.key, b"k002".to_vec());
    }

    #[tokio::test]
    async fn test_page_error_is_sticky() {
        let source = Arc::new(VecSource::new(10, Some(1)));
        let mut it = PagedEntries::new(source, b"p", b"", 4);
        for _ in 0..4 {
            assert!(it.advance().await);
        }
        assert!(!it.advance().await);
        assert!(matches!(it.err(), Some(KvError::OperationFailed(_))));
        assert!(!it.advance().await);
    }

    #[tokio::test]
    async fn test_closed_iterator() {
        let source = Arc::new(VecSource::new(3, None));
        let mut it = PagedEntries::new(source, b"p", b"", 10);
        assert!(it.advance().await);
        it.close();
        assert!(!it.advance().await);
        assert_eq!(it.err(), Some(&KvError::ClosedEntries));
        assert_eq!(it.next_entry().await, Err(KvError::ClosedEntries));
    }
}
