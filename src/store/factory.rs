use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, KvBackend};
use crate::store::backoff::BackoffPolicy;
use crate::store::memory::MemoryStore;
use crate::store::postgres::{PostgresOptions, PostgresStore};
use crate::store::traits::Store;

/// Opens the KV backend selected by configuration. The set of backends is closed;
/// adding one means adding a match arm here.
pub async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    let kv = &config.kv;
    match kv.backend {
        KvBackend::Memory => {
            log::info!("using in-memory kv store (data is not persisted)");
            Ok(Arc::new(MemoryStore::with_page_size(kv.scan_page_size)))
        }
        KvBackend::Postgres => {
            let options = PostgresOptions {
                connection_string: config.database_url()?,
                max_connections: kv.postgres.max_connections,
                table_name: kv.postgres.table_name.clone(),
                scan_page_size: kv.scan_page_size,
                provision: BackoffPolicy {
                    max_interval: Duration::from_secs(kv.postgres.provision_max_interval_secs),
                    max_elapsed: Duration::from_secs(kv.postgres.provision_max_elapsed_secs),
                    ..BackoffPolicy::default()
                },
            };
            log::info!("connecting to postgres kv store (table={})", options.table_name);
            let store = PostgresStore::open(&options).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_is_default() {
        let store = open_store(&AppConfig::default()).await.unwrap();
        store.set(b"p", b"k", b"v").await.unwrap();
        assert_eq!(store.get(b"p", b"k").await.unwrap().value, b"v".to_vec());
    }

    #[tokio::test]
    async fn test_postgres_without_url_fails_fast() {
        if std::env::var("DATABASE_URL").is_ok() {
            return;
        }
        let mut config = AppConfig::default();
        config.kv.backend = KvBackend::Postgres;
        assert!(open_store(&config).await.is_err());
    }
}
