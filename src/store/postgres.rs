use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::store::backoff::{self, Attempt, BackoffPolicy};
use crate::store::iterator::{PageSource, PagedEntries};
use crate::store::traits::{
    validate_key, validate_write, EntriesIterator, Entry, KvError, KvResult, Predicate, Store,
    ValueWithPredicate,
};

pub const DEFAULT_TABLE_NAME: &str = "kv";

#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub connection_string: String,
    pub max_connections: u32,
    pub table_name: String,
    pub scan_page_size: usize,
    pub provision: BackoffPolicy,
}

#[derive(Debug)]
struct Statements {
    create_table: String,
    table_ready: String,
    get: String,
    upsert: String,
    insert_if_absent: String,
    update_if_match: String,
    delete: String,
    page_inclusive: String,
    page_exclusive: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    partition_key BYTEA NOT NULL,
                    key BYTEA NOT NULL,
                    value BYTEA NOT NULL,
                    PRIMARY KEY (partition_key, key)
                )"
            ),
            table_ready: "SELECT to_regclass($1) IS NOT NULL AS ready".to_string(),
            get: format!("SELECT value FROM {table} WHERE partition_key = $1 AND key = $2"),
            upsert: format!(
                "INSERT INTO {table} (partition_key, key, value) VALUES ($1, $2, $3)
                 ON CONFLICT (partition_key, key) DO UPDATE SET value = EXCLUDED.value"
            ),
            insert_if_absent: format!(
                "INSERT INTO {table} (partition_key, key, value) VALUES ($1, $2, $3)
                 ON CONFLICT (partition_key, key) DO NOTHING"
            ),
            update_if_match: format!(
                "UPDATE {table} SET value = $3
                 WHERE partition_key = $1 AND key = $2 AND value = $4"
            ),
            delete: format!("DELETE FROM {table} WHERE partition_key = $1 AND key = $2"),
            page_inclusive: format!(
                "SELECT key, value FROM {table}
                 WHERE partition_key = $1 AND key >= $2 ORDER BY key LIMIT $3"
            ),
            page_exclusive: format!(
                "SELECT key, value FROM {table}
                 WHERE partition_key = $1 AND key > $2 ORDER BY key LIMIT $3"
            ),
        }
    }
}

/// KV store over a single PostgreSQL table. The CAS predicate is the stored value.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    sql: Arc<Statements>,
    table_name: String,
    scan_page_size: usize,
}

impl PostgresStore {
    /// Connect and provision the KV table, retrying transient startup states.
    pub async fn open(options: &PostgresOptions) -> KvResult<Self> {
        validate_table_name(&options.table_name)?;

        let pool = backoff::retry(&options.provision, || async {
            PgPoolOptions::new()
                .max_connections(options.max_connections)
                .acquire_timeout(Duration::from_secs(5))
                .connect(&options.connection_string)
                .await
                .map_err(classify_setup_error)
        })
        .await
        .map_err(|e| KvError::SetupFailed(format!("connect: {}", e)))?;

        let store = Self {
            pool,
            sql: Arc::new(Statements::for_table(&options.table_name)),
            table_name: options.table_name.clone(),
            scan_page_size: options.scan_page_size.max(1),
        };
        store.provision(&options.provision).await?;
        log::info!("postgres kv table '{}' ready", store.table_name);
        Ok(store)
    }

    /// Idempotently creates the table and waits until it is visible.
    async fn provision(&self, policy: &BackoffPolicy) -> KvResult<()> {
        backoff::retry(policy, || async {
            sqlx::query(&self.sql.create_table)
                .execute(&self.pool)
                .await
                .map_err(classify_setup_error)?;

            let ready: bool = sqlx::query(&self.sql.table_ready)
                .bind(&self.table_name)
                .fetch_one(&self.pool)
                .await
                .map_err(classify_setup_error)?
                .try_get::<bool, _>("ready")
                .map_err(Attempt::Permanent)?;
            if ready {
                Ok(())
            } else {
                Err(Attempt::Transient(sqlx::Error::Protocol(
                    "table not yet visible".to_string(),
                )))
            }
        })
        .await
        .map_err(|e| KvError::SetupFailed(format!("provision table {}: {}", self.table_name, e)))
    }

    /// Drops the KV table. Test cleanup only.
    pub async fn drop_table(&self) -> KvResult<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table_name))
            .execute(&self.pool)
            .await
            .map_err(|e| operation_failed("drop table", b"", e))?;
        Ok(())
    }
}

fn validate_table_name(name: &str) -> KvResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start
        || name.len() > 63
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(KvError::SetupFailed(format!("invalid table name '{}'", name)));
    }
    Ok(())
}

/// Connection-level failures and a server that is still starting are worth retrying.
fn classify_setup_error(err: sqlx::Error) -> Attempt<sqlx::Error> {
    let transient = match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            // cannot_connect_now, concurrent CREATE TABLE racing on pg_type
            Some("57P03") | Some("23505")
        ),
        _ => false,
    };
    if transient {
        Attempt::Transient(err)
    } else {
        Attempt::Permanent(err)
    }
}

fn operation_failed(op: &str, key: &[u8], err: sqlx::Error) -> KvError {
    KvError::OperationFailed(format!(
        "{} (key={}): {}",
        op,
        String::from_utf8_lossy(key),
        err
    ))
}

#[async_trait]
impl Store for PostgresStore {
    async fn get(&self, partition_key: &[u8], key: &[u8]) -> KvResult<ValueWithPredicate> {
        validate_key(partition_key, key)?;
        let row = sqlx::query(&self.sql.get)
            .bind(partition_key)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| operation_failed("get item", key, e))?;

        let Some(row) = row else {
            return Err(KvError::NotFound);
        };
        let value: Vec<u8> = row
            .try_get("value")
            .map_err(|e| operation_failed("decode item", key, e))?;
        Ok(ValueWithPredicate {
            predicate: Predicate::new(value.clone()),
            value,
        })
    }

    async fn set(&self, partition_key: &[u8], key: &[u8], value: &[u8]) -> KvResult<()> {
        validate_write(partition_key, key, value)?;
        sqlx::query(&self.sql.upsert)
            .bind(partition_key)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| operation_failed("put item", key, e))?;
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
        let result = match predicate {
            None => sqlx::query(&self.sql.insert_if_absent)
                .bind(partition_key)
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await,
            Some(expected) => sqlx::query(&self.sql.update_if_match)
                .bind(partition_key)
                .bind(key)
                .bind(value)
                .bind(expected.as_bytes())
                .execute(&self.pool)
                .await,
        }
        .map_err(|e| operation_failed("conditional put item", key, e))?;

        if result.rows_affected() == 0 {
            return Err(KvError::PredicateFailed);
        }
        Ok(())
    }

    async fn delete(&self, partition_key: &[u8], key: &[u8]) -> KvResult<()> {
        validate_key(partition_key, key)?;
        sqlx::query(&self.sql.delete)
            .bind(partition_key)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| operation_failed("delete item", key, e))?;
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

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PageSource for PostgresStore {
    async fn fetch_page(
        &self,
        partition_key: &[u8],
        from: &[u8],
        inclusive: bool,
        limit: usize,
    ) -> KvResult<Vec<Entry>> {
        let sql = if inclusive {
            &self.sql.page_inclusive
        } else {
            &self.sql.page_exclusive
        };
        let rows = sqlx::query(sql)
            .bind(partition_key)
            .bind(from)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| operation_failed("query page", from, e))?;

        rows.into_iter()
            .map(|row| {
                Ok(Entry {
                    key: row
                        .try_get("key")
                        .map_err(|e| operation_failed("decode page", from, e))?,
                    value: row
                        .try_get("value")
                        .map_err(|e| operation_failed("decode page", from, e))?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("kv").is_ok());
        assert!(validate_table_name("_lakeref_kv2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2kv").is_err());
        assert!(validate_table_name("kv; DROP TABLE users").is_err());
    }

    async fn open_test_store() -> Option<PostgresStore> {
        let url = std::env::var("LAKEREF_TEST_POSTGRES_URL").ok()?;
        let options = PostgresOptions {
            connection_string: url,
            max_connections: 4,
            table_name: format!("kv_test_{}", uuid::Uuid::new_v4().simple()),
            scan_page_size: 3,
            provision: BackoffPolicy::default(),
        };
        Some(PostgresStore::open(&options).await.expect("provision test table"))
    }

    #[tokio::test]
    async fn test_postgres_cas_and_scan() {
        let Some(store) = open_test_store().await else {
            return;
        };

        store.set_if(b"p", b"k", b"v1", None).await.unwrap();
        assert_eq!(
            store.set_if(b"p", b"k", b"v2", None).await,
            Err(KvError::PredicateFailed)
        );
        let got = store.get(b"p", b"k").await.unwrap();
        store.set_if(b"p", b"k", b"v2", Some(&got.predicate)).await.unwrap();
        assert_eq!(
            store.set_if(b"p", b"k", b"v3", Some(&got.predicate)).await,
            Err(KvError::PredicateFailed)
        );

        for i in 0..8 {
            store.set(b"s", format!("{:02}", i).as_bytes(), b"x").await.unwrap();
        }
        let mut it = store.scan(b"s", b"03").await.unwrap();
        let mut keys = Vec::new();
        while let Some(entry) = it.next_entry().await.unwrap() {
            keys.push(entry.key);
        }
        it.close();
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0], b"03".to_vec());

        store.drop_table().await.unwrap();
    }
}
