use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub kv: KvConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    pub backend: KvBackend,
    pub scan_page_size: usize,
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub connection_string: Option<String>,
    pub max_connections: u32,
    pub table_name: String,
    pub provision_max_interval_secs: u64,
    pub provision_max_elapsed_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// TTL of the commit / meta-range cache
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    /// How many times a staged write follows a staging token that was sealed under it
    pub staging_write_retries: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            kv: KvConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            backend: KvBackend::Memory,
            scan_page_size: 1000,
            postgres: PostgresConfig::default(),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            max_connections: 20,
            table_name: "kv".to_string(),
            provision_max_interval_secs: 5,
            provision_max_elapsed_secs: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            cache_capacity: 10_000,
            staging_write_retries: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional `lakeref` config file and
    /// `LAKEREF_`-prefixed environment variables (`__` separates nested keys).
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        // Add default configuration
        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        // Add config file if it exists
        config = config.add_source(config::File::with_name("lakeref").required(false));

        // e.g. LAKEREF_KV__BACKEND=postgres
        config = config.add_source(
            config::Environment::with_prefix("LAKEREF")
                .prefix_separator("_")
                .separator("__"),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }

    /// Get the postgres URL from config or environment
    pub fn database_url(&self) -> anyhow::Result<String> {
        if let Some(connection_string) = &self.kv.postgres.connection_string {
            return Ok(connection_string.clone());
        }

        // Fall back to environment variable
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return Ok(url);
        }

        anyhow::bail!("kv.postgres.connection_string is not set and DATABASE_URL is missing")
    }

    /// Get the server bind address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.kv.backend, KvBackend::Memory);
        assert_eq!(config.server_address(), "127.0.0.1:8000");
        assert_eq!(config.engine.staging_write_retries, 5);
    }

    #[test]
    fn test_database_url_prefers_config() {
        let mut config = AppConfig::default();
        config.kv.postgres.connection_string = Some("postgres://kv@db/lakeref".to_string());
        assert_eq!(config.database_url().unwrap(), "postgres://kv@db/lakeref");
    }
}
