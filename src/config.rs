use envconfig::Envconfig;
use log::debug;
use std::time::Duration;

#[derive(Envconfig)]
pub struct Config {
    /// Store opened by the binary: `sqlite` or `postgres`
    #[envconfig(from = "DATA_SOURCE", default = "sqlite")]
    pub data_source: String,
}

impl Config {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!("Config loaded: data_source={}", config.data_source);
        Ok(config)
    }
}

/// Limits applied to every built and executed query
#[derive(Envconfig, Clone, Debug, PartialEq, Eq)]
pub struct QueryConfig {
    #[envconfig(from = "QUERY_DEFAULT_LIMIT", default = "100")]
    pub default_limit: u64,

    #[envconfig(from = "QUERY_MAX_LIMIT", default = "100000")]
    pub max_limit: u64,

    #[envconfig(from = "QUERY_TIMEOUT_MS", default = "30000")]
    pub timeout_ms: u64,

    #[envconfig(from = "QUERY_MAX_ROWS", default = "100000")]
    pub max_rows: usize,
}

impl QueryConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "QueryConfig loaded: default_limit={}, max_limit={}, timeout_ms={}, max_rows={}",
            config.default_limit, config.max_limit, config.timeout_ms, config.max_rows
        );
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            default_limit: 100,
            max_limit: 100_000,
            timeout_ms: 30_000,
            max_rows: 100_000,
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct SqliteConfig {
    #[envconfig(from = "SQLITE_PATH")]
    pub path: String,
}

impl SqliteConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!("SqliteConfig loaded: path={}", config.path);
        Ok(config)
    }
}

#[derive(Envconfig, Clone)]
pub struct PostgresConfig {
    #[envconfig(from = "POSTGRES_USER", default = "postgres")]
    pub user: String,
    #[envconfig(from = "POSTGRES_PASSWORD", default = "postgres")]
    pub password: String,
    #[envconfig(from = "POSTGRES_HOST", default = "localhost:5432")]
    pub host: String,
    #[envconfig(from = "POSTGRES_DB", default = "main")]
    pub dbname: String,
}

impl PostgresConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "PostgresConfig loaded: user={}, host={}, dbname={}",
            config.user, config.host, config.dbname
        );
        Ok(config)
    }
}
