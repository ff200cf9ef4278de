//! Configuration management for the backup coordinator.
//!
//! Loads configuration from an optional TOML file, then applies environment
//! variable overrides (a `.env` file is honoured when present).

use crate::utils::errors::{CoordinatorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub relational: RelationalConfig,
    #[serde(default)]
    pub vector_index: VectorIndexConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding one sub-directory per backup id
    #[serde(default = "default_backup_root")]
    pub root: PathBuf,

    /// Scratch space for decompressed restore artifacts (default: `<root>/.staging`)
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Compression algorithm used when a backup asks for compression (gzip, zstd)
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Compression level (algorithm specific, None = codec default)
    #[serde(default)]
    pub compression_level: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum engine tasks running at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Time box for a single engine task
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Optional deadline for a whole backup or restore operation
    #[serde(default)]
    pub operation_timeout_secs: Option<u64>,

    /// Time a cancelled tool gets between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    #[serde(default = "default_localhost")]
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    #[serde(default = "default_postgres_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_postgres_db")]
    pub database: String,
    #[serde(default = "default_pg_dump")]
    pub dump_tool: String,
    #[serde(default = "default_pg_restore")]
    pub restore_tool: String,
    #[serde(default = "default_pg_isready")]
    pub ready_tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexConfig {
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default = "default_qdrant_collection")]
    pub collection: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_curl")]
    pub http_tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_neo4j_database")]
    pub database: String,
    #[serde(default = "default_neo4j_admin")]
    pub admin_tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_localhost")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_redis_cli")]
    pub cli_tool: String,
    /// Redis `dir`, where the server loads its RDB file from
    #[serde(default = "default_redis_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_redis_db_filename")]
    pub db_filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_backup_root() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_task_timeout_secs() -> u64 {
    30 * 60
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_localhost() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_user() -> String {
    "postgres".to_string()
}

fn default_postgres_db() -> String {
    "memories".to_string()
}

fn default_pg_dump() -> String {
    "pg_dump".to_string()
}

fn default_pg_restore() -> String {
    "pg_restore".to_string()
}

fn default_pg_isready() -> String {
    "pg_isready".to_string()
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}

fn default_qdrant_collection() -> String {
    "memories".to_string()
}

fn default_curl() -> String {
    "curl".to_string()
}

fn default_neo4j_database() -> String {
    "neo4j".to_string()
}

fn default_neo4j_admin() -> String {
    "neo4j-admin".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_cli() -> String {
    "redis-cli".to_string()
}

fn default_redis_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/redis")
}

fn default_redis_db_filename() -> String {
    "dump.rdb".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: default_backup_root(),
            staging_dir: None,
            compression: default_compression(),
            compression_level: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            task_timeout_secs: default_task_timeout_secs(),
            operation_timeout_secs: None,
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            host: default_localhost(),
            port: default_postgres_port(),
            user: default_postgres_user(),
            password: None,
            database: default_postgres_db(),
            dump_tool: default_pg_dump(),
            restore_tool: default_pg_restore(),
            ready_tool: default_pg_isready(),
        }
    }
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            url: default_qdrant_url(),
            collection: default_qdrant_collection(),
            api_key: None,
            http_tool: default_curl(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            database: default_neo4j_database(),
            admin_tool: default_neo4j_admin(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: default_localhost(),
            port: default_redis_port(),
            password: None,
            cli_tool: default_redis_cli(),
            data_dir: default_redis_data_dir(),
            db_filename: default_redis_db_filename(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backup: BackupConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            relational: RelationalConfig::default(),
            vector_index: VectorIndexConfig::default(),
            graph: GraphConfig::default(),
            cache: CacheConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| CoordinatorError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load the file (if any), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .parse()
                .map_err(|_| CoordinatorError::Config(format!("{} has an invalid value: {}", key, value)))
        }

        if let Some(v) = lookup("BACKUP_ROOT") {
            self.backup.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKUP_STAGING_DIR") {
            self.backup.staging_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("BACKUP_COMPRESSION") {
            self.backup.compression = v;
        }
        if let Some(v) = lookup("BACKUP_CONCURRENCY") {
            self.pool.concurrency = parse("BACKUP_CONCURRENCY", v)?;
        }
        if let Some(v) = lookup("BACKUP_TASK_TIMEOUT_SECS") {
            self.pool.task_timeout_secs = parse("BACKUP_TASK_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("BACKUP_OPERATION_TIMEOUT_SECS") {
            self.pool.operation_timeout_secs = Some(parse("BACKUP_OPERATION_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = lookup("BACKUP_RETRY_ATTEMPTS") {
            self.retry.attempts = parse("BACKUP_RETRY_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("BACKUP_RETRY_BACKOFF_MS") {
            self.retry.initial_backoff_ms = parse("BACKUP_RETRY_BACKOFF_MS", v)?;
        }

        if let Some(v) = lookup("POSTGRES_HOST") {
            self.relational.host = v;
        }
        if let Some(v) = lookup("POSTGRES_PORT") {
            self.relational.port = parse("POSTGRES_PORT", v)?;
        }
        if let Some(v) = lookup("POSTGRES_USER") {
            self.relational.user = v;
        }
        if let Some(v) = lookup("POSTGRES_PASSWORD") {
            self.relational.password = Some(v);
        }
        if let Some(v) = lookup("POSTGRES_DB") {
            self.relational.database = v;
        }

        if let Some(v) = lookup("QDRANT_URL") {
            self.vector_index.url = v;
        }
        if let Some(v) = lookup("QDRANT_COLLECTION") {
            self.vector_index.collection = v;
        }
        if let Some(v) = lookup("QDRANT_API_KEY") {
            self.vector_index.api_key = Some(v);
        }

        if let Some(v) = lookup("NEO4J_DATABASE") {
            self.graph.database = v;
        }
        if let Some(v) = lookup("NEO4J_ADMIN") {
            self.graph.admin_tool = v;
        }

        if let Some(v) = lookup("REDIS_HOST") {
            self.cache.host = v;
        }
        if let Some(v) = lookup("REDIS_PORT") {
            self.cache.port = parse("REDIS_PORT", v)?;
        }
        if let Some(v) = lookup("REDIS_PASSWORD") {
            self.cache.password = Some(v);
        }
        if let Some(v) = lookup("REDIS_DATA_DIR") {
            self.cache.data_dir = PathBuf::from(v);
        }

        if let Some(v) = lookup("LOG_LEVEL") {
            self.log.level = v;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.concurrency == 0 {
            return Err(CoordinatorError::Config(
                "pool.concurrency must be at least 1".to_string(),
            ));
        }
        if self.pool.task_timeout_secs == 0 {
            return Err(CoordinatorError::Config(
                "pool.task_timeout_secs must be at least 1".to_string(),
            ));
        }
        crate::codec::Algorithm::from_name(&self.backup.compression)?;
        Ok(())
    }

    pub fn codec(&self) -> Result<crate::codec::CompressionCodec> {
        let algorithm = crate::codec::Algorithm::from_name(&self.backup.compression)?;
        Ok(crate::codec::CompressionCodec::new(
            algorithm,
            self.backup.compression_level,
        ))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.backup
            .staging_dir
            .clone()
            .unwrap_or_else(|| self.backup.root.join(".staging"))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.task_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.pool.operation_timeout_secs.map(Duration::from_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.pool.kill_grace_secs)
    }
}
