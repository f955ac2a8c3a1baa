//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Storage Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/keeper";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default directory (or key prefix) for staged upload payloads.
pub const DEFAULT_STAGING_ROOT: &str = "queueCache";

/// Default number of tasks decoded concurrently.
pub const DEFAULT_QUEUE_WORKERS: usize = 4;

/// Default capacity of the analyzer record and delete channels.
pub const DEFAULT_ANALYZER_INTAKE_CAPACITY: usize = 5;

/// Default number of records normalized concurrently.
pub const DEFAULT_ANALYZER_MAX_WORKERS: usize = 16;

/// Default idle time before the writer flushes a partial batch.
pub const DEFAULT_WRITER_MAX_WAIT_SECS: u64 = 30;

/// Default batch length; a flush happens once the batch grows past it.
pub const DEFAULT_WRITER_MAX_BUFFER_LENGTH: usize = 30;

/// Default capacity of the writer input channel.
pub const DEFAULT_WRITER_CHANNEL_CAPACITY: usize = 10;

// ============================================================================
// Cache Configuration Constants
// ============================================================================

/// Default interval between availability checks of a claimed name.
pub const DEFAULT_CACHE_POLL_INTERVAL_SECS: u64 = 2;

/// Default number of intervals a getter waits before giving up.
pub const DEFAULT_CACHE_MAX_ATTEMPTS: u32 = 10;

/// Keeper configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub staging: StagingConfig,
    pub queue: QueueConfig,
    pub analyzer: AnalyzerConfig,
    pub writer: WriterConfig,
    pub cache: CacheConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Payload staging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub root: PathBuf,
    /// Remove staged payloads once their task decoded successfully
    pub cleanup: bool,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STAGING_ROOT),
            cleanup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_QUEUE_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub intake_capacity: usize,
    pub max_workers: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            intake_capacity: DEFAULT_ANALYZER_INTAKE_CAPACITY,
            max_workers: DEFAULT_ANALYZER_MAX_WORKERS,
        }
    }
}

/// Batch writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub max_wait_secs: u64,
    pub max_buffer_length: usize,
    pub channel_capacity: usize,
}

impl WriterConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: DEFAULT_WRITER_MAX_WAIT_SECS,
            max_buffer_length: DEFAULT_WRITER_MAX_BUFFER_LENGTH,
            channel_capacity: DEFAULT_WRITER_CHANNEL_CAPACITY,
        }
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
}

impl CacheConfig {
    /// Total time a getter waits for a claimed name to be stored.
    pub fn wait_budget(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs) * self.max_attempts
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_CACHE_POLL_INTERVAL_SECS,
            max_attempts: DEFAULT_CACHE_MAX_ATTEMPTS,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            storage: StorageConfig {
                database_url: std::env::var("KEEPER_DSN")
                    .or_else(|_| std::env::var("DATABASE_URL"))
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "KEEPER_DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "KEEPER_DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            staging: StagingConfig {
                root: std::env::var("KEEPER_STAGING_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_STAGING_ROOT)),
                cleanup: env_or("KEEPER_STAGING_CLEANUP", false),
            },
            queue: QueueConfig {
                workers: env_or("KEEPER_QUEUE_WORKERS", DEFAULT_QUEUE_WORKERS),
            },
            analyzer: AnalyzerConfig {
                intake_capacity: env_or(
                    "KEEPER_ANALYZER_INTAKE_CAPACITY",
                    DEFAULT_ANALYZER_INTAKE_CAPACITY,
                ),
                max_workers: env_or("KEEPER_ANALYZER_MAX_WORKERS", DEFAULT_ANALYZER_MAX_WORKERS),
            },
            writer: WriterConfig {
                max_wait_secs: env_or("KEEPER_WRITER_MAX_WAIT", DEFAULT_WRITER_MAX_WAIT_SECS),
                max_buffer_length: env_or(
                    "KEEPER_WRITER_MAX_BUFFER_LENGTH",
                    DEFAULT_WRITER_MAX_BUFFER_LENGTH,
                ),
                channel_capacity: env_or(
                    "KEEPER_WRITER_CHANNEL_CAPACITY",
                    DEFAULT_WRITER_CHANNEL_CAPACITY,
                ),
            },
            cache: CacheConfig {
                poll_interval_secs: env_or(
                    "KEEPER_CACHE_POLL_INTERVAL",
                    DEFAULT_CACHE_POLL_INTERVAL_SECS,
                ),
                max_attempts: env_or("KEEPER_CACHE_MAX_ATTEMPTS", DEFAULT_CACHE_MAX_ATTEMPTS),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.database_url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.storage.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.staging.root.as_os_str().is_empty() {
            anyhow::bail!("Staging root cannot be empty");
        }

        // Channel and semaphore sizes of zero would stall the pipeline
        if self.queue.workers == 0 {
            anyhow::bail!("Queue workers must be greater than 0");
        }
        if self.analyzer.intake_capacity == 0 || self.analyzer.max_workers == 0 {
            anyhow::bail!("Analyzer intake capacity and max workers must be greater than 0");
        }
        if self.writer.channel_capacity == 0 {
            anyhow::bail!("Writer channel capacity must be greater than 0");
        }
        if self.writer.max_wait_secs == 0 {
            anyhow::bail!("Writer max wait must be at least one second");
        }

        if self.cache.max_attempts == 0 {
            anyhow::bail!("Cache max attempts must be greater than 0");
        }

        Ok(())
    }
}
