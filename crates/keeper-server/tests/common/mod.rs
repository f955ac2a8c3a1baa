//! Shared helpers for keeper-server integration tests
//!
//! - [`RecordingStorage`]: in-memory [`Storage`] that keeps every flushed batch
//! - [`TestPostgres`]: disposable PostgreSQL container for storage tests
//! - [`test_config`]: pipeline configuration staging into a temp directory

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use keeper_common::{NormalizedTuple, Result as KeeperResult};
use keeper_server::config::{Config, StorageConfig};
use keeper_server::storage::{PgStorage, Storage};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("keeper_server=debug")
        .with_test_writer()
        .try_init();
}

pub fn test_config(staging_root: &Path) -> Config {
    let mut config = Config::default();
    config.staging.root = staging_root.to_path_buf();
    config.queue.workers = 1;
    config
}

// ============================================================================
// In-memory Storage
// ============================================================================

#[derive(Default)]
pub struct RecordingStorage {
    batches: Mutex<Vec<Vec<NormalizedTuple>>>,
    lists: Mutex<HashSet<String>>,
    schemas: Vec<u8>,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose schema sync returns `body`.
    pub fn with_schemas(body: &[u8]) -> Self {
        Self {
            schemas: body.to_vec(),
            ..Self::default()
        }
    }

    pub fn mark_existing(&self, list_id: &str) {
        self.lists.lock().unwrap().insert(list_id.to_string());
    }

    pub fn batches(&self) -> Vec<Vec<NormalizedTuple>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn rows(&self) -> Vec<NormalizedTuple> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn bulk_insert(&self, rows: &[NormalizedTuple]) -> KeeperResult<()> {
        let mut lists = self.lists.lock().unwrap();
        for row in rows {
            lists.insert(row.list_id.clone());
        }
        self.batches.lock().unwrap().push(rows.to_vec());
        Ok(())
    }

    async fn sync_schemas(&self) -> KeeperResult<Vec<u8>> {
        Ok(self.schemas.clone())
    }

    async fn list_exists(&self, list_id: &str) -> KeeperResult<bool> {
        Ok(self.lists.lock().unwrap().contains(list_id))
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    storage: PgStorage,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let config = StorageConfig {
            database_url: format!("postgresql://postgres:postgres@{host}:{port}/postgres"),
            ..StorageConfig::default()
        };
        let storage = PgStorage::connect(&config)
            .await
            .context("Failed to connect to test database")?;

        Ok(Self {
            _container: container,
            storage,
        })
    }

    pub fn storage(&self) -> &PgStorage {
        &self.storage
    }
}
