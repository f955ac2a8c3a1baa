// Postgres component store
//
// Batches are written with multi-row INSERTs in chunks of 500 rows, inside a
// single transaction so a flush lands completely or not at all.

use async_trait::async_trait;
use keeper_common::{KeeperError, NormalizedTuple, Result};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info};

use super::Storage;
use crate::config::StorageConfig;

/// Rows per INSERT statement; 5 binds each keeps well under the 65535 limit.
const INSERT_CHUNK_SIZE: usize = 500;

const CREATE_COMPONENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS components (
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        schema JSONB NOT NULL,
        tracking BOOLEAN NOT NULL,
        lastcheck TIMESTAMP NOT NULL DEFAULT now()
    )
"#;

const CREATE_COMPONENTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS components_id_name_idx ON components (id, name, lastcheck DESC)";

/// Newest parameter map of every list.
const SELECT_LATEST_PARAMETERS: &str = r#"
    SELECT json_agg(parameters) FROM (
        SELECT DISTINCT ON (id) schema->'parameters' AS parameters
        FROM components
        ORDER BY id, lastcheck DESC
    ) latest
"#;

fn db_error(context: &str, err: sqlx::Error) -> KeeperError {
    KeeperError::database(format!("{context}: {err}"))
}

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connect a pool and make sure the components table exists.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(|e| db_error("Failed to connect to database", e))?;

        let storage = Self::from_pool(pool);
        storage.ensure_schema().await?;
        info!("Component storage ready");
        Ok(storage)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_COMPONENTS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to create components table", e))?;
        sqlx::query(CREATE_COMPONENTS_INDEX)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to create components index", e))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn bulk_insert(&self, rows: &[NormalizedTuple]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        // JSONB wants a document, not raw bytes
        let documents = rows
            .iter()
            .map(|row| serde_json::from_slice::<serde_json::Value>(&row.payload))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let checked_at = chrono::Utc::now().naive_utc();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        for (chunk, docs) in rows
            .chunks(INSERT_CHUNK_SIZE)
            .zip(documents.chunks(INSERT_CHUNK_SIZE))
        {
            let mut query_builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO components (id, name, schema, tracking, lastcheck) ");

            query_builder.push_values(chunk.iter().zip(docs), |mut b, (row, doc)| {
                b.push_bind(&row.list_id)
                    .push_bind(&row.name)
                    .push_bind(doc)
                    .push_bind(row.tracking)
                    .push_bind(checked_at);
            });

            query_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to insert components", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit components", e))?;

        debug!(rows = rows.len(), "Inserted component rows");
        Ok(())
    }

    async fn sync_schemas(&self) -> Result<Vec<u8>> {
        let aggregated: Option<serde_json::Value> = sqlx::query_scalar(SELECT_LATEST_PARAMETERS)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load schemas", e))?;

        match aggregated {
            Some(value) => Ok(serde_json::to_vec(&value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn list_exists(&self, list_id: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM components WHERE id = $1)")
            .bind(list_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to look up list", e))
    }
}
