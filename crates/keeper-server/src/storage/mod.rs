//! Component store and payload staging

use async_trait::async_trait;
use keeper_common::{NormalizedTuple, Result};

pub mod postgres;
pub mod staging;

pub use postgres::PgStorage;
pub use staging::{FsStagingStore, StagedPayload, StagingStore};

/// Append-only component store
///
/// Rows are never updated in place: the newest row per `(list, name)` decides
/// whether a component is still tracked.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append a batch of tuples in one round trip.
    async fn bulk_insert(&self, rows: &[NormalizedTuple]) -> Result<()>;

    /// JSON array with the lookup parameters of every stored list.
    async fn sync_schemas(&self) -> Result<Vec<u8>>;

    async fn list_exists(&self, list_id: &str) -> Result<bool>;
}
