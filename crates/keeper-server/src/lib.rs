//! Keeper Server Library
//!
//! Asynchronous ingestion of bulk component uploads and a stampede-safe cache
//! for externally sourced availability data.
//!
//! # Architecture
//!
//! ```text
//! upload ─► TaskQueue ─► Decoder ─┬─► AnalyzerPool ─┬─► BatchWriter ─► Storage
//!           (staging)   (csv/json) │   (normalize)   │   (size/idle)
//!                                  └─────────────────┘
//!                            object streams skip the analyzer
//! ```
//!
//! - **schema**: per-list field order and lookup parameters
//! - **storage**: bulk-insert store and durable payload staging
//! - **ingest**: task queue, decoders, analyzer pool, batch writer and the
//!   [`ingest::Pipeline`] facade wiring them together
//! - **cache**: [`cache::ResultCache`], claim-then-fetch coalescing keyed by
//!   component name
//!
//! # Example
//!
//! ```no_run
//! use keeper_server::{config::Config, ids::ListIdGenerator, ingest::Pipeline, schema::SchemaRegistry};
//! use keeper_server::storage::{FsStagingStore, PgStorage};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let storage = Arc::new(PgStorage::connect(&config.storage).await?);
//!     let schema = Arc::new(SchemaRegistry::new());
//!     schema.init(storage.as_ref()).await?;
//!
//!     let pipeline = Pipeline::start(
//!         &config,
//!         storage,
//!         Arc::new(FsStagingStore::new(&config.staging.root)),
//!         schema,
//!         ListIdGenerator::from_entropy(),
//!         CancellationToken::new(),
//!     );
//!     pipeline.upload("L1abcdef", "json", br#"[{"part name":"R1"}]"#).await?;
//!     pipeline.drain().await?;
//!     Ok(())
//! }
//! ```

pub mod availability;
pub mod cache;
pub mod config;
pub mod ids;
pub mod ingest;
pub mod schema;
pub mod storage;

pub use keeper_common::{KeeperError, Result};
