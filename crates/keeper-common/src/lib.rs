//! Keeper Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the keeper workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`KeeperError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Types**: records and tuples that flow through the ingestion pipeline
//!
//! # Example
//!
//! ```no_run
//! use keeper_common::{Result, KeeperError};
//! use keeper_common::types::DeleteRequest;
//!
//! fn parse(frame: &[u8]) -> Result<DeleteRequest> {
//!     DeleteRequest::from_legacy_frame(frame)
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{KeeperError, Result};
pub use types::{
    ComponentFields, DeleteRequest, NormalizedTuple, RawRecord, SchemaParameters, LIST_ID_LEN,
};
