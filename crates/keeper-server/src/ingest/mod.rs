//! Ingestion pipeline
//!
//! ```text
//! TaskQueue ─► Dispatcher ─► DelimitedDecoder ──► AnalyzerPool ─┐
//!                        └─► ObjectStreamDecoder ───────────────┼─► BatchWriter
//!            handle_delete ─────────────────────► AnalyzerPool ─┘
//! ```
//!
//! Every stage owns the receiving end of its input channel and exits when
//! all senders are gone, so dropping the producers drains the pipeline in
//! order. Cancelling the shared token stops every stage at once.

pub mod analyzer;
pub mod decoder;
pub mod pipeline;
pub mod queue;
pub mod writer;

pub use analyzer::{AnalyzerIntake, AnalyzerPool, AnalyzerReport};
pub use decoder::{encode, DecodeSummary, DecoderRegistry, PayloadFormat, RecordDecoder};
pub use pipeline::{Pipeline, PipelineReport};
pub use queue::{DispatchStats, Dispatcher, Task, TaskQueue};
pub use writer::{BatchWriter, WriterStats};
