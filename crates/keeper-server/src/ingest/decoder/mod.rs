//! Format-specific payload decoders
//!
//! A decoder turns one staged payload into records for the rest of the
//! pipeline. Delimited tables produce positional [`RawRecord`]s that still need
//! the analyzer; object streams already carry their field names and are
//! normalized inline.
//!
//! [`RawRecord`]: keeper_common::RawRecord

use async_trait::async_trait;
use keeper_common::{ComponentFields, KeeperError, NormalizedTuple, RawRecord, Result, SchemaParameters};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::schema::SchemaSource;
use crate::storage::StagedPayload;

pub mod delimited;
pub mod object_stream;

pub use delimited::DelimitedDecoder;
pub use object_stream::ObjectStreamDecoder;

/// Payload formats accepted by the task queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadFormat {
    /// Header row followed by rows separated by `,` or `;`
    Delimited,
    /// JSON array of flat objects
    ObjectStream,
}

impl PayloadFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadFormat::Delimited => "csv",
            PayloadFormat::ObjectStream => "json",
        }
    }
}

impl FromStr for PayloadFormat {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "csv" | "delimited" => Ok(PayloadFormat::Delimited),
            "json" | "object-stream" => Ok(PayloadFormat::ObjectStream),
            other => Err(KeeperError::format(format!("unknown payload format '{other}'"))),
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of decoding one payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub emitted: usize,
    pub skipped: usize,
}

#[async_trait]
pub trait RecordDecoder: Send + Sync {
    fn format(&self) -> PayloadFormat;

    /// Decode `payload` for `list_id`, stopping early when `cancel` fires.
    async fn decode(
        &self,
        list_id: &str,
        payload: StagedPayload,
        cancel: &CancellationToken,
    ) -> Result<DecodeSummary>;
}

/// Decoders keyed by format, fixed once the pipeline starts
#[derive(Default, Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<PayloadFormat, Arc<dyn RecordDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the delimited and object-stream decoders.
    pub fn standard(
        schema: Arc<dyn SchemaSource>,
        records: mpsc::Sender<RawRecord>,
        tuples: mpsc::Sender<NormalizedTuple>,
    ) -> Self {
        Self::new()
            .with(DelimitedDecoder::new(Arc::clone(&schema), records))
            .with(ObjectStreamDecoder::new(schema, tuples))
    }

    pub fn with(mut self, decoder: impl RecordDecoder + 'static) -> Self {
        self.decoders.insert(decoder.format(), Arc::new(decoder));
        self
    }

    pub fn get(&self, format: PayloadFormat) -> Option<Arc<dyn RecordDecoder>> {
        self.decoders.get(&format).cloned()
    }
}

#[derive(Serialize)]
struct EncodedComponent<'a> {
    component: &'a ComponentFields,
    parameters: &'a SchemaParameters,
}

/// Encode a component and its list parameters as the stored JSON document.
pub fn encode(component: &ComponentFields, parameters: &SchemaParameters) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&EncodedComponent {
        component,
        parameters,
    })?)
}
