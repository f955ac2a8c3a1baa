//! Pipeline facade
//!
//! Wires the queue, decoders, analyzer and writer around one cancellation
//! token and exposes the request-side operations.

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use keeper_common::{ComponentFields, DeleteRequest, KeeperError, NormalizedTuple, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::analyzer::{AnalyzerIntake, AnalyzerPool, AnalyzerReport};
use super::decoder::{encode, DecoderRegistry};
use super::queue::{DispatchStats, TaskQueue};
use super::writer::{BatchWriter, WriterStats};
use crate::availability::{AvailabilityCache, StockResponse};
use crate::config::Config;
use crate::ids::ListIdGenerator;
use crate::schema::{SchemaRegistry, SchemaSource, DEFAULT_NAME_FIELD, PARAM_NAME_FIELD};
use crate::storage::{StagingStore, Storage};

/// Attempts at drawing an unused list id before giving up.
const MAX_ID_ATTEMPTS: usize = 16;

/// Final counters of every stage
#[derive(Debug)]
pub struct PipelineReport {
    pub dispatch: DispatchStats,
    pub analyzer: AnalyzerReport,
    pub writer: WriterStats,
}

pub struct Pipeline {
    queue: TaskQueue,
    intake: AnalyzerIntake,
    schema: Arc<SchemaRegistry>,
    storage: Arc<dyn Storage>,
    cache: Arc<AvailabilityCache>,
    ids: ListIdGenerator,
    uploads: AtomicU64,
    cancel: CancellationToken,
    dispatcher: JoinHandle<DispatchStats>,
    analyzer: JoinHandle<AnalyzerReport>,
    writer: JoinHandle<WriterStats>,
}

impl Pipeline {
    /// Spawn every stage on the current runtime.
    pub fn start(
        config: &Config,
        storage: Arc<dyn Storage>,
        staging: Arc<dyn StagingStore>,
        schema: Arc<SchemaRegistry>,
        ids: ListIdGenerator,
        cancel: CancellationToken,
    ) -> Self {
        let source: Arc<dyn SchemaSource> = schema.clone();

        let (tuple_tx, tuple_rx) = mpsc::channel(config.writer.channel_capacity);
        let writer = BatchWriter::new(Arc::clone(&storage), config.writer.clone());
        let writer = tokio::spawn(writer.run(tuple_rx, cancel.clone()));

        let (pool, intake) = AnalyzerPool::new(&config.analyzer, Arc::clone(&source), tuple_tx.clone());
        let analyzer = tokio::spawn(pool.run(cancel.clone()));

        let decoders = DecoderRegistry::standard(source, intake.records.clone(), tuple_tx);
        let (queue, dispatcher) =
            TaskQueue::new(staging, decoders, &config.queue, &config.staging);
        let dispatcher = tokio::spawn(dispatcher.run(cancel.clone()));

        info!(
            queue_workers = config.queue.workers,
            analyzer_workers = config.analyzer.max_workers,
            max_buffer_length = config.writer.max_buffer_length,
            "Pipeline started"
        );

        Self {
            queue,
            intake,
            schema,
            storage,
            cache: Arc::new(AvailabilityCache::new(&config.cache)),
            ids,
            uploads: AtomicU64::new(0),
            cancel,
            dispatcher,
            analyzer,
            writer,
        }
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    pub fn cache(&self) -> &Arc<AvailabilityCache> {
        &self.cache
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stage a payload under `name` and queue it for decoding.
    pub async fn push_task(
        &self,
        list_id: &str,
        format_tag: &str,
        payload: &[u8],
        name: &str,
    ) -> Result<u64> {
        self.queue.push_task(list_id, format_tag, payload, name).await
    }

    /// Queue an upload under a generated staging name, which is returned.
    ///
    /// Names are `<list id><RFC3339 timestamp>-<upload number>`, unique per
    /// pipeline even for uploads within the same microsecond.
    pub async fn upload(&self, list_id: &str, format_tag: &str, payload: &[u8]) -> Result<String> {
        let name = format!(
            "{list_id}{}-{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            self.uploads.fetch_add(1, Ordering::Relaxed)
        );
        self.push_task(list_id, format_tag, payload, &name).await?;
        Ok(name)
    }

    /// Store one component directly, bypassing the queue and the writer.
    #[instrument(skip(self, fields))]
    pub async fn add_item(&self, list_id: &str, fields: ComponentFields) -> Result<()> {
        let names: Vec<String> = fields.keys().cloned().collect();
        self.schema.reconcile_field_names(list_id, &names)?;

        let parameters = self.schema.parameters(list_id)?;
        let name_field = parameters
            .get(PARAM_NAME_FIELD)
            .map(String::as_str)
            .unwrap_or(DEFAULT_NAME_FIELD);
        let name = fields.get(name_field).cloned().ok_or_else(|| {
            KeeperError::validation(format!("item for list '{list_id}' has no '{name_field}'"))
        })?;

        let document = encode(&fields, &parameters)?;
        self.storage
            .bulk_insert(&[NormalizedTuple::tracked(list_id, name, document)])
            .await
    }

    /// Queue a tombstone for the component described by `body`.
    pub async fn handle_delete(&self, list_id: &str, body: impl Into<Vec<u8>>) -> Result<()> {
        self.submit_delete(DeleteRequest::new(list_id, body)).await
    }

    /// Queue a delete given in the `<JSON field map><list id>` frame.
    pub async fn handle_delete_frame(&self, frame: &[u8]) -> Result<()> {
        self.submit_delete(DeleteRequest::from_legacy_frame(frame)?)
            .await
    }

    async fn submit_delete(&self, request: DeleteRequest) -> Result<()> {
        self.intake
            .deletes
            .send(request)
            .await
            .map_err(|_| KeeperError::Cancelled)
    }

    /// Allocate a fresh list id and register an empty schema for it.
    pub async fn create_list(&self) -> Result<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.next_id();
            if self.storage.list_exists(&id).await? {
                continue;
            }
            if self.schema.new_schema(&id).is_ok() {
                info!(list_id = %id, "List created");
                return Ok(id);
            }
        }
        Err(KeeperError::validation(format!(
            "no unused list id after {MAX_ID_ATTEMPTS} attempts"
        )))
    }

    /// Wait for the availability data of `name` to be cached.
    pub async fn cached(&self, name: &str) -> Result<StockResponse> {
        self.cache
            .get(&self.cancel, name)
            .await
            .ok_or_else(|| KeeperError::CacheTimeout(name.to_string()))
    }

    /// Finish all queued work, flush the writer and stop.
    pub async fn drain(self) -> anyhow::Result<PipelineReport> {
        let Pipeline {
            queue,
            intake,
            dispatcher,
            analyzer,
            writer,
            ..
        } = self;

        // Each stage exits once its producers are gone
        drop(queue);
        let dispatch = dispatcher.await.context("Dispatcher task failed")?;
        drop(intake);
        let analyzer = analyzer.await.context("Analyzer task failed")?;
        let writer = writer.await.context("Writer task failed")?;

        info!(
            tasks = dispatch.completed,
            normalized = analyzer.normalized,
            rows = writer.rows_written,
            "Pipeline drained"
        );
        Ok(PipelineReport {
            dispatch,
            analyzer,
            writer,
        })
    }

    /// Cancel every stage; unflushed tuples are discarded.
    pub async fn shutdown(self) -> anyhow::Result<PipelineReport> {
        self.cancel.cancel();
        self.drain().await
    }
}
