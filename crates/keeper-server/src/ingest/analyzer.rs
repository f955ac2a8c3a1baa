//! Concurrent record normalization
//!
//! The pool drains two bounded intakes, positional records from the delimited
//! decoder and delete requests, and normalizes each item on its own task.
//! Failures never stop sibling items; they are collected and reported once
//! the pool has drained.

use keeper_common::{
    ComponentFields, DeleteRequest, KeeperError, NormalizedTuple, RawRecord, Result,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::encode;
use crate::config::AnalyzerConfig;
use crate::schema::{SchemaSource, DEFAULT_NAME_FIELD, PARAM_NAME_FIELD};

/// Sending half of the analyzer intakes
#[derive(Clone)]
pub struct AnalyzerIntake {
    pub records: mpsc::Sender<RawRecord>,
    pub deletes: mpsc::Sender<DeleteRequest>,
}

/// Accumulated outcome of a pool run
#[derive(Debug, Default)]
pub struct AnalyzerReport {
    pub normalized: usize,
    pub failures: Vec<KeeperError>,
    pub panicked: usize,
}

impl AnalyzerReport {
    fn absorb(&mut self, joined: std::result::Result<Result<()>, JoinError>) {
        match joined {
            Ok(Ok(())) => self.normalized += 1,
            Ok(Err(e)) => self.failures.push(e),
            Err(e) => {
                warn!(error = %e, "Analyzer worker panicked");
                self.panicked += 1;
            }
        }
    }

    fn log(&self) {
        for failure in &self.failures {
            warn!(error = %failure, "Record dropped during normalization");
        }
        info!(
            normalized = self.normalized,
            failed = self.failures.len(),
            panicked = self.panicked,
            "Analyzer drained"
        );
    }
}

enum Job {
    Record(RawRecord),
    Delete(DeleteRequest),
}

#[derive(Clone)]
struct Worker {
    schema: Arc<dyn SchemaSource>,
    output: mpsc::Sender<NormalizedTuple>,
}

impl Worker {
    async fn handle(self, job: Job) -> Result<()> {
        let tuple = match job {
            Job::Record(record) => self.normalize_record(record)?,
            Job::Delete(request) => self.normalize_delete(request)?,
        };
        self.output
            .send(tuple)
            .await
            .map_err(|_| KeeperError::Cancelled)
    }

    fn normalize_record(&self, record: RawRecord) -> Result<NormalizedTuple> {
        if record.values.is_empty() {
            return Err(KeeperError::validation(format!(
                "record for list '{}' has no fields",
                record.list_id
            )));
        }

        let (names, name_index) = self.schema.field_order(&record.list_id)?;
        let name = record.values.get(name_index).cloned().ok_or_else(|| {
            KeeperError::validation(format!(
                "record for list '{}' has no value at name position {name_index}",
                record.list_id
            ))
        })?;

        // Pairs up to the shorter of the two sides
        let fields: ComponentFields = names.into_iter().zip(record.values).collect();
        let parameters = self.schema.parameters(&record.list_id)?;
        let document = encode(&fields, &parameters)?;

        Ok(NormalizedTuple::tracked(record.list_id, name, document))
    }

    fn normalize_delete(&self, request: DeleteRequest) -> Result<NormalizedTuple> {
        let fields = request.fields().map_err(|e| {
            KeeperError::validation(format!("delete body is not a field map: {e}"))
        })?;
        let parameters = self.schema.parameters(&request.list_id)?;
        let name_field = parameters
            .get(PARAM_NAME_FIELD)
            .map(String::as_str)
            .unwrap_or(DEFAULT_NAME_FIELD);

        let name = fields.get(name_field).cloned().ok_or_else(|| {
            KeeperError::validation(format!(
                "delete for list '{}' has no '{name_field}'",
                request.list_id
            ))
        })?;
        let document = encode(&fields, &parameters)?;

        Ok(NormalizedTuple::tombstone(request.list_id, name, document))
    }
}

pub struct AnalyzerPool {
    worker: Worker,
    records: mpsc::Receiver<RawRecord>,
    deletes: mpsc::Receiver<DeleteRequest>,
    limiter: Arc<Semaphore>,
}

impl AnalyzerPool {
    pub fn new(
        config: &AnalyzerConfig,
        schema: Arc<dyn SchemaSource>,
        output: mpsc::Sender<NormalizedTuple>,
    ) -> (Self, AnalyzerIntake) {
        let (record_tx, records) = mpsc::channel(config.intake_capacity);
        let (delete_tx, deletes) = mpsc::channel(config.intake_capacity);

        let pool = Self {
            worker: Worker { schema, output },
            records,
            deletes,
            limiter: Arc::new(Semaphore::new(config.max_workers)),
        };
        let intake = AnalyzerIntake {
            records: record_tx,
            deletes: delete_tx,
        };
        (pool, intake)
    }

    /// Normalize items until both intakes close or `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> AnalyzerReport {
        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        let mut report = AnalyzerReport::default();
        let mut records_open = true;
        let mut deletes_open = true;

        while records_open || deletes_open {
            while let Some(joined) = workers.try_join_next() {
                report.absorb(joined);
            }

            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Analyzer cancelled");
                    break;
                }
                received = self.records.recv(), if records_open => match received {
                    Some(record) => Job::Record(record),
                    None => {
                        records_open = false;
                        continue;
                    }
                },
                received = self.deletes.recv(), if deletes_open => match received {
                    Some(request) => Job::Delete(request),
                    None => {
                        deletes_open = false;
                        continue;
                    }
                },
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = self.worker.clone();
            workers.spawn(async move {
                let _permit = permit;
                worker.handle(job).await
            });
        }

        // Stop accepting before waiting so blocked senders fail fast
        self.records.close();
        self.deletes.close();
        drop(self.worker);

        while let Some(joined) = workers.join_next().await {
            report.absorb(joined);
        }

        report.log();
        report
    }
}
