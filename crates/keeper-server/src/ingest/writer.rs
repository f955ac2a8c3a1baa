//! Batching writer
//!
//! Tuples are buffered and written to storage in one bulk insert when the
//! batch grows past `max_buffer_length` or when no tuple arrived for
//! `max_wait`. Every arrival pushes the idle deadline back. A failed flush is
//! logged and its tuples are dropped; the batch is empty after every flush
//! attempt.

use keeper_common::NormalizedTuple;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WriterConfig;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub flushes: u64,
    pub rows_written: u64,
    pub failed_flushes: u64,
    pub rows_dropped: u64,
}

pub struct BatchWriter {
    storage: Arc<dyn Storage>,
    config: WriterConfig,
    pending: Vec<NormalizedTuple>,
    stats: WriterStats,
}

impl BatchWriter {
    pub fn new(storage: Arc<dyn Storage>, config: WriterConfig) -> Self {
        Self {
            storage,
            pending: Vec::with_capacity(config.max_buffer_length + 1),
            config,
            stats: WriterStats::default(),
        }
    }

    /// Consume tuples until `input` closes or `cancel` fires.
    ///
    /// A closed input flushes what is pending; cancellation discards it.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<NormalizedTuple>,
        cancel: CancellationToken,
    ) -> WriterStats {
        let max_wait = self.config.max_wait();
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if !self.pending.is_empty() {
                        warn!(dropped = self.pending.len(), "Writer cancelled with unflushed tuples");
                    }
                    break;
                }
                received = input.recv() => match received {
                    Some(tuple) => {
                        deadline = Some(Instant::now() + max_wait);
                        self.pending.push(tuple);
                        if self.pending.len() > self.config.max_buffer_length {
                            self.flush().await;
                        }
                    }
                    None => {
                        debug!("Writer input closed");
                        self.flush().await;
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.flush().await;
                }
            }
        }

        info!(
            flushes = self.stats.flushes,
            rows = self.stats.rows_written,
            failed = self.stats.failed_flushes,
            "Writer stopped"
        );
        self.stats
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.pending);
        let rows = batch.len() as u64;
        match self.storage.bulk_insert(&batch).await {
            Ok(()) => {
                self.stats.flushes += 1;
                self.stats.rows_written += rows;
                debug!(rows, "Flushed batch");
            }
            Err(e) => {
                self.stats.failed_flushes += 1;
                self.stats.rows_dropped += rows;
                error!(rows, error = %e, "Batch insert failed, dropping batch");
            }
        }
    }
}
