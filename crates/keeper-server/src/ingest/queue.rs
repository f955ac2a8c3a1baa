//! Upload task queue
//!
//! `push_task` stages the payload durably and then enqueues a small task
//! descriptor, so the caller returns without waiting on decoding. The
//! [`Dispatcher`] takes tasks in FIFO order and runs up to `workers` of them
//! at once, each with the decoder registered for its format tag.

use keeper_common::{KeeperError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::{DecodeSummary, DecoderRegistry, PayloadFormat};
use crate::config::{QueueConfig, StagingConfig};
use crate::storage::StagingStore;

/// Descriptor of one staged upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub sequence: u64,
    pub list_id: String,
    /// Staging location of the payload
    pub name: String,
    pub format_tag: String,
}

/// Producer side of the queue
#[derive(Clone)]
pub struct TaskQueue {
    staging: Arc<dyn StagingStore>,
    sender: mpsc::UnboundedSender<Task>,
    next_sequence: Arc<AtomicU64>,
}

impl TaskQueue {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        decoders: DecoderRegistry,
        queue: &QueueConfig,
        staging_config: &StagingConfig,
    ) -> (Self, Dispatcher) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            receiver,
            runner: TaskRunner {
                staging: Arc::clone(&staging),
                decoders: Arc::new(decoders),
                cleanup: staging_config.cleanup,
            },
            limiter: Arc::new(Semaphore::new(queue.workers)),
        };
        let queue = Self {
            staging,
            sender,
            next_sequence: Arc::new(AtomicU64::new(0)),
        };
        (queue, dispatcher)
    }

    /// Stage `payload` under `name` and enqueue it for decoding.
    ///
    /// Nothing is enqueued when staging fails.
    pub async fn push_task(
        &self,
        list_id: &str,
        format_tag: &str,
        payload: &[u8],
        name: &str,
    ) -> Result<u64> {
        if let Err(e) = self.staging.write(name, payload).await {
            warn!(list_id, name, error = %e, "Failed to stage payload");
            return Err(e);
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            sequence,
            list_id: list_id.to_string(),
            name: name.to_string(),
            format_tag: format_tag.to_string(),
        };
        self.sender.send(task).map_err(|_| KeeperError::Cancelled)?;

        debug!(list_id, name, format = format_tag, sequence, "Task queued");
        Ok(sequence)
    }
}

/// Totals of one dispatcher run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub records: u64,
}

impl DispatchStats {
    fn absorb(&mut self, joined: std::result::Result<Result<DecodeSummary>, JoinError>) {
        match joined {
            Ok(Ok(summary)) => {
                self.completed += 1;
                self.records += summary.emitted as u64;
            }
            Ok(Err(_)) => self.abandoned += 1,
            Err(e) => {
                warn!(error = %e, "Task worker panicked");
                self.abandoned += 1;
            }
        }
    }
}

#[derive(Clone)]
struct TaskRunner {
    staging: Arc<dyn StagingStore>,
    decoders: Arc<DecoderRegistry>,
    cleanup: bool,
}

impl TaskRunner {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<DecodeSummary> {
        let format: PayloadFormat = task.format_tag.parse()?;
        let decoder = self.decoders.get(format).ok_or_else(|| {
            KeeperError::format(format!("no decoder registered for '{format}'"))
        })?;

        let payload = self.staging.open(&task.name).await?;
        let summary = decoder.decode(&task.list_id, payload, cancel).await?;

        if self.cleanup {
            if let Err(e) = self.staging.remove(&task.name).await {
                warn!(name = %task.name, error = %e, "Failed to remove staged payload");
            }
        }
        Ok(summary)
    }
}

/// Consumer side of the queue
pub struct Dispatcher {
    receiver: mpsc::UnboundedReceiver<Task>,
    runner: TaskRunner,
    limiter: Arc<Semaphore>,
}

impl Dispatcher {
    /// Run tasks until every [`TaskQueue`] handle is dropped or `cancel`
    /// fires, then wait for in-flight tasks.
    pub async fn run(mut self, cancel: CancellationToken) -> DispatchStats {
        let mut tasks: JoinSet<Result<DecodeSummary>> = JoinSet::new();
        let mut stats = DispatchStats::default();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                stats.absorb(joined);
            }

            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Dispatcher cancelled");
                    break;
                }
                task = self.receiver.recv() => match task {
                    Some(task) => task,
                    None => break,
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

            stats.dispatched += 1;
            let runner = self.runner.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                match runner.execute(&task, &cancel).await {
                    Ok(summary) => {
                        info!(
                            list_id = %task.list_id,
                            sequence = task.sequence,
                            records = summary.emitted,
                            "Task completed"
                        );
                        Ok(summary)
                    }
                    Err(e) => {
                        warn!(
                            list_id = %task.list_id,
                            name = %task.name,
                            format = %task.format_tag,
                            error = %e,
                            "Task abandoned"
                        );
                        Err(e)
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            stats.absorb(joined);
        }

        info!(
            dispatched = stats.dispatched,
            completed = stats.completed,
            abandoned = stats.abandoned,
            "Dispatcher stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::decoder::RecordDecoder;
    use crate::storage::{FsStagingStore, StagedPayload};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    /// Records `(list_id, payload)` for every decoded task.
    #[derive(Default)]
    struct Recording {
        seen: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl RecordDecoder for Recording {
        fn format(&self) -> PayloadFormat {
            PayloadFormat::Delimited
        }

        async fn decode(
            &self,
            list_id: &str,
            mut payload: StagedPayload,
            _cancel: &CancellationToken,
        ) -> Result<DecodeSummary> {
            let mut text = String::new();
            payload.read_to_string(&mut text).await?;
            self.seen.lock().unwrap().push((list_id.to_string(), text));
            Ok(DecodeSummary {
                emitted: 1,
                skipped: 0,
            })
        }
    }

    fn setup(
        dir: &TempDir,
        cleanup: bool,
    ) -> (TaskQueue, Dispatcher, Arc<Mutex<Vec<(String, String)>>>) {
        let recording = Recording::default();
        let seen = Arc::clone(&recording.seen);
        let staging = Arc::new(FsStagingStore::new(dir.path().join("queueCache")));
        let (queue, dispatcher) = TaskQueue::new(
            staging,
            DecoderRegistry::new().with(recording),
            &QueueConfig { workers: 1 },
            &StagingConfig {
                root: dir.path().join("queueCache"),
                cleanup,
            },
        );
        (queue, dispatcher, seen)
    }

    #[tokio::test]
    async fn test_tasks_run_in_order() {
        let dir = TempDir::new().unwrap();
        let (queue, dispatcher, seen) = setup(&dir, false);

        for n in 0..3 {
            let sequence = queue
                .push_task(
                    &format!("L{n}abcdef"),
                    "csv",
                    format!("body {n}").as_bytes(),
                    &format!("task-{n}"),
                )
                .await
                .unwrap();
            assert_eq!(sequence, n);
        }
        drop(queue);

        let stats = dispatcher.run(CancellationToken::new()).await;
        assert_eq!(stats.completed, 3);

        let seen = seen.lock().unwrap();
        let lists: Vec<_> = seen.iter().map(|(list, _)| list.as_str()).collect();
        assert_eq!(lists, vec!["L0abcdef", "L1abcdef", "L2abcdef"]);
        assert_eq!(seen[2].1, "body 2");
        assert!(dir.path().join("queueCache/task-0").exists());
    }

    #[tokio::test]
    async fn test_cleanup_removes_staged_payload() {
        let dir = TempDir::new().unwrap();
        let (queue, dispatcher, _seen) = setup(&dir, true);

        queue.push_task("L1abcdef", "csv", b"x,y", "task").await.unwrap();
        drop(queue);
        dispatcher.run(CancellationToken::new()).await;

        assert!(!dir.path().join("queueCache/task").exists());
    }

    #[tokio::test]
    async fn test_unknown_or_unregistered_format_abandoned() {
        let dir = TempDir::new().unwrap();
        let (queue, dispatcher, seen) = setup(&dir, true);

        queue.push_task("L1abcdef", "xml", b"<a/>", "task-xml").await.unwrap();
        queue.push_task("L1abcdef", "json", b"[]", "task-json").await.unwrap();
        drop(queue);

        let stats = dispatcher.run(CancellationToken::new()).await;
        assert_eq!(stats.abandoned, 2);
        assert!(seen.lock().unwrap().is_empty());
        // Abandoned payloads stay staged
        assert!(dir.path().join("queueCache/task-xml").exists());
    }

    #[tokio::test]
    async fn test_staging_failure_enqueues_nothing() {
        let dir = TempDir::new().unwrap();
        let (queue, dispatcher, _seen) = setup(&dir, false);
        std::fs::write(dir.path().join("queueCache"), b"not a directory").unwrap();

        let err = queue.push_task("L1abcdef", "csv", b"x,y", "task").await.unwrap_err();
        assert!(matches!(err, KeeperError::Io(_)));
        drop(queue);

        let stats = dispatcher.run(CancellationToken::new()).await;
        assert_eq!(stats.dispatched, 0);
    }
}
