#![allow(clippy::if_same_then_else)]
#![allow(dead_code)]

// Batches the structured-event stream to object storage (`spec.md` §4.2's
// worker log, read by the heartbeat process for staleness checks). Keeps
// the teacher's `LogWriter<T>`/state-machine shape
// (`onefuzz-task/src/tasks/task_logger.rs`'s Azure append-blob writer),
// adapted to `pingu_core::storage::StorageClient`: since S3 has no true
// append, each "writer" accumulates its chunk in memory and re-PUTs the
// whole object, rolling over to a new numbered object once `max_log_size`
// is reached.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pingu_core::storage::{StorageClient, StoragePath};
use pingu_telemetry::{format_events, LogEvent};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use tokio::sync::broadcast::Receiver;

const LOGS_BUFFER_SIZE: usize = 100;
const MAX_LOG_SIZE: u64 = 100_000_000; // 100 MB
const DEFAULT_LOGGING_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(PartialEq, Debug)]
enum WriteLogResponse {
    Success,
    /// The message needs to be split into multiple parts.
    MessageTooLarge,
    /// the log file is full; we need a new file
    MaxSizeReached,
}

/// Abstracts the operation needed to write logs.
#[async_trait]
trait LogWriter<T>: Send + Sync {
    async fn write_logs(&mut self, logs: &[LogEvent]) -> Result<WriteLogResponse>;
    /// Creates the next chunk's writer.
    async fn get_next_writer(&self) -> Result<Box<dyn LogWriter<T>>>;
}

fn format_log_event(event: &LogEvent) -> String {
    format!(
        "[{}] {}: {}\n",
        event.timestamp,
        event.event.as_str(),
        format_events(&event.data)
    )
}

/// Writes logs to an object-storage bucket, one growing object per chunk.
pub struct StorageLogWriter {
    storage: Arc<dyn StorageClient>,
    prefix: StoragePath,
    task_id: Uuid,
    machine_id: Uuid,
    chunk_id: usize,
    max_log_size: u64,
    buffer: Vec<u8>,
}

impl StorageLogWriter {
    fn object_path(&self) -> StoragePath {
        self.prefix
            .join(format!("{}/{}/{}.log", self.task_id, self.machine_id, self.chunk_id))
    }

    pub async fn create(
        storage: Arc<dyn StorageClient>,
        prefix: StoragePath,
        task_id: Uuid,
        machine_id: Uuid,
        max_log_size: u64,
    ) -> Result<Self> {
        let search_prefix = prefix.join(format!("{task_id}/{machine_id}"));
        let existing = storage.list_blobs(&search_prefix).await.unwrap_or_default();

        let chunk_id = existing
            .iter()
            .filter_map(|b| b.path.file_name())
            .filter_map(|name| name.strip_suffix(".log"))
            .filter_map(|name| name.parse::<usize>().ok())
            .max()
            .map(|id| id + 1)
            .unwrap_or(1);

        Ok(Self {
            storage,
            prefix,
            task_id,
            machine_id,
            chunk_id,
            max_log_size,
            buffer: Vec::new(),
        })
    }
}

#[async_trait]
impl LogWriter<StorageLogWriter> for StorageLogWriter {
    async fn write_logs(&mut self, logs: &[LogEvent]) -> Result<WriteLogResponse> {
        let formatted: Vec<u8> = logs.iter().flat_map(|e| format_log_event(e).into_bytes()).collect();

        if formatted.len() as u64 > self.max_log_size {
            return Ok(WriteLogResponse::MessageTooLarge);
        }

        if self.buffer.len() as u64 + formatted.len() as u64 > self.max_log_size {
            return Ok(WriteLogResponse::MaxSizeReached);
        }

        self.buffer.extend_from_slice(&formatted);
        self.storage
            .write_data(&self.object_path(), self.buffer.clone())
            .await
            .map_err(|e| anyhow!(e.to_string()))?;

        Ok(WriteLogResponse::Success)
    }

    async fn get_next_writer(&self) -> Result<Box<dyn LogWriter<StorageLogWriter>>> {
        Ok(Box::new(Self {
            storage: self.storage.clone(),
            prefix: self.prefix.clone(),
            task_id: self.task_id,
            machine_id: self.machine_id,
            chunk_id: self.chunk_id + 1,
            max_log_size: self.max_log_size,
            buffer: Vec::new(),
        }))
    }
}

#[derive(Clone)]
pub struct TaskLogger {
    job_id: Uuid,
    task_id: Uuid,
    machine_id: Uuid,
    logging_interval: Duration,
    log_buffer_size: usize,
    polling_interval: Duration,
}

enum LoopState {
    Receive,
    InitLog {
        start: usize,
        count: usize,
        flush: bool,
    },
    Send {
        start: usize,
        count: usize,
        flush: bool,
    },
    Done,
}

struct LoopContext<T: Sized> {
    pub log_writer: Box<dyn LogWriter<T>>,
    pub pending_logs: Vec<LogEvent>,
    pub state: LoopState,
    pub event: Receiver<LogEvent>,
}

impl TaskLogger {
    pub fn new(job_id: Uuid, task_id: Uuid, machine_id: Uuid) -> Self {
        Self {
            job_id,
            task_id,
            machine_id,
            logging_interval: DEFAULT_LOGGING_INTERVAL,
            log_buffer_size: LOGS_BUFFER_SIZE,
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    async fn event_loop<T: Send + Sized>(
        &self,
        context: LoopContext<T>,
        flush_and_close: bool,
    ) -> Result<LoopContext<T>> {
        match context.state {
            LoopState::Send {
                start,
                count,
                flush,
            } => {
                let LoopContext {
                    mut log_writer,
                    pending_logs,
                    event,
                    ..
                } = context;

                match log_writer
                    .write_logs(&pending_logs[start..start + count])
                    .await?
                {
                    WriteLogResponse::Success => {
                        if start + count >= pending_logs.len() {
                            if flush {
                                bail!("done");
                            } else {
                                Ok(LoopContext {
                                    log_writer,
                                    pending_logs: vec![],
                                    state: LoopState::Receive,
                                    event,
                                })
                            }
                        } else {
                            let new_start = start + 1;
                            let new_count = pending_logs.len() - new_start;
                            Ok(LoopContext {
                                log_writer,
                                pending_logs,
                                state: LoopState::Send {
                                    start: new_start,
                                    count: new_count,
                                    flush,
                                },
                                event,
                            })
                        }
                    }
                    WriteLogResponse::MaxSizeReached => Ok(LoopContext {
                        log_writer,
                        pending_logs,
                        state: LoopState::InitLog {
                            start,
                            count,
                            flush,
                        },
                        event,
                    }),
                    WriteLogResponse::MessageTooLarge => Ok(LoopContext {
                        log_writer,
                        pending_logs,
                        state: LoopState::Send {
                            start,
                            count: count / 2,
                            flush,
                        },
                        event,
                    }),
                }
            }
            LoopState::InitLog {
                start,
                count,
                flush,
            } => {
                let new_writer = context.log_writer.get_next_writer().await?;
                Ok(LoopContext {
                    log_writer: new_writer,
                    state: LoopState::Send {
                        start,
                        count,
                        flush,
                    },
                    ..context
                })
            }
            LoopState::Receive => {
                let mut event = context.event;
                let mut data = Vec::with_capacity(self.log_buffer_size);
                let now = tokio::time::Instant::now();

                loop {
                    if data.len() >= self.log_buffer_size {
                        break;
                    }

                    if tokio::time::Instant::now() - now > self.logging_interval {
                        break;
                    }
                    match event.try_recv() {
                        Ok(v) => {
                            data.push(v);
                        }
                        Err(_) => {
                            tokio::time::sleep(self.polling_interval).await;
                        }
                    }
                }

                if !data.is_empty() {
                    Ok(LoopContext {
                        state: LoopState::Send {
                            start: 0,
                            count: data.len(),
                            flush: flush_and_close,
                        },
                        pending_logs: data,
                        event,
                        ..context
                    })
                } else {
                    Ok(LoopContext { event, ..context })
                }
            }
            LoopState::Done => Ok(context),
        }
    }

    pub async fn start(
        &self,
        event: Receiver<LogEvent>,
        storage: Arc<dyn StorageClient>,
        prefix: StoragePath,
    ) -> Result<SpawnedLogger> {
        let writer = StorageLogWriter::create(
            storage,
            prefix,
            self.task_id,
            self.machine_id,
            MAX_LOG_SIZE,
        )
        .await?;

        self._start(event, Box::new(writer))
    }

    fn _start<T: 'static + Send>(
        &self,
        event: Receiver<LogEvent>,
        log_writer: Box<dyn LogWriter<T>>,
    ) -> Result<SpawnedLogger> {
        let (flush_and_close_sender, mut flush_and_close_receiver) =
            tokio::sync::oneshot::channel::<()>();

        let this = self.clone();

        let logger_handle = tokio::spawn(async move {
            let initial_state = LoopContext {
                log_writer,
                pending_logs: vec![],
                state: LoopState::Receive,
                event,
            };

            let mut context = initial_state;

            loop {
                let flush_and_close = flush_and_close_receiver
                    .try_recv()
                    .ok()
                    .map(|_| true)
                    .unwrap_or_default();

                context = match this.event_loop(context, flush_and_close).await {
                    Ok(LoopContext {
                        log_writer: _,
                        pending_logs: _,
                        state: LoopState::Done,
                        event: _,
                    }) => break,
                    Ok(c) => c,
                    Err(e) => {
                        error!("{}", e);
                        break;
                    }
                };
            }
            Ok(())
        });

        Ok(SpawnedLogger {
            logger_handle,
            flush_and_close_sender,
        })
    }
}

pub struct SpawnedLogger {
    logger_handle: tokio::task::JoinHandle<Result<()>>,
    flush_and_close_sender: tokio::sync::oneshot::Sender<()>,
}

impl SpawnedLogger {
    pub async fn flush_and_stop(self, timeout: Duration) -> Result<()> {
        let _ = self.flush_and_close_sender.send(());
        let _ = tokio::time::timeout(timeout, self.logger_handle).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::RwLock;

    use super::*;
    use pingu_telemetry::{Event, EventData};

    fn test_event(message: &str) -> LogEvent {
        LogEvent {
            timestamp: chrono::Utc::now(),
            event: Event::task_start,
            data: vec![EventData::Path(message.to_owned())],
        }
    }

    pub struct TestLogWriter {
        events: Arc<RwLock<HashMap<usize, Vec<LogEvent>>>>,
        id: usize,
        max_size: usize,
    }

    #[async_trait]
    impl LogWriter<TestLogWriter> for TestLogWriter {
        async fn write_logs(&mut self, logs: &[LogEvent]) -> Result<WriteLogResponse> {
            let mut events = self.events.write().unwrap();
            let entry = events.entry(self.id).or_insert_with(Vec::new);
            if entry.len() >= self.max_size {
                Ok(WriteLogResponse::MaxSizeReached)
            } else if logs.len() > 1 {
                Ok(WriteLogResponse::MessageTooLarge)
            } else {
                entry.extend(logs.iter().cloned());
                Ok(WriteLogResponse::Success)
            }
        }
        async fn get_next_writer(&self) -> Result<Box<dyn LogWriter<TestLogWriter>>> {
            Ok(Box::new(Self {
                events: self.events.clone(),
                id: self.id + 1,
                max_size: self.max_size,
            }))
        }
    }

    #[tokio::test]
    async fn test_task_logger_normal_messages() -> Result<()> {
        let events = Arc::new(RwLock::new(HashMap::new()));
        let log_writer = Box::new(TestLogWriter {
            id: 0,
            events: events.clone(),
            max_size: 1,
        });

        let task_logger = TaskLogger {
            job_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            machine_id: Uuid::new_v4(),
            logging_interval: Duration::from_secs(1),
            log_buffer_size: 1,
            polling_interval: Duration::from_secs(1),
        };

        let (tx, rx) = tokio::sync::broadcast::channel(16);
        for i in 1..=5 {
            tx.send(test_event(&format!("test{i}")))?;
        }

        let _res = task_logger
            ._start(rx, log_writer)?
            .flush_and_stop(Duration::from_secs(5))
            .await;

        let x = events.read().unwrap();
        assert_eq!(x.keys().len(), 5, "expected 5 groups of messages");
        Ok(())
    }

    #[tokio::test]
    async fn test_task_logger_big_messages() -> Result<()> {
        let events = Arc::new(RwLock::new(HashMap::new()));
        let log_writer = Box::new(TestLogWriter {
            id: 0,
            events: events.clone(),
            max_size: 2,
        });

        let task_logger = TaskLogger {
            job_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            machine_id: Uuid::new_v4(),
            logging_interval: Duration::from_secs(3),
            log_buffer_size: 2,
            polling_interval: Duration::from_secs(1),
        };

        let (tx, rx) = tokio::sync::broadcast::channel(16);
        for i in 1..=5 {
            tx.send(test_event(&format!("test{i}")))?;
        }

        let _res = task_logger
            ._start(rx, log_writer)?
            .flush_and_stop(Duration::from_secs(5))
            .await;

        let x = events.read().unwrap();
        assert_eq!(x.keys().len(), 3, "expected 3 groups of messages");
        Ok(())
    }
}
