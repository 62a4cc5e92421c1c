// Periodic, deduplicated heartbeat flushing.
//
// Generalized from the teacher's Azure Storage Queue-backed
// `HeartbeatClient` (`onefuzz/src/heartbeat.rs`) to be agnostic to where a
// heartbeat message actually goes: the production sink posts to the
// control-plane HTTP API (`pingu_api::Client::report_heartbeat`), while
// tests use an in-memory sink.

use crate::jitter::random_delay;
use crate::utils::CheckNotify;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::HashSet,
    hash::Hash,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::Notify, task, task::JoinHandle};

const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(60 * 5);

/// Where a drained batch of heartbeat messages is sent.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn send(&self, message: serde_json::Value) -> Result<()>;
}

pub struct HeartbeatContext<TContext, T> {
    pub state: TContext,
    pub sink: Arc<dyn HeartbeatSink>,
    pub pending_messages: Mutex<HashSet<T>>,
    pub cancelled: Notify,
}

pub struct HeartbeatClient<TContext, T>
where
    T: Clone + Send + Sync,
{
    pub context: Arc<HeartbeatContext<TContext, T>>,
    pub heartbeat_process: JoinHandle<Result<()>>,
}

impl<TContext, T> Drop for HeartbeatClient<TContext, T>
where
    T: Clone + Sync + Send,
{
    fn drop(&mut self) {
        self.context.cancelled.notify_one();
    }
}

impl<TContext, T> HeartbeatClient<TContext, T>
where
    T: Clone + Sync + Send + Eq + Hash,
{
    pub fn drain_current_messages(context: Arc<HeartbeatContext<TContext, T>>) -> Vec<T> {
        let lock = context.pending_messages.lock();
        let mut messages = lock.unwrap();
        let drain = messages.iter().cloned().collect::<Vec<T>>();
        messages.clear();
        drain
    }

    pub fn init_heartbeat<F, Fut>(
        context: TContext,
        sink: Arc<dyn HeartbeatSink>,
        initial_delay: Option<Duration>,
        heartbeat_period: Option<Duration>,
        flush: F,
    ) -> HeartbeatClient<TContext, T>
    where
        F: Fn(Arc<HeartbeatContext<TContext, T>>) -> Fut + Sync + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
        T: 'static,
        TContext: Send + Sync + 'static,
    {
        let heartbeat_period = heartbeat_period.unwrap_or(DEFAULT_HEARTBEAT_PERIOD);
        let initial_delay = initial_delay.unwrap_or(DEFAULT_HEARTBEAT_PERIOD);

        let context = Arc::new(HeartbeatContext {
            state: context,
            sink,
            pending_messages: Mutex::new(HashSet::<T>::new()),
            cancelled: Notify::new(),
        });

        let flush_context = context.clone();
        let heartbeat_process = task::spawn(async move {
            random_delay(initial_delay).await;
            flush(flush_context.clone()).await;
            while !flush_context.cancelled.is_notified(heartbeat_period).await {
                flush(flush_context.clone()).await;
            }
            flush(flush_context.clone()).await;
            Ok(())
        });

        HeartbeatClient {
            context,
            heartbeat_process,
        }
    }
}

/// Serializes a drained batch and hands it to the configured sink, logging
/// (not failing) on error: a dropped heartbeat should never take down the
/// task it's reporting on.
pub async fn flush_to_sink<T: Serialize>(sink: &dyn HeartbeatSink, messages: &[T]) {
    if messages.is_empty() {
        return;
    }

    match serde_json::to_value(messages) {
        Ok(value) => {
            if let Err(err) = sink.send(value).await {
                warn!("unable to send heartbeat: {}", err);
            }
        }
        Err(err) => {
            warn!("unable to serialize heartbeat messages: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl HeartbeatSink for RecordingSink {
        async fn send(&self, _message: serde_json::Value) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_flush_to_sink_skips_empty() {
        let sink = RecordingSink {
            sent: AtomicUsize::new(0),
        };
        flush_to_sink(&sink, &Vec::<String>::new()).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flush_to_sink_sends_batch() {
        let sink = RecordingSink {
            sent: AtomicUsize::new(0),
        };
        flush_to_sink(&sink, &["task_alive".to_owned()]).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 1);
    }
}
