// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use async_trait::async_trait;
use pingu_core::heartbeat::{flush_to_sink, HeartbeatClient, HeartbeatContext, HeartbeatSink};
use serde::{self, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The task-liveness vocabulary a running task handler reports (`spec.md`
/// §4.2/§4.10-§4.11). Distinct from the bot-level heartbeat process, which
/// reports worker-log staleness rather than task events.
#[derive(Debug, Deserialize, Serialize, Hash, Eq, PartialEq, Clone)]
#[serde(tag = "type")]
pub enum HeartbeatData {
    TaskAlive,
    MachineAlive,
    NewCrashingInput,
    NoReproCrashingInput,
    NewReport,
    NewUniqueReport,
    NewRegressionReport,
}

#[derive(Debug, Serialize, Clone)]
struct Heartbeat {
    task_id: Uuid,
    job_id: Uuid,
    machine_id: Uuid,
    machine_name: String,
    data: Vec<HeartbeatData>,
}

#[derive(Clone)]
pub struct TaskContext {
    task_id: Uuid,
    job_id: Uuid,
    machine_id: Uuid,
    machine_name: String,
}

pub type TaskHeartbeatClient = HeartbeatClient<TaskContext, HeartbeatData>;

/// Adapts `pingu_api::Client` to `HeartbeatSink` so a task's heartbeat
/// batches are posted to the control-plane API (`spec.md` §4.2).
pub struct ApiHeartbeatSink {
    pub api: pingu_api::Client,
}

#[async_trait]
impl HeartbeatSink for ApiHeartbeatSink {
    async fn send(&self, message: serde_json::Value) -> Result<()> {
        self.api.send_heartbeat(message).await?;
        Ok(())
    }
}

pub async fn init_task_heartbeat(
    sink: Arc<dyn HeartbeatSink>,
    task_id: Uuid,
    job_id: Uuid,
    initial_delay: Option<Duration>,
    machine_id: Uuid,
    machine_name: String,
) -> Result<TaskHeartbeatClient> {
    let hb = HeartbeatClient::init_heartbeat(
        TaskContext {
            task_id,
            job_id,
            machine_id,
            machine_name,
        },
        sink,
        initial_delay,
        None,
        |context: Arc<HeartbeatContext<TaskContext, HeartbeatData>>| async move {
            let task_id = context.state.task_id;
            let machine_id = context.state.machine_id;
            let machine_name = context.state.machine_name.clone();
            let job_id = context.state.job_id;

            let data = HeartbeatClient::<TaskContext, _>::drain_current_messages(context.clone());
            flush_to_sink(
                context.sink.as_ref(),
                &[Heartbeat {
                    task_id,
                    job_id,
                    machine_id,
                    machine_name,
                    data,
                }],
            )
            .await;
        },
    );
    Ok(hb)
}

#[async_trait]
pub trait HeartbeatSender {
    fn send(&self, data: HeartbeatData) -> Result<()>;

    async fn send_direct(&self, data: HeartbeatData) -> Result<()>;

    fn alive(&self) {
        if let Err(error) = self.send(HeartbeatData::TaskAlive) {
            error!("failed to send heartbeat: {}", error);
        }
    }
}

#[async_trait]
impl HeartbeatSender for TaskHeartbeatClient {
    fn send(&self, data: HeartbeatData) -> Result<()> {
        let mut messages_lock = self
            .context
            .pending_messages
            .lock()
            .map_err(|_| anyhow::format_err!("Unable to acquire the lock"))?;
        messages_lock.insert(data);
        Ok(())
    }

    async fn send_direct(&self, data: HeartbeatData) -> Result<()> {
        let task_id = self.context.state.task_id;
        let job_id = self.context.state.job_id;
        let machine_id = self.context.state.machine_id;
        let machine_name = self.context.state.machine_name.clone();

        flush_to_sink(
            self.context.sink.as_ref(),
            &[Heartbeat {
                task_id,
                job_id,
                machine_id,
                machine_name,
                data: vec![data],
            }],
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl HeartbeatSender for Option<TaskHeartbeatClient> {
    fn send(&self, data: HeartbeatData) -> Result<()> {
        match self {
            Some(client) => client.send(data),
            None => Ok(()),
        }
    }

    async fn send_direct(&self, data: HeartbeatData) -> Result<()> {
        match self {
            Some(client) => client.send_direct(data).await,
            None => Ok(()),
        }
    }
}
