// The side-channel heartbeat process (`spec.md` §4.2). Runs independently
// of the worker so it can notice a wedged task even if the worker itself
// is hung; grounded on the shape of this file's teacher original (a
// periodic tick posting liveness) generalized with the stale-task
// detection/cleanup `spec.md` adds, and on `pingu_core::heartbeat`'s
// already-generalized `HeartbeatSink` for the actual post.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use pingu_api::Client;
use pingu_core::env::Environment;
use pingu_core::heartbeat::HeartbeatSink;
use std::path::Path;
use std::time::Duration;

/// `spec.md` §4.2: heartbeat wakes every 10 minutes to check task liveness.
pub const HEARTBEAT_WAIT_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Grace period past a task's lease deadline before it's considered
/// abandoned and is torn down by the heartbeat rather than by the worker
/// itself (`spec.md` §4.2).
pub const TASK_COMPLETION_BUFFER: ChronoDuration = ChronoDuration::minutes(5);

#[async_trait::async_trait]
impl HeartbeatSink for Client {
    async fn send(&self, message: serde_json::Value) -> Result<()> {
        self.send_heartbeat(message).await.map_err(Into::into)
    }
}

/// One heartbeat tick: reap a stale task if one is leased past its buffer,
/// and post an update heartbeat if the worker log has moved since the last
/// tick. Returns the worker-log mtime observed this tick, to be passed back
/// in as `last_seen` on the next call.
pub async fn tick(
    api: &Client,
    environment: &Environment,
    worker_binary: &Path,
    last_seen_log_mtime: Option<std::time::SystemTime>,
) -> Result<Option<std::time::SystemTime>> {
    reap_stale_task(api, environment, worker_binary).await?;
    check_worker_liveness(api, environment, last_seen_log_mtime).await
}

async fn reap_stale_task(
    api: &Client,
    environment: &Environment,
    worker_binary: &Path,
) -> Result<()> {
    let Some(marker) = environment.read_current_task_marker().await? else {
        return Ok(());
    };

    let deadline = marker.lease_deadline + TASK_COMPLETION_BUFFER;
    if Utc::now() <= deadline {
        return Ok(());
    }

    warn!(
        "task {} is past its lease deadline + completion buffer, reaping",
        marker.task_id
    );

    let needle = worker_binary.display().to_string();
    for proc in pingu_core::system::find_by_command_line(&needle)? {
        warn!("terminating stale worker process tree pid={}", proc.pid);
        if let Err(err) = pingu_core::system::kill_tree(proc.pid) {
            warn!("failed to kill pid {}: {}", proc.pid, err);
        }
    }

    clear_scratch_dirs(environment).await;

    if let Err(err) = api.end_task(marker.task_id).await {
        warn!("failed to end stale task {}: {}", marker.task_id, err);
    }
    environment.clear_current_task_marker().await?;

    Ok(())
}

async fn clear_scratch_dirs(environment: &Environment) {
    for dir in [environment.tmp_dir(), environment.testcase_dir()] {
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to clear {}: {}", dir.display(), err);
            }
        }
    }
}

async fn check_worker_liveness(
    api: &Client,
    environment: &Environment,
    last_seen_log_mtime: Option<std::time::SystemTime>,
) -> Result<Option<std::time::SystemTime>> {
    let log_path = environment.worker_log_path();
    let mtime = match tokio::fs::metadata(&log_path).await {
        Ok(metadata) => metadata.modified().ok(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err.into()),
    };

    if mtime.is_some() && mtime != last_seen_log_mtime {
        let payload = serde_json::json!({
            "bot_name": environment.bot_name,
            "machine_id": environment.machine_id,
            "type": "worker_log_update",
        });
        if let Err(err) = api.send_heartbeat(payload).await {
            warn!("failed to post worker-liveness heartbeat: {}", err);
        }
    }

    Ok(mtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pingu_core::env::CurrentTaskMarker;
    use uuid::Uuid;

    fn environment(root: &std::path::Path) -> Environment {
        Environment {
            instance_id: Uuid::nil(),
            machine_id: Uuid::nil(),
            bot_name: "bot-1".into(),
            root_dir: root.to_path_buf(),
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_stale_marker_is_past_its_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let environment = environment(dir.path());

        let marker = CurrentTaskMarker {
            task_id: Uuid::new_v4(),
            lease_deadline: Utc::now() - ChronoDuration::hours(1),
        };
        environment.write_current_task_marker(&marker).await.unwrap();

        assert!(environment
            .read_current_task_marker()
            .await
            .unwrap()
            .is_some());
        assert!(Utc::now() > marker.lease_deadline + TASK_COMPLETION_BUFFER);
    }

    #[tokio::test]
    async fn test_check_worker_liveness_no_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let environment = environment(dir.path());
        let api = Client::new("https://api.example.test".parse().unwrap(), None).unwrap();

        let result = check_worker_liveness(&api, &environment, None).await.unwrap();
        assert!(result.is_none());
    }
}
