// Upload-reports task: flushes the job-run stats this bot accumulated
// locally while fuzzing up to the object store, as a newline-delimited JSON
// record alongside the task's logs (`spec.md` §4.8 step 8 "upload job-run
// stats"). Grounded on `pingu_core::stats::{JobRun, append_record}`.

use crate::tasks::config::CommonConfig;
use anyhow::{Context, Result};
use pingu_core::stats::{append_record, JobRun};
use pingu_core::storage::StoragePath;

const STATS_FILE: &str = "job-runs.jsonl";

pub async fn run(common: CommonConfig) -> Result<()> {
    let local_stats_path = common
        .environment
        .logs_dir()
        .join(common.task_id.to_string())
        .join("stats.json");

    let record: JobRun = match tokio::fs::read(&local_stats_path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing local stats at {}", local_stats_path.display()))?,
        Err(_) => JobRun {
            job_id: common.job_id,
            task_id: common.task_id,
            timestamp: chrono::Utc::now(),
            execs_done: 0,
            execs_per_sec: 0.0,
            corpus_size: 0,
            crashes_found: 0,
        },
    };

    let prefix = StoragePath::new("stats", common.job_id.to_string())?;
    append_record(common.storage.as_ref(), &prefix, STATS_FILE, &record)
        .await
        .context("uploading job-run stats")
}
