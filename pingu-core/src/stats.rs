// Stats/logs layout: line-delimited JSON run records uploaded alongside a
// task's logs, one line per job run / testcase run, so the control plane
// (or an offline analysis pass) can reconstruct fuzzing throughput without
// polling the API for every event.

use crate::storage::{StorageClient, StoragePath};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JobRun {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub execs_done: u64,
    pub execs_per_sec: f64,
    pub corpus_size: u64,
    pub crashes_found: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TestcaseRun {
    pub testcase_id: Uuid,
    pub task_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub return_code: i32,
    pub duration_ms: u64,
}

/// Appends one record as a newline-delimited JSON line under `prefix`,
/// named by `file`, reading-modifying-writing the remote object since the
/// object store has no native append.
pub async fn append_record<T: Serialize>(
    storage: &dyn StorageClient,
    prefix: &StoragePath,
    file: &str,
    record: &T,
) -> Result<()> {
    let path = prefix.join(file);

    let mut contents = match storage.read_data(&path).await {
        Ok(data) => data,
        Err(_) => Vec::new(),
    };

    let mut line = serde_json::to_vec(record).context("serialize stats record")?;
    contents.append(&mut line);
    contents.push(b'\n');

    storage.write_data(&path, contents).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_run_roundtrip() {
        let run = JobRun {
            job_id: Uuid::nil(),
            task_id: Uuid::nil(),
            timestamp: Utc::now(),
            execs_done: 100,
            execs_per_sec: 12.5,
            corpus_size: 4,
            crashes_found: 1,
        };

        let json = serde_json::to_string(&run).unwrap();
        let parsed: JobRun = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.execs_done, 100);
    }
}
