// Launches the worker process and waits on it, bounded by `RUN_TIMEOUT`
// (`spec.md` §4.1 step 2, §4.5 process runner). Reuses
// `pingu_core::process::run_cmd`, the same scoped-subprocess-with-timeout
// primitive the task handlers use for fuzz targets, rather than the
// teacher's own `command-group`-based `Worker` state machine, since a
// worker launch here is a single bounded child process, not a multi-step
// work-unit lifecycle.

use anyhow::Result;
use pingu_core::process::{run_cmd, Output};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// The teacher's three-way exit-code classification (`spec.md` §4.1 step 3):
/// normal exit, a fatal worker-level error, or anything else (a crash,
/// signal, or timeout) worth a louder log line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerExit {
    Normal,
    Fatal,
    Other(Option<i32>),
}

impl WorkerExit {
    pub fn classify(code: Option<i32>) -> Self {
        match code {
            Some(0) => WorkerExit::Normal,
            Some(1) => WorkerExit::Fatal,
            other => WorkerExit::Other(other),
        }
    }
}

pub async fn run_worker_once(
    worker_binary: &Path,
    config_path: &Path,
    timeout: Duration,
) -> Result<Output> {
    let env: HashMap<String, String> = HashMap::new();
    let argv = vec![
        "run".to_owned(),
        "--config".to_owned(),
        config_path.display().to_string(),
    ];
    run_cmd(worker_binary, argv, &env, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_normal_exit() {
        assert_eq!(WorkerExit::classify(Some(0)), WorkerExit::Normal);
    }

    #[test]
    fn test_classify_fatal_exit() {
        assert_eq!(WorkerExit::classify(Some(1)), WorkerExit::Fatal);
    }

    #[test]
    fn test_classify_other_exit() {
        assert_eq!(WorkerExit::classify(Some(137)), WorkerExit::Other(Some(137)));
        assert_eq!(WorkerExit::classify(None), WorkerExit::Other(None));
    }
}
