// Typed, explicitly-passed process state.
//
// The teacher reads ad hoc `std::env::var` calls scattered through
// `onefuzz`/`onefuzz-task`/`onefuzz-supervisor` wherever a machine id, job
// id, or working directory is needed. Per this bot's design notes, that
// ambient global bus is replaced with one `Environment` value, built once at
// process start and threaded through explicitly to whatever needs it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A record of the task currently leased by this bot's worker process,
/// written to disk so the side-channel heartbeat process (`spec.md` §4.2)
/// can detect a stale task without sharing memory with the worker.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CurrentTaskMarker {
    pub task_id: Uuid,
    pub lease_deadline: DateTime<Utc>,
}

pub const PATH: &str = "PATH";

pub fn get_path_with_directory(to_add: &PathBuf) -> Result<OsString> {
    match std::env::var_os(PATH) {
        Some(path) => {
            let mut paths: Vec<_> = std::env::split_paths(&path).collect();
            if !paths.contains(to_add) {
                paths.push(to_add.clone())
            }
            Ok(std::env::join_paths(paths)?)
        }
        None => Ok(to_add.clone().into()),
    }
}

/// Process-wide identity and filesystem layout, set once at startup and
/// passed down to every task/supervisor component that needs it.
#[derive(Clone, Debug)]
pub struct Environment {
    pub instance_id: Uuid,
    pub machine_id: Uuid,
    pub bot_name: String,
    pub root_dir: PathBuf,
    pub extra: HashMap<String, String>,
}

impl Environment {
    pub fn new(instance_id: Uuid, machine_id: Uuid, bot_name: impl Into<String>) -> Result<Self> {
        let root_dir = match std::env::var_os("PINGU_ROOT") {
            Some(path) => PathBuf::from(path),
            None => std::env::current_dir()?,
        };

        Ok(Self {
            instance_id,
            machine_id,
            bot_name: bot_name.into(),
            root_dir,
            extra: HashMap::new(),
        })
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.root_dir.join("etc")
    }

    pub fn bot_config_path(&self) -> PathBuf {
        self.root_dir.join("config").join("bot").join("config.yaml")
    }

    pub fn project_config_path(&self) -> PathBuf {
        self.root_dir.join("config").join("project.yaml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root_dir.join("logs")
    }

    /// Scratch space a task handler is free to clobber between tasks.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root_dir.join("tmp")
    }

    /// Where an abandoned task's reproducer input, if any, was written.
    pub fn testcase_dir(&self) -> PathBuf {
        self.root_dir.join("testcases")
    }

    pub fn worker_log_path(&self) -> PathBuf {
        self.logs_dir().join("bot.log")
    }

    pub fn current_task_marker_path(&self) -> PathBuf {
        self.etc_dir().join("current_task.json")
    }

    /// Records the lease on the task the worker is about to process
    /// (`spec.md` §4.2's "current task"), so the heartbeat process can find
    /// it without talking to the worker directly.
    pub async fn write_current_task_marker(&self, marker: &CurrentTaskMarker) -> Result<()> {
        let path = self.current_task_marker_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec(marker)?;
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    pub async fn clear_current_task_marker(&self) -> Result<()> {
        let path = self.current_task_marker_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn read_current_task_marker(&self) -> Result<Option<CurrentTaskMarker>> {
        let path = self.current_task_marker_path();
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    pub fn path_with_directory(&self, to_add: impl AsRef<Path>) -> Result<OsString> {
        get_path_with_directory(&to_add.as_ref().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_layout() {
        let env = Environment {
            instance_id: Uuid::nil(),
            machine_id: Uuid::nil(),
            bot_name: "bot-1".to_owned(),
            root_dir: PathBuf::from("/pingu"),
            extra: HashMap::new(),
        };

        assert_eq!(env.etc_dir(), PathBuf::from("/pingu/etc"));
        assert_eq!(
            env.bot_config_path(),
            PathBuf::from("/pingu/config/bot/config.yaml")
        );
        assert_eq!(env.logs_dir(), PathBuf::from("/pingu/logs"));
    }

    #[test]
    fn test_environment_extra() {
        let mut env = Environment {
            instance_id: Uuid::nil(),
            machine_id: Uuid::nil(),
            bot_name: "bot-1".to_owned(),
            root_dir: PathBuf::from("/pingu"),
            extra: HashMap::new(),
        };

        assert_eq!(env.get("queue_name"), None);
        env.set("queue_name", "tasks");
        assert_eq!(env.get("queue_name"), Some("tasks"));
    }

    #[tokio::test]
    async fn test_current_task_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment {
            instance_id: Uuid::nil(),
            machine_id: Uuid::nil(),
            bot_name: "bot-1".to_owned(),
            root_dir: dir.path().to_path_buf(),
            extra: HashMap::new(),
        };

        assert!(env.read_current_task_marker().await.unwrap().is_none());

        let marker = CurrentTaskMarker {
            task_id: Uuid::new_v4(),
            lease_deadline: Utc::now(),
        };
        env.write_current_task_marker(&marker).await.unwrap();
        let read_back = env.read_current_task_marker().await.unwrap().unwrap();
        assert_eq!(read_back.task_id, marker.task_id);

        env.clear_current_task_marker().await.unwrap();
        assert!(env.read_current_task_marker().await.unwrap().is_none());
    }
}
