// Per-task common context and the task loop (`spec.md` §4.2/§4.3). The
// teacher deserializes an entire per-task JSON config from a file dropped
// in the agent's work directory; this bot instead builds `CommonConfig`
// once per leased task straight from the control-plane API (job/project/
// task rows) and overlays the job's `environment_string`, the way
// `process_command` does in `spec.md` §4.3.

use crate::engine::EngineRegistry;
use crate::error::BotError;
use crate::tasks::heartbeat::{
    init_task_heartbeat, ApiHeartbeatSink, HeartbeatSender, TaskHeartbeatClient,
};
use anyhow::{Context, Result};
use pingu_api::model::{Task, TaskCommand, TaskStatus};
use pingu_api::Client;
use pingu_core::env::Environment;
use pingu_core::heartbeat::HeartbeatSink;
use pingu_core::storage::{S3StorageClient, StorageClient};
use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const FAIL_WAIT_SECONDS: u64 = 60;
const LEASE_EXTEND_INTERVAL: Duration = Duration::from_secs(60);

/// Bot-wide configuration, loaded once at startup from a YAML file or from
/// the environment. Mirrors the shape of `onefuzz-supervisor`'s
/// `StaticConfig`: a handful of connection details plus the two
/// `BotError`-classification pattern lists `process_command` consults
/// (`spec.md` §4.3).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BotConfig {
    pub api_url: Url,
    pub api_key: Option<String>,

    pub storage_region: String,
    pub storage_endpoint: Option<Url>,
    pub storage_access_key: Option<String>,
    pub storage_secret_key: Option<String>,

    pub instance_id: Uuid,
    #[serde(default = "Uuid::new_v4")]
    pub machine_id: Uuid,
    pub bot_name: String,

    /// Regexes matched against a failed task's error message; a match means
    /// the task is unrecoverable and should be marked `Error` rather than
    /// retried (`spec.md` §4.3's "terminal error" classification).
    #[serde(default)]
    pub bot_error_termination_list: Vec<String>,
    /// Regexes whose match means the bot should stop polling for new work
    /// entirely rather than retry (a wedged host, a poisoned build).
    #[serde(default)]
    pub bot_error_hang_list: Vec<String>,
}

impl BotConfig {
    /// `onefuzz-supervisor/src/config.rs`'s `StaticConfig::from_file`
    /// equivalent: a YAML document written to `config/bot/config.yaml`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading bot config file: {}", path.display()))?;
        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing bot config file: {}", path.display()))
    }

    /// `onefuzz-supervisor/src/config.rs`'s `StaticConfig::from_env`
    /// equivalent, used when no `--config` file is given.
    pub fn from_env() -> Result<Self> {
        let api_url = std::env::var("PINGU_API_URL").context("PINGU_API_URL is not set")?;
        let storage_region =
            std::env::var("PINGU_STORAGE_REGION").unwrap_or_else(|_| "us-east-1".to_owned());
        let instance_id = match std::env::var("PINGU_INSTANCE_ID") {
            Ok(value) => Uuid::parse_str(&value).context("PINGU_INSTANCE_ID is not a uuid")?,
            Err(_) => Uuid::new_v4(),
        };
        let bot_name = std::env::var("PINGU_BOT_NAME").unwrap_or_else(|_| "pingu-bot".to_owned());

        let split_list = |name: &str| -> Vec<String> {
            std::env::var(name)
                .ok()
                .map(|value| value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect())
                .unwrap_or_default()
        };

        Ok(Self {
            api_url: api_url.parse().context("PINGU_API_URL is not a valid url")?,
            api_key: std::env::var("PINGU_API_KEY").ok(),
            storage_region,
            storage_endpoint: std::env::var("PINGU_STORAGE_ENDPOINT")
                .ok()
                .map(|value| value.parse())
                .transpose()
                .context("PINGU_STORAGE_ENDPOINT is not a valid url")?,
            storage_access_key: std::env::var("PINGU_STORAGE_ACCESS_KEY").ok(),
            storage_secret_key: std::env::var("PINGU_STORAGE_SECRET_KEY").ok(),
            instance_id,
            machine_id: Uuid::new_v4(),
            bot_name,
            bot_error_termination_list: split_list("PINGU_BOT_ERROR_TERMINATION_LIST"),
            bot_error_hang_list: split_list("PINGU_BOT_ERROR_HANG_LIST"),
        })
    }

    pub fn storage_credentials(&self) -> Option<(String, String)> {
        match (&self.storage_access_key, &self.storage_secret_key) {
            (Some(access_key), Some(secret_key)) => Some((access_key.clone(), secret_key.clone())),
            _ => None,
        }
    }

    pub async fn build_storage(&self) -> Result<Arc<dyn StorageClient>> {
        let client = S3StorageClient::new(
            self.storage_endpoint.clone(),
            self.storage_region.clone(),
            self.storage_credentials(),
        )
        .await
        .context("building storage client")?;
        Ok(Arc::new(client))
    }

    pub fn build_api(&self) -> Result<Client> {
        Client::new(self.api_url.clone(), self.api_key.clone()).context("building api client")
    }

    pub fn compile_termination_list(&self) -> Result<Vec<regex::Regex>> {
        self.bot_error_termination_list
            .iter()
            .map(|pattern| regex::Regex::new(pattern).context("invalid bot_error_termination_list pattern"))
            .collect()
    }

    pub fn compile_hang_list(&self) -> Result<Vec<regex::Regex>> {
        self.bot_error_hang_list
            .iter()
            .map(|pattern| regex::Regex::new(pattern).context("invalid bot_error_hang_list pattern"))
            .collect()
    }
}

/// Threaded through to every task handler: who we are, what we were asked
/// to do, and how to reach the control plane and object store.
#[derive(Clone)]
pub struct CommonConfig {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub instance_id: Uuid,
    pub argument: String,
    pub api: Client,
    pub storage: Arc<dyn StorageClient>,
    pub environment: Environment,
    pub heartbeat: Option<TaskHeartbeatClient>,
}

impl CommonConfig {
    /// A testcase-id argument (`spec.md` §6: "argument ... typically a
    /// testcase id").
    pub fn testcase_id(&self) -> Result<Uuid, BotError> {
        Uuid::parse_str(&self.argument).map_err(|_| BotError::BadConfig {
            path: "task.argument".into(),
            reason: format!("not a uuid: {}", self.argument),
        })
    }

    /// A `fuzzer,binary` argument (`fuzz` / `corpus_pruning`).
    pub fn fuzz_target_ref(&self) -> Result<(String, String), BotError> {
        self.argument
            .split_once(',')
            .map(|(fuzzer, binary)| (fuzzer.to_owned(), binary.to_owned()))
            .ok_or_else(|| BotError::BadConfig {
                path: "task.argument".into(),
                reason: format!("expected `fuzzer,binary`: {}", self.argument),
            })
    }
}

/// Extends a task's lease periodically for as long as its handler body
/// runs, and releases it on every exit path (`spec.md` §4.3: "with
/// task.lease(): # extends the deadline and releases on all paths").
pub struct TaskLease {
    task_id: Uuid,
    api: Client,
    cancel: CancellationToken,
    refresher: Option<tokio::task::JoinHandle<()>>,
}

impl TaskLease {
    pub fn acquire(api: Client, task_id: Uuid) -> Self {
        let cancel = CancellationToken::new();
        let refresher = {
            let api = api.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(LEASE_EXTEND_INTERVAL) => {
                            if let Err(err) = api.update_task_status(task_id, TaskStatus::Wip).await {
                                error!("failed to extend lease for task {}: {}", task_id, err);
                            }
                        }
                    }
                }
            })
        };
        Self {
            task_id,
            api,
            cancel,
            refresher: Some(refresher),
        }
    }

    pub async fn release(mut self) {
        self.cancel.cancel();
        if let Some(refresher) = self.refresher.take() {
            let _ = refresher.await;
        }
        if let Err(err) = self.api.end_task(self.task_id).await {
            error!("failed to end task {}: {}", self.task_id, err);
        }
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// `spec.md` §4.3's outer loop: lease the next task, overlay its
/// environment, dispatch to the matching handler, forever.
pub async fn task_loop(
    api: Client,
    storage: Arc<dyn StorageClient>,
    mut environment: Environment,
    engines: EngineRegistry,
    bot_error_termination_list: &[regex::Regex],
    bot_error_hang_list: &[regex::Regex],
) -> Result<()> {
    loop {
        let task = match api.get_next_task().await {
            Ok(Some(task)) => task,
            Ok(None) => {
                wait_next_loop().await;
                continue;
            }
            Err(err) => {
                error!("failed to fetch next task: {}", err);
                wait_next_loop().await;
                continue;
            }
        };

        if !task.command.is_multi_instance() {
            match api.update_task_status(task.id, TaskStatus::Started).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("task {} already running elsewhere, skipping", task.id);
                    continue;
                }
                Err(err) => {
                    error!("failed to claim task {}: {}", task.id, err);
                    continue;
                }
            }
        }

        environment.set("TASK_ID", task.id.to_string());
        let lease = TaskLease::acquire(api.clone(), task.id);

        let marker = pingu_core::env::CurrentTaskMarker {
            task_id: task.id,
            lease_deadline: task.lease_deadline,
        };
        if let Err(err) = environment.write_current_task_marker(&marker).await {
            warn!("failed to write current-task marker for {}: {}", task.id, err);
        }

        let result = process_command(&task, &api, &storage, &mut environment, &engines).await;
        lease.release().await;

        if let Err(err) = environment.clear_current_task_marker().await {
            warn!("failed to clear current-task marker for {}: {}", task.id, err);
        }

        match result {
            Ok(()) => {
                let _ = api.update_task_status(task.id, TaskStatus::Finished).await;
            }
            Err(err) => {
                let formatted = format!("{err:?}");
                let _ = api.update_task_status(task.id, TaskStatus::Error).await;

                if bot_error_termination_list
                    .iter()
                    .any(|re| re.is_match(&formatted))
                {
                    return Err(err).context("fatal bot error, terminating");
                }
                if bot_error_hang_list.iter().any(|re| re.is_match(&formatted)) {
                    error!("hanging for operator inspection after error: {}", err);
                    std::future::pending::<()>().await;
                }
                error!("task {} failed: {}", task.id, err);
            }
        }
    }
}

async fn wait_next_loop() {
    let seconds = rand::thread_rng().gen_range(1..=FAIL_WAIT_SECONDS);
    tokio::time::sleep(Duration::from_secs(seconds)).await;
}

/// `spec.md` §4.3's `process_command`: resolve job/project, write the
/// project config, overlay environment, enforce `CPU_ARCH`, then dispatch.
async fn process_command(
    task: &Task,
    api: &Client,
    storage: &Arc<dyn StorageClient>,
    environment: &mut Environment,
    engines: &EngineRegistry,
) -> Result<()> {
    let job = api.get_job(task.job_id).await?;
    let project = api.get_project(job.project_id).await?;

    let project_config_path = environment.project_config_path();
    if let Some(parent) = project_config_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&project_config_path, &project.yaml_config).await?;

    environment.set("JOB_ID", job.id.to_string());
    environment.set("TASK_NAME", format!("{:?}", task.command));
    environment.set("TASK_ARGUMENT", task.argument.clone());
    for (key, value) in job.environment() {
        environment.set(key, value);
    }

    if let Some(expected_arch) = environment.get("CPU_ARCH") {
        if expected_arch != std::env::consts::ARCH {
            warn!(
                "CPU_ARCH mismatch for task {} (expected {}, running {}); skipping",
                task.id,
                expected_arch,
                std::env::consts::ARCH
            );
            return Ok(());
        }
    }

    let heartbeat = init_task_heartbeat(
        Arc::new(ApiHeartbeatSink { api: api.clone() }) as Arc<dyn HeartbeatSink>,
        task.id,
        task.job_id,
        None,
        environment.machine_id,
        environment.bot_name.clone(),
    )
    .await?;
    heartbeat.alive();

    let common = CommonConfig {
        job_id: task.job_id,
        task_id: task.id,
        instance_id: environment.instance_id,
        argument: task.argument.clone(),
        api: api.clone(),
        storage: storage.clone(),
        environment: environment.clone(),
        heartbeat: Some(heartbeat),
    };

    match task.command {
        TaskCommand::Analyze => crate::analyze::run(common).await,
        TaskCommand::Minimize => crate::minimize::run(common, engines.clone()).await,
        TaskCommand::Regression => crate::regression::run(common, false).await,
        TaskCommand::Progression => crate::regression::run(common, true).await,
        TaskCommand::Symbolize => crate::symbolize::run(common).await,
        TaskCommand::Fuzz => crate::fuzz::run(common, engines.clone()).await,
        TaskCommand::CorpusPruning => crate::corpus_pruning::run(common, engines.clone()).await,
        TaskCommand::Impact => crate::impact::run(common).await,
        TaskCommand::Variant => crate::variant::run(common).await,
        TaskCommand::Unpack => crate::unpack::run(common).await,
        TaskCommand::UploadReports => crate::upload_reports::run(common).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(argument: &str) -> CommonConfig {
        CommonConfig {
            job_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            argument: argument.to_owned(),
            api: Client::new("http://localhost".parse().unwrap(), None).unwrap(),
            storage: Arc::new(NoopStorage),
            environment: Environment::new(Uuid::new_v4(), Uuid::new_v4(), "bot-1").unwrap(),
            heartbeat: None,
        }
    }

    struct NoopStorage;

    #[async_trait::async_trait]
    impl StorageClient for NoopStorage {
        async fn create_bucket(&self, _bucket: &str) -> Result<()> {
            unimplemented!()
        }
        async fn list_blobs(
            &self,
            _prefix: &pingu_core::storage::StoragePath,
        ) -> Result<Vec<pingu_core::storage::BlobMetadata>> {
            unimplemented!()
        }
        async fn get(
            &self,
            _path: &pingu_core::storage::StoragePath,
        ) -> Result<pingu_core::storage::BlobMetadata> {
            unimplemented!()
        }
        async fn read_data(&self, _path: &pingu_core::storage::StoragePath) -> Result<Vec<u8>> {
            unimplemented!()
        }
        async fn write_data(
            &self,
            _path: &pingu_core::storage::StoragePath,
            _data: Vec<u8>,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn copy_file_to(
            &self,
            _local: &std::path::Path,
            _path: &pingu_core::storage::StoragePath,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn copy_file_from(
            &self,
            _path: &pingu_core::storage::StoragePath,
            _local: &std::path::Path,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn delete(&self, _path: &pingu_core::storage::StoragePath) -> Result<()> {
            unimplemented!()
        }
        async fn last_updated(
            &self,
            _path: &pingu_core::storage::StoragePath,
        ) -> Result<Option<std::time::SystemTime>> {
            unimplemented!()
        }
    }

    #[test]
    fn test_testcase_id_parses_uuid_argument() {
        let id = Uuid::new_v4();
        let common = common(&id.to_string());
        assert_eq!(common.testcase_id().unwrap(), id);
    }

    #[test]
    fn test_testcase_id_rejects_non_uuid() {
        let common = common("not-a-uuid");
        assert!(common.testcase_id().is_err());
    }

    #[test]
    fn test_fuzz_target_ref_splits_on_comma() {
        let common = common("my_fuzzer,my_binary");
        assert_eq!(
            common.fuzz_target_ref().unwrap(),
            ("my_fuzzer".to_owned(), "my_binary".to_owned())
        );
    }

    #[test]
    fn test_fuzz_target_ref_rejects_missing_comma() {
        let common = common("my_fuzzer");
        assert!(common.fuzz_target_ref().is_err());
    }

    #[test]
    fn test_bot_config_round_trips_through_yaml() {
        let config = BotConfig {
            api_url: "https://api.example.test".parse().unwrap(),
            api_key: Some("secret".into()),
            storage_region: "us-east-1".into(),
            storage_endpoint: None,
            storage_access_key: None,
            storage_secret_key: None,
            instance_id: Uuid::new_v4(),
            machine_id: Uuid::new_v4(),
            bot_name: "bot-1".into(),
            bot_error_termination_list: vec!["out of memory".into()],
            bot_error_hang_list: vec![],
        };

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: BotConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.bot_name, config.bot_name);
        assert_eq!(parsed.bot_error_termination_list, config.bot_error_termination_list);
    }

    #[test]
    fn test_compile_termination_list_rejects_bad_regex() {
        let mut config = BotConfig {
            api_url: "https://api.example.test".parse().unwrap(),
            api_key: None,
            storage_region: "us-east-1".into(),
            storage_endpoint: None,
            storage_access_key: None,
            storage_secret_key: None,
            instance_id: Uuid::new_v4(),
            machine_id: Uuid::new_v4(),
            bot_name: "bot-1".into(),
            bot_error_termination_list: vec!["[".into()],
            bot_error_hang_list: vec![],
        };
        assert!(config.compile_termination_list().is_err());

        config.bot_error_termination_list = vec!["out of memory".into()];
        assert!(config.compile_termination_list().is_ok());
    }

    #[test]
    fn test_storage_credentials_requires_both_keys() {
        let mut config = BotConfig {
            api_url: "https://api.example.test".parse().unwrap(),
            api_key: None,
            storage_region: "us-east-1".into(),
            storage_endpoint: None,
            storage_access_key: Some("ak".into()),
            storage_secret_key: None,
            instance_id: Uuid::new_v4(),
            machine_id: Uuid::new_v4(),
            bot_name: "bot-1".into(),
            bot_error_termination_list: vec![],
            bot_error_hang_list: vec![],
        };
        assert!(config.storage_credentials().is_none());

        config.storage_secret_key = Some("sk".into());
        assert_eq!(
            config.storage_credentials(),
            Some(("ak".to_owned(), "sk".to_owned()))
        );
    }
}
