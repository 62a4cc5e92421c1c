// Supervisor startup configuration (`spec.md` §4.1). Grounded on
// `onefuzz-supervisor/src/config.rs`'s `StaticConfig::from_file`/`from_env`,
// generalized from Azure AD credentials + an Azure Storage Queue heartbeat
// to this bot's plain api-key/HTTP-API model.

use anyhow::{Context, Result};
use pingu_api::model::Bot;
use pingu_api::Client;
use pingu_core::env::Environment;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_RUN_TIMEOUT_SECONDS: u64 = 60 * 60 * 24;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SupervisorConfig {
    pub api_url: Url,
    pub api_key: Option<String>,

    pub instance_id: Uuid,
    #[serde(default = "Uuid::new_v4")]
    pub machine_id: Uuid,
    pub bot_name: String,

    /// Path to the `pingu-worker` binary the supervisor launches each
    /// iteration, and the bot config file passed to it via `--config`.
    pub worker_binary: std::path::PathBuf,

    /// `RUN_TIMEOUT`, capped at `i32::MAX / 1000` seconds as `spec.md`
    /// §4.1 specifies.
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,
}

fn default_run_timeout_seconds() -> u64 {
    DEFAULT_RUN_TIMEOUT_SECONDS
}

impl SupervisorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading supervisor config file: {}", path.display()))?;
        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing supervisor config file: {}", path.display()))
    }

    pub fn from_env() -> Result<Self> {
        let api_url = std::env::var("PINGU_API_URL").context("PINGU_API_URL is not set")?;
        let instance_id = match std::env::var("PINGU_INSTANCE_ID") {
            Ok(value) => Uuid::parse_str(&value).context("PINGU_INSTANCE_ID is not a uuid")?,
            Err(_) => Uuid::new_v4(),
        };
        let bot_name = std::env::var("PINGU_BOT_NAME").unwrap_or_else(|_| "pingu-bot".to_owned());
        let worker_binary = std::env::var("PINGU_WORKER_BINARY")
            .unwrap_or_else(|_| "pingu-worker".to_owned())
            .into();
        let run_timeout_seconds = std::env::var("PINGU_RUN_TIMEOUT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_RUN_TIMEOUT_SECONDS);

        Ok(Self {
            api_url: api_url.parse().context("PINGU_API_URL is not a valid url")?,
            api_key: std::env::var("PINGU_API_KEY").ok(),
            instance_id,
            machine_id: Uuid::new_v4(),
            bot_name,
            worker_binary,
            run_timeout_seconds,
        })
    }

    pub fn build_api(&self) -> Result<Client> {
        Client::new(self.api_url.clone(), self.api_key.clone()).context("building api client")
    }

    /// `spec.md` §4.1: `RUN_TIMEOUT` capped at 2³¹⁄1000 s.
    pub fn run_timeout(&self) -> Duration {
        const CAP_SECONDS: u64 = (i32::MAX as u64) / 1000;
        Duration::from_secs(self.run_timeout_seconds.min(CAP_SECONDS))
    }
}

/// `spec.md` §4.1: `GET /bot/{name}` then `GET /bot-config/{bot_id}`,
/// written to `config/bot/config.yaml` before any task runs.
pub async fn fetch_and_write_bot_config(
    api: &Client,
    environment: &Environment,
    bot_name: &str,
) -> Result<Bot> {
    let bot = api
        .get_bot(bot_name)
        .await
        .with_context(|| format!("fetching bot registration for {bot_name}"))?;

    let yaml = api
        .get_bot_config(bot.id)
        .await
        .with_context(|| format!("fetching bot config for {}", bot.id))?;

    let config_path = environment.bot_config_path();
    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(&config_path, yaml)
        .await
        .with_context(|| format!("writing {}", config_path.display()))?;

    Ok(bot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_timeout_is_capped() {
        let config = SupervisorConfig {
            api_url: "https://api.example.test".parse().unwrap(),
            api_key: None,
            instance_id: Uuid::new_v4(),
            machine_id: Uuid::new_v4(),
            bot_name: "bot-1".into(),
            worker_binary: "pingu-worker".into(),
            run_timeout_seconds: u64::MAX,
        };
        assert_eq!(config.run_timeout(), Duration::from_secs((i32::MAX as u64) / 1000));
    }

    #[test]
    fn test_supervisor_config_round_trips_through_yaml() {
        let config = SupervisorConfig {
            api_url: "https://api.example.test".parse().unwrap(),
            api_key: Some("secret".into()),
            instance_id: Uuid::new_v4(),
            machine_id: Uuid::new_v4(),
            bot_name: "bot-1".into(),
            worker_binary: "pingu-worker".into(),
            run_timeout_seconds: 3600,
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: SupervisorConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.bot_name, config.bot_name);
        assert_eq!(parsed.run_timeout_seconds, config.run_timeout_seconds);
    }
}
