// The supervisor's top-level lifecycle loop (`spec.md` §4.1). The teacher's
// `Agent` drives an elaborate `Free`/`SettingUp`/`PendingReboot`/`Ready`/
// `Busy`/`Done` state machine around an Azure Storage Queue work-set
// protocol; this bot's worker self-polls the control-plane API directly
// (see `pingu_task_lib::tasks::config::task_loop`), so the supervisor's
// job collapses to: keep a heartbeat running, launch the worker bounded by
// a timeout, and watch for the bot's run-timed-out flag.

use crate::config::{fetch_and_write_bot_config, SupervisorConfig};
use crate::heartbeat;
use crate::worker::{run_worker_once, WorkerExit};
use anyhow::Result;
use pingu_api::Client;
use pingu_core::env::Environment;
use std::time::SystemTime;
use tokio::task::JoinHandle;

pub struct Agent {
    api: Client,
    environment: Environment,
    config: SupervisorConfig,
}

impl Agent {
    pub fn new(api: Client, environment: Environment, config: SupervisorConfig) -> Self {
        Self {
            api,
            environment,
            config,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let bot = fetch_and_write_bot_config(&self.api, &self.environment, &self.config.bot_name).await?;
        info!("bot {} ({}) registered, starting run loop", bot.name, bot.id);

        let heartbeat_handle = self.spawn_heartbeat();

        let result = self.run_loop().await;

        heartbeat_handle.abort();

        result
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let api = self.api.clone();
        let environment = self.environment.clone();
        let worker_binary = self.config.worker_binary.clone();

        tokio::spawn(async move {
            let mut last_seen = None;
            loop {
                tokio::time::sleep(heartbeat::HEARTBEAT_WAIT_INTERVAL).await;
                match heartbeat::tick(&api, &environment, &worker_binary, last_seen).await {
                    Ok(seen) => last_seen = seen,
                    Err(err) => warn!("heartbeat tick failed: {}", err),
                }
            }
        })
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            let started = SystemTime::now();
            let outcome = run_worker_once(
                &self.config.worker_binary,
                &self.environment.bot_config_path(),
                self.config.run_timeout(),
            )
            .await;

            match outcome {
                Ok(output) => {
                    let elapsed = started.elapsed().unwrap_or_default();
                    match WorkerExit::classify(output.exit_status.code) {
                        WorkerExit::Normal => {
                            debug!("worker exited normally after {:?}", elapsed);
                        }
                        WorkerExit::Fatal => {
                            error!(
                                "worker exited with a fatal error after {:?}: {}",
                                elapsed, output.stderr
                            );
                        }
                        WorkerExit::Other(code) => {
                            warn!(
                                "worker exited unexpectedly (code {:?}) after {:?}: {}",
                                code, elapsed, output.stderr
                            );
                        }
                    }
                }
                Err(err) => {
                    warn!("failed to run worker: {}", err);
                }
            }

            if self.bot_run_timed_out().await? {
                info!("bot run has timed out, shutting down");
                return Ok(());
            }
        }
    }

    /// `spec.md` §4.1 step 3: re-checks the bot's own registration after
    /// every worker exit; a control-plane-side field, not a standalone
    /// endpoint (`spec.md` §6 only lists bot get-by-name/get-config).
    async fn bot_run_timed_out(&self) -> Result<bool> {
        let bot = self.api.get_bot(&self.config.bot_name).await?;
        Ok(bot.run_timed_out)
    }
}

#[cfg(test)]
mod tests;
