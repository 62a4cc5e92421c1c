#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate pingu_telemetry;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pingu_core::env::Environment;
use pingu_task_lib::engine::EngineRegistry;
use pingu_task_lib::tasks::config::BotConfig;
use std::path::PathBuf;

/// The worker bot: leases tasks from the control plane and runs them until
/// told to stop (`spec.md` §4.2/§4.3). Generalized from `onefuzz-agent`'s
/// `--config`-driven entrypoint to a `pingu-bot worker` command.
#[derive(Parser)]
#[command(name = "pingu-worker", version)]
struct Opt {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker loop against a YAML bot config file.
    Run {
        #[arg(long, short = 'c')]
        config: PathBuf,
    },
    /// Run the worker loop using `PINGU_*` environment variables instead of
    /// a config file.
    RunEnv,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    set_sanitizer_env_vars()?;

    let opt = Opt::parse();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(opt))
}

async fn run(opt: Opt) -> Result<()> {
    let config = match opt.command {
        Command::Run { config } => BotConfig::from_file(&config)
            .with_context(|| format!("loading bot config: {}", config.display()))?,
        Command::RunEnv => BotConfig::from_env().context("loading bot config from environment")?,
    };

    info!("starting worker bot {}", config.bot_name);

    let api = config.build_api()?;
    let storage = config.build_storage().await?;
    let environment = Environment::new(config.instance_id, config.machine_id, config.bot_name.clone())
        .context("initializing environment")?;
    let engines = EngineRegistry::new();

    let termination_list = config.compile_termination_list()?;
    let hang_list = config.compile_hang_list()?;

    let result = pingu_task_lib::tasks::config::task_loop(
        api,
        storage,
        environment,
        engines,
        &termination_list,
        &hang_list,
    )
    .await;

    if let Err(err) = &result {
        error!("worker bot exiting with error: {err}");
    }

    result
}

/// Ensures sanitizer environment variables are set before any task spawns a
/// child process, so every worker run is consistently instrumented
/// regardless of what the host shell happened to export.
fn set_sanitizer_env_vars() -> Result<()> {
    let sanitizer_env_vars = pingu_core::sanitizer::default_sanitizer_env_vars()?;

    for (k, v) in sanitizer_env_vars {
        std::env::set_var(k, v);
    }

    Ok(())
}
