// Standalone entry point for the side-channel heartbeat process
// (`spec.md` §4.2). Kept as its own binary, rather than folded into the
// supervisor's own process, so it can keep noticing a wedged worker even
// if the supervisor that launched it has also wedged.

#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate pingu_telemetry;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pingu_core::env::Environment;
use pingu_supervisor_lib::config::SupervisorConfig;
use pingu_supervisor_lib::heartbeat;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pingu-heartbeat", version)]
struct Opt {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run {
        #[arg(long, short = 'c')]
        config: PathBuf,
    },
    RunEnv,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(opt))
}

async fn run(opt: Opt) -> Result<()> {
    let config = match opt.command {
        Command::Run { config } => SupervisorConfig::from_file(&config)
            .with_context(|| format!("loading supervisor config: {}", config.display()))?,
        Command::RunEnv => {
            SupervisorConfig::from_env().context("loading supervisor config from environment")?
        }
    };

    info!("starting heartbeat process for bot {}", config.bot_name);

    let api = config.build_api()?;
    let environment = Environment::new(config.instance_id, config.machine_id, config.bot_name.clone())
        .context("initializing environment")?;

    let mut last_seen = None;
    loop {
        tokio::time::sleep(heartbeat::HEARTBEAT_WAIT_INTERVAL).await;
        match heartbeat::tick(&api, &environment, &config.worker_binary, last_seen).await {
            Ok(seen) => last_seen = seen,
            Err(err) => warn!("heartbeat tick failed: {}", err),
        }
    }
}
