#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate pingu_telemetry;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pingu_core::env::Environment;
use pingu_supervisor_lib::agent::Agent;
use pingu_supervisor_lib::config::SupervisorConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pingu-supervisor", version)]
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

    info!("starting supervisor for bot {}", config.bot_name);

    let api = config.build_api()?;
    let environment = Environment::new(config.instance_id, config.machine_id, config.bot_name.clone())
        .context("initializing environment")?;

    let agent = Agent::new(api, environment, config);
    let result = agent.run().await;

    if let Err(err) = &result {
        error!("supervisor exiting with error: {err}");
    }
    result
}
