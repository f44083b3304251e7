mod archive;
mod cli;
mod config;
mod error;
mod orchestrator;
mod output;
mod report;
mod resource;
mod signals;
mod state_machine;
mod timing;
mod ui;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

use crate::config::PilotConfig;
use crate::orchestrator::JobOrchestrator;
use crate::resource::SearchPaths;
use crate::state_machine::Outcome;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "pilot failed to start");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = PilotConfig::load(&cli.config)?;
    if let Some(resource) = cli.resource {
        config.resource = resource;
    }

    match cli.command {
        Command::Config => {
            let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
            print!("{rendered}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            harvester_workdir,
            rank,
        } => {
            let rank = rank.unwrap_or_else(resource::rank_from_env);
            let handoff = std::path::absolute(&harvester_workdir).with_context(|| {
                format!("invalid harvester workdir {}", harvester_workdir.display())
            })?;
            tracing::info!(rank, resource = %config.resource, handoff = %handoff.display(), "pilot configured");

            let adapter = resource::build(&config, rank, SearchPaths::from_env());
            let mut pilot = JobOrchestrator::new(adapter, config);
            if cli.progress {
                pilot = pilot.with_observer(Box::new(ui::PhaseProgress::start()));
            }

            let cancel = signals::install_signal_handlers();
            let trace = pilot.run(&handoff, &cancel).await;
            tracing::info!(
                state = ?trace.state,
                nr_jobs = trace.nr_jobs,
                error_code = trace.error_code,
                "pilot trace"
            );

            Ok(match trace.state {
                Outcome::Success => ExitCode::SUCCESS,
                Outcome::Failure => ExitCode::FAILURE,
            })
        }
    }
}
