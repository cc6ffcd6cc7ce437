mod batcher;
mod brain;
mod cli;
mod config;
mod error;
mod ledger;
mod llm;
mod logging;
mod orchestrator;
mod repair;
mod report;
mod source;
mod state_machine;
#[cfg(test)]
mod testing;
mod ui;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use batcher::{BatcherSettings, IngestionBatcher};
use brain::BrainClient;
use cli::{Cli, Command};
use config::AppConfig;
use ledger::ResultLedger;
use orchestrator::{JobOrchestrator, OrchestratorSettings};
use repair::LlmRepairer;
use ui::RunProgress;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::setup_logging(cli.verbose)?;

    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            paths,
            concurrency,
            output_dir,
            no_repair,
        } => {
            if let Some(window) = concurrency {
                config.orchestrator.concurrency_window = window;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            if no_repair {
                config.repair.enabled = false;
            }
            config.validate()?;
            run(config, &paths).await
        }
        Command::Status { paths } => status(&config, &paths),
    }
}

async fn run(mut config: AppConfig, paths: &[PathBuf]) -> anyhow::Result<()> {
    if config.repair.enabled && config.repair.api_key.is_empty() {
        warn!("no repair API key configured (OPENAI_API_KEY); simulation errors will not be repaired");
        config.repair.enabled = false;
    }

    let sources = source::discover_sources(paths)?;
    if sources.is_empty() {
        warn!("no source files found");
        return Ok(());
    }

    let client = Arc::new(
        BrainClient::from_config(&config.brain)
            .await
            .context("authenticating with the simulation API")?,
    );
    let repairer = Arc::new(LlmRepairer::from_config(&config.repair)?);
    let orchestrator_settings = OrchestratorSettings::from_config(
        &config.orchestrator,
        config.repair.enabled,
        config.repair.persist_to_source,
    );
    let batcher_settings = BatcherSettings::from_config(&config.orchestrator);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current poll pass");
            let _ = shutdown_tx.send(true);
        }
    });

    for path in sources {
        let candidates = match source::load_candidates(&path) {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "skipping source");
                continue;
            }
        };

        let ledger_path = ledger::ledger_path(&config.output_dir, &path);
        let mut ledger = ResultLedger::open(&ledger_path)
            .with_context(|| format!("opening ledger {}", ledger_path.display()))?;
        info!(source = %path.display(), ledger = %ledger_path.display(), "evaluating source");

        let name = path.file_name().map_or_else(
            || path.display().to_string(),
            |n| n.to_string_lossy().into_owned(),
        );
        let orchestrator = JobOrchestrator::new(
            client.clone(),
            repairer.clone(),
            orchestrator_settings.clone(),
        )
        .with_source_file(path.clone())
        .with_shutdown(shutdown_rx.clone())
        .with_progress(RunProgress::start(&name, candidates.len() as u64));

        let mut batcher = IngestionBatcher::new(orchestrator, batcher_settings.clone());
        let report = batcher.run(&path, candidates, &mut ledger).await?;
        batcher.orchestrator().progress().complete(&report);

        if report.interrupted {
            break;
        }
    }
    Ok(())
}

fn status(config: &AppConfig, paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut ledgers = Vec::new();
    for path in paths {
        if is_csv(path) {
            ledgers.push(path.clone());
        } else {
            for source in source::discover_sources(std::slice::from_ref(path))? {
                ledgers.push(ledger::ledger_path(&config.output_dir, &source));
            }
        }
    }

    for path in ledgers {
        if !path.exists() {
            println!("{}: no ledger yet", path.display());
            continue;
        }
        let summary = ledger::summarize(&path)
            .with_context(|| format!("reading ledger {}", path.display()))?;
        ui::print_summary(&summary);
    }
    Ok(())
}

fn is_csv(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "csv")
}
