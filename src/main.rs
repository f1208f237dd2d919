mod backlog;
mod cli;
mod config;
mod dispatcher;
mod error;
mod logging;
mod machine;
mod resolver;
mod store;
mod ui;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, warn};

use backlog::{Backlog, place_order};
use cli::{Cli, Command};
use config::BaristaConfig;
use dispatcher::Dispatcher;
use machine::MachineClient;
use store::Store;
use ui::Printer;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let printer = Printer::default();

    match run(&cli, &printer).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "barista failed");
            printer.error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, printer: &Printer) -> Result<()> {
    let config = BaristaConfig::load(&cli.config)?;
    logging::init(logging::level(cli.verbose || config.debug), config.log_format)?;

    let store = Store::connect(&config.database_url).await?;

    match cli.subcommand() {
        Command::Run => {
            debug!("barista started");
            let machines = MachineClient::new(config.machine_timeout())?;
            let report = Dispatcher::new(store, machines, config).run_cycle().await?;
            if !report.is_clean() {
                warn!(
                    failures = report.failures.len(),
                    unresolved = report.resolve_failures.len(),
                    "cycle finished with per-machine failures"
                );
            }
            if cli.json {
                printer.json(&report)?;
            } else {
                printer.cycle(&report);
            }
            debug!("barista finished");
        }
        Command::Status => {
            let backlog = Backlog::collect(&store).await?;
            if cli.json {
                printer.json(&backlog)?;
            } else {
                printer.backlog(&backlog);
            }
        }
        Command::Order { products } => {
            let (order, jobs) = place_order(&store, &products).await?;
            if cli.json {
                printer.json(&serde_json::json!({ "order": order, "jobs": jobs }))?;
            } else {
                printer.order(&order, &jobs);
            }
        }
        Command::Init => {
            store.init_schema().await?;
            if cli.json {
                printer.json(&serde_json::json!({ "schema": "ready" }))?;
            } else {
                printer.schema_ready(&config.database_url);
            }
        }
    }
    Ok(())
}
