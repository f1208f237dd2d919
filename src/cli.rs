//! Command line interface.
//!
//! Without a subcommand barista runs one cycle, which is what a cron job or
//! Kubernetes CronJob invokes.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Dispatches coffee orders to a pool of networked machines.
#[derive(Debug, Parser)]
#[command(name = "barista", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to the configuration file.
    #[arg(long, short, global = true, default_value = "barista.toml")]
    pub config: PathBuf,

    /// Log at debug level.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Print results as JSON instead of a summary.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run one cycle: retrieve finished jobs, then dispatch pending ones.
    Run,

    /// Show pending, brewing and due work.
    Status,

    /// Place an order directly in the database.
    Order {
        /// Product to brew; repeat for each cup.
        #[arg(long = "product", short, required = true)]
        products: Vec<String>,
    },

    /// Create the database schema.
    Init,
}

impl Cli {
    pub fn subcommand(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}
