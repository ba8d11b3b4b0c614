//! Airlift CLI library

pub mod commands;
pub mod error;
pub mod plan;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// Airlift - air-gapped Kubernetes release deployment
#[derive(Parser, Debug)]
#[command(name = "airlift")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deploy every release in a plan, dependencies first
    Deploy(commands::deploy::DeployArgs),
    /// Print the order a plan's releases would deploy in
    Order(commands::order::OrderArgs),
    /// Restore an earlier revision of a release
    Rollback(commands::rollback::RollbackArgs),
    /// Delete a release's resources and history
    Remove(commands::remove::RemoveArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Deploy(args) => commands::deploy::run(args).await,
            Commands::Order(args) => commands::order::run(args).await,
            Commands::Rollback(args) => commands::rollback::run(args).await,
            Commands::Remove(args) => commands::remove::run(args).await,
        }
    }
}
