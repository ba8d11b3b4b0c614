//! Rollback command

use std::path::Path;

use clap::Args;

use super::{live_executor, EngineArgs};
use crate::Result;

#[derive(Args, Debug)]
pub struct RollbackArgs {
    /// Release to roll back
    #[arg(long)]
    pub release: String,

    /// Revision to restore (defaults to the one before the deployed revision)
    #[arg(long)]
    pub revision: Option<u32>,

    #[command(flatten)]
    pub engine: EngineArgs,
}

pub async fn run(args: RollbackArgs) -> Result<()> {
    let config = args.engine.engine_config()?;
    let executor = live_executor(&args.engine, config, Path::new(".")).await?;
    let restored = executor.rollback(&args.release, args.revision).await?;
    println!(
        "{} restored as revision {} ({})",
        restored.release_name, restored.version, restored.description
    );
    Ok(())
}
