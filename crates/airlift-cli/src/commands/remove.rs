//! Remove command

use std::path::Path;

use clap::Args;

use super::{live_executor, EngineArgs};
use crate::Result;

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Release to remove
    #[arg(long)]
    pub release: String,

    #[command(flatten)]
    pub engine: EngineArgs,
}

pub async fn run(args: RemoveArgs) -> Result<()> {
    let config = args.engine.engine_config()?;
    let executor = live_executor(&args.engine, config, Path::new(".")).await?;
    executor.remove(&args.release).await?;
    println!("{} removed", args.release);
    Ok(())
}
