//! Deploy command

use std::collections::BTreeMap;
use std::path::PathBuf;

use airlift_release::{ConnectStrings, DeployOutcome};
use clap::Args;
use tracing::info;

use super::{dry_run_executor, live_executor, EngineArgs};
use crate::plan::ReleasePlan;
use crate::Result;

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Release plan file
    #[arg(long)]
    pub plan: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Render and substitute locally without touching a cluster
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn run(args: DeployArgs) -> Result<()> {
    let plan = ReleasePlan::load(&args.plan)?;
    let root = ReleasePlan::base_dir(&args.plan);
    let config = args.engine.engine_config()?;

    let executor = if args.dry_run {
        dry_run_executor(config, &root)?
    } else {
        live_executor(&args.engine, config, &root).await?
    };

    info!(releases = plan.charts.len(), dry_run = args.dry_run, "deploying plan");
    let outcomes = executor.deploy_graph(&plan.charts, &plan.values).await?;

    println!("{}", serde_json::to_string_pretty(&connect_strings(&outcomes))?);
    Ok(())
}

/// Connect strings of every deployed release, keyed by release name
fn connect_strings(outcomes: &[DeployOutcome]) -> BTreeMap<&str, &ConnectStrings> {
    outcomes
        .iter()
        .filter(|o| !o.connect_strings.is_empty())
        .map(|o| (o.release_name.as_str(), &o.connect_strings))
        .collect()
}
