//! Order command: print the deploy order of a plan

use std::path::PathBuf;

use airlift_common::graph::sort_dependencies;
use airlift_release::ChartDescriptor;
use clap::Args;

use crate::plan::ReleasePlan;
use crate::Result;

#[derive(Args, Debug)]
pub struct OrderArgs {
    /// Release plan file
    #[arg(long)]
    pub plan: PathBuf,
}

pub async fn run(args: OrderArgs) -> Result<()> {
    let plan = ReleasePlan::load(&args.plan)?;
    for id in deploy_order(&plan)? {
        println!("{}", id);
    }
    Ok(())
}

fn deploy_order(plan: &ReleasePlan) -> Result<Vec<String>> {
    let nodes: Vec<_> = plan
        .charts
        .iter()
        .map(ChartDescriptor::dependency_node)
        .collect();
    Ok(sort_dependencies(&nodes)?)
}
