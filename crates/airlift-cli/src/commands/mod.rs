//! CLI commands

use std::path::{Path, PathBuf};
use std::sync::Arc;

use airlift_common::kube_utils::create_client;
use airlift_release::post_render::managed_namespace;
use airlift_release::{
    ClusterClient, DryRunCluster, EngineConfig, KubeCluster, LocalChartSource, MemoryReleaseStore,
    ReleaseExecutor, RenderMode, SecretReleaseStore, TemplateRenderer, HISTORY_NAMESPACE,
};
use clap::Args;
use tracing::{debug, info};

use crate::Result;

pub mod deploy;
pub mod order;
pub mod remove;
pub mod rollback;

/// API server version the dry-run cluster reports
pub const DRY_RUN_SERVER_VERSION: &str = "v1.32.0";

/// Flags shared by every command that talks to a cluster
#[derive(Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// Engine config file (retries, timeouts, airgap state)
    #[arg(long, env = "AIRLIFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Kubeconfig to use instead of the inferred one
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
}

impl EngineArgs {
    /// Load the engine config, falling back to defaults when none is given
    pub fn engine_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => {
                debug!(path = %path.display(), "loading engine config");
                Ok(EngineConfig::load(path)?)
            }
            None => Ok(EngineConfig::default()),
        }
    }
}

/// Build an executor against the live cluster
///
/// Release history lives in [`HISTORY_NAMESPACE`], which is created on
/// first use.
pub async fn live_executor(
    args: &EngineArgs,
    config: EngineConfig,
    chart_root: &Path,
) -> Result<ReleaseExecutor> {
    let client = create_client(args.kubeconfig.as_deref()).await?;
    let cluster = KubeCluster::new(client.clone(), &config.field_manager);

    if cluster.get_namespace(HISTORY_NAMESPACE).await?.is_none() {
        info!(namespace = HISTORY_NAMESPACE, "creating release history namespace");
        cluster
            .create_namespace(&managed_namespace(HISTORY_NAMESPACE))
            .await?;
    }

    Ok(ReleaseExecutor::new(
        config,
        Arc::new(cluster),
        Arc::new(SecretReleaseStore::new(client, HISTORY_NAMESPACE)),
        Arc::new(LocalChartSource::new(chart_root)),
        Arc::new(TemplateRenderer),
    )?)
}

/// Build an executor that renders locally and only logs cluster writes
pub fn dry_run_executor(mut config: EngineConfig, chart_root: &Path) -> Result<ReleaseExecutor> {
    config.mode = RenderMode::Local;
    Ok(ReleaseExecutor::new(
        config,
        Arc::new(DryRunCluster::new(DRY_RUN_SERVER_VERSION)),
        Arc::new(MemoryReleaseStore::new()),
        Arc::new(LocalChartSource::new(chart_root)),
        Arc::new(TemplateRenderer),
    )?)
}
