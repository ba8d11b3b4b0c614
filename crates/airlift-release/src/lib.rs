//! Release deployment engine for air-gapped clusters
//!
//! A release is one chart deployed into one namespace. [`ReleaseExecutor`]
//! installs or upgrades releases with bounded retries and rolls failed
//! upgrades back to the last good revision. Rendered manifests pass through
//! a [`PostRender`] step that substitutes airgap placeholders, provisions
//! namespaces and pull secrets, and collects connect strings. Upgrades first
//! migrate stored manifests off Kubernetes APIs the cluster no longer serves.

#![deny(missing_docs)]

pub mod chart;
pub mod cluster;
pub mod config;
pub mod deprecation;
pub mod error;
pub mod events;
pub mod executor;
pub mod history;
pub mod post_render;
pub mod render;
pub mod secrets;
pub mod state;
pub mod storage;
pub mod substitute;

#[cfg(test)]
mod testing;

pub use chart::{ChartDescriptor, ChartSource, LoadedChart, LocalChartSource, Values};
pub use cluster::{ClusterClient, DryRunCluster, KubeCluster, ResourceRef};
pub use config::{EngineConfig, Remediation, RenderMode};
pub use deprecation::{DeprecatedApi, DeprecationMigrator};
pub use error::{Error, Operation, RollbackOutcome, StopReason};
pub use events::{Phase, ProgressReporter, TracingProgress};
pub use executor::{DeployOutcome, ReleaseExecutor};
pub use history::{MemoryReleaseStore, ReleaseRevision, ReleaseStatus, ReleaseStore};
pub use post_render::{ConnectString, ConnectStrings, PostRender, PostRenderOutput};
pub use render::{ChartRenderer, ReleaseContext, TemplateRenderer};
pub use state::ClusterState;
pub use storage::{SecretReleaseStore, HISTORY_NAMESPACE};

/// Result type alias using the engine's Error type
pub type Result<T> = std::result::Result<T, Error>;
