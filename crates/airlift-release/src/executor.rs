//! Release executor
//!
//! Drives one release through install or upgrade:
//!
//! 1. Read history. No revisions means install, otherwise upgrade. A failed
//!    read is fatal.
//! 2. Upgrades migrate the latest revision off removed APIs once, then fix
//!    the rollback target: the last deployed revision at that point.
//! 3. Each attempt renders the chart, post-renders the stream, applies it in
//!    order, prunes resources the previous revision had but this one does not
//!    (upgrade only), waits for readiness and records the revision.
//! 4. Attempts repeat with a fixed backoff under the install or upgrade
//!    policy. Every attempt is bounded by the attempt timeout.
//! 5. An upgrade that gives up rolls back to the target from step 2 under
//!    its own timeout. The upgrade still fails either way; the error carries
//!    the rollback outcome.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use airlift_common::graph::sort_dependencies;
use airlift_common::retry::{retry_fixed, RetryError};
use airlift_common::yaml::{split_manifests, ManifestDocument};
use tracing::{debug, info, warn};

use crate::chart::{merge_values, ChartDescriptor, ChartSource, LoadedChart, Values};
use crate::cluster::{ClusterClient, ResourceRef};
use crate::config::EngineConfig;
use crate::deprecation::DeprecationMigrator;
use crate::error::{Error, Operation, RollbackOutcome, StopReason};
use crate::events::{Phase, ProgressReporter, TracingProgress};
use crate::history::{
    last_deployed, latest, next_version, prune, record_deployed, ReleaseRevision, ReleaseStatus,
    ReleaseStore,
};
use crate::post_render::{post_renderer, ConnectStrings, PostRender, RenderTarget};
use crate::render::{ChartRenderer, ReleaseContext};

/// Result of a successful deploy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployOutcome {
    /// Resolved release name
    pub release_name: String,
    /// Connect strings discovered while post-rendering
    pub connect_strings: ConnectStrings,
    /// Revision recorded as deployed
    pub revision: u32,
    /// Whether this was an install or an upgrade
    pub operation: Operation,
}

/// Everything an attempt needs that does not change between attempts
struct Plan<'a> {
    chart: &'a ChartDescriptor,
    release: &'a str,
    loaded: LoadedChart,
    values: Values,
    post_render: Box<dyn PostRender>,
    /// Last deployed revision before the first attempt
    previous: Option<ReleaseRevision>,
}

/// What a successful attempt produced
struct Applied {
    revision: u32,
    connect_strings: ConnectStrings,
}

/// Install/upgrade/rollback state machine for releases
pub struct ReleaseExecutor {
    config: EngineConfig,
    cluster: Arc<dyn ClusterClient>,
    store: Arc<dyn ReleaseStore>,
    source: Arc<dyn ChartSource>,
    renderer: Arc<dyn ChartRenderer>,
    progress: Arc<dyn ProgressReporter>,
    migrator: DeprecationMigrator,
}

impl ReleaseExecutor {
    /// Create an executor; the config is validated here
    pub fn new(
        config: EngineConfig,
        cluster: Arc<dyn ClusterClient>,
        store: Arc<dyn ReleaseStore>,
        source: Arc<dyn ChartSource>,
        renderer: Arc<dyn ChartRenderer>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let migrator = DeprecationMigrator::new(&config.deprecations);
        Ok(Self {
            config,
            cluster,
            store,
            source,
            renderer,
            progress: Arc::new(TracingProgress),
            migrator,
        })
    }

    /// Report phase transitions somewhere other than the log
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Engine configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Install or upgrade one release
    ///
    /// `values` are merged over the chart's own values.
    pub async fn deploy(
        &self,
        chart: &ChartDescriptor,
        values: Values,
    ) -> Result<DeployOutcome, Error> {
        let release = chart.release_name();
        self.progress.report(release, Phase::Queued).await;

        let result = self.run_deploy(chart, release, values).await;
        match &result {
            Ok(outcome) => {
                self.progress
                    .report(
                        release,
                        Phase::Succeeded {
                            revision: outcome.revision,
                        },
                    )
                    .await
            }
            Err(_) => self.progress.report(release, Phase::Failed).await,
        }
        result
    }

    async fn run_deploy(
        &self,
        chart: &ChartDescriptor,
        release: &str,
        values: Values,
    ) -> Result<DeployOutcome, Error> {
        self.progress.report(release, Phase::CheckingHistory).await;
        let history = self.store.history(release).await?;
        let operation = if history.is_empty() {
            Operation::Install
        } else {
            Operation::Upgrade
        };
        info!(release = %release, chart = %chart.name, operation = %operation, "deploying release");

        let previous = match operation {
            Operation::Upgrade => {
                self.migrate(release, &history).await?;
                let history = self.store.history(release).await?;
                last_deployed(&history).cloned()
            }
            _ => None,
        };

        let loaded = self.source.load(chart).await?;
        let mut merged = loaded.values.clone();
        merge_values(&mut merged, values);

        let post_render = post_renderer(
            &self.config,
            RenderTarget {
                release: release.to_string(),
                namespace: chart.namespace.clone(),
            },
            self.cluster.clone(),
        )?;
        let plan = Plan {
            chart,
            release,
            loaded,
            values: merged,
            post_render,
            previous,
        };

        let policy = match operation {
            Operation::Upgrade => self.config.upgrade_policy(),
            _ => self.config.install_policy(),
        };
        let name = format!("{} {}", operation, release);
        let result = retry_fixed(&policy, &name, |attempt| {
            self.attempt(&plan, operation, attempt)
        })
        .await;

        match result {
            Ok(applied) => {
                self.prune_history(release).await;
                Ok(DeployOutcome {
                    release_name: release.to_string(),
                    connect_strings: applied.connect_strings,
                    revision: applied.revision,
                    operation,
                })
            }
            Err(failure) => {
                let (stop, source) = split_failure(failure);
                match operation {
                    Operation::Upgrade => {
                        let rollback = self.recover(chart, release, plan.previous).await;
                        Err(Error::UpgradeFailed {
                            release: release.to_string(),
                            stop,
                            rollback,
                            source: Box::new(source),
                        })
                    }
                    _ => Err(Error::InstallFailed {
                        release: release.to_string(),
                        stop,
                        source: Box::new(source),
                    }),
                }
            }
        }
    }

    /// One bounded attempt; failures are recorded as failed revisions
    async fn attempt(
        &self,
        plan: &Plan<'_>,
        operation: Operation,
        attempt: u32,
    ) -> Result<Applied, Error> {
        let phase = match operation {
            Operation::Upgrade => Phase::Upgrading { attempt },
            _ => Phase::Installing { attempt },
        };
        self.progress.report(plan.release, phase).await;

        let mut manifest = String::new();
        let limit = self.config.attempt_timeout();
        let result =
            match tokio::time::timeout(limit, self.try_attempt(plan, operation, &mut manifest))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation,
                    release: plan.release.to_string(),
                    elapsed: limit,
                }),
            };

        if let Err(e) = &result {
            warn!(release = %plan.release, attempt, error = %e, "{} attempt failed", operation);
            self.record_failed(plan, operation, manifest, e).await;
        }
        result
    }

    async fn try_attempt(
        &self,
        plan: &Plan<'_>,
        operation: Operation,
        manifest: &mut String,
    ) -> Result<Applied, Error> {
        let release = plan.release;
        let namespace = plan.chart.namespace.as_str();

        let history = self.store.history(release).await?;
        let version = next_version(&history);

        let rendered = self.renderer.render(
            &plan.loaded,
            &plan.values,
            &ReleaseContext {
                name: release.to_string(),
                namespace: namespace.to_string(),
                revision: version,
                is_install: operation == Operation::Install,
                is_upgrade: operation == Operation::Upgrade,
            },
        )?;
        let output = plan.post_render.run(&rendered).await?;
        manifest.clone_from(&output.manifest);

        let applied = self.apply_documents(release, namespace, &output.documents).await?;

        if let Some(previous) = &plan.previous {
            self.prune_removed(release, namespace, &previous.manifest, &output.documents)
                .await?;
        }

        if !plan.chart.no_wait {
            debug!(release = %release, resources = applied.len(), "waiting for resources");
            self.cluster
                .wait_ready(&applied, namespace, self.config.attempt_timeout())
                .await
                .map_err(|e| Error::apply(release, "readiness", e.to_string()))?;
        }

        let description = match operation {
            Operation::Upgrade => "Upgrade complete",
            _ => "Install complete",
        };
        let revision = ReleaseRevision::new(
            release,
            namespace,
            version,
            ReleaseStatus::Deployed,
            output.manifest,
            description,
        );
        record_deployed(self.store.as_ref(), &history, &revision).await?;
        info!(release = %release, revision = version, "{} complete", operation);

        Ok(Applied {
            revision: version,
            connect_strings: output.connect_strings,
        })
    }

    /// Migrate the latest revision off removed APIs
    async fn migrate(&self, release: &str, history: &[ReleaseRevision]) -> Result<(), Error> {
        let Some(current) = latest(history) else {
            return Ok(());
        };
        let version = self
            .cluster
            .server_version()
            .await
            .map_err(|e| Error::migration(release, format!("unable to read cluster version: {}", e)))?;
        if let Some(migrated) = self
            .migrator
            .migrate(self.store.as_ref(), current, &version)
            .await?
        {
            info!(release = %release, revision = migrated.version, "migrated deprecated APIs");
        }
        Ok(())
    }

    async fn apply_documents(
        &self,
        release: &str,
        namespace: &str,
        documents: &[ManifestDocument],
    ) -> Result<Vec<ResourceRef>, Error> {
        let mut applied = Vec::with_capacity(documents.len());
        for doc in documents {
            let resource = self
                .cluster
                .apply(&doc.content, namespace)
                .await
                .map_err(|e| Error::apply(release, &doc.source, e.to_string()))?;
            applied.push(resource);
        }
        Ok(applied)
    }

    /// Delete resources `previous` had that `current` no longer renders
    async fn prune_removed(
        &self,
        release: &str,
        namespace: &str,
        previous: &str,
        current: &[ManifestDocument],
    ) -> Result<(), Error> {
        let keep: HashSet<_> = current
            .iter()
            .filter_map(|d| ResourceRef::from_manifest(&d.content).ok())
            .map(|r| identity(&r, namespace))
            .collect();

        let stale: Vec<ResourceRef> = split_manifests(previous)
            .iter()
            .filter_map(|d| ResourceRef::from_manifest(&d.content).ok())
            .filter(|r| !keep.contains(&identity(r, namespace)))
            .collect();

        for resource in stale.iter().rev() {
            debug!(release = %release, resource = %resource, "deleting resource no longer in release");
            self.cluster
                .delete(resource, namespace)
                .await
                .map_err(|e| Error::apply(release, resource.to_string(), e.to_string()))?;
        }
        Ok(())
    }

    async fn record_failed(
        &self,
        plan: &Plan<'_>,
        operation: Operation,
        manifest: String,
        error: &Error,
    ) {
        let history = match self.store.history(plan.release).await {
            Ok(history) => history,
            Err(e) => {
                warn!(release = %plan.release, error = %e, "unable to record failed revision");
                return;
            }
        };
        let revision = ReleaseRevision::new(
            plan.release,
            plan.chart.namespace.as_str(),
            next_version(&history),
            ReleaseStatus::Failed,
            manifest,
            format!("{} failed: {}", operation, error),
        );
        if let Err(e) = self.store.create(&revision).await {
            warn!(release = %plan.release, error = %e, "unable to record failed revision");
        }
    }

    /// Roll back to `target` after a failed upgrade
    async fn recover(
        &self,
        chart: &ChartDescriptor,
        release: &str,
        target: Option<ReleaseRevision>,
    ) -> RollbackOutcome {
        let Some(target) = target else {
            return RollbackOutcome::NoTarget {
                reason: "no deployed revision in history".to_string(),
            };
        };
        let history = match self.store.history(release).await {
            Ok(history) => history,
            Err(e) => {
                return RollbackOutcome::NoTarget {
                    reason: e.to_string(),
                }
            }
        };

        match self
            .rollback_with_timeout(&history, &target, &chart.namespace, !chart.no_wait)
            .await
        {
            Ok(_) => RollbackOutcome::Succeeded {
                version: target.version,
            },
            Err(e) => RollbackOutcome::Failed {
                version: target.version,
                error: e.to_string(),
            },
        }
    }

    /// Restore an earlier revision of a release
    ///
    /// With no `version`, the newest non-failed revision older than the
    /// currently deployed one is used.
    pub async fn rollback(
        &self,
        release: &str,
        version: Option<u32>,
    ) -> Result<ReleaseRevision, Error> {
        let history = self.store.history(release).await?;
        let current = last_deployed(&history).map(|r| r.version).unwrap_or(u32::MAX);
        let target = match version {
            Some(v) => history
                .iter()
                .find(|r| r.version == v)
                .ok_or_else(|| Error::Rollback {
                    release: release.to_string(),
                    version: v,
                    message: "no such revision in history".to_string(),
                })?,
            None => history
                .iter()
                .filter(|r| r.version < current && r.status != ReleaseStatus::Failed)
                .max_by_key(|r| r.version)
                .ok_or_else(|| Error::NoRollbackTarget {
                    release: release.to_string(),
                })?,
        }
        .clone();

        let namespace = target.namespace.clone();
        let result = self
            .rollback_with_timeout(&history, &target, &namespace, true)
            .await;
        match &result {
            Ok(revision) => {
                self.progress
                    .report(
                        release,
                        Phase::Succeeded {
                            revision: revision.version,
                        },
                    )
                    .await
            }
            Err(_) => self.progress.report(release, Phase::Failed).await,
        }
        result
    }

    async fn rollback_with_timeout(
        &self,
        history: &[ReleaseRevision],
        target: &ReleaseRevision,
        namespace: &str,
        wait: bool,
    ) -> Result<ReleaseRevision, Error> {
        let release = target.release_name.as_str();
        self.progress
            .report(release, Phase::RollingBack { to: target.version })
            .await;
        info!(release = %release, revision = target.version, "rolling back");

        let limit = self.config.rollback_timeout();
        let result = match tokio::time::timeout(
            limit,
            self.rollback_to(history, target, namespace, wait, limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: Operation::Rollback,
                release: release.to_string(),
                elapsed: limit,
            }),
        };

        match result {
            Ok(revision) => {
                self.prune_history(release).await;
                Ok(revision)
            }
            Err(e @ Error::Timeout { .. }) => Err(e),
            Err(e) => Err(Error::Rollback {
                release: release.to_string(),
                version: target.version,
                message: e.to_string(),
            }),
        }
    }

    async fn rollback_to(
        &self,
        history: &[ReleaseRevision],
        target: &ReleaseRevision,
        namespace: &str,
        wait: bool,
        limit: Duration,
    ) -> Result<ReleaseRevision, Error> {
        let release = target.release_name.as_str();
        let documents = split_manifests(&target.manifest);
        let applied = self.apply_documents(release, namespace, &documents).await?;

        // Clean up whatever the newest revision created that the target lacks
        if let Some(newest) = latest(history).filter(|r| r.version != target.version) {
            self.prune_removed(release, namespace, &newest.manifest, &documents)
                .await?;
        }

        if wait {
            self.cluster.wait_ready(&applied, namespace, limit).await?;
        }

        let current = self.store.history(release).await?;
        let revision = ReleaseRevision::new(
            release,
            namespace,
            next_version(&current),
            ReleaseStatus::Deployed,
            target.manifest.clone(),
            format!("Rollback to {}", target.version),
        );
        record_deployed(self.store.as_ref(), &current, &revision).await?;
        Ok(revision)
    }

    /// Delete a release's resources (in reverse order) and its history
    pub async fn remove(&self, release: &str) -> Result<(), Error> {
        let history = self.store.history(release).await?;
        let Some(current) = last_deployed(&history).or_else(|| latest(&history)) else {
            info!(release = %release, "release not found, nothing to remove");
            return Ok(());
        };

        let namespace = current.namespace.as_str();
        for doc in split_manifests(&current.manifest).iter().rev() {
            let resource = match ResourceRef::from_manifest(&doc.content) {
                Ok(resource) => resource,
                Err(e) => {
                    warn!(release = %release, source = %doc.source, error = %e, "skipping unreadable resource");
                    continue;
                }
            };
            self.cluster
                .delete(&resource, namespace)
                .await
                .map_err(|e| Error::apply(release, resource.to_string(), e.to_string()))?;
        }

        for revision in &history {
            self.store.delete(release, revision.version).await?;
        }
        info!(release = %release, "release removed");
        Ok(())
    }

    /// Deploy several releases in dependency order, stopping at the first failure
    ///
    /// `values` is keyed by `namespace/release`.
    pub async fn deploy_graph(
        &self,
        charts: &[ChartDescriptor],
        values: &BTreeMap<String, Values>,
    ) -> Result<Vec<DeployOutcome>, Error> {
        let nodes: Vec<_> = charts.iter().map(ChartDescriptor::dependency_node).collect();
        let order = sort_dependencies(&nodes)?;

        let mut by_id: BTreeMap<String, &ChartDescriptor> = BTreeMap::new();
        for chart in charts {
            by_id.entry(chart.qualified_name()).or_insert(chart);
        }

        let mut outcomes = Vec::with_capacity(order.len());
        for id in &order {
            let Some(chart) = by_id.get(id) else {
                continue;
            };
            let chart_values = values.get(id).cloned().unwrap_or_default();
            outcomes.push(self.deploy(chart, chart_values).await?);
        }
        Ok(outcomes)
    }

    async fn prune_history(&self, release: &str) {
        match prune(self.store.as_ref(), release, self.config.max_history).await {
            Ok(0) => {}
            Ok(n) => debug!(release = %release, pruned = n, "pruned release history"),
            Err(e) => warn!(release = %release, error = %e, "unable to prune release history"),
        }
    }
}

/// Identity of a resource across revisions, ignoring apiVersion
fn identity(resource: &ResourceRef, namespace: &str) -> (String, String, String) {
    (
        resource.kind.clone(),
        resource
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string()),
        resource.name.clone(),
    )
}

fn split_failure(failure: RetryError<Error>) -> (StopReason, Error) {
    match failure {
        RetryError::Exhausted { attempts, last } => (StopReason::Exhausted { attempts }, last),
        RetryError::TimedOut {
            attempts,
            elapsed,
            last,
        } => (StopReason::TimedOut { attempts, elapsed }, last),
        RetryError::Fatal { attempts, error } => (StopReason::Fatal { attempts }, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::{ChartMetadata, ChartTemplate, MockChartSource};
    use crate::history::MemoryReleaseStore;
    use crate::render::{MockChartRenderer, TemplateRenderer};
    use crate::state::{ClusterState, RegistryInfo};
    use crate::testing::{FakeCluster, RecordingProgress};
    use serde_json::json;

    const SERVICE: &str = "apiVersion: v1\nkind: Service\nmetadata:\n  name: {{ Release.Name }}\n  labels:\n    airlift.dev/connect-name: web\n  annotations:\n    airlift.dev/connect-description: Web UI\n    airlift.dev/connect-url: /\n";
    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {{ Release.Name }}\nspec:\n  replicas: {{ Values.replicas }}\n  template:\n    spec:\n      containers:\n        - image: ###AIRLIFT_REGISTRY###/podinfo\n";
    const NAMESPACE: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: podinfo\n";
    const CONFIGMAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n";
    const CRONJOB: &str = "apiVersion: batch/v1beta1\nkind: CronJob\nmetadata:\n  name: cleanup\n";

    fn loaded(templates: &[(&str, &str)]) -> LoadedChart {
        LoadedChart {
            metadata: ChartMetadata {
                name: "podinfo".to_string(),
                version: "6.5.0".to_string(),
                ..Default::default()
            },
            templates: templates
                .iter()
                .map(|(path, content)| ChartTemplate {
                    path: path.to_string(),
                    content: content.to_string(),
                })
                .collect(),
            values: match json!({"replicas": 1}) {
                serde_json::Value::Object(map) => map,
                _ => Values::new(),
            },
        }
    }

    fn source(chart: LoadedChart) -> Arc<MockChartSource> {
        let mut source = MockChartSource::new();
        source.expect_load().returning(move |_| Ok(chart.clone()));
        Arc::new(source)
    }

    fn config(retries: u32) -> EngineConfig {
        EngineConfig {
            install: crate::config::Remediation::Fixed(retries),
            upgrade: crate::config::Remediation::Fixed(retries),
            backoff_seconds: 0,
            state: Some(ClusterState {
                distro: "k3s".to_string(),
                registry: RegistryInfo {
                    address: "127.0.0.1:31999".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Attempts time out after 5s, with 2s between them; rollbacks get 100s
    fn timed_config(retries: u32, max_total_seconds: Option<u64>) -> EngineConfig {
        EngineConfig {
            timeout_seconds: 5,
            backoff_seconds: 2,
            rollback_timeout_seconds: 100,
            max_total_seconds,
            mode: crate::config::RenderMode::Local,
            ..config(retries)
        }
    }

    fn descriptor() -> ChartDescriptor {
        ChartDescriptor {
            name: "podinfo".to_string(),
            namespace: "podinfo".to_string(),
            ..Default::default()
        }
    }

    struct Harness {
        executor: ReleaseExecutor,
        cluster: Arc<FakeCluster>,
        store: Arc<MemoryReleaseStore>,
        progress: Arc<RecordingProgress>,
    }

    fn harness(config: EngineConfig, chart: LoadedChart) -> Harness {
        harness_with(config, chart, FakeCluster::new("v1.29.0"))
    }

    fn harness_with(config: EngineConfig, chart: LoadedChart, cluster: FakeCluster) -> Harness {
        let cluster = Arc::new(cluster);
        let store = Arc::new(MemoryReleaseStore::new());
        let progress = Arc::new(RecordingProgress::default());
        let executor = ReleaseExecutor::new(
            config,
            cluster.clone(),
            store.clone(),
            source(chart),
            Arc::new(TemplateRenderer),
        )
        .unwrap()
        .with_progress(progress.clone());
        Harness {
            executor,
            cluster,
            store,
            progress,
        }
    }

    fn rollbacks(progress: &RecordingProgress) -> usize {
        progress.count(|p| matches!(p, Phase::RollingBack { .. }))
    }

    fn attempts(progress: &RecordingProgress) -> usize {
        progress.count(|p| matches!(p, Phase::Installing { .. } | Phase::Upgrading { .. }))
    }

    #[tokio::test]
    async fn redeploy_installs_once_then_upgrades() {
        let h = harness(
            config(3),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
        );

        let first = h.executor.deploy(&descriptor(), Values::new()).await.unwrap();
        let second = h.executor.deploy(&descriptor(), Values::new()).await.unwrap();

        assert_eq!(first.operation, Operation::Install);
        assert_eq!(first.revision, 1);
        assert_eq!(second.operation, Operation::Upgrade);
        assert_eq!(second.revision, 2);
        assert_eq!(h.progress.count(|p| matches!(p, Phase::Installing { .. })), 1);
        assert_eq!(h.progress.count(|p| matches!(p, Phase::Upgrading { .. })), 1);

        let history = h.store.history("podinfo").await.unwrap();
        let statuses: Vec<_> = history.iter().map(|r| r.status).collect();
        assert_eq!(statuses, [ReleaseStatus::Superseded, ReleaseStatus::Deployed]);
    }

    #[tokio::test]
    async fn deploy_returns_connect_strings_and_applies_substituted_manifests() {
        let h = harness(
            config(0),
            loaded(&[
                ("templates/deploy.yaml", DEPLOYMENT),
                ("templates/ns.yaml", NAMESPACE),
                ("templates/svc.yaml", SERVICE),
            ]),
        );
        let mut values = Values::new();
        values.insert("replicas".to_string(), json!(3));

        let outcome = h.executor.deploy(&descriptor(), values).await.unwrap();

        assert_eq!(outcome.release_name, "podinfo");
        assert_eq!(outcome.connect_strings["web"].description, "Web UI");
        assert_eq!(h.cluster.count("create_namespace:podinfo"), 1);
        assert_eq!(h.cluster.count("apply:Namespace"), 0);

        let deployment = h.cluster.object("Deployment/podinfo/podinfo").unwrap();
        assert!(deployment.contains("replicas: 3"));
        assert!(deployment.contains("127.0.0.1:31999/podinfo"));
        assert_eq!(h.cluster.count("wait_ready:2"), 1);

        let history = h.store.history("podinfo").await.unwrap();
        assert!(!history[0].manifest.contains("kind: Namespace"));
    }

    #[tokio::test]
    async fn failed_upgrade_retries_then_rolls_back_once() {
        let h = harness(
            config(2),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
        );
        h.executor.deploy(&descriptor(), Values::new()).await.unwrap();
        h.cluster.fail_kind("Deployment");

        let err = h.executor.deploy(&descriptor(), Values::new()).await.unwrap_err();

        assert_eq!(h.progress.count(|p| matches!(p, Phase::Upgrading { .. })), 3);
        assert_eq!(rollbacks(&h.progress), 1);
        assert!(h
            .progress
            .phases()
            .contains(&Phase::RollingBack { to: 1 }));
        match &err {
            Error::UpgradeFailed { stop, rollback, .. } => {
                assert_eq!(*stop, StopReason::Exhausted { attempts: 3 });
                // Rolling back re-applies the same Deployment, which still fails
                assert!(matches!(rollback, RollbackOutcome::Failed { version: 1, .. }));
            }
            other => panic!("Expected UpgradeFailed, got {other}"),
        }
        assert!(matches!(err.root_cause(), Error::Apply { .. }));

        let history = h.store.history("podinfo").await.unwrap();
        assert_eq!(
            history.iter().filter(|r| r.status == ReleaseStatus::Failed).count(),
            3
        );
        assert_eq!(last_deployed(&history).map(|r| r.version), Some(1));
    }

    #[tokio::test]
    async fn deploy_after_failed_install_upgrades_over_failed_history() {
        let h = harness(
            config(1),
            loaded(&[
                ("templates/deploy.yaml", DEPLOYMENT),
                ("templates/job.yaml", "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: migrate\n"),
            ]),
        );
        h.cluster.fail_kind("Job");
        let err = h.executor.deploy(&descriptor(), Values::new()).await.unwrap_err();
        assert!(matches!(err, Error::InstallFailed { .. }));
        assert_eq!(rollbacks(&h.progress), 0);

        h.cluster.heal_kind("Job");
        let outcome = h.executor.deploy(&descriptor(), Values::new()).await.unwrap();
        assert_eq!(outcome.operation, Operation::Upgrade);
        assert_eq!(outcome.revision, 3);
        assert_eq!(h.cluster.count("delete:"), 0);
    }

    #[tokio::test]
    async fn upgrade_rollback_succeeds_when_previous_manifest_applies() {
        let cluster = FakeCluster::new("v1.29.0");
        let h = harness_with(
            config(1),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
            cluster,
        );
        h.executor.deploy(&descriptor(), Values::new()).await.unwrap();

        let broken = harness_with(
            config(1),
            loaded(&[
                ("templates/deploy.yaml", DEPLOYMENT),
                ("templates/job.yaml", "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: migrate\n"),
            ]),
            FakeCluster::new("v1.29.0"),
        );
        // Seed the broken harness with the good history
        for revision in h.store.history("podinfo").await.unwrap() {
            broken.store.create(&revision).await.unwrap();
        }
        broken.cluster.fail_kind("Job");

        let err = broken
            .executor
            .deploy(&descriptor(), Values::new())
            .await
            .unwrap_err();

        assert_eq!(attempts(&broken.progress), 2);
        assert_eq!(rollbacks(&broken.progress), 1);
        assert_eq!(
            err.rollback_outcome(),
            Some(&RollbackOutcome::Succeeded { version: 1 })
        );
        assert!(err.to_string().contains("rollback to revision 1 succeeded"));

        let history = broken.store.history("podinfo").await.unwrap();
        let newest = latest(&history).unwrap();
        assert_eq!(newest.status, ReleaseStatus::Deployed);
        assert_eq!(newest.description, "Rollback to 1");
        assert!(!broken.cluster.objects().iter().any(|o| o.starts_with("Job/")));
    }

    #[tokio::test]
    async fn upgrade_without_deployed_revision_does_not_roll_back() {
        let h = harness(
            config(2),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
        );
        h.store
            .create(&ReleaseRevision::new(
                "podinfo",
                "podinfo",
                1,
                ReleaseStatus::Failed,
                "",
                "Install failed",
            ))
            .await
            .unwrap();
        h.cluster.fail_kind("Deployment");

        let err = h.executor.deploy(&descriptor(), Values::new()).await.unwrap_err();

        assert_eq!(attempts(&h.progress), 3);
        assert_eq!(rollbacks(&h.progress), 0);
        assert!(matches!(
            err.rollback_outcome(),
            Some(RollbackOutcome::NoTarget { .. })
        ));
        assert!(err
            .to_string()
            .contains("unable to determine a safe rollback target"));
    }

    #[tokio::test]
    async fn install_failure_never_rolls_back() {
        let h = harness(
            config(2),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
        );
        h.cluster.fail_kind("Deployment");

        let err = h.executor.deploy(&descriptor(), Values::new()).await.unwrap_err();

        assert_eq!(attempts(&h.progress), 3);
        assert_eq!(rollbacks(&h.progress), 0);
        assert!(matches!(
            err,
            Error::InstallFailed {
                stop: StopReason::Exhausted { attempts: 3 },
                ..
            }
        ));
        assert_eq!(h.progress.phases().last(), Some(&Phase::Failed));
    }

    #[tokio::test]
    async fn namespace_failures_stop_without_retrying() {
        let cluster = FakeCluster::new("v1.29.0");
        cluster.fail_namespace("podinfo");
        let h = harness_with(
            config(5),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
            cluster,
        );

        let err = h.executor.deploy(&descriptor(), Values::new()).await.unwrap_err();

        assert_eq!(attempts(&h.progress), 1);
        assert!(matches!(
            err,
            Error::InstallFailed {
                stop: StopReason::Fatal { attempts: 1 },
                ..
            }
        ));
        assert!(matches!(err.root_cause(), Error::NamespaceProvision { .. }));
        assert_eq!(h.cluster.count("apply:"), 0);
    }

    #[tokio::test]
    async fn history_read_failure_is_fatal() {
        let mut store = crate::history::MockReleaseStore::new();
        store
            .expect_history()
            .times(1)
            .returning(|r| Err(Error::history(r, "connection refused")));
        let mut source = MockChartSource::new();
        source.expect_load().times(0);
        let mut renderer = MockChartRenderer::new();
        renderer.expect_render().times(0);

        let executor = ReleaseExecutor::new(
            config(3),
            Arc::new(FakeCluster::new("v1.29.0")),
            Arc::new(store),
            Arc::new(source),
            Arc::new(renderer),
        )
        .unwrap();

        let err = executor.deploy(&descriptor(), Values::new()).await.unwrap_err();
        assert!(matches!(err, Error::History { .. }));
    }

    #[tokio::test]
    async fn render_errors_are_retried() {
        let h = harness(
            config(1),
            loaded(&[("templates/bad.yaml", "{{ Values.missing | required }}")]),
        );
        let err = h.executor.deploy(&descriptor(), Values::new()).await.unwrap_err();
        assert_eq!(attempts(&h.progress), 2);
        assert!(matches!(err.root_cause(), Error::Render { .. }));
    }

    #[tokio::test]
    async fn upgrade_migrates_deprecated_apis_first() {
        let h = harness(
            config(0),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
        );
        h.store
            .create(&ReleaseRevision::new(
                "podinfo",
                "podinfo",
                1,
                ReleaseStatus::Deployed,
                "---\n# Source: podinfo/templates/cron.yaml\napiVersion: batch/v1beta1\nkind: CronJob\nmetadata:\n  name: cleanup\n",
                "Install complete",
            ))
            .await
            .unwrap();

        let outcome = h.executor.deploy(&descriptor(), Values::new()).await.unwrap();
        assert_eq!(outcome.revision, 3);

        let history = h.store.history("podinfo").await.unwrap();
        assert_eq!(history[0].status, ReleaseStatus::Superseded);
        assert_eq!(history[1].description, crate::history::MIGRATION_DESCRIPTION);
        assert!(history[1].manifest.contains("apiVersion: batch/v1\n"));
        assert_eq!(history[1].status, ReleaseStatus::Superseded);
        // The CronJob is gone from the new chart, so it is pruned
        assert_eq!(h.cluster.count("delete:CronJob/podinfo/cleanup"), 1);
    }

    #[tokio::test]
    async fn upgrade_prunes_resources_dropped_from_chart() {
        let h = harness(
            config(0),
            loaded(&[
                ("templates/deploy.yaml", DEPLOYMENT),
                ("templates/svc.yaml", SERVICE),
            ]),
        );
        h.executor.deploy(&descriptor(), Values::new()).await.unwrap();

        let slim = harness_with(
            config(0),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
            FakeCluster::new("v1.29.0"),
        );
        for revision in h.store.history("podinfo").await.unwrap() {
            slim.store.create(&revision).await.unwrap();
        }
        slim.executor.deploy(&descriptor(), Values::new()).await.unwrap();

        assert_eq!(slim.cluster.count("delete:Service/podinfo/podinfo"), 1);
        assert_eq!(slim.cluster.count("delete:Deployment"), 0);
    }

    #[tokio::test]
    async fn no_wait_skips_readiness() {
        let h = harness(
            config(0),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
        );
        let chart = ChartDescriptor {
            no_wait: true,
            ..descriptor()
        };
        h.executor.deploy(&chart, Values::new()).await.unwrap();
        assert_eq!(h.cluster.count("wait_ready:"), 0);
    }

    #[tokio::test]
    async fn history_is_pruned_to_max() {
        let config = EngineConfig {
            max_history: 2,
            ..config(0)
        };
        let h = harness(config, loaded(&[("templates/deploy.yaml", DEPLOYMENT)]));
        for _ in 0..4 {
            h.executor.deploy(&descriptor(), Values::new()).await.unwrap();
        }
        let versions: Vec<u32> = h
            .store
            .history("podinfo")
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, [3, 4]);
    }

    #[tokio::test]
    async fn explicit_rollback_to_version() {
        let h = harness(
            config(0),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
        );
        h.executor.deploy(&descriptor(), Values::new()).await.unwrap();
        h.executor.deploy(&descriptor(), Values::new()).await.unwrap();

        let restored = h.executor.rollback("podinfo", None).await.unwrap();
        assert_eq!(restored.version, 3);
        assert_eq!(restored.description, "Rollback to 1");

        let err = h.executor.rollback("podinfo", Some(42)).await.unwrap_err();
        assert!(matches!(err, Error::Rollback { version: 42, .. }));
    }

    #[tokio::test]
    async fn rollback_without_earlier_revision_names_no_version() {
        let h = harness(
            config(0),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
        );
        h.executor.deploy(&descriptor(), Values::new()).await.unwrap();

        let err = h.executor.rollback("podinfo", None).await.unwrap_err();

        assert!(matches!(err, Error::NoRollbackTarget { .. }));
        assert_eq!(err.to_string(), "no earlier revision of podinfo to roll back to");
        assert_eq!(rollbacks(&h.progress), 0);
    }

    #[tokio::test]
    async fn remove_deletes_resources_in_reverse_and_history() {
        let h = harness(
            config(0),
            loaded(&[
                ("templates/a-deploy.yaml", DEPLOYMENT),
                ("templates/b-svc.yaml", SERVICE),
            ]),
        );
        h.executor.deploy(&descriptor(), Values::new()).await.unwrap();
        h.executor.remove("podinfo").await.unwrap();

        let deletes: Vec<String> = h
            .cluster
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("delete:"))
            .collect();
        assert_eq!(
            deletes,
            ["delete:Service/podinfo/podinfo", "delete:Deployment/podinfo/podinfo"]
        );
        assert!(h.store.history("podinfo").await.unwrap().is_empty());
        assert!(h.executor.remove("podinfo").await.is_ok());
    }

    #[tokio::test]
    async fn graph_deploys_in_dependency_order() {
        let h = harness(
            config(0),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
        );
        let chart = |name: &str, deps: &[&str]| ChartDescriptor {
            name: name.to_string(),
            namespace: "apps".to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        };
        let charts = vec![
            chart("frontend", &["apps/api"]),
            chart("api", &["apps/db"]),
            chart("db", &[]),
        ];

        let outcomes = h
            .executor
            .deploy_graph(&charts, &BTreeMap::new())
            .await
            .unwrap();
        let names: Vec<&str> = outcomes.iter().map(|o| o.release_name.as_str()).collect();
        assert_eq!(names, ["db", "api", "frontend"]);
    }

    #[tokio::test]
    async fn graph_cycles_deploy_nothing() {
        let h = harness(
            config(0),
            loaded(&[("templates/deploy.yaml", DEPLOYMENT)]),
        );
        let charts = vec![
            ChartDescriptor {
                name: "a".to_string(),
                namespace: "apps".to_string(),
                depends_on: vec!["apps/b".to_string()],
                ..Default::default()
            },
            ChartDescriptor {
                name: "b".to_string(),
                namespace: "apps".to_string(),
                depends_on: vec!["apps/a".to_string()],
                ..Default::default()
            },
        ];
        let err = h
            .executor
            .deploy_graph(&charts, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Graph(_)));
        assert_eq!(h.cluster.count("apply:"), 0);
    }

    #[tokio::test]
    async fn failing_upgrade_with_removed_api_migrates_once_and_restores_last_good() {
        let h = harness(config(2), loaded(&[("templates/cm.yaml", CONFIGMAP)]));
        h.executor.deploy(&descriptor(), Values::new()).await.unwrap();

        let broken = harness_with(
            config(2),
            loaded(&[
                ("templates/cm.yaml", CONFIGMAP),
                ("templates/cron.yaml", CRONJOB),
            ]),
            FakeCluster::new("v1.29.0"),
        );
        for revision in h.store.history("podinfo").await.unwrap() {
            broken.store.create(&revision).await.unwrap();
        }
        broken.cluster.fail_kind("CronJob");

        let err = broken
            .executor
            .deploy(&descriptor(), Values::new())
            .await
            .unwrap_err();

        assert_eq!(attempts(&broken.progress), 3);
        assert_eq!(rollbacks(&broken.progress), 1);
        assert!(broken
            .progress
            .phases()
            .contains(&Phase::RollingBack { to: 1 }));
        assert_eq!(
            err.rollback_outcome(),
            Some(&RollbackOutcome::Succeeded { version: 1 })
        );

        let history = broken.store.history("podinfo").await.unwrap();
        assert!(history
            .iter()
            .all(|r| r.description != crate::history::MIGRATION_DESCRIPTION));
        assert_eq!(
            history.iter().filter(|r| r.status == ReleaseStatus::Failed).count(),
            3
        );
        let deployed: Vec<_> = history
            .iter()
            .filter(|r| r.status == ReleaseStatus::Deployed)
            .collect();
        assert_eq!(deployed.len(), 1);
        assert_eq!(deployed[0].description, "Rollback to 1");
        assert!(!deployed[0].manifest.contains("CronJob"));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeouts_are_retried() {
        let h = harness(timed_config(1, None), loaded(&[("templates/cm.yaml", CONFIGMAP)]));
        h.cluster.delay_ready(Duration::from_secs(60));

        let err = h.executor.deploy(&descriptor(), Values::new()).await.unwrap_err();

        assert_eq!(attempts(&h.progress), 2);
        assert!(matches!(
            err,
            Error::InstallFailed {
                stop: StopReason::Exhausted { attempts: 2 },
                ..
            }
        ));
        assert!(!err.is_timeout());
        assert!(matches!(
            err.root_cause(),
            Error::Timeout {
                operation: Operation::Install,
                ..
            }
        ));

        let history = h.store.history("podinfo").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history
            .iter()
            .all(|r| r.status == ReleaseStatus::Failed && r.description.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_time_budget_is_a_timeout() {
        // 5s attempt + 2s backoff twice crosses the 12s budget
        let h = harness(
            timed_config(10, Some(12)),
            loaded(&[("templates/cm.yaml", CONFIGMAP)]),
        );
        h.cluster.delay_ready(Duration::from_secs(60));

        let err = h.executor.deploy(&descriptor(), Values::new()).await.unwrap_err();

        assert_eq!(attempts(&h.progress), 2);
        assert!(matches!(
            err,
            Error::InstallFailed {
                stop: StopReason::TimedOut { attempts: 2, .. },
                ..
            }
        ));
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_is_not_bound_by_the_upgrade_budget() {
        let h = harness(
            timed_config(5, Some(6)),
            loaded(&[("templates/cm.yaml", CONFIGMAP)]),
        );
        h.executor.deploy(&descriptor(), Values::new()).await.unwrap();
        h.cluster.delay_ready(Duration::from_secs(20));

        let start = tokio::time::Instant::now();
        let err = h.executor.deploy(&descriptor(), Values::new()).await.unwrap_err();

        assert!(matches!(
            err,
            Error::UpgradeFailed {
                stop: StopReason::TimedOut { attempts: 1, .. },
                ..
            }
        ));
        assert!(err.is_timeout());
        assert_eq!(
            err.rollback_outcome(),
            Some(&RollbackOutcome::Succeeded { version: 1 })
        );
        // One timed-out attempt, one backoff, then the full 20s readiness wait
        assert!(start.elapsed() >= Duration::from_secs(27));
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_overrunning_its_own_timeout_fails() {
        let config = EngineConfig {
            rollback_timeout_seconds: 10,
            ..timed_config(5, Some(6))
        };
        let h = harness(config, loaded(&[("templates/cm.yaml", CONFIGMAP)]));
        h.executor.deploy(&descriptor(), Values::new()).await.unwrap();
        h.cluster.delay_ready(Duration::from_secs(20));

        let err = h.executor.deploy(&descriptor(), Values::new()).await.unwrap_err();

        match err.rollback_outcome() {
            Some(RollbackOutcome::Failed { version: 1, error }) => {
                assert!(error.contains("rollback of podinfo timed out after 10s"));
            }
            other => panic!("Expected failed rollback, got {:?}", other),
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            max_history: 0,
            ..Default::default()
        };
        let result = ReleaseExecutor::new(
            config,
            Arc::new(FakeCluster::new("v1.29.0")),
            Arc::new(MemoryReleaseStore::new()),
            Arc::new(MockChartSource::new()),
            Arc::new(MockChartRenderer::new()),
        );
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
