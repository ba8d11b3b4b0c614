//! Post-rendering of a release's manifest stream
//!
//! After templating and before anything reaches the cluster, the rendered
//! stream is run through placeholder substitution and re-split into
//! documents. The cluster renderer then takes `Namespace` documents out of
//! the stream (their lifecycle belongs to the engine, not the chart),
//! collects connect strings from labelled Services, creates every namespace
//! the manifest needs, and provisions registry and git secrets into them.
//!
//! The renderer is picked once per executor from [`RenderMode`].

use std::collections::BTreeMap;
use std::sync::Arc;

use airlift_common::yaml::{join_manifests, parse_yaml, split_manifests, ManifestDocument};
use airlift_common::{
    CONNECT_DESCRIPTION_ANNOTATION, CONNECT_LABEL, CONNECT_URL_ANNOTATION, INITIAL_NAMESPACES,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, RELEASE_LABEL,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cluster::{ClusterClient, CreateOutcome};
use crate::config::{EngineConfig, RenderMode};
use crate::error::Error;
use crate::secrets::{git_server_secret, registry_secret, secret_data_matches};
use crate::state::ClusterState;
use crate::substitute::VariableConfig;

/// How to reach a deployed service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectString {
    /// Human-readable description
    pub description: String,
    /// URL path or address
    pub url: String,
}

/// Connect strings keyed by the Service's connect label value
pub type ConnectStrings = BTreeMap<String, ConnectString>;

/// Result of post-rendering one manifest stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostRenderOutput {
    /// Filtered stream, one `---`/`# Source:` block per document
    pub manifest: String,
    /// The same documents, in apply order
    pub documents: Vec<ManifestDocument>,
    /// Connect strings discovered on Services
    pub connect_strings: ConnectStrings,
}

impl PostRenderOutput {
    fn from_documents(documents: Vec<ManifestDocument>, connect_strings: ConnectStrings) -> Self {
        Self {
            manifest: join_manifests(&documents),
            documents,
            connect_strings,
        }
    }
}

/// Rewrites a release's rendered manifest stream
#[async_trait]
pub trait PostRender: Send + Sync {
    /// Post-render `rendered` into the stream that will be applied
    async fn run(&self, rendered: &str) -> Result<PostRenderOutput, Error>;
}

/// Release a renderer is working for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderTarget {
    /// Release name
    pub release: String,
    /// Namespace the chart deploys into
    pub namespace: String,
}

/// Build the post-renderer selected by `config.mode`
pub fn post_renderer(
    config: &EngineConfig,
    target: RenderTarget,
    cluster: Arc<dyn ClusterClient>,
) -> Result<Box<dyn PostRender>, Error> {
    let variables = VariableConfig::from_engine(config)?;
    Ok(match config.mode {
        RenderMode::Cluster => Box::new(ClusterPostRenderer::new(
            config, target, variables, cluster,
        )),
        RenderMode::Local => Box::new(LocalPostRenderer::new(variables)),
    })
}

/// Substitute placeholders through a scratch file and re-split the result
async fn substitute_and_split(
    variables: &VariableConfig,
    rendered: &str,
) -> Result<Vec<ManifestDocument>, Error> {
    let scratch = tempfile::tempdir()
        .map_err(|e| Error::render("post-render", format!("unable to create tmpdir: {}", e)))?;
    let path = scratch.path().join("chart.yaml");
    tokio::fs::write(&path, rendered).await.map_err(|e| {
        Error::render(
            "post-render",
            format!("unable to write the post-render file: {}", e),
        )
    })?;

    variables.apply_file(&path).await?;

    let substituted = tokio::fs::read_to_string(&path).await.map_err(|e| {
        Error::render(
            "post-render",
            format!("unable to read the post-rendered file: {}", e),
        )
    })?;
    Ok(split_manifests(&substituted))
}

/// Substitution and re-splitting only, for dry runs
///
/// With no cluster to manage namespaces in, every document is kept as is.
pub struct LocalPostRenderer {
    variables: VariableConfig,
}

impl LocalPostRenderer {
    /// Create a renderer using this placeholder map
    pub fn new(variables: VariableConfig) -> Self {
        Self { variables }
    }
}

#[async_trait]
impl PostRender for LocalPostRenderer {
    async fn run(&self, rendered: &str) -> Result<PostRenderOutput, Error> {
        let documents = substitute_and_split(&self.variables, rendered).await?;
        Ok(PostRenderOutput::from_documents(
            documents,
            ConnectStrings::new(),
        ))
    }
}

/// A namespace the manifest needs
#[derive(Clone, Debug)]
enum PendingNamespace {
    /// Declared by a `Namespace` document, already stamped
    Declared(Box<Namespace>),
    /// Only referenced from another resource's `metadata.namespace`
    Referenced,
}

/// Cluster-integrated post-renderer
pub struct ClusterPostRenderer {
    target: RenderTarget,
    variables: VariableConfig,
    cluster: Arc<dyn ClusterClient>,
    adopt: bool,
    secrets_from: Option<ClusterState>,
}

impl ClusterPostRenderer {
    /// Create a renderer for one release
    pub fn new(
        config: &EngineConfig,
        target: RenderTarget,
        variables: VariableConfig,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        let secrets_from = if config.provisions_secrets() {
            config.state.clone()
        } else {
            None
        };
        Self {
            target,
            variables,
            cluster,
            adopt: config.adopt_existing_resources,
            secrets_from,
        }
    }

    /// Sort documents into namespaces, connect strings and the outgoing stream
    async fn edit_resources(
        &self,
        documents: Vec<ManifestDocument>,
        pending: &mut BTreeMap<String, PendingNamespace>,
        connect_strings: &mut ConnectStrings,
    ) -> Result<Vec<ManifestDocument>, Error> {
        let mut kept = Vec::with_capacity(documents.len());

        for doc in documents {
            let value = parse_yaml(&doc.content).map_err(|e| {
                Error::render(
                    &self.target.release,
                    format!("failed to parse {}: {}", doc.source, e),
                )
            })?;
            let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();

            match kind {
                "Namespace" => {
                    match serde_json::from_value::<Namespace>(value.clone()) {
                        Ok(namespace) => {
                            let namespace = self.stamp(namespace);
                            let name = namespace.metadata.name.clone().unwrap_or_default();
                            debug!(namespace = %name, release = %self.target.release, "taking over namespace from chart");
                            pending.insert(name, PendingNamespace::Declared(Box::new(namespace)));
                        }
                        Err(e) => {
                            warn!(source = %doc.source, error = %e, "could not parse namespace")
                        }
                    }
                    continue;
                }
                "Service" => {
                    if let Some((key, connect)) = connect_string(&value) {
                        debug!(service = %object_name(&value), key = %key, "found connect string");
                        connect_strings.insert(key, connect);
                    }
                }
                _ => {}
            }

            if let Some(ns) = value
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .filter(|ns| !ns.is_empty())
            {
                pending
                    .entry(ns.to_string())
                    .or_insert(PendingNamespace::Referenced);
            }

            if self.adopt {
                if let Err(e) = self
                    .cluster
                    .adopt(
                        &doc.content,
                        &self.target.namespace,
                        &self.target.release,
                        &self.target.namespace,
                    )
                    .await
                {
                    debug!(resource = %object_name(&value), error = %e, "unable to adopt resource");
                }
            }

            kept.push(doc);
        }

        Ok(kept)
    }

    /// Stamp the managed-by and release labels on a chart namespace
    fn stamp(&self, mut namespace: Namespace) -> Namespace {
        let labels = namespace.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(RELEASE_LABEL.to_string(), self.target.release.clone());
        namespace
    }

    /// Create or adopt every pending namespace, then provision its secrets
    async fn reconcile_namespaces(
        &self,
        pending: BTreeMap<String, PendingNamespace>,
    ) -> Result<(), Error> {
        for (name, wanted) in pending {
            let existing = self
                .cluster
                .get_namespace(&name)
                .await
                .map_err(|e| {
                    Error::namespace_provision(
                        &name,
                        format!("unable to check for existing namespace: {}", e),
                    )
                })?;

            match existing {
                None => {
                    let namespace = match wanted {
                        PendingNamespace::Declared(ns) => *ns,
                        PendingNamespace::Referenced => managed_namespace(&name),
                    };
                    self.cluster
                        .create_namespace(&namespace)
                        .await
                        .map_err(|e| {
                            Error::namespace_provision(
                                &name,
                                format!("unable to create the missing namespace: {}", e),
                            )
                        })?;
                    debug!(namespace = %name, "created namespace");
                }
                Some(current) if self.adopt => {
                    if INITIAL_NAMESPACES.contains(&name.as_str()) {
                        warn!(namespace = %name, "refusing to adopt an initial namespace");
                    } else {
                        let adopted = adopt_namespace(current, wanted);
                        self.cluster
                            .update_namespace(&adopted)
                            .await
                            .map_err(|e| {
                                Error::namespace_provision(
                                    &name,
                                    format!("unable to adopt the existing namespace: {}", e),
                                )
                            })?;
                        debug!(namespace = %name, "adopted namespace");
                    }
                }
                Some(_) => {}
            }

            if let Some(state) = &self.secrets_from {
                if let Err(e) = self.provision_secrets(&name, state).await {
                    warn!(namespace = %name, error = %e, "problem provisioning secrets");
                }
            }
        }
        Ok(())
    }

    /// Create or refresh the registry and git secrets in one namespace
    ///
    /// Nothing is written when the registry secret already has the wanted
    /// data.
    async fn provision_secrets(&self, namespace: &str, state: &ClusterState) -> Result<(), Error> {
        let registry = registry_secret(namespace, &state.registry)?;
        let current = self
            .cluster
            .get_secret(namespace, airlift_common::REGISTRY_SECRET_NAME)
            .await
            .ok()
            .flatten();
        if current
            .as_ref()
            .is_some_and(|c| secret_data_matches(c, &registry))
        {
            return Ok(());
        }

        let mut first_error = None;
        if let Err(e) = self.create_or_update(&registry).await {
            warn!(namespace = %namespace, error = %e, "problem creating registry secret");
            first_error.get_or_insert(e);
        }
        let git = git_server_secret(namespace, &state.git_server);
        if let Err(e) = self.create_or_update(&git).await {
            warn!(namespace = %namespace, error = %e, "problem creating git server secret");
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn create_or_update(
        &self,
        secret: &k8s_openapi::api::core::v1::Secret,
    ) -> Result<(), Error> {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        let outcome = self
            .cluster
            .create_secret(secret)
            .await
            .map_err(|e| Error::secret_provision(&namespace, &name, e.to_string()))?;
        if outcome == CreateOutcome::AlreadyExists {
            self.cluster
                .update_secret(secret)
                .await
                .map_err(|e| Error::secret_provision(&namespace, &name, e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl PostRender for ClusterPostRenderer {
    async fn run(&self, rendered: &str) -> Result<PostRenderOutput, Error> {
        let documents = substitute_and_split(&self.variables, rendered).await?;

        let mut pending = BTreeMap::new();
        pending.insert(self.target.namespace.clone(), PendingNamespace::Referenced);
        let mut connect_strings = ConnectStrings::new();

        let kept = self
            .edit_resources(documents, &mut pending, &mut connect_strings)
            .await?;
        self.reconcile_namespaces(pending).await?;

        Ok(PostRenderOutput::from_documents(kept, connect_strings))
    }
}

/// Bare namespace carrying only the managed-by label
pub fn managed_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Merge the labels airlift wants onto a live namespace
fn adopt_namespace(mut current: Namespace, wanted: PendingNamespace) -> Namespace {
    let labels = current.metadata.labels.get_or_insert_with(BTreeMap::new);
    if let PendingNamespace::Declared(declared) = wanted {
        if let Some(declared_labels) = declared.metadata.labels {
            labels.extend(declared_labels);
        }
    }
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    current
}

fn object_name(value: &Value) -> &str {
    value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Connect string carried by a Service, if it has the connect label
fn connect_string(service: &Value) -> Option<(String, ConnectString)> {
    let key = service
        .pointer("/metadata/labels")
        .and_then(|l| l.get(CONNECT_LABEL))
        .and_then(Value::as_str)?;
    let annotation = |name: &str| {
        service
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some((
        key.to_string(),
        ConnectString {
            description: annotation(CONNECT_DESCRIPTION_ANNOTATION),
            url: annotation(CONNECT_URL_ANNOTATION),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{GitServerInfo, RegistryInfo};
    use crate::testing::FakeCluster;

    const RENDERED: &str = r#"---
# Source: podinfo/templates/namespace.yaml
apiVersion: v1
kind: Namespace
metadata:
  name: podinfo
  labels:
    team: web
---
# Source: podinfo/templates/service.yaml
apiVersion: v1
kind: Service
metadata:
  name: podinfo
  namespace: podinfo
  labels:
    airlift.dev/connect-name: podinfo-ui
  annotations:
    airlift.dev/connect-description: Podinfo web UI
    airlift.dev/connect-url: /ui
spec:
  ports:
    - port: 9898
---
# Source: podinfo/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: podinfo
  namespace: podinfo
spec:
  template:
    spec:
      containers:
        - image: ###AIRLIFT_REGISTRY###/podinfo:6.5.0
---
# Source: podinfo/templates/monitor.yaml
apiVersion: v1
kind: ConfigMap
metadata:
  name: dashboards
  namespace: monitoring
"#;

    fn state() -> ClusterState {
        ClusterState {
            distro: "k3s".to_string(),
            registry: RegistryInfo {
                address: "127.0.0.1:31999".to_string(),
                node_port: 31999,
                pull_username: "pull".to_string(),
                pull_password: "secret".to_string(),
                ..Default::default()
            },
            git_server: GitServerInfo {
                pull_username: "reader".to_string(),
                pull_password: "pw".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            state: Some(state()),
            ..Default::default()
        }
    }

    fn target(namespace: &str) -> RenderTarget {
        RenderTarget {
            release: "podinfo".to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn renderer(config: &EngineConfig, cluster: Arc<FakeCluster>) -> Box<dyn PostRender> {
        post_renderer(config, target("podinfo"), cluster).unwrap()
    }

    #[tokio::test]
    async fn namespaces_are_stripped_and_created_once() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        let out = renderer(&config(), cluster.clone()).run(RENDERED).await.unwrap();

        assert!(out.documents.iter().all(|d| !d.content.contains("kind: Namespace")));
        assert_eq!(out.documents.len(), 3);
        assert!(!out.manifest.contains("kind: Namespace"));

        assert_eq!(cluster.count("get_namespace:podinfo"), 1);
        assert_eq!(cluster.count("create_namespace:podinfo"), 1);
        assert_eq!(cluster.count("get_namespace:monitoring"), 1);
        assert_eq!(cluster.count("create_namespace:monitoring"), 1);
        assert_eq!(cluster.count("create_namespace:"), 2);

        let declared = cluster.namespace("podinfo").unwrap();
        let labels = declared.metadata.labels.unwrap();
        assert_eq!(labels["team"], "web");
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        assert_eq!(labels[RELEASE_LABEL], "podinfo");

        let bare = cluster.namespace("monitoring").unwrap();
        let labels = bare.metadata.labels.unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
    }

    #[tokio::test]
    async fn documents_keep_render_order_and_sources() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        let out = renderer(&config(), cluster).run(RENDERED).await.unwrap();

        let sources: Vec<&str> = out.documents.iter().map(|d| d.source.as_str()).collect();
        assert_eq!(
            sources,
            [
                "podinfo/templates/service.yaml",
                "podinfo/templates/deployment.yaml",
                "podinfo/templates/monitor.yaml",
            ]
        );
        assert!(out
            .manifest
            .starts_with("---\n# Source: podinfo/templates/service.yaml\napiVersion: v1\n"));
        assert!(out.manifest.contains("image: 127.0.0.1:31999/podinfo:6.5.0"));
    }

    #[tokio::test]
    async fn labelled_services_yield_connect_strings() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        let out = renderer(&config(), cluster).run(RENDERED).await.unwrap();

        assert_eq!(out.connect_strings.len(), 1);
        assert_eq!(
            out.connect_strings["podinfo-ui"],
            ConnectString {
                description: "Podinfo web UI".to_string(),
                url: "/ui".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unlabelled_services_yield_nothing() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        let rendered = "---\n# Source: a/svc.yaml\napiVersion: v1\nkind: Service\nmetadata:\n  name: plain\n";
        let out = renderer(&config(), cluster).run(rendered).await.unwrap();
        assert!(out.connect_strings.is_empty());
        assert_eq!(out.documents.len(), 1);
    }

    #[tokio::test]
    async fn chart_namespace_is_always_reconciled() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        let rendered = "---\n# Source: a/cm.yaml\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n";
        renderer(&config(), cluster.clone()).run(rendered).await.unwrap();
        assert_eq!(cluster.count("create_namespace:podinfo"), 1);
    }

    #[tokio::test]
    async fn namespace_creation_failure_is_fatal() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        cluster.fail_namespace("monitoring");
        let err = renderer(&config(), cluster).run(RENDERED).await.unwrap_err();
        assert!(matches!(err, Error::NamespaceProvision { ref namespace, .. } if namespace == "monitoring"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn secrets_are_provisioned_per_namespace() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        renderer(&config(), cluster.clone()).run(RENDERED).await.unwrap();

        for ns in ["podinfo", "monitoring"] {
            let registry = cluster.secret(ns, "private-registry").unwrap();
            assert_eq!(
                registry.type_.as_deref(),
                Some("kubernetes.io/dockerconfigjson")
            );
            assert!(cluster.secret(ns, "private-git-server").is_some());
        }
    }

    #[tokio::test]
    async fn matching_registry_secret_is_left_alone() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        let rendered = "---\n# Source: a/cm.yaml\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n";
        let r = renderer(&config(), cluster.clone());
        r.run(rendered).await.unwrap();
        r.run(rendered).await.unwrap();

        assert_eq!(cluster.count("create_secret:podinfo/private-registry"), 1);
        assert_eq!(cluster.count("update_secret:"), 0);
    }

    #[tokio::test]
    async fn changed_registry_credentials_update_both_secrets() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        let rendered = "---\n# Source: a/cm.yaml\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n";
        renderer(&config(), cluster.clone()).run(rendered).await.unwrap();

        let mut changed = config();
        if let Some(state) = changed.state.as_mut() {
            state.registry.pull_password = "rotated".to_string();
        }
        renderer(&changed, cluster.clone()).run(rendered).await.unwrap();

        assert_eq!(cluster.count("update_secret:podinfo/private-registry"), 1);
        assert_eq!(cluster.count("update_secret:podinfo/private-git-server"), 1);
    }

    #[tokio::test]
    async fn yolo_deployments_skip_secrets() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        let mut config = config();
        config.yolo = true;
        if let Some(state) = config.state.as_mut() {
            state.distro = "YOLO".to_string();
        }
        renderer(&config, cluster.clone()).run(RENDERED).await.unwrap();
        assert_eq!(cluster.count("get_secret:"), 0);
        assert_eq!(cluster.count("create_secret:"), 0);
        assert_eq!(cluster.count("create_namespace:"), 2);
    }

    #[tokio::test]
    async fn existing_namespaces_are_adopted_except_initial_ones() {
        let cluster = Arc::new(
            FakeCluster::new("v1.29.0")
                .with_namespace("podinfo")
                .with_namespace("kube-system"),
        );
        let config = EngineConfig {
            adopt_existing_resources: true,
            ..config()
        };
        let rendered = r#"---
# Source: a/cm.yaml
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
---
# Source: a/sys.yaml
apiVersion: v1
kind: ConfigMap
metadata:
  name: sys
  namespace: kube-system
"#;
        renderer(&config, cluster.clone()).run(rendered).await.unwrap();

        assert_eq!(cluster.count("create_namespace:"), 0);
        assert_eq!(cluster.count("update_namespace:podinfo"), 1);
        assert_eq!(cluster.count("update_namespace:kube-system"), 0);
        let labels = cluster.namespace("podinfo").unwrap().metadata.labels.unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);

        assert_eq!(cluster.count("adopt:ConfigMap/podinfo/cfg:podinfo"), 1);
        assert_eq!(cluster.count("adopt:ConfigMap/kube-system/sys:podinfo"), 1);
    }

    #[tokio::test]
    async fn existing_namespaces_are_untouched_without_adoption() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0").with_namespace("podinfo"));
        let rendered = "---\n# Source: a/cm.yaml\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n";
        renderer(&config(), cluster.clone()).run(rendered).await.unwrap();
        assert_eq!(cluster.count("update_namespace:"), 0);
        assert_eq!(cluster.count("create_namespace:"), 0);
        assert_eq!(cluster.count("adopt:"), 0);
    }

    #[tokio::test]
    async fn local_renderer_keeps_everything() {
        let cluster = Arc::new(FakeCluster::new("v1.29.0"));
        let config = EngineConfig {
            mode: RenderMode::Local,
            ..config()
        };
        let out = renderer(&config, cluster.clone()).run(RENDERED).await.unwrap();

        assert_eq!(out.documents.len(), 4);
        assert!(out.manifest.contains("kind: Namespace"));
        assert!(out.manifest.contains("127.0.0.1:31999/podinfo"));
        assert!(out.connect_strings.is_empty());
        assert!(cluster.calls().is_empty());
    }
}
