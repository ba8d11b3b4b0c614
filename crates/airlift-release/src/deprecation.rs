//! Deprecated API migration for stored releases
//!
//! Before an upgrade, the latest revision's manifest is checked against a
//! table of removed Kubernetes APIs. Resources whose API is gone on the
//! target cluster are rewritten to the replacement API, or dropped when
//! there is none. If anything changed the latest revision is superseded by
//! a new deployed revision carrying the migrated manifest, so the upgrade
//! diffs against objects the cluster can actually serve.

use airlift_common::yaml::{
    join_manifests, parse_yaml, split_manifests, to_yaml_string, ManifestDocument,
};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Error;
use crate::history::{ReleaseRevision, ReleaseStatus, ReleaseStore, MIGRATION_DESCRIPTION};

const K8S_COMPONENT: &str = "k8s";

/// One removed API
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprecatedApi {
    /// Component the API belongs to; only `k8s` entries are applied
    #[serde(default = "default_component")]
    pub component: String,
    /// Resource kind
    pub kind: String,
    /// Deprecated apiVersion (e.g. `extensions/v1beta1`)
    pub name: String,
    /// First Kubernetes version that no longer serves the API
    pub removed_in: String,
    /// apiVersion to rewrite to; `None` means the resource is dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_api: Option<String>,
}

fn default_component() -> String {
    K8S_COMPONENT.to_string()
}

/// (kind, removed apiVersion, removed in, replacement)
const BUILTIN: &[(&str, &str, &str, Option<&str>)] = &[
    ("Deployment", "extensions/v1beta1", "1.16.0", Some("apps/v1")),
    ("DaemonSet", "extensions/v1beta1", "1.16.0", Some("apps/v1")),
    ("ReplicaSet", "extensions/v1beta1", "1.16.0", Some("apps/v1")),
    ("NetworkPolicy", "extensions/v1beta1", "1.16.0", Some("networking.k8s.io/v1")),
    ("PodSecurityPolicy", "extensions/v1beta1", "1.16.0", Some("policy/v1beta1")),
    ("Deployment", "apps/v1beta1", "1.16.0", Some("apps/v1")),
    ("Deployment", "apps/v1beta2", "1.16.0", Some("apps/v1")),
    ("StatefulSet", "apps/v1beta1", "1.16.0", Some("apps/v1")),
    ("StatefulSet", "apps/v1beta2", "1.16.0", Some("apps/v1")),
    ("DaemonSet", "apps/v1beta2", "1.16.0", Some("apps/v1")),
    ("ReplicaSet", "apps/v1beta2", "1.16.0", Some("apps/v1")),
    ("Ingress", "extensions/v1beta1", "1.22.0", Some("networking.k8s.io/v1")),
    ("Ingress", "networking.k8s.io/v1beta1", "1.22.0", Some("networking.k8s.io/v1")),
    ("IngressClass", "networking.k8s.io/v1beta1", "1.22.0", Some("networking.k8s.io/v1")),
    (
        "CustomResourceDefinition",
        "apiextensions.k8s.io/v1beta1",
        "1.22.0",
        Some("apiextensions.k8s.io/v1"),
    ),
    (
        "MutatingWebhookConfiguration",
        "admissionregistration.k8s.io/v1beta1",
        "1.22.0",
        Some("admissionregistration.k8s.io/v1"),
    ),
    (
        "ValidatingWebhookConfiguration",
        "admissionregistration.k8s.io/v1beta1",
        "1.22.0",
        Some("admissionregistration.k8s.io/v1"),
    ),
    ("ClusterRole", "rbac.authorization.k8s.io/v1beta1", "1.22.0", Some("rbac.authorization.k8s.io/v1")),
    (
        "ClusterRoleBinding",
        "rbac.authorization.k8s.io/v1beta1",
        "1.22.0",
        Some("rbac.authorization.k8s.io/v1"),
    ),
    ("Role", "rbac.authorization.k8s.io/v1beta1", "1.22.0", Some("rbac.authorization.k8s.io/v1")),
    ("RoleBinding", "rbac.authorization.k8s.io/v1beta1", "1.22.0", Some("rbac.authorization.k8s.io/v1")),
    ("PriorityClass", "scheduling.k8s.io/v1beta1", "1.22.0", Some("scheduling.k8s.io/v1")),
    ("CSIDriver", "storage.k8s.io/v1beta1", "1.22.0", Some("storage.k8s.io/v1")),
    ("CronJob", "batch/v1beta1", "1.25.0", Some("batch/v1")),
    ("PodDisruptionBudget", "policy/v1beta1", "1.25.0", Some("policy/v1")),
    ("PodSecurityPolicy", "policy/v1beta1", "1.25.0", None),
    ("HorizontalPodAutoscaler", "autoscaling/v2beta1", "1.25.0", Some("autoscaling/v2")),
    ("EndpointSlice", "discovery.k8s.io/v1beta1", "1.25.0", Some("discovery.k8s.io/v1")),
    ("HorizontalPodAutoscaler", "autoscaling/v2beta2", "1.26.0", Some("autoscaling/v2")),
    (
        "FlowSchema",
        "flowcontrol.apiserver.k8s.io/v1beta1",
        "1.26.0",
        Some("flowcontrol.apiserver.k8s.io/v1beta3"),
    ),
    (
        "PriorityLevelConfiguration",
        "flowcontrol.apiserver.k8s.io/v1beta1",
        "1.26.0",
        Some("flowcontrol.apiserver.k8s.io/v1beta3"),
    ),
    ("CSIStorageCapacity", "storage.k8s.io/v1beta1", "1.27.0", Some("storage.k8s.io/v1")),
];

/// The built-in table of removed Kubernetes APIs
pub fn builtin_deprecations() -> Vec<DeprecatedApi> {
    BUILTIN
        .iter()
        .map(|(kind, name, removed_in, replacement)| DeprecatedApi {
            component: K8S_COMPONENT.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            removed_in: removed_in.to_string(),
            replacement_api: replacement.map(str::to_string),
        })
        .collect()
}

/// Parse a Kubernetes version into (major, minor, patch)
///
/// Accepts git versions like `v1.29.3+k3s1` and short forms like `1.25`.
/// Pre-release and build metadata are ignored.
pub fn parse_kube_version(version: &str) -> Option<(u64, u64, u64)> {
    let trimmed = version.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(trimmed) {
        return Some((v.major, v.minor, v.patch));
    }
    // Short forms such as `1.25` or `1.25-eks`
    let core = trimmed
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

/// What happened to one resource
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Keep,
    Rewrite(String),
    Drop,
}

fn disposition(
    kind: &str,
    api_version: &str,
    cluster: (u64, u64, u64),
    table: &[DeprecatedApi],
) -> Disposition {
    for entry in table {
        if entry.component != K8S_COMPONENT || entry.kind != kind || entry.name != api_version {
            continue;
        }
        let Some(removed) = parse_kube_version(&entry.removed_in) else {
            warn!(kind = %kind, api_version = %api_version, removed_in = %entry.removed_in, "ignoring deprecation with invalid version");
            continue;
        };
        if removed > cluster {
            continue;
        }
        return match &entry.replacement_api {
            Some(replacement) if !replacement.is_empty() => {
                Disposition::Rewrite(replacement.clone())
            }
            _ => Disposition::Drop,
        };
    }
    Disposition::Keep
}

/// Rewrite a manifest stream for a cluster version
///
/// Returns `None` when no resource needed migrating.
pub fn migrate_manifest(
    manifest: &str,
    cluster_version: &str,
    table: &[DeprecatedApi],
) -> Result<Option<String>, String> {
    let cluster = parse_kube_version(cluster_version)
        .ok_or_else(|| format!("unable to parse cluster version {:?}", cluster_version))?;

    let mut modified = false;
    let mut out: Vec<ManifestDocument> = Vec::new();

    for doc in split_manifests(manifest) {
        let mut value = parse_yaml(&doc.content)
            .map_err(|e| format!("failed to parse {}: {}", doc.source, e))?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let api_version = value
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match disposition(&kind, &api_version, cluster, table) {
            Disposition::Keep => out.push(doc),
            Disposition::Rewrite(replacement) => {
                debug!(source = %doc.source, from = %api_version, to = %replacement, "rewriting deprecated API");
                value["apiVersion"] = Value::String(replacement);
                let content = to_yaml_string(&value)
                    .map_err(|e| format!("failed to serialize {}: {}", doc.source, e))?;
                out.push(ManifestDocument::new(doc.source, content));
                modified = true;
            }
            Disposition::Drop => {
                debug!(source = %doc.source, kind = %kind, api_version = %api_version, "dropping resource with removed API");
                modified = true;
            }
        }
    }

    Ok(modified.then(|| join_manifests(&out)))
}

/// Migrates the latest revision of a release off removed APIs
#[derive(Clone, Debug)]
pub struct DeprecationMigrator {
    table: Vec<DeprecatedApi>,
}

impl Default for DeprecationMigrator {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl DeprecationMigrator {
    /// Built-in table plus `extra` entries
    pub fn new(extra: &[DeprecatedApi]) -> Self {
        let mut table = builtin_deprecations();
        table.extend_from_slice(extra);
        Self { table }
    }

    /// Deprecation table in use
    pub fn table(&self) -> &[DeprecatedApi] {
        &self.table
    }

    /// Migrate `latest` for a cluster running `cluster_version`
    ///
    /// When the manifest changed, `latest` is marked superseded and a new
    /// deployed revision is written and returned. Returns `None` when
    /// nothing needed migrating.
    pub async fn migrate(
        &self,
        store: &dyn ReleaseStore,
        latest: &ReleaseRevision,
        cluster_version: &str,
    ) -> Result<Option<ReleaseRevision>, Error> {
        let release = &latest.release_name;
        let Some(manifest) = migrate_manifest(&latest.manifest, cluster_version, &self.table)
            .map_err(|e| Error::migration(release, e))?
        else {
            return Ok(None);
        };

        warn!(release = %release, version = latest.version, "detected deprecated APIs in release");

        store
            .update(&latest.with_status(ReleaseStatus::Superseded))
            .await
            .map_err(|e| Error::migration(release, format!("unable to supersede revision: {}", e)))?;

        let migrated = ReleaseRevision::new(
            release.clone(),
            latest.namespace.clone(),
            latest.version + 1,
            ReleaseStatus::Deployed,
            manifest,
            MIGRATION_DESCRIPTION,
        );
        store
            .create(&migrated)
            .await
            .map_err(|e| Error::migration(release, format!("unable to record migrated revision: {}", e)))?;

        Ok(Some(migrated))
    }
}
