//! Cluster access used by the release engine
//!
//! [`ClusterClient`] is the seam between the engine and the API server:
//! namespace and secret bookkeeping for post-rendering, plus generic apply,
//! delete and readiness for rendered resources. [`KubeCluster`] implements it
//! with kube-rs, server-side apply and API discovery.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use airlift_common::kube_utils::{
    parse_manifest, poll_until, resolve_api_resource, run_discovery, workload_ready,
    DEFAULT_POLL_INTERVAL,
};
use airlift_common::{
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, RELEASE_NAMESPACE_ANNOTATION, RELEASE_NAME_ANNOTATION,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// Result of a create that tolerates existing objects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The object was created
    Created,
    /// An object with that name already existed
    AlreadyExists,
}

/// Identity of one applied resource
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// apiVersion of the resource
    pub api_version: String,
    /// Kind of the resource
    pub kind: String,
    /// Resource name
    pub name: String,
    /// Namespace from the manifest, if any
    pub namespace: Option<String>,
}

impl ResourceRef {
    /// Identify the resource a manifest document describes
    pub fn from_manifest(content: &str) -> Result<Self, Error> {
        let meta = parse_manifest(content)?;
        Ok(Self {
            api_version: meta.api_resource.api_version,
            kind: meta.kind,
            name: meta.name,
            namespace: meta.namespace,
        })
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Cluster operations the release engine depends on
///
/// All methods must be safe to call again after a failed attempt.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Git version of the API server (e.g. `v1.29.3`)
    async fn server_version(&self) -> Result<String, Error>;

    /// Get a namespace, `None` when it does not exist
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Create a namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error>;

    /// Replace an existing namespace's metadata
    async fn update_namespace(&self, namespace: &Namespace) -> Result<(), Error>;

    /// Get a secret, `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a secret, reporting rather than failing when it already exists
    async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome, Error>;

    /// Replace an existing secret
    async fn update_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Server-side apply one manifest document
    ///
    /// Namespaced resources without a namespace land in `default_namespace`.
    async fn apply(&self, manifest: &str, default_namespace: &str) -> Result<ResourceRef, Error>;

    /// Mark an already existing resource as owned by a release
    ///
    /// A resource that does not exist yet is left alone.
    async fn adopt(
        &self,
        manifest: &str,
        default_namespace: &str,
        release: &str,
        release_namespace: &str,
    ) -> Result<(), Error>;

    /// Delete a resource; a missing resource is not an error
    async fn delete(&self, resource: &ResourceRef, default_namespace: &str) -> Result<(), Error>;

    /// Wait until every resource reports ready
    async fn wait_ready(
        &self,
        resources: &[ResourceRef],
        default_namespace: &str,
        timeout: Duration,
    ) -> Result<(), Error>;
}

/// kube-rs backed [`ClusterClient`]
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
    discovery: Arc<RwLock<Option<Arc<Discovery>>>>,
}

impl KubeCluster {
    /// Wrap a client; discovery runs lazily on first apply
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
            discovery: Arc::new(RwLock::new(None)),
        }
    }

    async fn discovery(&self, refresh: bool) -> Result<Arc<Discovery>, Error> {
        if !refresh {
            if let Some(d) = self.discovery.read().await.as_ref() {
                return Ok(d.clone());
            }
        }
        let fresh = Arc::new(run_discovery(&self.client).await?);
        *self.discovery.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    /// Resolve a GVK, re-running discovery once for types registered since
    async fn resolve(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities), Error> {
        if let Some(found) = resolve_api_resource(&*self.discovery(false).await?, api_version, kind)
        {
            return Ok(found);
        }
        resolve_api_resource(&*self.discovery(true).await?, api_version, kind).ok_or_else(|| {
            Error::Common(airlift_common::Error::validation_for(
                format!("{}/{}", api_version, kind),
                "resource type is not served by this cluster",
            ))
        })
    }

    async fn dynamic_api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        default_namespace: &str,
    ) -> Result<Api<DynamicObject>, Error> {
        let (ar, caps) = self.resolve(api_version, kind).await?;
        Ok(match caps.scope {
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                namespace.unwrap_or(default_namespace),
                &ar,
            ),
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn server_version(&self) -> Result<String, Error> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), namespace).await?;
        Ok(())
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let name = namespace.metadata.name.as_deref().unwrap_or_default();
        api.replace(name, &PostParams::default(), namespace).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome, Error> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), secret).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(&self.field_manager).force();
        let mut body = secret.clone();
        body.metadata.resource_version = None;
        let mut value = serde_json::to_value(&body).map_err(|e| {
            Error::Common(airlift_common::Error::serialization_for_kind(
                "Secret",
                e.to_string(),
            ))
        })?;
        value["apiVersion"] = serde_json::json!("v1");
        value["kind"] = serde_json::json!("Secret");
        api.patch(name, &params, &Patch::Apply(&value)).await?;
        Ok(())
    }

    async fn apply(&self, manifest: &str, default_namespace: &str) -> Result<ResourceRef, Error> {
        let meta = parse_manifest(manifest)?;
        let api = self
            .dynamic_api(
                &meta.api_resource.api_version,
                &meta.kind,
                meta.namespace.as_deref(),
                default_namespace,
            )
            .await?;

        let params = PatchParams::apply(&self.field_manager).force();
        api.patch(&meta.name, &params, &Patch::Apply(&meta.value))
            .await?;

        trace!(resource = %meta.display_name(), "applied manifest");
        Ok(ResourceRef {
            api_version: meta.api_resource.api_version,
            kind: meta.kind,
            name: meta.name,
            namespace: meta.namespace,
        })
    }

    async fn adopt(
        &self,
        manifest: &str,
        default_namespace: &str,
        release: &str,
        release_namespace: &str,
    ) -> Result<(), Error> {
        let meta = parse_manifest(manifest)?;
        let api = self
            .dynamic_api(
                &meta.api_resource.api_version,
                &meta.kind,
                meta.namespace.as_deref(),
                default_namespace,
            )
            .await?;

        if api.get_opt(&meta.name).await?.is_none() {
            return Ok(());
        }

        let patch = serde_json::json!({
            "metadata": {
                "labels": { MANAGED_BY_LABEL: MANAGED_BY_VALUE },
                "annotations": {
                    RELEASE_NAME_ANNOTATION: release,
                    RELEASE_NAMESPACE_ANNOTATION: release_namespace,
                }
            }
        });
        api.patch(&meta.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(resource = %meta.display_name(), release = %release, "adopted existing resource");
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef, default_namespace: &str) -> Result<(), Error> {
        let api = match self
            .dynamic_api(
                &resource.api_version,
                &resource.kind,
                resource.namespace.as_deref(),
                default_namespace,
            )
            .await
        {
            Ok(api) => api,
            // The type is gone from the cluster, so the object is too
            Err(Error::Common(airlift_common::Error::Validation { .. })) => return Ok(()),
            Err(e) => return Err(e),
        };

        match api.delete(&resource.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_ready(
        &self,
        resources: &[ResourceRef],
        default_namespace: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;

        for resource in resources {
            let api = self
                .dynamic_api(
                    &resource.api_version,
                    &resource.kind,
                    resource.namespace.as_deref(),
                    default_namespace,
                )
                .await?;
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let name = resource.name.clone();
            let kind = resource.kind.clone();

            poll_until(
                remaining,
                DEFAULT_POLL_INTERVAL,
                format!("timed out waiting for {} to become ready", resource),
                || {
                    let api = api.clone();
                    let name = name.clone();
                    let kind = kind.clone();
                    async move {
                        let Some(obj) = api.get_opt(&name).await? else {
                            return Ok(false);
                        };
                        let value = serde_json::to_value(&obj).map_err(|e| {
                            airlift_common::Error::serialization_for_kind(&kind, e.to_string())
                        })?;
                        Ok(workload_ready(&kind, &value))
                    }
                },
            )
            .await?;
            trace!(resource = %resource, "resource ready");
        }
        Ok(())
    }
}

/// [`ClusterClient`] that logs what it would do and never contacts a cluster
///
/// Namespaces and secrets always look absent and every write succeeds.
#[derive(Clone, Debug)]
pub struct DryRunCluster {
    server_version: String,
}

impl DryRunCluster {
    /// Pretend to be an API server of the given git version
    pub fn new(server_version: impl Into<String>) -> Self {
        Self {
            server_version: server_version.into(),
        }
    }
}

#[async_trait]
impl ClusterClient for DryRunCluster {
    async fn server_version(&self) -> Result<String, Error> {
        Ok(self.server_version.clone())
    }

    async fn get_namespace(&self, _name: &str) -> Result<Option<Namespace>, Error> {
        Ok(None)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        info!(namespace = ?namespace.metadata.name, "dry run: would create namespace");
        Ok(())
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        info!(namespace = ?namespace.metadata.name, "dry run: would update namespace");
        Ok(())
    }

    async fn get_secret(&self, _namespace: &str, _name: &str) -> Result<Option<Secret>, Error> {
        Ok(None)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome, Error> {
        info!(secret = ?secret.metadata.name, namespace = ?secret.metadata.namespace, "dry run: would create secret");
        Ok(CreateOutcome::Created)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<(), Error> {
        info!(secret = ?secret.metadata.name, namespace = ?secret.metadata.namespace, "dry run: would update secret");
        Ok(())
    }

    async fn apply(&self, manifest: &str, default_namespace: &str) -> Result<ResourceRef, Error> {
        let resource = ResourceRef::from_manifest(manifest)?;
        info!(resource = %resource, default_namespace, "dry run: would apply");
        Ok(resource)
    }

    async fn adopt(
        &self,
        manifest: &str,
        _default_namespace: &str,
        release: &str,
        _release_namespace: &str,
    ) -> Result<(), Error> {
        let resource = ResourceRef::from_manifest(manifest)?;
        info!(resource = %resource, release, "dry run: would adopt");
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef, default_namespace: &str) -> Result<(), Error> {
        info!(resource = %resource, default_namespace, "dry run: would delete");
        Ok(())
    }

    async fn wait_ready(
        &self,
        resources: &[ResourceRef],
        _default_namespace: &str,
        _timeout: Duration,
    ) -> Result<(), Error> {
        debug!(resources = resources.len(), "dry run: skipping readiness wait");
        Ok(())
    }
}
