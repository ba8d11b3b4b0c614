//! In-memory cluster and progress fakes for unit tests

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;

use crate::cluster::{ClusterClient, CreateOutcome, ResourceRef};
use crate::error::Error;
use crate::events::{Phase, ProgressReporter};

/// Stateful stand-in for a cluster
///
/// Every call is appended to `calls` as `<method>:<target>`.
pub struct FakeCluster {
    version: String,
    namespaces: Mutex<BTreeMap<String, Namespace>>,
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    objects: Mutex<BTreeMap<String, String>>,
    failing_kinds: Mutex<BTreeSet<String>>,
    failing_namespaces: Mutex<BTreeSet<String>>,
    ready_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            namespaces: Mutex::new(BTreeMap::new()),
            secrets: Mutex::new(BTreeMap::new()),
            objects: Mutex::new(BTreeMap::new()),
            failing_kinds: Mutex::new(BTreeSet::new()),
            failing_namespaces: Mutex::new(BTreeSet::new()),
            ready_delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_namespace(self, name: &str) -> Self {
        self.namespaces.lock().insert(
            name.to_string(),
            Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        self
    }

    /// Reject every apply of this kind
    pub fn fail_kind(&self, kind: &str) {
        self.failing_kinds.lock().insert(kind.to_string());
    }

    pub fn heal_kind(&self, kind: &str) {
        self.failing_kinds.lock().remove(kind);
    }

    /// Reject creation of this namespace
    pub fn fail_namespace(&self, name: &str) {
        self.failing_namespaces.lock().insert(name.to_string());
    }

    /// Make every readiness wait take this long
    pub fn delay_ready(&self, delay: Duration) {
        *self.ready_delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.namespaces.lock().get(name).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Display names of resources currently in the cluster
    pub fn objects(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<String> {
        self.objects.lock().get(key).cloned()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn key(resource: &ResourceRef, default_namespace: &str) -> String {
        let scoped = ResourceRef {
            namespace: Some(
                resource
                    .namespace
                    .clone()
                    .unwrap_or_else(|| default_namespace.to_string()),
            ),
            ..resource.clone()
        };
        scoped.to_string()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn server_version(&self) -> Result<String, Error> {
        Ok(self.version.clone())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        self.record(format!("get_namespace:{}", name));
        Ok(self.namespaces.lock().get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        self.record(format!("create_namespace:{}", name));
        if self.failing_namespaces.lock().contains(&name) {
            return Err(Error::configuration(format!("namespaces \"{}\" is forbidden", name)));
        }
        self.namespaces.lock().insert(name, namespace.clone());
        Ok(())
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        self.record(format!("update_namespace:{}", name));
        self.namespaces.lock().insert(name, namespace.clone());
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        self.record(format!("get_secret:{}/{}", namespace, name));
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<CreateOutcome, Error> {
        let key = (
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        self.record(format!("create_secret:{}/{}", key.0, key.1));
        let mut secrets = self.secrets.lock();
        if secrets.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        secrets.insert(key, secret.clone());
        Ok(CreateOutcome::Created)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<(), Error> {
        let key = (
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        self.record(format!("update_secret:{}/{}", key.0, key.1));
        self.secrets.lock().insert(key, secret.clone());
        Ok(())
    }

    async fn apply(&self, manifest: &str, default_namespace: &str) -> Result<ResourceRef, Error> {
        let resource = ResourceRef::from_manifest(manifest)?;
        let key = Self::key(&resource, default_namespace);
        self.record(format!("apply:{}", key));
        if self.failing_kinds.lock().contains(&resource.kind) {
            return Err(Error::apply("fake", key, "admission webhook denied the request"));
        }
        self.objects.lock().insert(key, manifest.to_string());
        Ok(resource)
    }

    async fn adopt(
        &self,
        manifest: &str,
        default_namespace: &str,
        release: &str,
        _release_namespace: &str,
    ) -> Result<(), Error> {
        let resource = ResourceRef::from_manifest(manifest)?;
        self.record(format!(
            "adopt:{}:{}",
            Self::key(&resource, default_namespace),
            release
        ));
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef, default_namespace: &str) -> Result<(), Error> {
        let key = Self::key(resource, default_namespace);
        self.record(format!("delete:{}", key));
        self.objects.lock().remove(&key);
        Ok(())
    }

    async fn wait_ready(
        &self,
        resources: &[ResourceRef],
        _default_namespace: &str,
        _timeout: Duration,
    ) -> Result<(), Error> {
        self.record(format!("wait_ready:{}", resources.len()));
        let delay = *self.ready_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// Collects reported phases
#[derive(Default)]
pub struct RecordingProgress {
    phases: Mutex<Vec<(String, Phase)>>,
}

impl RecordingProgress {
    pub fn phases(&self) -> Vec<Phase> {
        self.phases.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn count(&self, matches: impl Fn(&Phase) -> bool) -> usize {
        self.phases.lock().iter().filter(|(_, p)| matches(p)).count()
    }
}

#[async_trait]
impl ProgressReporter for RecordingProgress {
    async fn report(&self, release: &str, phase: Phase) {
        self.phases.lock().push((release.to_string(), phase));
    }
}
