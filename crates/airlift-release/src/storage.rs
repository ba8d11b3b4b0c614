//! Secret-backed release history
//!
//! Each revision is stored as one Secret in a dedicated namespace, named
//! `sh.airlift.release.v1.<release>.v<version>`. The revision itself is
//! serialized as JSON under the `release` key; labels mirror the fields the
//! store needs to query on.

use std::collections::BTreeMap;

use airlift_common::MANAGED_BY_VALUE;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, warn};

use crate::error::Error;
use crate::history::{ReleaseRevision, ReleaseStore};

/// Namespace holding release history secrets
pub const HISTORY_NAMESPACE: &str = "airlift-system";

/// Secret type for release records
pub const RELEASE_SECRET_TYPE: &str = "airlift.dev/release.v1";

const RELEASE_KEY: &str = "release";
const OWNER_LABEL: &str = "owner";
const NAME_LABEL: &str = "name";
const STATUS_LABEL: &str = "status";
const VERSION_LABEL: &str = "version";

/// Name of the Secret holding one revision
pub fn secret_name(release: &str, version: u32) -> String {
    format!("sh.airlift.release.v1.{}.v{}", release, version)
}

/// Encode a revision as a Secret
pub fn revision_to_secret(revision: &ReleaseRevision, namespace: &str) -> Result<Secret, Error> {
    let payload = serde_json::to_vec(revision).map_err(|e| {
        Error::history(
            &revision.release_name,
            format!("unable to encode revision {}: {}", revision.version, e),
        )
    })?;

    let labels = BTreeMap::from([
        (OWNER_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (NAME_LABEL.to_string(), revision.release_name.clone()),
        (STATUS_LABEL.to_string(), revision.status.to_string()),
        (VERSION_LABEL.to_string(), revision.version.to_string()),
    ]);

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(&revision.release_name, revision.version)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some(RELEASE_SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            RELEASE_KEY.to_string(),
            ByteString(payload),
        )])),
        ..Default::default()
    })
}

/// Decode a revision from a Secret written by [`revision_to_secret`]
pub fn secret_to_revision(secret: &Secret) -> Result<ReleaseRevision, Error> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let payload = secret
        .data
        .as_ref()
        .and_then(|d| d.get(RELEASE_KEY))
        .ok_or_else(|| Error::history(&name, "release secret has no release payload"))?;
    serde_json::from_slice(&payload.0)
        .map_err(|e| Error::history(&name, format!("corrupt release payload: {}", e)))
}

/// Release history persisted as Secrets
#[derive(Clone)]
pub struct SecretReleaseStore {
    api: Api<Secret>,
    namespace: String,
}

impl SecretReleaseStore {
    /// Store history in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl ReleaseStore for SecretReleaseStore {
    async fn history(&self, release: &str) -> Result<Vec<ReleaseRevision>, Error> {
        let selector = format!(
            "{}={},{}={}",
            OWNER_LABEL, MANAGED_BY_VALUE, NAME_LABEL, release
        );
        let secrets = self
            .api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| Error::history(release, format!("unable to list revisions: {}", e)))?;

        let mut revisions = Vec::with_capacity(secrets.items.len());
        for secret in &secrets.items {
            match secret_to_revision(secret) {
                Ok(revision) => revisions.push(revision),
                Err(e) => warn!(release = %release, error = %e, "skipping unreadable revision"),
            }
        }
        revisions.sort_by_key(|r| r.version);
        debug!(release = %release, revisions = revisions.len(), "loaded release history");
        Ok(revisions)
    }

    async fn create(&self, revision: &ReleaseRevision) -> Result<(), Error> {
        let secret = revision_to_secret(revision, &self.namespace)?;
        match self.api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::history_conflict(
                &revision.release_name,
                revision.version,
            )),
            Err(e) => Err(Error::history(
                &revision.release_name,
                format!("unable to create revision {}: {}", revision.version, e),
            )),
        }
    }

    async fn update(&self, revision: &ReleaseRevision) -> Result<(), Error> {
        let secret = revision_to_secret(revision, &self.namespace)?;
        let patch = serde_json::json!({
            "metadata": { "labels": secret.metadata.labels },
            "data": secret.data,
        });
        self.api
            .patch(
                &secret_name(&revision.release_name, revision.version),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| {
                Error::history(
                    &revision.release_name,
                    format!("unable to update revision {}: {}", revision.version, e),
                )
            })?;
        Ok(())
    }

    async fn delete(&self, release: &str, version: u32) -> Result<(), Error> {
        match self
            .api
            .delete(&secret_name(release, version), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::history(
                release,
                format!("unable to delete revision {}: {}", version, e),
            )),
        }
    }
}
