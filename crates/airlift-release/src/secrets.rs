//! Registry and git credential secrets for managed namespaces

use std::collections::BTreeMap;

use airlift_common::{
    GIT_SERVER_SECRET_NAME, MANAGED_BY_LABEL, MANAGED_BY_VALUE, REGISTRY_SECRET_NAME,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use crate::error::Error;
use crate::state::{GitServerInfo, RegistryInfo};

/// Secret type for image pull credentials
pub const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

fn managed_metadata(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_VALUE.to_string(),
        )])),
        ..Default::default()
    }
}

/// Image pull secret for the airgap registry
pub fn registry_secret(namespace: &str, registry: &RegistryInfo) -> Result<Secret, Error> {
    let auth = STANDARD.encode(format!(
        "{}:{}",
        registry.pull_username, registry.pull_password
    ));
    let config = serde_json::json!({
        "auths": {
            registry.address.as_str(): { "auth": auth }
        }
    });
    let payload = serde_json::to_vec(&config).map_err(|e| {
        Error::secret_provision(
            namespace,
            REGISTRY_SECRET_NAME,
            format!("unable to encode docker config: {}", e),
        )
    })?;

    Ok(Secret {
        metadata: managed_metadata(REGISTRY_SECRET_NAME, namespace),
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(payload),
        )])),
        ..Default::default()
    })
}

/// Read-only git server credentials
pub fn git_server_secret(namespace: &str, git: &GitServerInfo) -> Secret {
    Secret {
        metadata: managed_metadata(GIT_SERVER_SECRET_NAME, namespace),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            ("username".to_string(), git.pull_username.clone()),
            ("password".to_string(), git.pull_password.clone()),
        ])),
        ..Default::default()
    }
}

/// Whether an existing secret already carries the desired data
pub fn secret_data_matches(existing: &Secret, desired: &Secret) -> bool {
    existing.data == desired.data
}
