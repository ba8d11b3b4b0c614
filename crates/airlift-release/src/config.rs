//! Engine configuration
//!
//! One explicit value per deploy request, built from YAML and handed to the
//! executor. Nothing in the engine reads process-global settings.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use airlift_common::retry::FixedRetryPolicy;
use airlift_common::FIELD_MANAGER;
use serde::{Deserialize, Serialize};

use crate::deprecation::DeprecatedApi;
use crate::error::Error;
use crate::state::ClusterState;
use crate::substitute::{Constant, SetVariable};

/// Retry behaviour for install or upgrade
///
/// In YAML this is either a retry count or the string `default`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RemediationRepr", into = "RemediationRepr")]
pub enum Remediation {
    /// Use the engine's `defaultRetries`
    #[default]
    Default,
    /// Retry exactly this many times after the first attempt
    Fixed(u32),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RemediationRepr {
    Retries(u32),
    Keyword(String),
}

impl TryFrom<RemediationRepr> for Remediation {
    type Error = String;

    fn try_from(repr: RemediationRepr) -> Result<Self, Self::Error> {
        match repr {
            RemediationRepr::Retries(n) => Ok(Remediation::Fixed(n)),
            RemediationRepr::Keyword(k) if k.eq_ignore_ascii_case("default") => {
                Ok(Remediation::Default)
            }
            RemediationRepr::Keyword(k) => Err(format!(
                "invalid remediation {:?}: expected a retry count or \"default\"",
                k
            )),
        }
    }
}

impl From<Remediation> for RemediationRepr {
    fn from(r: Remediation) -> Self {
        match r {
            Remediation::Default => RemediationRepr::Keyword("default".to_string()),
            Remediation::Fixed(n) => RemediationRepr::Retries(n),
        }
    }
}

impl Remediation {
    /// Retry count after resolving `Default`
    pub fn retries(self, default_retries: u32) -> u32 {
        match self {
            Remediation::Default => default_retries,
            Remediation::Fixed(n) => n,
        }
    }
}

/// Which post-renderer the executor uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Provision namespaces and secrets in the live cluster
    #[default]
    Cluster,
    /// Substitute and re-split only; no cluster calls
    Local,
}

/// Settings for one deploy request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Install retry behaviour
    pub install: Remediation,
    /// Upgrade retry behaviour
    pub upgrade: Remediation,
    /// Retries used when a remediation is `default`
    pub default_retries: u32,
    /// Fixed sleep between attempts
    pub backoff_seconds: u64,
    /// Wall-clock budget for the whole retry loop
    pub max_total_seconds: Option<u64>,
    /// Deadline for a single attempt, including the readiness wait
    pub timeout_seconds: u64,
    /// Deadline for an automatic or explicit rollback
    pub rollback_timeout_seconds: u64,
    /// Revisions kept per release
    pub max_history: usize,
    /// Take ownership of namespaces and resources that already exist
    pub adopt_existing_resources: bool,
    /// Provision registry and git secrets into managed namespaces
    pub airgap_mode: bool,
    /// Deployment is explicitly stateless; no secrets are provisioned
    pub yolo: bool,
    /// Post-renderer selection
    pub mode: RenderMode,
    /// Field manager for server-side apply
    pub field_manager: String,
    /// Placeholder prefix (`###<PREFIX>_KEY###`)
    pub variable_prefix: String,
    /// Package variables, keyed by name
    pub variables: BTreeMap<String, SetVariable>,
    /// Package constants
    pub constants: Vec<Constant>,
    /// Airgap cluster state
    pub state: Option<ClusterState>,
    /// Extra entries appended to the built-in deprecated API table
    pub deprecations: Vec<DeprecatedApi>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            install: Remediation::Default,
            upgrade: Remediation::Default,
            default_retries: 3,
            backoff_seconds: 10,
            max_total_seconds: None,
            timeout_seconds: 900,
            rollback_timeout_seconds: 900,
            max_history: 10,
            adopt_existing_resources: false,
            airgap_mode: true,
            yolo: false,
            mode: RenderMode::Cluster,
            field_manager: FIELD_MANAGER.to_string(),
            variable_prefix: "AIRLIFT".to_string(),
            variables: BTreeMap::new(),
            constants: Vec::new(),
            state: None,
            deprecations: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML config
    pub fn from_yaml_str(input: &str) -> Result<Self, Error> {
        let config: EngineConfig = serde_yaml::from_str(input)
            .map_err(|e| Error::configuration(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML config file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("unable to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_history == 0 {
            return Err(Error::configuration("maxHistory must be at least 1"));
        }
        if self.timeout_seconds == 0 || self.rollback_timeout_seconds == 0 {
            return Err(Error::configuration("timeouts must be greater than zero"));
        }
        if self.field_manager.is_empty() {
            return Err(Error::configuration("fieldManager must not be empty"));
        }
        let prefix_ok = !self.variable_prefix.is_empty()
            && self
                .variable_prefix
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !prefix_ok {
            return Err(Error::configuration(format!(
                "variablePrefix {:?} must be non-empty uppercase alphanumerics",
                self.variable_prefix
            )));
        }
        Ok(())
    }

    fn policy(&self, remediation: Remediation) -> FixedRetryPolicy {
        let policy = FixedRetryPolicy::new(
            remediation.retries(self.default_retries),
            Duration::from_secs(self.backoff_seconds),
        );
        match self.max_total_seconds {
            Some(secs) => policy.with_max_total(Duration::from_secs(secs)),
            None => policy,
        }
    }

    /// Retry policy for installs
    pub fn install_policy(&self) -> FixedRetryPolicy {
        self.policy(self.install)
    }

    /// Retry policy for upgrades
    pub fn upgrade_policy(&self) -> FixedRetryPolicy {
        self.policy(self.upgrade)
    }

    /// Per-attempt deadline
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Rollback deadline
    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_timeout_seconds)
    }

    /// Whether post-rendering should provision secrets
    pub fn provisions_secrets(&self) -> bool {
        match &self.state {
            Some(state) => self.airgap_mode && !(self.yolo && state.is_yolo()),
            None => false,
        }
    }
}
