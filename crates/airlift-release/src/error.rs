//! Error types for the release engine
//!
//! Every terminal failure names the operation (install, upgrade, rollback),
//! how the retry loop stopped, and for upgrades what happened to the
//! rollback. Retry classification lives on [`Error::is_retryable`].

use std::fmt;
use std::time::Duration;

use airlift_common::graph::GraphError;
use airlift_common::retry::Retryable;
use thiserror::Error;

/// Release lifecycle operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// First deployment of a release
    Install,
    /// Deployment over an existing release
    Upgrade,
    /// Restoring an earlier revision
    Rollback,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Install => write!(f, "install"),
            Operation::Upgrade => write!(f, "upgrade"),
            Operation::Rollback => write!(f, "rollback"),
        }
    }
}

/// How a retry loop ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// All allowed attempts failed
    Exhausted {
        /// Attempts made
        attempts: u32,
    },
    /// The overall time budget elapsed with attempts remaining
    TimedOut {
        /// Attempts made
        attempts: u32,
        /// Time spent
        elapsed: Duration,
    },
    /// An attempt failed with a non-retryable error
    Fatal {
        /// Attempts made
        attempts: u32,
    },
}

impl StopReason {
    /// Attempts made before stopping
    pub fn attempts(&self) -> u32 {
        match self {
            StopReason::Exhausted { attempts }
            | StopReason::TimedOut { attempts, .. }
            | StopReason::Fatal { attempts } => *attempts,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Exhausted { attempts } => write!(f, "after {} attempts", attempts),
            StopReason::TimedOut { attempts, elapsed } => write!(
                f,
                "after timing out ({}s elapsed, {} attempts)",
                elapsed.as_secs(),
                attempts
            ),
            StopReason::Fatal { attempts } => {
                write!(f, "with a non-retryable error on attempt {}", attempts)
            }
        }
    }
}

/// What happened to the automatic rollback after a failed upgrade
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// No deployed revision to go back to, or history could not be read
    NoTarget {
        /// Why no target was found
        reason: String,
    },
    /// Cluster state was restored to this revision
    Succeeded {
        /// Revision rolled back to
        version: u32,
    },
    /// The rollback itself failed
    Failed {
        /// Revision that was targeted
        version: u32,
        /// Rollback failure
        error: String,
    },
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::NoTarget { reason } => write!(
                f,
                "unable to upgrade, and unable to determine a safe rollback target ({})",
                reason
            ),
            RollbackOutcome::Succeeded { version } => {
                write!(f, "rollback to revision {} succeeded", version)
            }
            RollbackOutcome::Failed { version, error } => {
                write!(f, "rollback to revision {} also failed: {}", version, error)
            }
        }
    }
}

/// Release engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Cluster client or engine configuration is unusable
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's wrong
        message: String,
    },

    /// The chart source could not produce a chart
    #[error("unable to load chart data for {chart}: {message}")]
    ChartLoad {
        /// Chart name
        chart: String,
        /// Description of what failed
        message: String,
    },

    /// Template rendering or post-rendering failed
    #[error("render error for {release}: {message}")]
    Render {
        /// Release being rendered
        release: String,
        /// Description of what failed
        message: String,
    },

    /// The cluster rejected a resource
    #[error("apply error for {release} ({resource}): {message}")]
    Apply {
        /// Release being applied
        release: String,
        /// `Kind/name` of the rejected resource
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Release history could not be read or written
    #[error("release history error for {release}: {message}")]
    History {
        /// Release whose history failed
        release: String,
        /// Description of what failed
        message: String,
        /// The store refused a write because the revision already exists
        conflict: bool,
    },

    /// Deprecated API migration failed
    #[error("deprecated API migration failed for {release}: {message}")]
    Migration {
        /// Release being migrated
        release: String,
        /// Description of what failed
        message: String,
    },

    /// A namespace the manifest needs could not be created or adopted
    #[error("unable to provision namespace {namespace}: {message}")]
    NamespaceProvision {
        /// Namespace name
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// A pull or git secret could not be created or updated
    #[error("unable to provision secret {secret} in {namespace}: {message}")]
    SecretProvision {
        /// Namespace holding the secret
        namespace: String,
        /// Secret name
        secret: String,
        /// Description of what failed
        message: String,
    },

    /// Install gave up
    #[error("install of {release} failed {stop}: {source}")]
    InstallFailed {
        /// Release name
        release: String,
        /// How the retry loop ended
        stop: StopReason,
        /// Error from the last attempt
        source: Box<Error>,
    },

    /// Upgrade gave up; the rollback outcome is part of the error
    #[error("upgrade of {release} failed {stop}; {rollback}: {source}")]
    UpgradeFailed {
        /// Release name
        release: String,
        /// How the retry loop ended
        stop: StopReason,
        /// Result of the automatic rollback
        rollback: RollbackOutcome,
        /// Error from the last attempt
        source: Box<Error>,
    },

    /// An explicit rollback failed
    #[error("rollback of {release} to revision {version} failed: {message}")]
    Rollback {
        /// Release name
        release: String,
        /// Target revision
        version: u32,
        /// Description of what failed
        message: String,
    },

    /// An explicit rollback found no earlier revision to restore
    #[error("no earlier revision of {release} to roll back to")]
    NoRollbackTarget {
        /// Release name
        release: String,
    },

    /// An operation overran its own deadline
    #[error("{operation} of {release} timed out after {}s", elapsed.as_secs())]
    Timeout {
        /// Operation that timed out
        operation: Operation,
        /// Release name
        release: String,
        /// Deadline that was exceeded
        elapsed: Duration,
    },

    /// Release dependency graph is invalid
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Error from shared helpers (kube, yaml, polling)
    #[error(transparent)]
    Common(#[from] airlift_common::Error),
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        Error::Common(airlift_common::Error::from(source))
    }
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a chart load error
    pub fn chart_load(chart: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ChartLoad {
            chart: chart.into(),
            message: msg.into(),
        }
    }

    /// Create a render error
    pub fn render(release: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Render {
            release: release.into(),
            message: msg.into(),
        }
    }

    /// Create an apply error for one resource
    pub fn apply(
        release: impl Into<String>,
        resource: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Apply {
            release: release.into(),
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a history error
    pub fn history(release: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::History {
            release: release.into(),
            message: msg.into(),
            conflict: false,
        }
    }

    /// Create a history error for an optimistic-versioning conflict
    pub fn history_conflict(release: impl Into<String>, version: u32) -> Self {
        Self::History {
            release: release.into(),
            message: format!("revision {} already exists", version),
            conflict: true,
        }
    }

    /// Create a migration error
    pub fn migration(release: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Migration {
            release: release.into(),
            message: msg.into(),
        }
    }

    /// Create a namespace provisioning error
    pub fn namespace_provision(namespace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NamespaceProvision {
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create a secret provisioning error
    pub fn secret_provision(
        namespace: impl Into<String>,
        secret: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::SecretProvision {
            namespace: namespace.into(),
            secret: secret.into(),
            message: msg.into(),
        }
    }

    /// Check if another attempt could succeed
    ///
    /// Render, apply and migration failures are retried. Configuration,
    /// history and namespace failures are not, and neither are the terminal
    /// install/upgrade/rollback errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Render { .. } | Error::Apply { .. } | Error::Migration { .. } => true,
            Error::Timeout { .. } => true,
            Error::Common(e) => e.is_retryable(),
            Error::Configuration { .. }
            | Error::ChartLoad { .. }
            | Error::History { .. }
            | Error::NamespaceProvision { .. }
            | Error::SecretProvision { .. }
            | Error::InstallFailed { .. }
            | Error::UpgradeFailed { .. }
            | Error::Rollback { .. }
            | Error::NoRollbackTarget { .. }
            | Error::Graph(_) => false,
        }
    }

    /// Whether this is a terminal error caused by a time budget
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::InstallFailed { stop, .. } | Error::UpgradeFailed { stop, .. } => {
                matches!(stop, StopReason::TimedOut { .. })
            }
            _ => false,
        }
    }

    /// The rollback outcome, for failed upgrades
    pub fn rollback_outcome(&self) -> Option<&RollbackOutcome> {
        match self {
            Error::UpgradeFailed { rollback, .. } => Some(rollback),
            _ => None,
        }
    }

    /// The last attempt's error, unwrapping terminal install/upgrade errors
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::InstallFailed { source, .. } | Error::UpgradeFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        Error::is_retryable(self)
    }
}
