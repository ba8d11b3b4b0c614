//! Deployment progress reporting
//!
//! Reporters are **fire-and-forget**: `report()` never returns an error and
//! the executor behaves identically whether anyone is listening or not.

use std::fmt;

use async_trait::async_trait;
use tracing::{info, warn};

/// Phase transition of one release deployment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Deploy request accepted
    Queued,
    /// Reading release history to choose install or upgrade
    CheckingHistory,
    /// Install attempt started (1-based)
    Installing {
        /// Attempt number
        attempt: u32,
    },
    /// Upgrade attempt started (1-based)
    Upgrading {
        /// Attempt number
        attempt: u32,
    },
    /// Release reached `deployed`
    Succeeded {
        /// Revision recorded
        revision: u32,
    },
    /// Restoring an earlier revision
    RollingBack {
        /// Revision being restored
        to: u32,
    },
    /// Deployment ended in an error
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Queued => write!(f, "queued"),
            Phase::CheckingHistory => write!(f, "checking history"),
            Phase::Installing { attempt } => write!(f, "installing (attempt {})", attempt),
            Phase::Upgrading { attempt } => write!(f, "upgrading (attempt {})", attempt),
            Phase::Succeeded { revision } => write!(f, "deployed revision {}", revision),
            Phase::RollingBack { to } => write!(f, "rolling back to revision {}", to),
            Phase::Failed => write!(f, "failed"),
        }
    }
}

/// Receives phase transitions for a release
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Report that `release` entered `phase`
    async fn report(&self, release: &str, phase: Phase);
}

/// Writes phase transitions to the tracing subscriber
pub struct TracingProgress;

#[async_trait]
impl ProgressReporter for TracingProgress {
    async fn report(&self, release: &str, phase: Phase) {
        match phase {
            Phase::Failed => warn!(release = %release, "release {}", phase),
            _ => info!(release = %release, "release {}", phase),
        }
    }
}

/// Discards all progress
pub struct NoopProgress;

#[async_trait]
impl ProgressReporter for NoopProgress {
    async fn report(&self, _release: &str, _phase: Phase) {}
}
