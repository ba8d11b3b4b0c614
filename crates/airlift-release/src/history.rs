//! Release history
//!
//! A release's history is an ordered list of revisions. Revisions are
//! values: a status change produces a new value which the store persists in
//! place of the old one. The store is the only cross-release coordination
//! point and uses optimistic versioning: creating a revision whose version
//! already exists fails with a conflict.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// Description written on revisions created by deprecated API migration
pub const MIGRATION_DESCRIPTION: &str =
    "Kubernetes deprecated API upgrade - DO NOT rollback from this version";

/// Revision status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    /// Currently deployed
    Deployed,
    /// Replaced by a newer deployed revision
    Superseded,
    /// An attempt that did not complete
    Failed,
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseStatus::Deployed => write!(f, "deployed"),
            ReleaseStatus::Superseded => write!(f, "superseded"),
            ReleaseStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ReleaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deployed" => Ok(ReleaseStatus::Deployed),
            "superseded" => Ok(ReleaseStatus::Superseded),
            "failed" => Ok(ReleaseStatus::Failed),
            other => Err(format!("unknown release status {:?}", other)),
        }
    }
}

/// One historical version of a release
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRevision {
    /// Release name
    pub release_name: String,
    /// Namespace the release deploys into
    pub namespace: String,
    /// Monotonic revision number, starting at 1
    pub version: u32,
    /// Revision status
    pub status: ReleaseStatus,
    /// Rendered, post-processed manifest stream
    pub manifest: String,
    /// Human-readable description of how this revision came to be
    pub description: String,
    /// When the revision was recorded
    pub timestamp: DateTime<Utc>,
}

impl ReleaseRevision {
    /// Create a revision stamped with the current time
    pub fn new(
        release_name: impl Into<String>,
        namespace: impl Into<String>,
        version: u32,
        status: ReleaseStatus,
        manifest: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            release_name: release_name.into(),
            namespace: namespace.into(),
            version,
            status,
            manifest: manifest.into(),
            description: description.into(),
            timestamp: Utc::now(),
        }
    }

    /// A copy of this revision with a different status
    pub fn with_status(&self, status: ReleaseStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Persistent store of release revisions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// All revisions of a release, oldest first; empty when never installed
    async fn history(&self, release: &str) -> Result<Vec<ReleaseRevision>, Error>;

    /// Persist a new revision; fails with a conflict if the version exists
    async fn create(&self, revision: &ReleaseRevision) -> Result<(), Error>;

    /// Replace an existing revision (status transitions)
    async fn update(&self, revision: &ReleaseRevision) -> Result<(), Error>;

    /// Delete one revision
    async fn delete(&self, release: &str, version: u32) -> Result<(), Error>;
}

/// Latest revision by version
pub fn latest(history: &[ReleaseRevision]) -> Option<&ReleaseRevision> {
    history.iter().max_by_key(|r| r.version)
}

/// Most recent revision with status `deployed`
pub fn last_deployed(history: &[ReleaseRevision]) -> Option<&ReleaseRevision> {
    history
        .iter()
        .filter(|r| r.status == ReleaseStatus::Deployed)
        .max_by_key(|r| r.version)
}

/// Version to use for the next revision
pub fn next_version(history: &[ReleaseRevision]) -> u32 {
    latest(history).map(|r| r.version + 1).unwrap_or(1)
}

/// Record `revision` as deployed and flip older deployed revisions to superseded
pub async fn record_deployed(
    store: &dyn ReleaseStore,
    history: &[ReleaseRevision],
    revision: &ReleaseRevision,
) -> Result<(), Error> {
    for previous in history
        .iter()
        .filter(|r| r.status == ReleaseStatus::Deployed && r.version != revision.version)
    {
        store
            .update(&previous.with_status(ReleaseStatus::Superseded))
            .await?;
    }
    store.create(revision).await
}

/// Delete the oldest revisions so at most `max` remain
///
/// Returns the number of revisions deleted.
pub async fn prune(store: &dyn ReleaseStore, release: &str, max: usize) -> Result<usize, Error> {
    let mut history = store.history(release).await?;
    if history.len() <= max {
        return Ok(0);
    }
    history.sort_by_key(|r| r.version);
    let excess = history.len() - max;
    for revision in &history[..excess] {
        store.delete(release, revision.version).await?;
    }
    Ok(excess)
}

/// In-memory store for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryReleaseStore {
    releases: DashMap<String, Vec<ReleaseRevision>>,
}

impl MemoryReleaseStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn history(&self, release: &str) -> Result<Vec<ReleaseRevision>, Error> {
        let mut revisions = self
            .releases
            .get(release)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        revisions.sort_by_key(|r| r.version);
        Ok(revisions)
    }

    async fn create(&self, revision: &ReleaseRevision) -> Result<(), Error> {
        let mut entry = self
            .releases
            .entry(revision.release_name.clone())
            .or_default();
        if entry.iter().any(|r| r.version == revision.version) {
            return Err(Error::history_conflict(
                &revision.release_name,
                revision.version,
            ));
        }
        entry.push(revision.clone());
        Ok(())
    }

    async fn update(&self, revision: &ReleaseRevision) -> Result<(), Error> {
        let mut entry = self
            .releases
            .get_mut(&revision.release_name)
            .ok_or_else(|| Error::history(&revision.release_name, "release not found"))?;
        let slot = entry
            .iter_mut()
            .find(|r| r.version == revision.version)
            .ok_or_else(|| {
                Error::history(
                    &revision.release_name,
                    format!("revision {} not found", revision.version),
                )
            })?;
        *slot = revision.clone();
        Ok(())
    }

    async fn delete(&self, release: &str, version: u32) -> Result<(), Error> {
        if let Some(mut entry) = self.releases.get_mut(release) {
            entry.retain(|r| r.version != version);
        }
        self.releases.remove_if(release, |_, v| v.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revision(version: u32, status: ReleaseStatus) -> ReleaseRevision {
        ReleaseRevision::new("podinfo", "podinfo", version, status, "", "test")
    }

    #[test]
    fn with_status_leaves_original_untouched() {
        let original = revision(1, ReleaseStatus::Deployed);
        let superseded = original.with_status(ReleaseStatus::Superseded);
        assert_eq!(original.status, ReleaseStatus::Deployed);
        assert_eq!(superseded.status, ReleaseStatus::Superseded);
        assert_eq!(superseded.version, 1);
    }

    #[test]
    fn history_queries() {
        let history = vec![
            revision(1, ReleaseStatus::Superseded),
            revision(2, ReleaseStatus::Deployed),
            revision(3, ReleaseStatus::Failed),
        ];
        assert_eq!(latest(&history).map(|r| r.version), Some(3));
        assert_eq!(last_deployed(&history).map(|r| r.version), Some(2));
        assert_eq!(next_version(&history), 4);
        assert_eq!(next_version(&[]), 1);
        assert!(last_deployed(&[revision(1, ReleaseStatus::Failed)]).is_none());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ReleaseStatus::Deployed,
            ReleaseStatus::Superseded,
            ReleaseStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<ReleaseStatus>(), Ok(status));
        }
        assert!("pending".parse::<ReleaseStatus>().is_err());
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_versions() {
        let store = MemoryReleaseStore::new();
        store.create(&revision(1, ReleaseStatus::Deployed)).await.unwrap();
        let err = store
            .create(&revision(1, ReleaseStatus::Deployed))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::History { conflict: true, .. }));
    }

    #[tokio::test]
    async fn record_deployed_supersedes_previous() {
        let store = MemoryReleaseStore::new();
        store.create(&revision(1, ReleaseStatus::Deployed)).await.unwrap();
        let history = store.history("podinfo").await.unwrap();

        record_deployed(&store, &history, &revision(2, ReleaseStatus::Deployed))
            .await
            .unwrap();

        let history = store.history("podinfo").await.unwrap();
        assert_eq!(history[0].status, ReleaseStatus::Superseded);
        assert_eq!(history[1].status, ReleaseStatus::Deployed);
    }

    #[tokio::test]
    async fn prune_keeps_newest_revisions() {
        let store = MemoryReleaseStore::new();
        for v in 1..=12 {
            store.create(&revision(v, ReleaseStatus::Superseded)).await.unwrap();
        }
        assert_eq!(prune(&store, "podinfo", 10).await.unwrap(), 2);
        let versions: Vec<u32> = store
            .history("podinfo")
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, (3..=12).collect::<Vec<_>>());
        assert_eq!(prune(&store, "podinfo", 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_of_unknown_revision_fails() {
        let store = MemoryReleaseStore::new();
        assert!(store
            .update(&revision(1, ReleaseStatus::Superseded))
            .await
            .is_err());
    }
}
