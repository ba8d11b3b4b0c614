//! Release plan files
//!
//! A plan lists the charts to deploy and per-release value overrides:
//!
//! ```yaml
//! charts:
//!   - name: postgres
//!     namespace: data
//!     sourceRef: charts/postgres
//!   - name: api
//!     namespace: apps
//!     sourceRef: charts/api
//!     dependsOn: [data/postgres]
//! values:
//!   apps/api:
//!     replicas: 2
//! ```
//!
//! Relative `sourceRef` and `valuesFiles` paths resolve against the plan's
//! directory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use airlift_release::{ChartDescriptor, Values};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Parsed plan file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleasePlan {
    /// Charts to deploy, in any order
    #[serde(default)]
    pub charts: Vec<ChartDescriptor>,
    /// Value overrides keyed by `namespace/release`
    #[serde(default)]
    pub values: BTreeMap<String, Values>,
}

impl ReleasePlan {
    /// Parse and validate plan YAML
    pub fn from_yaml_str(path: &Path, input: &str) -> Result<Self> {
        let plan: ReleasePlan =
            serde_yaml::from_str(input).map_err(|e| Error::invalid_plan(path, e.to_string()))?;
        plan.validate(path)?;
        Ok(plan)
    }

    /// Read a plan file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_plan(path, format!("unable to read plan: {}", e))
        })?;
        Self::from_yaml_str(path, &text)
    }

    /// Directory relative chart paths resolve against
    pub fn base_dir(path: &Path) -> PathBuf {
        path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let mut seen = BTreeSet::new();
        for chart in &self.charts {
            if chart.name.is_empty() || chart.namespace.is_empty() {
                return Err(Error::invalid_plan(
                    path,
                    "every chart needs a name and a namespace",
                ));
            }
            if !seen.insert(chart.qualified_name()) {
                return Err(Error::invalid_plan(
                    path,
                    format!("release {} is listed twice", chart.qualified_name()),
                ));
            }
        }
        for id in self.values.keys() {
            if !seen.contains(id) {
                return Err(Error::invalid_plan(
                    path,
                    format!("values given for unknown release {}", id),
                ));
            }
        }
        Ok(())
    }
}
