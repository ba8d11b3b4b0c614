//! Chart descriptors and chart loading
//!
//! A [`ChartDescriptor`] names one deployable unit. A [`ChartSource`] turns
//! it into a [`LoadedChart`]: metadata, templates and the chart's default
//! values merged with the descriptor's values files.

use std::path::{Path, PathBuf};

use airlift_common::graph::DependencyNode;
use airlift_common::yaml::parse_yaml;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// Chart values
pub type Values = Map<String, Value>;

/// One deployable chart release
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartDescriptor {
    /// Chart name
    pub name: String,
    /// Namespace the release deploys into
    pub namespace: String,
    /// Release name; defaults to the chart name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    /// Expected chart version
    #[serde(default)]
    pub version: String,
    /// Where the chart comes from (a chart directory for [`LocalChartSource`])
    #[serde(default)]
    pub source_ref: String,
    /// Values files merged over the chart defaults, in order
    #[serde(default)]
    pub values_files: Vec<PathBuf>,
    /// Skip the readiness wait after applying
    #[serde(default)]
    pub no_wait: bool,
    /// Releases (`namespace/release`) that must be deployed first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ChartDescriptor {
    /// Effective release name
    pub fn release_name(&self) -> &str {
        match self.release_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.name,
        }
    }

    /// `namespace/release`, the id used in dependency graphs
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.release_name())
    }

    /// Node for dependency ordering
    pub fn dependency_node(&self) -> DependencyNode {
        DependencyNode::new(self.qualified_name(), self.depends_on.iter().cloned())
    }
}

/// `Chart.yaml` contents the engine uses
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart name
    pub name: String,
    /// Chart version
    pub version: String,
    /// Version of the packaged application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    /// One-line description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One template file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartTemplate {
    /// Path relative to the chart root (`templates/deployment.yaml`)
    pub path: String,
    /// Template source
    pub content: String,
}

impl ChartTemplate {
    /// Partials (`_helpers.tpl`) are importable but never rendered on their own
    pub fn is_partial(&self) -> bool {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('_'))
    }
}

/// A chart ready to render
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadedChart {
    /// Chart metadata
    pub metadata: ChartMetadata,
    /// Templates in file name order
    pub templates: Vec<ChartTemplate>,
    /// Default values merged with the descriptor's values files
    pub values: Values,
}

/// Resolves descriptors to loaded charts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartSource: Send + Sync {
    /// Load the chart and its merged values
    async fn load(&self, chart: &ChartDescriptor) -> Result<LoadedChart, Error>;
}

/// Deep-merge `overlay` into `base`
///
/// Nested maps merge key by key; anything else in `overlay` replaces the
/// value in `base`. A `null` in `overlay` removes the key.
pub fn merge_values(base: &mut Values, overlay: Values) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (_, Value::Null) => {
                base.remove(&key);
            }
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_values(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Parse a YAML values document into a map; an empty document is empty values
pub fn parse_values(chart: &str, text: &str) -> Result<Values, Error> {
    match parse_yaml(text).map_err(|e| Error::chart_load(chart, format!("invalid values: {}", e)))? {
        Value::Null => Ok(Values::new()),
        Value::Object(map) => Ok(map),
        other => Err(Error::chart_load(
            chart,
            format!("values must be a map, found {}", other),
        )),
    }
}

/// Loads charts from directories on disk
///
/// `sourceRef` is a chart directory, resolved against `root` when relative.
#[derive(Clone, Debug, Default)]
pub struct LocalChartSource {
    root: Option<PathBuf>,
}

impl LocalChartSource {
    /// Resolve relative chart paths against `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn read(chart: &str, path: &Path) -> Result<String, Error> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::chart_load(chart, format!("unable to read {}: {}", path.display(), e)))
    }

    async fn load_templates(chart: &str, dir: &Path) -> Result<Vec<ChartTemplate>, Error> {
        let mut templates = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(templates),
            Err(e) => {
                return Err(Error::chart_load(
                    chart,
                    format!("unable to list {}: {}", dir.display(), e),
                ))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::chart_load(chart, format!("unable to list templates: {}", e)))?
        {
            let path = entry.path();
            let is_template = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "yaml" | "yml" | "tpl"));
            if !is_template {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            templates.push(ChartTemplate {
                path: format!("templates/{}", file_name),
                content: Self::read(chart, &path).await?,
            });
        }

        templates.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(templates)
    }
}

#[async_trait]
impl ChartSource for LocalChartSource {
    async fn load(&self, chart: &ChartDescriptor) -> Result<LoadedChart, Error> {
        let dir = self.resolve(Path::new(&chart.source_ref));
        let name = &chart.name;

        let metadata: ChartMetadata =
            serde_yaml::from_str(&Self::read(name, &dir.join("Chart.yaml")).await?)
                .map_err(|e| Error::chart_load(name, format!("invalid Chart.yaml: {}", e)))?;
        if !chart.version.is_empty() && chart.version != metadata.version {
            warn!(
                chart = %name,
                expected = %chart.version,
                found = %metadata.version,
                "chart version does not match descriptor"
            );
        }

        let defaults = dir.join("values.yaml");
        let mut values = if tokio::fs::try_exists(&defaults).await.unwrap_or(false) {
            parse_values(name, &Self::read(name, &defaults).await?)?
        } else {
            Values::new()
        };
        for file in &chart.values_files {
            let overlay = parse_values(name, &Self::read(name, &self.resolve(file)).await?)?;
            merge_values(&mut values, overlay);
        }

        let templates = Self::load_templates(name, &dir.join("templates")).await?;
        debug!(chart = %name, templates = templates.len(), "loaded chart");

        Ok(LoadedChart {
            metadata,
            templates,
            values,
        })
    }
}
