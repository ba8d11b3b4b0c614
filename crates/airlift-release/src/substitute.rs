//! Placeholder substitution for rendered manifests
//!
//! Placeholders look like `###AIRLIFT_REGISTRY###`: a fixed prefix, a scope
//! and an uppercase key between triple hashes. Three families exist:
//!
//! - builtins from cluster state: `###AIRLIFT_<KEY>###`
//! - package variables: `###AIRLIFT_VAR_<KEY>###`
//! - package constants: `###AIRLIFT_CONST_<KEY>###`
//!
//! Substitution is line oriented. Unknown placeholders are left in place so
//! a later pass (or a human) can spot them.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::Error;
use crate::state::ClusterState;

const SANITIZED: &str = "**sanitized**";

/// Old misspelled data injection marker, still accepted
const DEPRECATED_DATA_MARKER: &str = "DATA_INJECTON_MARKER";
/// Corrected data injection marker
const DATA_MARKER: &str = "DATA_INJECTION_MARKER";

/// How a variable's value is interpreted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// The value is the text to insert
    #[default]
    Raw,
    /// The value is a path to a text file whose contents are inserted
    File,
}

/// A package variable as set for this deployment
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetVariable {
    /// Value to substitute
    pub value: String,
    /// Hide the value in logs
    pub sensitive: bool,
    /// Re-indent multi-line values to the placeholder's column
    pub auto_indent: bool,
    /// Raw text or file path
    #[serde(rename = "type")]
    pub type_: VariableType,
}

/// A package constant
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Constant {
    /// Constant name
    pub name: String,
    /// Constant value
    pub value: String,
    /// Re-indent multi-line values to the placeholder's column
    pub auto_indent: bool,
}

/// Resolved value for one placeholder
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextTemplate {
    /// Value to substitute
    pub value: String,
    /// Hide the value in logs
    pub sensitive: bool,
    /// Re-indent multi-line values to the placeholder's column
    pub auto_indent: bool,
    /// Raw text or file path
    pub type_: VariableType,
}

impl TextTemplate {
    /// A plain, non-sensitive value
    pub fn raw(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    fn sensitive(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            sensitive: true,
            ..Default::default()
        }
    }
}

/// Placeholder map, alias map and pattern for one deployment
#[derive(Clone, Debug)]
pub struct VariableConfig {
    prefix: String,
    templates: BTreeMap<String, TextTemplate>,
    deprecations: BTreeMap<String, String>,
    pattern: Regex,
}

impl VariableConfig {
    /// Empty config for a placeholder prefix
    pub fn new(prefix: &str) -> Result<Self, Error> {
        let prefix = prefix.to_uppercase();
        let pattern = Regex::new(&format!("###{}_[A-Z0-9_]+###", regex::escape(&prefix)))
            .map_err(|e| Error::configuration(format!("invalid placeholder prefix: {}", e)))?;

        let mut deprecations = BTreeMap::new();
        deprecations.insert(
            placeholder(&prefix, DEPRECATED_DATA_MARKER),
            placeholder(&prefix, DATA_MARKER),
        );

        Ok(Self {
            prefix,
            templates: BTreeMap::new(),
            deprecations,
            pattern,
        })
    }

    /// Build the full placeholder map from an engine config
    pub fn from_engine(config: &EngineConfig) -> Result<Self, Error> {
        let mut vc = Self::new(&config.variable_prefix)?;
        if let Some(state) = &config.state {
            vc.add_builtins(state);
        }
        for (name, variable) in &config.variables {
            vc.set_variable(name, variable);
        }
        for constant in &config.constants {
            vc.set_constant(constant);
        }
        vc.log_templates();
        Ok(vc)
    }

    /// Add `###<PREFIX>_<KEY>###` entries derived from cluster state
    pub fn add_builtins(&mut self, state: &ClusterState) {
        let registry = &state.registry;
        let git = &state.git_server;
        let builtins = [
            ("STORAGE_CLASS", TextTemplate::raw(&state.storage_class)),
            ("REGISTRY", TextTemplate::raw(&registry.address)),
            ("NODEPORT", TextTemplate::raw(registry.node_port.to_string())),
            (
                "REGISTRY_AUTH_PUSH",
                TextTemplate::sensitive(&registry.push_password),
            ),
            (
                "REGISTRY_AUTH_PULL",
                TextTemplate::sensitive(&registry.pull_password),
            ),
            ("GIT_PUSH", TextTemplate::raw(&git.push_username)),
            ("GIT_AUTH_PUSH", TextTemplate::sensitive(&git.push_password)),
            ("GIT_PULL", TextTemplate::raw(&git.pull_username)),
            ("GIT_AUTH_PULL", TextTemplate::sensitive(&git.pull_password)),
        ];
        for (key, template) in builtins {
            self.templates.insert(placeholder(&self.prefix, key), template);
        }
    }

    /// Add a `###<PREFIX>_VAR_<NAME>###` entry
    pub fn set_variable(&mut self, name: &str, variable: &SetVariable) {
        self.templates.insert(
            placeholder(&self.prefix, &format!("VAR_{}", name)),
            TextTemplate {
                value: variable.value.clone(),
                sensitive: variable.sensitive,
                auto_indent: variable.auto_indent,
                type_: variable.type_,
            },
        );
    }

    /// Add a `###<PREFIX>_CONST_<NAME>###` entry
    pub fn set_constant(&mut self, constant: &Constant) {
        self.templates.insert(
            placeholder(&self.prefix, &format!("CONST_{}", constant.name)),
            TextTemplate {
                value: constant.value.clone(),
                auto_indent: constant.auto_indent,
                ..Default::default()
            },
        );
    }

    /// Add or replace an arbitrary placeholder
    pub fn insert(&mut self, key: impl Into<String>, template: TextTemplate) {
        self.templates.insert(key.into(), template);
    }

    /// Resolved placeholder map
    pub fn templates(&self) -> &BTreeMap<String, TextTemplate> {
        &self.templates
    }

    /// Deprecated placeholder -> replacement placeholder
    pub fn deprecations(&self) -> &BTreeMap<String, String> {
        &self.deprecations
    }

    /// Substitute placeholders in `text`
    pub fn apply(&self, text: &str) -> String {
        replace_text_template(text, &self.templates, &self.deprecations, &self.pattern)
    }

    /// Substitute placeholders in a file, rewriting it in place
    pub async fn apply_file(&self, path: &Path) -> Result<(), Error> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::render(
                path.display().to_string(),
                format!("unable to read rendered manifest: {}", e),
            )
        })?;
        tokio::fs::write(path, self.apply(&text))
            .await
            .map_err(|e| {
                Error::render(
                    path.display().to_string(),
                    format!("unable to write rendered manifest: {}", e),
                )
            })
    }

    fn log_templates(&self) {
        let shown: BTreeMap<&str, &str> = self
            .templates
            .iter()
            .map(|(k, t)| {
                let v = if t.sensitive { SANITIZED } else { t.value.as_str() };
                (k.as_str(), v)
            })
            .collect();
        debug!(templates = ?shown, deprecations = ?self.deprecations, "placeholder map");
    }
}

fn placeholder(prefix: &str, key: &str) -> String {
    format!("###{}_{}###", prefix, key).to_uppercase()
}

/// Replace every placeholder matched by `pattern` in `text`.
///
/// Each line is scanned left to right. A placeholder listed in
/// `deprecations` is reported and, when it has no mapping of its own,
/// resolved through its replacement. Placeholders with no mapping are kept
/// verbatim. Every output line ends with a newline.
pub fn replace_text_template(
    text: &str,
    mappings: &BTreeMap<String, TextTemplate>,
    deprecations: &BTreeMap<String, String>,
    pattern: &Regex,
) -> String {
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        let line_start = out.len();
        let mut rest = line;

        while let Some(found) = pattern.find(rest) {
            out.push_str(&rest[..found.start()]);
            let key = found.as_str();
            rest = &rest[found.end()..];

            let mut template = mappings.get(key);
            if let Some(replacement) = deprecations.get(key) {
                warn!(
                    deprecated = %key,
                    replacement = %replacement,
                    "package uses a deprecated variable, please notify the package creator"
                );
                if template.is_none() {
                    template = mappings.get(replacement);
                }
            }

            let Some(template) = template else {
                out.push_str(key);
                continue;
            };

            let mut value = template.value.clone();
            if template.type_ == VariableType::File && !value.is_empty() {
                match read_text_file(&value) {
                    Ok(contents) => value = contents,
                    Err(reason) => {
                        warn!(placeholder = %key, reason = %reason, "skipping file variable");
                        continue;
                    }
                }
            }

            if template.auto_indent {
                let column = out[line_start..].chars().count();
                value = value.replace('\n', &format!("\n{}", " ".repeat(column)));
            }
            out.push_str(&value);
        }

        out.push_str(rest);
        out.push('\n');
    }

    out
}

fn read_text_file(path: &str) -> Result<String, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("unable to read {}: {}", path, e))?;
    if bytes.contains(&0) {
        return Err(format!("refusing to load non-text file {}", path));
    }
    String::from_utf8(bytes).map_err(|_| format!("refusing to load non-text file {}", path))
}
