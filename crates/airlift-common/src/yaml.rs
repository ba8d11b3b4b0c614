//! YAML utilities
//!
//! Parsing goes through yaml-rust2 and lands in `serde_json::Value` so the
//! rest of the code base only deals with one dynamic value type. Emitting
//! goes through serde_yaml. Rendered chart output is handled as a stream of
//! `---` separated documents, each tagged with a `# Source:` comment naming
//! the template it came from.

use serde_json::{Map, Number, Value};
use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

/// Comment prefix that names the template a rendered document came from
pub const SOURCE_PREFIX: &str = "# Source: ";

/// Error type for YAML parsing and emitting
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct YamlError(String);

/// One resource document from a rendered manifest stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestDocument {
    /// Template path from the `# Source:` comment, or a positional name
    pub source: String,
    /// Document text without the separator and source comment
    pub content: String,
}

impl ManifestDocument {
    /// Create a document from a source path and its YAML text
    pub fn new(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
        }
    }

    /// Render back into stream form: separator, source comment, content
    pub fn to_stream_block(&self) -> String {
        format!("---\n{}{}\n{}\n", SOURCE_PREFIX, self.source, self.content)
    }
}

/// Parse a YAML string into a serde_json::Value.
///
/// For multi-document YAML, returns only the first document.
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Serialize a value as a YAML document (no leading `---`)
pub fn to_yaml_string<T: serde::Serialize>(value: &T) -> Result<String, YamlError> {
    let text = serde_yaml::to_string(value).map_err(|e| YamlError(e.to_string()))?;
    Ok(text
        .strip_prefix("---\n")
        .unwrap_or(&text)
        .trim_end()
        .to_string())
}

/// Split a rendered manifest stream into resource documents.
///
/// Documents keep their relative order. Documents that are empty or contain
/// only comments are dropped. A document without a `# Source:` comment is
/// named `manifest-<n>` after its position in the stream.
pub fn split_manifests(input: &str) -> Vec<ManifestDocument> {
    let mut docs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut position = 0usize;

    for line in input.lines() {
        if is_separator(line) {
            push_document(&mut docs, &current, position);
            current.clear();
            position += 1;
            continue;
        }
        current.push(line);
    }
    push_document(&mut docs, &current, position);

    docs
}

/// Join documents back into a single stream
pub fn join_manifests(docs: &[ManifestDocument]) -> String {
    docs.iter().map(ManifestDocument::to_stream_block).collect()
}

fn is_separator(line: &str) -> bool {
    let trimmed = line.trim_end();
    trimmed == "---" || trimmed.starts_with("--- ")
}

fn push_document(docs: &mut Vec<ManifestDocument>, lines: &[&str], position: usize) {
    let mut source = None;
    let mut body = Vec::with_capacity(lines.len());
    for line in lines {
        match line.strip_prefix(SOURCE_PREFIX) {
            Some(path) if source.is_none() => source = Some(path.trim().to_string()),
            _ => body.push(*line),
        }
    }

    let has_content = body.iter().any(|l| {
        let t = l.trim();
        !t.is_empty() && !t.starts_with('#')
    });
    if !has_content {
        return;
    }

    let content = body.join("\n").trim_matches('\n').to_string();
    docs.push(ManifestDocument {
        source: source.unwrap_or_else(|| format!("manifest-{}", position)),
        content,
    });
}

/// Convert a yaml_rust2::Yaml value to serde_json::Value
fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(e.to_string()))?;
            Ok(Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(YamlError("unsupported YAML key type".to_string())),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("YAML aliases not supported".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}
