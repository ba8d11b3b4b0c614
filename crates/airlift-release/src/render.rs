//! Chart template rendering
//!
//! Templates are Jinja (minijinja) with three top-level objects:
//! - `Values`: merged chart values
//! - `Release`: `Name`, `Namespace`, `Revision`, `IsInstall`, `IsUpgrade`
//! - `Chart`: `Name`, `Version`, `AppVersion`
//!
//! Each rendered template becomes one block of the output stream, headed by
//! `# Source: <chart>/<template path>`. Templates that render to nothing are
//! left out.

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{context, Environment, ErrorKind};
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::chart::{LoadedChart, Values};
use crate::error::Error;

/// Release facts exposed to templates
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseContext {
    /// Release name
    pub name: String,
    /// Release namespace
    pub namespace: String,
    /// Revision being rendered
    pub revision: u32,
    /// First deployment of the release
    pub is_install: bool,
    /// Deployment over an existing release
    pub is_upgrade: bool,
}

/// Renders a loaded chart into a manifest stream
#[cfg_attr(test, automock)]
pub trait ChartRenderer: Send + Sync {
    /// Render every non-partial template
    fn render(
        &self,
        chart: &LoadedChart,
        values: &Values,
        release: &ReleaseContext,
    ) -> Result<String, Error>;
}

/// minijinja-backed [`ChartRenderer`]
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    fn environment(chart: &LoadedChart) -> Result<Environment<'_>, minijinja::Error> {
        let mut env = Environment::new();
        env.add_filter("b64enc", b64enc);
        env.add_filter("b64dec", b64dec);
        env.add_filter("required", required);
        env.add_filter("quote", quote);
        for template in &chart.templates {
            env.add_template(&template.path, &template.content)?;
        }
        Ok(env)
    }
}

impl ChartRenderer for TemplateRenderer {
    fn render(
        &self,
        chart: &LoadedChart,
        values: &Values,
        release: &ReleaseContext,
    ) -> Result<String, Error> {
        let env = Self::environment(chart)
            .map_err(|e| Error::render(&release.name, format!("invalid template: {}", e)))?;

        let ctx = context! {
            Values => values,
            Release => release,
            Chart => context! {
                Name => &chart.metadata.name,
                Version => &chart.metadata.version,
                AppVersion => chart.metadata.app_version.as_deref().unwrap_or_default(),
            },
        };

        let mut out = String::new();
        for template in chart.templates.iter().filter(|t| !t.is_partial()) {
            let rendered = env
                .get_template(&template.path)
                .and_then(|t| t.render(&ctx))
                .map_err(|e| {
                    Error::render(&release.name, format!("{}: {}", template.path, e))
                })?;
            if rendered.trim().is_empty() {
                continue;
            }
            out.push_str(&format!(
                "---\n# Source: {}/{}\n{}\n",
                chart.metadata.name,
                template.path,
                rendered.trim_matches('\n')
            ));
        }
        Ok(out)
    }
}

fn b64enc(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

fn b64dec(value: &str) -> Result<String, minijinja::Error> {
    let bytes = STANDARD.decode(value).map_err(|e| {
        minijinja::Error::new(ErrorKind::InvalidOperation, format!("base64 decode error: {}", e))
    })?;
    String::from_utf8(bytes).map_err(|e| {
        minijinja::Error::new(
            ErrorKind::InvalidOperation,
            format!("base64 decode produced invalid UTF-8: {}", e),
        )
    })
}

fn required(value: minijinja::Value, message: Option<String>) -> Result<minijinja::Value, minijinja::Error> {
    if value.is_undefined() || value.is_none() {
        Err(minijinja::Error::new(
            ErrorKind::UndefinedError,
            message.unwrap_or_else(|| "required value is missing".to_string()),
        ))
    } else {
        Ok(value)
    }
}

fn quote(value: minijinja::Value) -> String {
    format!("{:?}", value.to_string())
}
