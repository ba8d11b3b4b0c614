//! Common building blocks for airlift: errors, Kubernetes and YAML helpers,
//! retry loops, telemetry and release dependency ordering

#![deny(missing_docs)]

pub mod error;
pub mod graph;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "airlift";

/// Standard label marking resources managed by airlift
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on airlift-managed resources
pub const MANAGED_BY_VALUE: &str = "airlift";

/// Label naming the release that created a namespace
pub const RELEASE_LABEL: &str = "airlift.dev/release";

/// Annotation naming the release that owns an adopted resource
pub const RELEASE_NAME_ANNOTATION: &str = "airlift.dev/release-name";

/// Annotation naming the namespace of the release that owns an adopted resource
pub const RELEASE_NAMESPACE_ANNOTATION: &str = "airlift.dev/release-namespace";

/// Service label whose value is the connect-string key
pub const CONNECT_LABEL: &str = "airlift.dev/connect-name";

/// Service annotation carrying the connect-string description
pub const CONNECT_DESCRIPTION_ANNOTATION: &str = "airlift.dev/connect-description";

/// Service annotation carrying the connect-string URL
pub const CONNECT_URL_ANNOTATION: &str = "airlift.dev/connect-url";

/// Image pull secret provisioned into every managed namespace
pub const REGISTRY_SECRET_NAME: &str = "private-registry";

/// Git credentials secret provisioned into every managed namespace
pub const GIT_SERVER_SECRET_NAME: &str = "private-git-server";

/// Namespaces that exist in every cluster and are never adopted
pub const INITIAL_NAMESPACES: &[&str] = &["default", "kube-node-lease", "kube-public", "kube-system"];
