//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Release(#[from] airlift_release::Error),

    #[error(transparent)]
    Common(#[from] airlift_common::Error),

    #[error("invalid release plan {path}: {message}")]
    InvalidPlan { path: PathBuf, message: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },
}

impl Error {
    pub fn invalid_plan(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::InvalidPlan {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }
}

impl From<airlift_common::graph::GraphError> for Error {
    fn from(e: airlift_common::graph::GraphError) -> Self {
        Error::Release(airlift_release::Error::Graph(e))
    }
}
