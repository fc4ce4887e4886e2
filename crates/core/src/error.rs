use std::path::PathBuf;

/// Error type for guard internals. Never crosses the hook boundary: every
/// variant is logged and converted into an allow decision there.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl GuardError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type GuardResult<T> = Result<T, GuardError>;
