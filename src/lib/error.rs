use std::path::PathBuf;

/// Errors callers may want to tell apart. They travel inside [anyhow::Error] and can be
/// recovered with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum CiError {
    #[error("another run is already in progress (lock held at {path})")]
    AlreadyRunning { path: PathBuf },

    #[error("{what} not ready after {attempts} attempt(s)")]
    NotReady { what: String, attempts: u32 },

    #[error("secret \"{0}\" could not be resolved")]
    SecretNotFound(String),

    #[error("{command} exited with {}", code.map(|c| c.to_string()).unwrap_or_else(|| "a signal".to_string()))]
    CommandFailed { command: String, code: Option<i32> },

    #[error("no line matching \"image: {image}:\" in {manifest}")]
    ManifestUnchanged { image: String, manifest: String },

    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}
