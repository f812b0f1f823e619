//! Error types for the CA bundle injector

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid or missing runtime configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A same-named config map exists but is not controlled by the source
    /// secret. Never auto-resolved; an operator has to remove the object.
    #[error("config map '{name}' in namespace '{namespace}' already exists and is not managed by the CA bundle injector")]
    OwnershipConflict { namespace: String, name: String },

    /// The local caches did not reach a consistent initial state
    #[error("initial cache sync failed: {0}")]
    CacheSyncError(String),

    /// I/O error from process-level plumbing (signal handlers)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Event reason attached to cluster Event records for this error.
    pub fn event_reason(&self) -> &'static str {
        match self {
            Error::OwnershipConflict { .. } => "OwnershipConflict",
            Error::KubeError(_) => "SyncFailed",
            Error::ConfigError(_) => "InvalidConfig",
            Error::CacheSyncError(_) => "CacheSyncFailed",
            Error::IoError(_) => "IoError",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
