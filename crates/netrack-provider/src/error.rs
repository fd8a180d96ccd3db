//! Provider errors

use netrack_store::StoreError;
use thiserror::Error;

/// Errors from providers and their host adapters
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} provider is already running")]
    AlreadyRunning(&'static str),

    #[error("{0} provider is not running")]
    NotRunning(&'static str),

    #[error("Failed to bind listener: {0}")]
    Bind(String),

    #[error("Listener not bound")]
    NotBound,

    #[error("Blocking task failed: {0}")]
    Join(String),
}
