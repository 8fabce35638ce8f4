//! Error types for the Gauntlet environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A module path could not be resolved by a loader
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// A module path tried to escape the loader root or was malformed
    #[error("Invalid module path: {0}")]
    InvalidPath(String),

    /// The loader answered, but could not produce the module
    #[error("Failed to load {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// A loading capability was used after it had been revoked
    #[error("Loading capability revoked (requested {0})")]
    CapabilityRevoked(String),

    /// Underlying I/O failed while reading module source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message channel was closed by the other side
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a module-not-found error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::ModuleNotFound(path.into())
    }

    /// Creates a channel-closed error.
    pub fn closed(what: impl std::fmt::Display) -> Self {
        Self::ChannelClosed(what.to_string())
    }
}
