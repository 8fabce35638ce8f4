//! Error types for the simulation harness.

use gauntlet_core::{BracketError, UnitError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid harness configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Unit(#[from] UnitError),

    #[error(transparent)]
    Bracket(#[from] BracketError),

    /// The async runtime could not be started
    #[error("Runtime error: {0}")]
    Runtime(String),
}
