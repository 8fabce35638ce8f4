//! Common types for the Gauntlet environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an execution unit.
///
/// Uses UUID v4 for global uniqueness without coordination. Every unit
/// lifetime gets a fresh id, even when the worker behind it is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId(pub Uuid);

impl UnitId {
    /// Creates a new random UnitId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a UnitId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic UnitId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Literal source text for a named logical module.
///
/// This is what crosses the isolation boundary during the dependency
/// handshake: the unit names a path, the supervisor answers with text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource {
    /// Logical module path as requested (e.g. `entries/alice`)
    pub path: String,

    /// The module's source text
    pub source_text: String,
}

impl ModuleSource {
    /// Creates a module source from a path and its text.
    pub fn new(path: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source_text: source_text.into(),
        }
    }

    /// Returns the source size in bytes.
    pub fn size(&self) -> usize {
        self.source_text.len()
    }
}
