//! Code-loading capability for execution units.
//!
//! A unit never reads code itself. It names a logical module path and
//! something holding a [`CodeLoader`] answers with the literal source text.
//! The supervisor-side implementations live here; the unit-side one
//! (which forwards the request across the isolation boundary) lives in
//! `gauntlet_core`.
//!
//! ```text
//! Unit                      Supervisor                  Loader
//!   |                           |                          |
//!   |-- request("entries/a") -->|                          |
//!   |                           |-- load("entries/a") ---->|
//!   |                           |<------ source text ------|
//!   |<-- {path, source_text} ---|                          |
//! ```

use crate::error::EnvError;
use crate::types::ModuleSource;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Resolves a logical module path to literal source text.
#[async_trait]
pub trait CodeLoader: Send + Sync + 'static {
    /// Loads the module at `path`.
    ///
    /// # Returns
    /// * `Ok(ModuleSource)` - the module text, tagged with the requested path
    /// * `Err(EnvError::ModuleNotFound)` - nothing is registered under `path`
    async fn load(&self, path: &str) -> Result<ModuleSource, EnvError>;
}

/// In-memory loader with modules registered up front.
///
/// Used by the simulation harness and tests, where participant entries are
/// generated rather than read from disk.
#[derive(Debug, Clone, Default)]
pub struct StaticLoader {
    modules: Arc<RwLock<HashMap<String, String>>>,
}

impl StaticLoader {
    /// Creates an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a module.
    pub fn insert(&self, path: impl Into<String>, source_text: impl Into<String>) {
        let mut modules = self.modules.write().unwrap();
        modules.insert(path.into(), source_text.into());
    }

    /// Builder-style registration.
    pub fn with_module(self, path: impl Into<String>, source_text: impl Into<String>) -> Self {
        self.insert(path, source_text);
        self
    }

    /// Returns the number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.read().unwrap().len()
    }

    /// Returns true if no modules are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CodeLoader for StaticLoader {
    async fn load(&self, path: &str) -> Result<ModuleSource, EnvError> {
        let modules = self.modules.read().unwrap();
        modules
            .get(path)
            .map(|text| ModuleSource::new(path, text.clone()))
            .ok_or_else(|| EnvError::not_found(path))
    }
}

/// Loader that reads modules from files under a root directory.
///
/// The logical path `entries/alice` maps to `<root>/entries/alice`.
/// Absolute paths and `..` components are rejected.
#[derive(Debug, Clone)]
pub struct FsLoader {
    root: PathBuf,
}

impl FsLoader {
    /// Creates a loader rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, EnvError> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !safe {
            return Err(EnvError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl CodeLoader for FsLoader {
    async fn load(&self, path: &str) -> Result<ModuleSource, EnvError> {
        let file = self.resolve(path)?;
        match tokio::fs::read_to_string(&file).await {
            Ok(text) => Ok(ModuleSource::new(path, text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EnvError::not_found(path)),
            Err(e) => Err(EnvError::Io(e)),
        }
    }
}
