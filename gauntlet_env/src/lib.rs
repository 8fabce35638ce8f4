//! Gauntlet Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the Gauntlet
//! tournament engine to run in both **Production** (tokio) and
//! **Simulation** (virtual clock) environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! Everything that touches the outside world is intercepted:
//! - Time (`now()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Entropy for root seeds (`entropy_words()`)
//! - Code loading for sandboxed units (`CodeLoader`)
//!
//! # Example
//!
//! ```ignore
//! use gauntlet_env::{GauntletContext, CodeLoader, StaticLoader};
//!
//! async fn warm_up<Ctx: GauntletContext>(ctx: &Ctx, loader: &StaticLoader) {
//!     let entry = loader.load("entries/alice").await?;
//!     ctx.sleep(Duration::from_millis(5)).await;
//! }
//! ```

mod context;
mod loader;
mod types;
mod error;
mod tokio_impl;

pub use context::GauntletContext;
pub use loader::{CodeLoader, FsLoader, StaticLoader};
pub use types::{ModuleSource, UnitId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
