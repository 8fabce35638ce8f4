//! Gauntlet Deterministic Simulation Harness
//!
//! Plays whole tournaments against generated entries inside a controlled
//! environment so runs can be replayed from a single 64-bit seed.
//!
//! # Core Principle: Everything Derives From The Seed
//!
//! - **Entries**: participant strategies are drawn from the seed
//! - **Root seed**: taken from the context's seeded entropy stream
//! - **Games**: every game reseeds its own RNG from its bracket seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        SimWorld                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐  │
//! │  │  SimContext  │   │ StaticLoader │   │  PoolManager │  │
//! │  │ (clock, rng) │   │  (entries)   │   │  (workers)   │  │
//! │  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘  │
//! │         │                  │                  │          │
//! │  ┌──────▼──────────────────▼──────────────────▼───────┐  │
//! │  │ TournamentRunner -> BracketNode -> UnitGame        │  │
//! │  │            (DiceRace / Hoard in units)             │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gauntlet_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::RaceRoundRobin);
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod world;
pub mod games;
pub mod scenarios;
pub mod runner;
pub mod exporter;

pub use context::SimContext;
pub use error::SimError;
pub use world::{SimConfig, SimWorld};
pub use games::{DiceRace, EntryConfig, Hoard};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use exporter::{ProgressFrame, SimExport};
