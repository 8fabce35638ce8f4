//! Gauntlet Core - Reproducible Recursive Tournament Engine
//!
//! This library runs competitions between untrusted participant programs:
//! 1. **Seed Tree**: every game's randomness is derived from one root seed via a bit-exact xorshift128+
//! 2. **Execution Units**: each game runs in an isolated worker that loads code only during its handshake
//! 3. **Brackets**: recursive Leaf/Composite trees fan out concurrently and fold results with scorers

pub mod gauntlet_seed;
pub mod gauntlet_protocol;
pub mod gauntlet_unit;
pub mod gauntlet_step;
pub mod gauntlet_bracket;
pub mod gauntlet_tournament;
pub mod game_runtime;
pub mod mailbox;
pub mod results;
pub mod unit_pool;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use gauntlet_seed::{Seed, SeedError, SeedGenerator, SeedKind, SeedSource};
pub use gauntlet_protocol::{Inbound, Outbound, StepKind};
pub use gauntlet_unit::{ExecutionUnit, Handshake, UnitBootstrap, UnitError, UnitProgram, UnitScope, UnitStatus};
pub use gauntlet_step::{GameDefinition, Simulation, SimulationError, StepError, StepPlan, StepProgram, StepRunner};
pub use gauntlet_bracket::{
    BracketError, BracketNode, Combinations, Combiner, Everyone, GameError, GamePreview, GameRunner, Repeat, Scorer,
    TotalScore, WinCount,
};
pub use gauntlet_tournament::{TournamentOutcome, TournamentRunner};
pub use game_runtime::UnitGame;
pub use results::{MatchResult, Participant, ParticipantResult, ProgressReport, ProgressSink};
pub use unit_pool::{PoolConfig, PoolManager, PoolStats, PooledUnit};
