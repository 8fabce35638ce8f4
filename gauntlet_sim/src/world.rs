//! SimWorld - The simulation harness container.
//!
//! Builds everything one scenario run needs from a [`SimConfig`]: a
//! seeded context, an in-memory module loader holding generated entries,
//! the unit pool, and the bracket for the scenario.

use crate::context::SimContext;
use crate::error::SimError;
use crate::games::{DiceRace, EntryConfig, Hoard};
use crate::scenarios::ScenarioId;

use gauntlet_core::{
    BracketNode, Combinations, Everyone, GameDefinition, Participant, PoolConfig, PoolManager, Repeat, StepPlan,
    TotalScore, TournamentRunner, UnitGame, WinCount,
};
use gauntlet_env::StaticLoader;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of generated participants
    pub participants: usize,

    /// Unit pool sizing
    pub pool: PoolConfig,

    /// STEP parameters sent by every game
    pub plan: StepPlan,

    /// Games per pairing in best-of scenarios
    pub best_of: usize,

    /// DiceRace finishing line
    pub race_target: u32,

    /// Frames between pauses in the pause/resume scenario
    pub pause_every: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            participants: 4,
            pool: PoolConfig::default(),
            plan: StepPlan::default().with_steps(8),
            best_of: 3,
            race_target: 60,
            pause_every: 3,
        }
    }
}

impl SimConfig {
    /// Loads a JSON config; missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_participants(mut self, participants: usize) -> Self {
        self.participants = participants;
        self
    }

    pub fn with_pool_size(mut self, max_idle: usize) -> Self {
        self.pool = self.pool.with_max_idle(max_idle);
        self
    }

    pub fn with_plan(mut self, plan: StepPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Applies command-line values; `None` keeps the configured field.
    pub fn with_overrides(mut self, seed: Option<u64>, participants: Option<usize>, pool_size: Option<usize>) -> Self {
        if let Some(seed) = seed {
            self.seed = seed;
        }
        if let Some(participants) = participants {
            self.participants = participants;
        }
        if let Some(max_idle) = pool_size {
            self = self.with_pool_size(max_idle);
        }
        self
    }
}

/// The SimWorld - container for one scenario run.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock, root-seed entropy)
    pub context: Arc<SimContext>,

    /// Entry modules served to units during their handshake
    pub loader: Arc<StaticLoader>,

    /// Unit pool shared by every game of the run
    pub pool: PoolManager<SimContext>,

    /// Generated participants, in bracket order
    pub participants: Vec<Participant>,
}

impl SimWorld {
    /// Creates a world; participant strategies are drawn from the seed.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        if config.participants < 2 {
            return Err(SimError::Config(format!(
                "need at least 2 participants, got {}",
                config.participants
            )));
        }
        let context = SimContext::shared(config.seed);
        let loader = Arc::new(StaticLoader::new());

        // Entry generation uses its own stream so root-seed entropy is unaffected
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_mul(0x9e3779b97f4a7c15));
        let participants = (0..config.participants)
            .map(|i| {
                let entry = EntryConfig {
                    caution: (rng.gen_range(0..=100) as f64) / 100.0,
                    greed: rng.gen_range(1..=4),
                    fault_after: None,
                };
                let participant = Participant::new(format!("player-{i:02}"), format!("entries/player-{i:02}.json"));
                loader.insert(participant.entry.clone(), entry.to_source());
                participant
            })
            .collect();

        let pool = PoolManager::new(Arc::clone(&context), loader.clone(), config.pool)?;
        debug!(seed = config.seed, participants = config.participants, "World created");

        Ok(Self {
            config,
            context,
            loader,
            pool,
            participants,
        })
    }

    /// Replaces participant `index`'s entry with one that faults on `frame`.
    pub fn sabotage(&mut self, index: usize, frame: u64) -> Option<&Participant> {
        let participant = self.participants.get(index)?;
        let entry = EntryConfig {
            caution: 0.5,
            greed: 2,
            fault_after: Some(frame),
        };
        self.loader.insert(participant.entry.clone(), entry.to_source());
        Some(participant)
    }

    /// A bracket leaf playing `game` in pooled units.
    pub fn leaf(&self, game: impl GameDefinition) -> BracketNode {
        let runner = UnitGame::new(self.pool.clone(), Arc::new(game)).with_plan(self.config.plan);
        BracketNode::leaf(Arc::new(runner))
    }

    /// The bracket a scenario runs.
    pub fn bracket(&self, scenario: ScenarioId) -> BracketNode {
        let race = DiceRace::default().with_target(self.config.race_target);
        match scenario {
            ScenarioId::RaceRoundRobin => {
                BracketNode::composite(self.leaf(race), Combinations { size: 2 }, WinCount)
            }
            ScenarioId::RaceFreeForAll => BracketNode::composite(self.leaf(race), Everyone, TotalScore),
            ScenarioId::HoardBestOf => BracketNode::composite(
                BracketNode::composite(self.leaf(Hoard::default()), Repeat { times: self.config.best_of }, WinCount),
                Combinations { size: 2 },
                WinCount,
            ),
            ScenarioId::CrashIsolation => {
                BracketNode::composite(self.leaf(race), Combinations { size: 2 }, TotalScore)
            }
            ScenarioId::PauseResume => BracketNode::composite(
                self.leaf(race.with_pause_every(self.config.pause_every)),
                Combinations { size: 2 },
                WinCount,
            ),
        }
    }

    pub fn tournament(&self, scenario: ScenarioId) -> TournamentRunner<SimContext> {
        TournamentRunner::new(Arc::clone(&self.context), self.bracket(scenario))
    }
}
