//! Bracket leaves backed by execution units.
//!
//! [`UnitGame`] plays one game per call: it checks a unit out of the pool
//! with the participants' entry modules as initial dependencies, sends
//! BEGIN, then STEP batches until a complete snapshot reads as a finished
//! game, and finally returns the unit to the pool.

use crate::gauntlet_bracket::{GameError, GameRunner};
use crate::gauntlet_protocol::{Inbound, Outbound};
use crate::gauntlet_seed::Seed;
use crate::gauntlet_step::{GameDefinition, StepPlan, StepProgram};
use crate::gauntlet_unit::ExecutionUnit;
use crate::mailbox::Subscription;
use crate::results::{MatchResult, Participant, ProgressReport, ProgressSink};
use crate::unit_pool::PoolManager;

use async_trait::async_trait;
use gauntlet_env::GauntletContext;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// A [`GameRunner`] that plays each game inside a pooled unit.
pub struct UnitGame<C: GauntletContext> {
    pool: PoolManager<C>,
    game: Arc<dyn GameDefinition>,
    plan: StepPlan,
    max_batches: usize,
}

impl<C: GauntletContext> UnitGame<C> {
    pub fn new(pool: PoolManager<C>, game: Arc<dyn GameDefinition>) -> Self {
        Self {
            pool,
            game,
            plan: StepPlan::default(),
            max_batches: 10_000,
        }
    }

    pub fn with_plan(mut self, plan: StepPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Upper bound on STEP batches before the game is declared stuck.
    pub fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = max_batches;
        self
    }

    pub fn pool(&self) -> &PoolManager<C> {
        &self.pool
    }

    async fn drive(
        &self,
        unit: &ExecutionUnit,
        inbox: &mut Subscription<Outbound>,
        seed: &Seed,
        participants: &[Participant],
        progress: &ProgressSink,
    ) -> Result<MatchResult, GameError> {
        unit.post_message(Inbound::Begin {
            config: json!({ "seed": seed, "participants": participants }),
        })?;

        for batch in 0..self.max_batches {
            unit.post_message(self.plan.to_message())?;
            loop {
                match inbox.recv().await {
                    None => return Err(GameError::UnitFailed("unit closed without replying".into())),
                    Some(Outbound::Disconnected { reason }) => return Err(GameError::UnitFailed(reason)),
                    Some(Outbound::StepIncomplete { state }) => {
                        progress.report(ProgressReport::new(self.game.progress(&state), None));
                    }
                    Some(Outbound::StepComplete {
                        state,
                        pause_triggered,
                        elapsed_ms,
                    }) => {
                        if let Some(result) = self.game.result(&state) {
                            debug!(%seed, batches = batch + 1, elapsed_ms, "Game finished");
                            return Ok(result);
                        }
                        if pause_triggered {
                            debug!(%seed, batch, "Game paused; resuming");
                        }
                        progress.report(ProgressReport::new(self.game.progress(&state), None));
                        break;
                    }
                }
            }
        }
        Err(GameError::NoResult(format!(
            "{} not finished after {} batches",
            self.game.name(),
            self.max_batches
        )))
    }
}

#[async_trait]
impl<C: GauntletContext> GameRunner for UnitGame<C> {
    fn name(&self) -> &str {
        self.game.name()
    }

    async fn run_game(
        &self,
        seed: &Seed,
        participants: &[Participant],
        progress: ProgressSink,
    ) -> Result<MatchResult, GameError> {
        let program = Arc::new(StepProgram::new(Arc::clone(self.pool.context()), Arc::clone(&self.game)));
        let entries = participants.iter().map(|p| p.entry.clone()).collect();

        let unit = self.pool.acquire(program, entries)?;
        let mut inbox = unit.add_listener();
        let outcome = self.drive(&unit, &mut inbox, seed, participants, &progress).await;
        let status = self.pool.release(unit).await;

        if let Err(e) = &outcome {
            warn!(%seed, ?status, "Game failed: {e}");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauntlet_bracket::{BracketNode, Combinations, TotalScore};
    use crate::gauntlet_protocol::StepKind;
    use crate::gauntlet_seed::SeedKind;
    use crate::gauntlet_step::{Simulation, SimulationError};
    use crate::results::ParticipantResult;
    use crate::unit_pool::PoolConfig;
    use gauntlet_env::{ModuleSource, StaticLoader, TokioContext};
    use serde_json::Value;

    /// Each entry module holds a number; players add it every frame for
    /// three frames. An entry reading `crash` faults on the first frame;
    /// one reading `slow` adds 1 and makes every frame take 150ms.
    struct Tally {
        ids: Vec<String>,
        values: Vec<Option<i64>>,
        totals: Vec<i64>,
        frame: u64,
        slow: bool,
    }

    impl Simulation for Tally {
        fn state(&self) -> Value {
            json!({ "ids": self.ids, "totals": self.totals, "frame": self.frame })
        }

        fn is_over(&self) -> bool {
            self.frame >= 3
        }

        fn frame(&self) -> u64 {
            self.frame
        }

        fn step(&mut self, _kind: StepKind) -> Result<(), SimulationError> {
            for (total, value) in self.totals.iter_mut().zip(&self.values) {
                *total += value.ok_or_else(|| SimulationError::fault("entry crashed"))?;
            }
            if self.slow {
                std::thread::sleep(std::time::Duration::from_millis(150));
            }
            self.frame += 1;
            Ok(())
        }

        fn update_config(&mut self, _config: Value) -> Result<(), SimulationError> {
            Ok(())
        }

        fn update_entry(&mut self, _entry: Value) -> Result<(), SimulationError> {
            Ok(())
        }
    }

    struct TallyGame;

    impl GameDefinition for TallyGame {
        fn name(&self) -> &str {
            "tally"
        }

        fn create(&self, config: &Value, modules: &[ModuleSource]) -> Result<Box<dyn Simulation>, SimulationError> {
            let participants: Vec<Participant> =
                serde_json::from_value(config["participants"].clone()).map_err(SimulationError::fault)?;
            Ok(Box::new(Tally {
                ids: participants.into_iter().map(|p| p.id).collect(),
                values: modules
                    .iter()
                    .map(|m| match m.source_text.trim() {
                        "slow" => Some(1),
                        text => text.parse().ok(),
                    })
                    .collect(),
                totals: vec![0; modules.len()],
                frame: 0,
                slow: modules.iter().any(|m| m.source_text.trim() == "slow"),
            }))
        }

        fn result(&self, state: &Value) -> Option<MatchResult> {
            if state["frame"].as_u64()? < 3 {
                return None;
            }
            let ids = state["ids"].as_array()?;
            let totals = state["totals"].as_array()?;
            let records = ids
                .iter()
                .zip(totals)
                .map(|(id, total)| ParticipantResult::new(id.as_str().unwrap_or_default(), total.as_f64().unwrap_or(0.0)))
                .collect();
            Some(MatchResult::ranked(records))
        }

        fn progress(&self, state: &Value) -> f64 {
            state["frame"].as_f64().unwrap_or(0.0) / 3.0
        }
    }

    fn setup() -> UnitGame<TokioContext> {
        let loader = StaticLoader::new()
            .with_module("entries/low", "2")
            .with_module("entries/high", "5")
            .with_module("entries/broken", "crash")
            .with_module("entries/slow", "slow");
        let pool = PoolManager::new(TokioContext::shared(), Arc::new(loader), PoolConfig::default()).unwrap();
        UnitGame::new(pool, Arc::new(TallyGame)).with_plan(StepPlan::default().with_steps(1))
    }

    fn seed() -> Seed {
        Seed::from_words(SeedKind::GAME, [5, 6, 7, 8])
    }

    #[tokio::test]
    async fn test_game_plays_to_result_and_recycles_unit() {
        let game = setup();
        let participants = vec![Participant::new("a", "entries/low"), Participant::new("b", "entries/high")];
        let (sink, mut rx) = ProgressSink::channel();

        let result = game.run_game(&seed(), &participants, sink).await.unwrap();

        assert_eq!(result.winners(), vec!["b"]);
        assert_eq!(result.get("a").unwrap().score, 6.0);
        assert_eq!(result.get("b").unwrap().score, 15.0);

        // One batch per frame; the last one carries the result instead.
        let fractions: Vec<f64> = std::iter::from_fn(|| rx.try_recv().ok()).map(|r| r.fraction).collect();
        assert_eq!(fractions.len(), 2);

        let stats = game.pool().stats();
        assert_eq!((stats.active, stats.recycled, stats.discarded), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_fault_in_unit_fails_game_and_discards_worker() {
        let game = setup();
        let participants = vec![Participant::new("a", "entries/low"), Participant::new("x", "entries/broken")];

        let err = game.run_game(&seed(), &participants, ProgressSink::noop()).await.unwrap_err();
        assert!(matches!(err, GameError::UnitFailed(ref r) if r.contains("entry crashed")));

        let stats = game.pool().stats();
        assert_eq!((stats.active, stats.recycled, stats.discarded), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_missing_entry_module_fails_game() {
        let game = setup();
        let participants = vec![Participant::new("a", "entries/nowhere")];

        let err = game.run_game(&seed(), &participants, ProgressSink::noop()).await.unwrap_err();
        assert!(err.to_string().contains("entries/nowhere"));
    }

    #[tokio::test]
    async fn test_failing_branch_leaves_pool_counters_consistent() {
        let game = setup();
        let pool = game.pool().clone();
        let bracket = BracketNode::composite(BracketNode::leaf(Arc::new(game)), Combinations { size: 2 }, TotalScore);
        let participants = vec![
            Participant::new("a", "entries/slow"),
            Participant::new("b", "entries/slow"),
            Participant::new("x", "entries/broken"),
        ];

        // (a, b) is still playing when the branches with x fail
        let err = bracket
            .run(Seed::from_words(SeedKind::MATCH, [1, 2, 3, 4]), &participants, ProgressSink::noop())
            .await
            .unwrap_err();
        assert!(!err.path().is_empty());

        let stats = pool.stats();
        assert_eq!(stats.active, 0, "{stats:?}");
        assert_eq!(stats.spawned, stats.idle + stats.discarded + stats.active, "{stats:?}");
        assert!(stats.discarded >= 2);
    }
}
