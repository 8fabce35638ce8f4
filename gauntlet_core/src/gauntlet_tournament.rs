//! Tournament entry point.
//!
//! Resolves the root seed, runs the bracket, and turns the per-level
//! progress reports into one stream for the caller.

use crate::gauntlet_bracket::{BracketError, BracketNode, GamePreview};
use crate::gauntlet_seed::{Seed, SeedKind};
use crate::results::{MatchResult, Participant, ProgressReport, ProgressSink};

use gauntlet_env::GauntletContext;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// A finished tournament.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TournamentOutcome {
    /// Root seed; replaying with it reproduces `result`
    pub seed: Seed,
    pub result: MatchResult,
}

/// Runs a bracket definition from a root seed.
pub struct TournamentRunner<C: GauntletContext> {
    ctx: Arc<C>,
    root: Arc<BracketNode>,
}

impl<C: GauntletContext> TournamentRunner<C> {
    pub fn new(ctx: Arc<C>, root: BracketNode) -> Self {
        Self {
            ctx,
            root: Arc::new(root),
        }
    }

    pub fn bracket(&self) -> &BracketNode {
        &self.root
    }

    /// The given seed, or a fresh root seed from the context's entropy.
    pub fn resolve_seed(&self, seed: Option<Seed>) -> Seed {
        seed.unwrap_or_else(|| Seed::from_words(SeedKind::TOURNAMENT, self.ctx.entropy_words()))
    }

    /// Runs the whole bracket.
    ///
    /// `progress` sees a non-decreasing fraction ending at `1.0` on
    /// success, each report carrying the best aggregate known so far.
    pub async fn begin(
        &self,
        seed: Option<Seed>,
        participants: Vec<Participant>,
        progress: ProgressSink,
    ) -> Result<TournamentOutcome, BracketError> {
        let seed = self.resolve_seed(seed);
        info!(%seed, participants = participants.len(), depth = self.root.depth(), "Tournament starting");

        let started = self.ctx.now();
        let high_water = Arc::new(Mutex::new(0.0f64));
        let sink = ProgressSink::new(move |report: ProgressReport| {
            let fraction = {
                let mut seen = high_water.lock().unwrap();
                *seen = seen.max(report.fraction);
                *seen
            };
            progress.report(ProgressReport::new(fraction, report.aggregated));
        });

        match self.root.run(seed.clone(), &participants, sink).await {
            Ok(result) => {
                let elapsed = self.ctx.now().saturating_sub(started);
                info!(
                    %seed,
                    winners = ?result.winners(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Tournament finished"
                );
                Ok(TournamentOutcome { seed, result })
            }
            Err(e) => {
                error!(%seed, path = ?e.path(), "Tournament failed: {e}");
                Err(e)
            }
        }
    }

    /// A representative game of the bracket for `seed`, without running it.
    pub fn preview(&self, seed: &Seed, participants: &[Participant]) -> Result<GamePreview, BracketError> {
        self.root.preview_random_game(seed, participants)
    }
}
