//! Recursive bracket definitions.
//!
//! A bracket is a tree of [`BracketNode`]s. Leaves play a single game;
//! composites split their participants into subsets, run their child once
//! per subset with a derived seed, and fold the child results with a
//! [`Scorer`]:
//!
//! ```text
//!   Composite(Combinations{2}, WinCount)          seed T...
//!     ├── Leaf [A, B]                             seed G... (1st derived)
//!     ├── Leaf [A, C]                             seed G... (2nd derived)
//!     └── Leaf [B, C]                             seed G... (3rd derived)
//! ```
//!
//! Child seeds are derived in enumeration order before any child starts,
//! so the seed tree depends only on the root seed and the definition,
//! never on which child finishes first.

use crate::gauntlet_seed::{Seed, SeedError, SeedGenerator, SeedKind};
use crate::gauntlet_unit::UnitError;
use crate::results::{MatchResult, Participant, ParticipantResult, ProgressReport, ProgressSink};

use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Failures of a single game.
#[derive(Debug, Error)]
pub enum GameError {
    /// The unit running the game crashed or was killed
    #[error("unit failed: {0}")]
    UnitFailed(String),

    #[error(transparent)]
    Unit(#[from] UnitError),

    /// The game ended without a readable result
    #[error("no result: {0}")]
    NoResult(String),

    #[error("invalid game setup: {0}")]
    Setup(String),
}

/// Failures anywhere in a bracket.
#[derive(Debug, Error)]
pub enum BracketError {
    /// A child run failed; `index` is its position in the enumeration
    #[error("branch {index} (seed {seed}): {source}")]
    Branch {
        index: usize,
        seed: Seed,
        #[source]
        source: Box<BracketError>,
    },

    #[error("game {seed} failed: {source}")]
    Game {
        seed: Seed,
        #[source]
        source: GameError,
    },

    #[error(transparent)]
    Seed(#[from] SeedError),

    #[error("{combiner} produced no subsets for {participants} participants")]
    EmptyCombination { combiner: String, participants: usize },
}

impl BracketError {
    /// Branch indices from the root down to the failing game.
    pub fn path(&self) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = self;
        while let BracketError::Branch { index, source, .. } = current {
            path.push(*index);
            current = source.as_ref();
        }
        path
    }

    /// Seed of the innermost failing node, if known.
    pub fn failing_seed(&self) -> Option<&Seed> {
        match self {
            BracketError::Branch { source, seed, .. } => source.failing_seed().or(Some(seed)),
            BracketError::Game { seed, .. } => Some(seed),
            _ => None,
        }
    }
}

// =============================================================================
// SEAMS
// =============================================================================

/// Plays one game for a leaf.
#[async_trait]
pub trait GameRunner: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run_game(
        &self,
        seed: &Seed,
        participants: &[Participant],
        progress: ProgressSink,
    ) -> Result<MatchResult, GameError>;
}

/// Splits a participant list into ordered subsets.
pub trait Combiner: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Must be a pure function of `participants` (order included).
    fn combine(&self, participants: &[Participant]) -> Vec<Vec<Participant>>;
}

/// Folds child results into one result for the node's participants.
pub trait Scorer: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// `child_results` may be partial while a node is still running.
    fn score(&self, participants: &[Participant], child_results: &[MatchResult]) -> MatchResult;
}

// =============================================================================
// COMBINERS
// =============================================================================

/// Every `size`-subset, in lexicographic order of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combinations {
    pub size: usize,
}

impl Combiner for Combinations {
    fn name(&self) -> &str {
        "combinations"
    }

    fn combine(&self, participants: &[Participant]) -> Vec<Vec<Participant>> {
        let mut out = Vec::new();
        let mut chosen = Vec::with_capacity(self.size);
        choose(participants, self.size, &mut chosen, &mut out);
        out
    }
}

fn choose(rest: &[Participant], k: usize, chosen: &mut Vec<Participant>, out: &mut Vec<Vec<Participant>>) {
    if k == 0 {
        out.push(chosen.clone());
        return;
    }
    if rest.len() < k {
        return;
    }
    for (i, first) in rest.iter().enumerate() {
        if rest.len() - i < k {
            break;
        }
        chosen.push(first.clone());
        choose(&rest[i + 1..], k - 1, chosen, out);
        chosen.pop();
    }
}

/// The full participant set, `times` times (best-of-N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repeat {
    pub times: usize,
}

impl Combiner for Repeat {
    fn name(&self) -> &str {
        "repeat"
    }

    fn combine(&self, participants: &[Participant]) -> Vec<Vec<Participant>> {
        vec![participants.to_vec(); self.times]
    }
}

/// The full participant set once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Everyone;

impl Combiner for Everyone {
    fn name(&self) -> &str {
        "everyone"
    }

    fn combine(&self, participants: &[Participant]) -> Vec<Vec<Participant>> {
        vec![participants.to_vec()]
    }
}

// =============================================================================
// SCORERS
// =============================================================================

/// Collects each participant's records from the child results.
fn gather(participants: &[Participant], child_results: &[MatchResult]) -> Vec<(Participant, Vec<ParticipantResult>)> {
    participants
        .iter()
        .map(|p| {
            let records = child_results.iter().filter_map(|r| r.get(&p.id).cloned()).collect();
            (p.clone(), records)
        })
        .collect()
}

/// Sum of child scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct TotalScore;

impl Scorer for TotalScore {
    fn name(&self) -> &str {
        "total_score"
    }

    fn score(&self, participants: &[Participant], child_results: &[MatchResult]) -> MatchResult {
        let records = gather(participants, child_results)
            .into_iter()
            .map(|(p, nested)| {
                let mut record = ParticipantResult::new(p.id, nested.iter().map(|r| r.score).sum());
                record.nested_results = nested;
                record
            })
            .collect();
        MatchResult::ranked(records)
    }
}

/// Number of child wins, ties broken by total score.
#[derive(Debug, Clone, Copy, Default)]
pub struct WinCount;

impl Scorer for WinCount {
    fn name(&self) -> &str {
        "win_count"
    }

    fn score(&self, participants: &[Participant], child_results: &[MatchResult]) -> MatchResult {
        let mut records: Vec<ParticipantResult> = gather(participants, child_results)
            .into_iter()
            .map(|(p, nested)| {
                let wins = nested.iter().filter(|r| r.winner).count();
                let total: f64 = nested.iter().map(|r| r.score).sum();
                let mut record = ParticipantResult::new(p.id, wins as f64).with_field("total_score", total);
                record.nested_results = nested;
                record
            })
            .collect();

        let key = |r: &ParticipantResult| (r.score, r.fields.get("total_score").and_then(|v| v.as_f64()).unwrap_or(0.0));
        records.sort_by(|a, b| key(b).partial_cmp(&key(a)).unwrap_or(Ordering::Equal));
        let top = records.first().map(key);
        for record in records.iter_mut() {
            record.winner = Some(key(record)) == top;
        }
        MatchResult { participants: records }
    }
}

// =============================================================================
// NODES
// =============================================================================

/// One level of a bracket.
#[derive(Clone)]
pub enum BracketNode {
    Leaf {
        game: Arc<dyn GameRunner>,
    },
    Composite {
        child: Arc<BracketNode>,
        combiner: Arc<dyn Combiner>,
        scorer: Arc<dyn Scorer>,
    },
}

/// The subset a composite would pick for a preview.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchPreview {
    pub index: usize,
    pub seed: Seed,
    pub participants: Vec<Participant>,
}

/// A representative game reached by following previews down to a leaf.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GamePreview {
    /// Branch index chosen at each composite level
    pub path: Vec<usize>,
    pub seed: Seed,
    pub participants: Vec<Participant>,
}

impl std::fmt::Debug for BracketNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BracketNode::Leaf { game } => write!(f, "Leaf({})", game.name()),
            BracketNode::Composite { child, combiner, scorer } => {
                write!(f, "Composite({}, {}, {:?})", combiner.name(), scorer.name(), child)
            }
        }
    }
}

impl BracketNode {
    pub fn leaf(game: Arc<dyn GameRunner>) -> Self {
        BracketNode::Leaf { game }
    }

    pub fn composite(child: BracketNode, combiner: impl Combiner, scorer: impl Scorer) -> Self {
        BracketNode::Composite {
            child: Arc::new(child),
            combiner: Arc::new(combiner),
            scorer: Arc::new(scorer),
        }
    }

    /// Seed kind used when a parent derives a seed for this node.
    pub fn seed_kind(&self) -> SeedKind {
        match self {
            BracketNode::Leaf { .. } => SeedKind::GAME,
            BracketNode::Composite { .. } => SeedKind::MATCH,
        }
    }

    /// Number of levels down to (and including) the leaf.
    pub fn depth(&self) -> usize {
        match self {
            BracketNode::Leaf { .. } => 1,
            BracketNode::Composite { child, .. } => 1 + child.depth(),
        }
    }

    /// Runs this node. Progress is reported through `progress` and ends
    /// with a complete report carrying the final result.
    pub fn run<'a>(
        &'a self,
        seed: Seed,
        participants: &'a [Participant],
        progress: ProgressSink,
    ) -> BoxFuture<'a, Result<MatchResult, BracketError>> {
        async move {
            match self {
                BracketNode::Leaf { game } => {
                    debug!(%seed, game = %game.name(), players = participants.len(), "Leaf started");
                    let result = game
                        .run_game(&seed, participants, progress.clone())
                        .await
                        .map_err(|source| BracketError::Game {
                            seed: seed.clone(),
                            source,
                        })?;
                    progress.report(ProgressReport::complete(result.clone()));
                    Ok(result)
                }
                BracketNode::Composite { child, combiner, scorer } => {
                    let subsets = self.enumerate(participants)?;
                    let mut generator = SeedGenerator::new(&seed);
                    let seeds: Vec<Seed> = subsets.iter().map(|_| generator.derive_seed(child.seed_kind())).collect();

                    if subsets.len() == 1 && subsets[0].as_slice() == participants {
                        debug!(%seed, combiner = %combiner.name(), "Single subset; running child directly");
                        let child_seed = seeds[0].clone();
                        return child
                            .run(child_seed.clone(), participants, progress)
                            .await
                            .map_err(|source| BracketError::Branch {
                                index: 0,
                                seed: child_seed,
                                source: Box::new(source),
                            });
                    }

                    debug!(%seed, combiner = %combiner.name(), branches = subsets.len(), "Fan-out");
                    let fan_in = FanIn::new(participants, Arc::clone(scorer), subsets.len(), progress.clone());
                    let runs = subsets.iter().zip(seeds).enumerate().map(|(index, (subset, child_seed))| {
                        let sink = fan_in.child_sink(index);
                        async move {
                            child
                                .run(child_seed.clone(), subset, sink)
                                .await
                                .map_err(|source| BracketError::Branch {
                                    index,
                                    seed: child_seed,
                                    source: Box::new(source),
                                })
                        }
                    });
                    let results = try_join_all(runs).await?;

                    let result = scorer.score(participants, &results);
                    progress.report(ProgressReport::complete(result.clone()));
                    Ok(result)
                }
            }
        }
        .boxed()
    }

    /// Picks one branch uniformly with the node's seed generator, without
    /// running anything. `None` for leaves.
    pub fn preview_random_branch(
        &self,
        seed: &Seed,
        participants: &[Participant],
    ) -> Result<Option<BranchPreview>, BracketError> {
        let BracketNode::Composite { child, .. } = self else {
            return Ok(None);
        };
        let mut subsets = self.enumerate(participants)?;
        let mut generator = SeedGenerator::new(seed);
        let mut seeds: Vec<Seed> = subsets.iter().map(|_| generator.derive_seed(child.seed_kind())).collect();
        let index = generator.next_below(subsets.len() as u32) as usize;
        Ok(Some(BranchPreview {
            index,
            seed: seeds.swap_remove(index),
            participants: subsets.swap_remove(index),
        }))
    }

    /// Follows branch previews down to a leaf.
    pub fn preview_random_game(&self, seed: &Seed, participants: &[Participant]) -> Result<GamePreview, BracketError> {
        let mut node = self;
        let mut preview = GamePreview {
            path: Vec::new(),
            seed: seed.clone(),
            participants: participants.to_vec(),
        };
        while let BracketNode::Composite { child, .. } = node {
            if let Some(branch) = node.preview_random_branch(&preview.seed, &preview.participants)? {
                preview.path.push(branch.index);
                preview.seed = branch.seed;
                preview.participants = branch.participants;
            }
            node = child.as_ref();
        }
        Ok(preview)
    }

    fn enumerate(&self, participants: &[Participant]) -> Result<Vec<Vec<Participant>>, BracketError> {
        match self {
            BracketNode::Leaf { .. } => Ok(vec![participants.to_vec()]),
            BracketNode::Composite { combiner, .. } => {
                let subsets = combiner.combine(participants);
                if subsets.is_empty() {
                    return Err(BracketError::EmptyCombination {
                        combiner: combiner.name().to_string(),
                        participants: participants.len(),
                    });
                }
                Ok(subsets)
            }
        }
    }
}

/// Per-composite progress aggregation.
struct FanIn {
    participants: Vec<Participant>,
    scorer: Arc<dyn Scorer>,
    parent: ProgressSink,
    slots: Arc<Mutex<Vec<(f64, Option<MatchResult>)>>>,
}

impl FanIn {
    fn new(participants: &[Participant], scorer: Arc<dyn Scorer>, children: usize, parent: ProgressSink) -> Self {
        Self {
            participants: participants.to_vec(),
            scorer,
            parent,
            slots: Arc::new(Mutex::new(vec![(0.0, None); children])),
        }
    }

    /// Sink for child `index`: folds its report into the parent's view.
    fn child_sink(&self, index: usize) -> ProgressSink {
        let participants = self.participants.clone();
        let scorer = Arc::clone(&self.scorer);
        let parent = self.parent.clone();
        let slots = Arc::clone(&self.slots);

        ProgressSink::new(move |report: ProgressReport| {
            let (fraction, partial) = {
                let mut slots = slots.lock().unwrap();
                let slot = &mut slots[index];
                slot.0 = slot.0.max(report.fraction);
                if report.aggregated.is_some() {
                    slot.1 = report.aggregated;
                }
                let fraction = slots.iter().map(|(f, _)| f).sum::<f64>() / slots.len() as f64;
                let partial: Vec<MatchResult> = slots.iter().filter_map(|(_, r)| r.clone()).collect();
                (fraction, partial)
            };
            let aggregated = (!partial.is_empty()).then(|| scorer.score(&participants, &partial));
            parent.report(ProgressReport::new(fraction, aggregated));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores each player by a seed-derived number; fails for `poison`.
    struct SeededGame {
        poison: Option<String>,
        played: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    }

    impl SeededGame {
        fn new() -> Self {
            Self {
                poison: None,
                played: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl GameRunner for SeededGame {
        fn name(&self) -> &str {
            "seeded"
        }

        async fn run_game(
            &self,
            seed: &Seed,
            participants: &[Participant],
            progress: ProgressSink,
        ) -> Result<MatchResult, GameError> {
            let ids: Vec<String> = participants.iter().map(|p| p.id.clone()).collect();
            self.played.lock().unwrap().push((seed.to_string(), ids.clone()));
            if let Some(poison) = &self.poison {
                if ids.contains(poison) {
                    return Err(GameError::NoResult(format!("{poison} poisoned the game")));
                }
            }
            progress.report(ProgressReport::new(0.5, None));

            let mut rng = SeedGenerator::new(seed);
            let records = ids
                .into_iter()
                .map(|id| ParticipantResult::new(id, rng.next_below(100) as f64))
                .collect();
            Ok(MatchResult::ranked(records))
        }
    }

    fn players(ids: &[&str]) -> Vec<Participant> {
        ids.iter().map(|id| Participant::new(*id, format!("entries/{id}"))).collect()
    }

    fn root() -> Seed {
        Seed::from_words(SeedKind::TOURNAMENT, [11, 22, 33, 44])
    }

    #[test]
    fn test_combinations_enumeration_order() {
        let subsets = Combinations { size: 2 }.combine(&players(&["A", "B", "C"]));
        let ids: Vec<Vec<&str>> = subsets
            .iter()
            .map(|s| s.iter().map(|p| p.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["A", "B"], vec!["A", "C"], vec!["B", "C"]]);

        assert_eq!(Combinations { size: 3 }.combine(&players(&["A", "B", "C", "D"])).len(), 4);
        assert!(Combinations { size: 4 }.combine(&players(&["A", "B"])).is_empty());
    }

    #[tokio::test]
    async fn test_child_seeds_follow_enumeration_and_repeat() {
        let game = Arc::new(SeededGame::new());
        let played = Arc::clone(&game.played);
        let bracket = BracketNode::composite(BracketNode::leaf(game), Combinations { size: 2 }, WinCount);
        let participants = players(&["A", "B", "C"]);

        let first = bracket.run(root(), &participants, ProgressSink::noop()).await.unwrap();
        let mut first_runs = played.lock().unwrap().drain(..).collect::<Vec<_>>();
        let second = bracket.run(root(), &participants, ProgressSink::noop()).await.unwrap();
        let mut second_runs = played.lock().unwrap().drain(..).collect::<Vec<_>>();

        assert_eq!(first, second);

        let mut generator = SeedGenerator::new(&root());
        let expected: Vec<(String, Vec<String>)> = [["A", "B"], ["A", "C"], ["B", "C"]]
            .iter()
            .map(|pair| {
                (
                    generator.derive_seed(SeedKind::GAME).to_string(),
                    pair.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect();
        // Completion order is not guaranteed; the seed for each subset is.
        first_runs.sort();
        second_runs.sort();
        let mut expected_sorted = expected.clone();
        expected_sorted.sort();
        assert_eq!(first_runs, expected_sorted);
        assert_eq!(second_runs, expected_sorted);
        assert!(expected.iter().all(|(seed, _)| seed.starts_with('G')));
    }

    #[tokio::test]
    async fn test_scorers_nest_child_records() {
        let game = Arc::new(SeededGame::new());
        let bracket = BracketNode::composite(BracketNode::leaf(game), Repeat { times: 3 }, TotalScore);
        let participants = players(&["A", "B"]);

        let result = bracket.run(root(), &participants, ProgressSink::noop()).await.unwrap();
        assert_eq!(result.len(), 2);
        for record in &result.participants {
            assert_eq!(record.nested_results.len(), 3);
            let sum: f64 = record.nested_results.iter().map(|r| r.score).sum();
            assert_eq!(record.score, sum);
        }
        assert!(result.participants[0].winner);
    }

    #[test]
    fn test_win_count_breaks_ties_by_total() {
        let participants = players(&["A", "B"]);
        let child = |a: f64, b: f64| {
            MatchResult::ranked(vec![ParticipantResult::new("A", a), ParticipantResult::new("B", b)])
        };
        let result = WinCount.score(&participants, &[child(10.0, 1.0), child(1.0, 20.0)]);

        assert_eq!(result.participants[0].id, "B");
        assert_eq!(result.participants[0].score, 1.0);
        assert_eq!(result.winners(), vec!["B"]);
    }

    #[tokio::test]
    async fn test_degenerate_composite_runs_child_directly() {
        let game = Arc::new(SeededGame::new());
        let played = Arc::clone(&game.played);
        let bracket = BracketNode::composite(BracketNode::leaf(game.clone()), Everyone, TotalScore);
        let participants = players(&["A", "B"]);

        let via_composite = bracket.run(root(), &participants, ProgressSink::noop()).await.unwrap();

        let mut generator = SeedGenerator::new(&root());
        let child_seed = generator.derive_seed(SeedKind::GAME);
        let direct = game.run_game(&child_seed, &participants, ProgressSink::noop()).await.unwrap();

        assert_eq!(via_composite, direct);
        assert_eq!(played.lock().unwrap().len(), 2);
        assert!(via_composite.participants.iter().all(|p| p.nested_results.is_empty()));
    }

    #[tokio::test]
    async fn test_failure_names_branch_path() {
        let mut game = SeededGame::new();
        game.poison = Some("C".into());
        let inner = BracketNode::composite(BracketNode::leaf(Arc::new(game)), Combinations { size: 2 }, WinCount);
        let bracket = BracketNode::composite(inner, Repeat { times: 2 }, TotalScore);

        let err = bracket
            .run(root(), &players(&["A", "B", "C"]), ProgressSink::noop())
            .await
            .unwrap_err();

        let path = err.path();
        assert_eq!(path.len(), 2);
        assert!(path[1] == 1 || path[1] == 2, "only subsets containing C fail: {path:?}");
        assert!(err.failing_seed().unwrap().as_str().starts_with('G'));
        assert!(err.to_string().contains("poisoned"));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_completes() {
        let bracket = BracketNode::composite(
            BracketNode::leaf(Arc::new(SeededGame::new())),
            Combinations { size: 2 },
            WinCount,
        );
        let (sink, mut rx) = ProgressSink::channel();
        let result = bracket.run(root(), &players(&["A", "B", "C", "D"]), sink).await.unwrap();

        let mut last = 0.0;
        let mut reports = 0;
        while let Ok(report) = rx.try_recv() {
            assert!(report.fraction >= last);
            last = report.fraction;
            reports += 1;
            if let Some(aggregated) = &report.aggregated {
                assert_eq!(aggregated.len(), 4);
            }
        }
        assert!(reports > 6);
        assert_eq!(last, 1.0);
        assert_eq!(result.winners().len(), result.participants.iter().filter(|p| p.winner).count());
    }

    #[test]
    fn test_preview_is_deterministic_and_matches_run_seeds() {
        let bracket = BracketNode::composite(
            BracketNode::composite(BracketNode::leaf(Arc::new(SeededGame::new())), Combinations { size: 2 }, WinCount),
            Repeat { times: 3 },
            TotalScore,
        );
        let participants = players(&["A", "B", "C"]);

        let a = bracket.preview_random_game(&root(), &participants).unwrap();
        let b = bracket.preview_random_game(&root(), &participants).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.path.len(), 2);
        assert_eq!(a.participants.len(), 2);
        assert!(a.seed.as_str().starts_with('G'));

        let top = bracket.preview_random_branch(&root(), &participants).unwrap().unwrap();
        let mut generator = SeedGenerator::new(&root());
        let seeds: Vec<Seed> = (0..3).map(|_| generator.derive_seed(SeedKind::MATCH)).collect();
        assert_eq!(top.seed, seeds[top.index]);
    }

    #[tokio::test]
    async fn test_empty_combination_is_an_error() {
        let bracket = BracketNode::composite(
            BracketNode::leaf(Arc::new(SeededGame::new())),
            Combinations { size: 5 },
            TotalScore,
        );
        let err = bracket
            .run(root(), &players(&["A", "B"]), ProgressSink::noop())
            .await
            .unwrap_err();
        assert!(matches!(err, BracketError::EmptyCombination { participants: 2, .. }));
    }
}
