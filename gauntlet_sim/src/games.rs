//! Demo games played by the harness.
//!
//! Both games read their players' strategies from the entry modules a
//! unit loads during its handshake (small JSON documents) and draw every
//! random number from a ChaCha8 stream keyed by the game's seed, so a
//! game is a pure function of `(seed, participants, entries)`.

use gauntlet_core::{
    GameDefinition, MatchResult, Participant, ParticipantResult, Seed, Simulation, SimulationError, StepKind,
};
use gauntlet_env::ModuleSource;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Strategy knobs read from an entry module.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    /// DiceRace: 0.0 rolls four dice per turn, 1.0 rolls one
    pub caution: f64,

    /// Hoard: most tokens taken per turn
    pub greed: u32,

    /// Raise a fault when this frame is reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_after: Option<u64>,
}

impl EntryConfig {
    pub fn parse(module: &ModuleSource) -> Result<Self, SimulationError> {
        serde_json::from_str(&module.source_text)
            .map_err(|e| SimulationError::fault(format!("bad entry {}: {e}", module.path)))
    }

    pub fn to_source(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// BEGIN payload sent by `UnitGame`.
#[derive(Debug, Deserialize)]
struct BeginConfig {
    seed: Seed,
    participants: Vec<Participant>,
}

/// ChaCha8 stream keyed by all four seed words.
pub fn game_rng(seed: &Seed) -> ChaCha8Rng {
    let mut key = [0u8; 32];
    for (i, word) in seed.words().iter().enumerate() {
        key[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    ChaCha8Rng::from_seed(key)
}

/// Pairs participants with their entry modules (same order).
fn roster(config: &Value, modules: &[ModuleSource]) -> Result<(ChaCha8Rng, Vec<(String, EntryConfig)>), SimulationError> {
    let begin: BeginConfig = serde_json::from_value(config.clone()).map_err(SimulationError::fault)?;
    if begin.participants.len() != modules.len() {
        return Err(SimulationError::fault(format!(
            "{} participants but {} entry modules",
            begin.participants.len(),
            modules.len()
        )));
    }
    let players = begin
        .participants
        .into_iter()
        .zip(modules)
        .map(|(p, module)| Ok((p.id, EntryConfig::parse(module)?)))
        .collect::<Result<Vec<_>, SimulationError>>()?;
    Ok((game_rng(&begin.seed), players))
}

fn check_faults<'a>(frame: u64, players: impl Iterator<Item = (&'a str, Option<u64>)>) -> Result<(), SimulationError> {
    for (id, fault_after) in players {
        if fault_after.is_some_and(|n| frame >= n) {
            return Err(SimulationError::fault(format!("{id} crashed on frame {frame}")));
        }
    }
    Ok(())
}

// =============================================================================
// DICE RACE
// =============================================================================

/// Push-your-luck race: each turn a player rolls one to four dice and
/// advances by their sum, unless any die shows a one.
#[derive(Debug, Clone, Copy)]
pub struct DiceRace {
    target: u32,
    max_rounds: u64,
    pause_every: Option<u64>,
}

impl Default for DiceRace {
    fn default() -> Self {
        Self {
            target: 60,
            max_rounds: 200,
            pause_every: None,
        }
    }
}

impl DiceRace {
    pub fn with_target(mut self, target: u32) -> Self {
        self.target = target;
        self
    }

    /// Raise the pause condition every `n` frames.
    pub fn with_pause_every(mut self, n: u64) -> Self {
        self.pause_every = Some(n).filter(|n| *n > 0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceRecord {
    pub id: String,
    pub position: u32,
    pub busts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceState {
    pub frame: u64,
    pub target: u32,
    pub over: bool,
    pub players: Vec<RaceRecord>,
}

struct RaceSim {
    rules: DiceRace,
    rng: ChaCha8Rng,
    entries: Vec<EntryConfig>,
    players: Vec<RaceRecord>,
    frame: u64,
    turn: usize,
}

impl RaceSim {
    fn take_turn(&mut self, index: usize) {
        let caution = self.entries[index].caution.clamp(0.0, 1.0);
        let dice = 1 + ((1.0 - caution) * 3.0).round() as usize;
        let rolls: Vec<u32> = (0..dice).map(|_| self.rng.gen_range(1..=6)).collect();
        let player = &mut self.players[index];
        if rolls.contains(&1) {
            player.busts += 1;
        } else {
            player.position += rolls.iter().sum::<u32>();
        }
    }

    fn snapshot(&self) -> RaceState {
        RaceState {
            frame: self.frame,
            target: self.rules.target,
            over: self.is_over(),
            players: self.players.clone(),
        }
    }
}

impl Simulation for RaceSim {
    fn state(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or(Value::Null)
    }

    fn is_over(&self) -> bool {
        self.frame >= self.rules.max_rounds || self.players.iter().any(|p| p.position >= self.rules.target)
    }

    fn frame(&self) -> u64 {
        self.frame
    }

    fn step(&mut self, kind: StepKind) -> Result<(), SimulationError> {
        check_faults(
            self.frame + 1,
            self.players.iter().zip(&self.entries).map(|(p, e)| (p.id.as_str(), e.fault_after)),
        )?;
        match kind {
            StepKind::All => {
                for index in 0..self.players.len() {
                    self.take_turn(index);
                }
            }
            StepKind::Single => {
                self.take_turn(self.turn);
                self.turn = (self.turn + 1) % self.players.len();
            }
        }
        self.frame += 1;

        if !self.is_over() && self.rules.pause_every.is_some_and(|n| self.frame % n == 0) {
            return Err(SimulationError::Pause);
        }
        Ok(())
    }

    fn update_config(&mut self, config: Value) -> Result<(), SimulationError> {
        let target = config["target"]
            .as_u64()
            .ok_or_else(|| SimulationError::fault("config update needs a numeric target"))?;
        self.rules.target = target as u32;
        Ok(())
    }

    fn update_entry(&mut self, entry: Value) -> Result<(), SimulationError> {
        let id = entry["id"].as_str().unwrap_or_default();
        let index = self
            .players
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| SimulationError::fault(format!("no player {id}")))?;
        self.entries[index] = serde_json::from_value(entry["entry"].clone()).map_err(SimulationError::fault)?;
        Ok(())
    }
}

impl GameDefinition for DiceRace {
    fn name(&self) -> &str {
        "dice_race"
    }

    fn create(&self, config: &Value, modules: &[ModuleSource]) -> Result<Box<dyn Simulation>, SimulationError> {
        let (rng, roster) = roster(config, modules)?;
        if roster.is_empty() {
            return Err(SimulationError::fault("a race needs at least one player"));
        }
        let (ids, entries): (Vec<String>, Vec<EntryConfig>) = roster.into_iter().unzip();
        Ok(Box::new(RaceSim {
            rules: *self,
            rng,
            entries,
            players: ids
                .into_iter()
                .map(|id| RaceRecord {
                    id,
                    position: 0,
                    busts: 0,
                })
                .collect(),
            frame: 0,
            turn: 0,
        }))
    }

    fn result(&self, state: &Value) -> Option<MatchResult> {
        let state: RaceState = serde_json::from_value(state.clone()).ok()?;
        if !state.over {
            return None;
        }
        let records = state
            .players
            .into_iter()
            .map(|p| ParticipantResult::new(p.id, p.position as f64).with_field("busts", p.busts))
            .collect();
        Some(MatchResult::ranked(records))
    }

    fn progress(&self, state: &Value) -> f64 {
        let Ok(state) = serde_json::from_value::<RaceState>(state.clone()) else {
            return 0.0;
        };
        let leader = state.players.iter().map(|p| p.position).max().unwrap_or(0);
        let by_distance = leader as f64 / state.target.max(1) as f64;
        let by_rounds = state.frame as f64 / self.max_rounds.max(1) as f64;
        by_distance.max(by_rounds).min(1.0)
    }
}

// =============================================================================
// HOARD
// =============================================================================

/// Take-away game: players draw tokens from a shared pile in turn; taking
/// the last token costs a penalty.
#[derive(Debug, Clone, Copy)]
pub struct Hoard {
    min_pile: u32,
    max_pile: u32,
    last_token_penalty: f64,
}

impl Default for Hoard {
    fn default() -> Self {
        Self {
            min_pile: 20,
            max_pile: 40,
            last_token_penalty: 5.0,
        }
    }
}

impl Hoard {
    pub fn with_pile(mut self, min: u32, max: u32) -> Self {
        self.min_pile = min.max(1);
        self.max_pile = max.max(self.min_pile);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoardRecord {
    pub id: String,
    pub hoard: u32,
    pub took_last: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoardState {
    pub frame: u64,
    pub initial_pile: u32,
    pub pile: u32,
    pub penalty: f64,
    pub players: Vec<HoardRecord>,
}

struct HoardSim {
    rng: ChaCha8Rng,
    entries: Vec<EntryConfig>,
    state: HoardState,
    turn: usize,
}

impl HoardSim {
    fn take_turn(&mut self) {
        if self.state.pile == 0 {
            return;
        }
        let index = self.turn;
        self.turn = (self.turn + 1) % self.state.players.len();

        let greed = self.entries[index].greed.clamp(1, 5);
        let take = self.rng.gen_range(1..=greed).min(self.state.pile);
        self.state.pile -= take;
        let player = &mut self.state.players[index];
        player.hoard += take;
        player.took_last = self.state.pile == 0;
    }
}

impl Simulation for HoardSim {
    fn state(&self) -> Value {
        serde_json::to_value(&self.state).unwrap_or(Value::Null)
    }

    fn is_over(&self) -> bool {
        self.state.pile == 0
    }

    fn frame(&self) -> u64 {
        self.state.frame
    }

    fn step(&mut self, kind: StepKind) -> Result<(), SimulationError> {
        check_faults(
            self.state.frame + 1,
            self.state.players.iter().zip(&self.entries).map(|(p, e)| (p.id.as_str(), e.fault_after)),
        )?;
        let turns = match kind {
            StepKind::Single => 1,
            StepKind::All => self.state.players.len(),
        };
        for _ in 0..turns {
            self.take_turn();
        }
        self.state.frame += 1;
        Ok(())
    }

    fn update_config(&mut self, config: Value) -> Result<(), SimulationError> {
        if let Some(penalty) = config["penalty"].as_f64() {
            self.state.penalty = penalty;
        }
        Ok(())
    }

    fn update_entry(&mut self, _entry: Value) -> Result<(), SimulationError> {
        Err(SimulationError::fault("hoard entries are fixed once the pile is dealt"))
    }
}

impl GameDefinition for Hoard {
    fn name(&self) -> &str {
        "hoard"
    }

    fn create(&self, config: &Value, modules: &[ModuleSource]) -> Result<Box<dyn Simulation>, SimulationError> {
        let (mut rng, roster) = roster(config, modules)?;
        if roster.is_empty() {
            return Err(SimulationError::fault("hoard needs at least one player"));
        }
        let pile = rng.gen_range(self.min_pile..=self.max_pile);
        let (ids, entries): (Vec<String>, Vec<EntryConfig>) = roster.into_iter().unzip();
        Ok(Box::new(HoardSim {
            rng,
            entries,
            state: HoardState {
                frame: 0,
                initial_pile: pile,
                pile,
                penalty: self.last_token_penalty,
                players: ids
                    .into_iter()
                    .map(|id| HoardRecord {
                        id,
                        hoard: 0,
                        took_last: false,
                    })
                    .collect(),
            },
            turn: 0,
        }))
    }

    fn result(&self, state: &Value) -> Option<MatchResult> {
        let state: HoardState = serde_json::from_value(state.clone()).ok()?;
        if state.pile > 0 {
            return None;
        }
        let records = state
            .players
            .into_iter()
            .map(|p| {
                let penalty = if p.took_last { state.penalty } else { 0.0 };
                ParticipantResult::new(p.id, p.hoard as f64 - penalty)
                    .with_field("hoard", p.hoard)
                    .with_field("took_last", p.took_last)
            })
            .collect();
        Some(MatchResult::ranked(records))
    }

    fn progress(&self, state: &Value) -> f64 {
        match serde_json::from_value::<HoardState>(state.clone()) {
            Ok(s) if s.initial_pile > 0 => 1.0 - s.pile as f64 / s.initial_pile as f64,
            _ => 0.0,
        }
    }
}
