//! Step-batched simulation driver.
//!
//! A [`StepRunner`] owns one live [`Simulation`] inside an execution unit
//! and turns inbound protocol messages into tick batches:
//!
//! ```text
//!   Idle ──BEGIN──► Running ──STEP/SKIP──► batch ──► Complete | Paused
//!                      │                     │
//!                      └──UPDATE_*──► sim    └──► STEP_INCOMPLETE at checkbacks
//! ```
//!
//! Batches are bounded by a tick count and by a deadline on the context
//! clock. Checkback boundaries sit on multiples of the interval; a partial
//! snapshot is emitted at each one unless the next boundary would fall
//! past the deadline, in which case the batch ends there.

use crate::gauntlet_protocol::{Inbound, Outbound, StepKind};
use crate::gauntlet_unit::{UnitBootstrap, UnitError, UnitProgram};
use crate::results::MatchResult;

use async_trait::async_trait;
use gauntlet_env::{GauntletContext, ModuleSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors a simulation may raise from a tick or an update.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    /// Designated pause condition; ends the batch, not the unit
    #[error("simulation paused")]
    Pause,

    /// Anything else; fatal to the unit
    #[error("simulation fault: {0}")]
    Fault(String),
}

impl SimulationError {
    pub fn fault(reason: impl std::fmt::Display) -> Self {
        Self::Fault(reason.to_string())
    }
}

/// Errors that end a unit running a [`StepRunner`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Fault(#[from] SimulationError),
}

/// A live game instance.
pub trait Simulation: Send {
    /// Serializable snapshot of the current state.
    fn state(&self) -> Value;

    fn is_over(&self) -> bool;

    /// Frames advanced so far (used by SKIP).
    fn frame(&self) -> u64;

    fn step(&mut self, kind: StepKind) -> Result<(), SimulationError>;

    /// The simulation owns all validation of the new config.
    fn update_config(&mut self, config: Value) -> Result<(), SimulationError>;

    fn update_entry(&mut self, entry: Value) -> Result<(), SimulationError>;
}

/// Knows how to build and read one kind of game.
pub trait GameDefinition: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Builds a simulation from the BEGIN config and the modules injected
    /// during the unit's handshake.
    fn create(&self, config: &Value, modules: &[ModuleSource]) -> Result<Box<dyn Simulation>, SimulationError>;

    /// Final result, if the state describes a finished game.
    fn result(&self, state: &Value) -> Option<MatchResult>;

    /// Completed fraction in `[0, 1]` for a partial state.
    fn progress(&self, state: &Value) -> f64;
}

// =============================================================================
// STEP PLAN
// =============================================================================

/// Batch parameters a caller sends with every STEP.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepPlan {
    /// Tick count per batch; negative runs until over or deadline
    pub steps: i64,

    pub max_duration_ms: Option<u64>,

    pub checkback_interval_ms: Option<u64>,

    pub kind: StepKind,
}

impl Default for StepPlan {
    fn default() -> Self {
        Self {
            steps: -1,
            max_duration_ms: Some(200),
            checkback_interval_ms: Some(50),
            kind: StepKind::All,
        }
    }
}

impl StepPlan {
    pub fn with_steps(mut self, steps: i64) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_max_duration(mut self, ms: Option<u64>) -> Self {
        self.max_duration_ms = ms;
        self
    }

    pub fn with_checkback_interval(mut self, ms: Option<u64>) -> Self {
        self.checkback_interval_ms = ms;
        self
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn to_message(&self) -> Inbound {
        Inbound::Step {
            steps: self.steps,
            max_duration_ms: self.max_duration_ms,
            checkback_interval_ms: self.checkback_interval_ms,
            kind: self.kind,
        }
    }
}

// =============================================================================
// RUNNER
// =============================================================================

/// What the caller should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// `TaskEnded` received; the unit should exit cleanly
    Finished,
}

/// Summary of one executed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub ticks: u64,
    pub checkbacks: u32,
    pub paused: bool,
}

/// First checkback boundary strictly after `now`: `(ceil(now / i) + 1) * i`.
pub fn next_checkback(now: Duration, interval: Duration) -> Duration {
    let i = interval.as_nanos().max(1);
    let k = now.as_nanos().div_ceil(i) + 1;
    Duration::from_nanos((k * i).min(u64::MAX as u128) as u64)
}

/// Drives one simulation through BEGIN, STEP, SKIP and UPDATE messages.
pub struct StepRunner<C: GauntletContext> {
    ctx: Arc<C>,
    game: Arc<dyn GameDefinition>,
    modules: Vec<ModuleSource>,
    simulation: Option<Box<dyn Simulation>>,
    started: Duration,
    batches: u64,
}

impl<C: GauntletContext> StepRunner<C> {
    pub fn new(ctx: Arc<C>, game: Arc<dyn GameDefinition>, modules: Vec<ModuleSource>) -> Self {
        let started = ctx.now();
        Self {
            ctx,
            game,
            modules,
            simulation: None,
            started,
            batches: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.simulation.is_some()
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Handles one inbound message, emitting snapshots through `emit`.
    pub fn handle(&mut self, msg: Inbound, emit: &mut dyn FnMut(Outbound)) -> Result<Control, StepError> {
        match msg {
            Inbound::Begin { config } => {
                self.begin(&config)?;
                Ok(Control::Continue)
            }
            Inbound::Step {
                steps,
                max_duration_ms,
                checkback_interval_ms,
                kind,
            } => {
                self.step(
                    steps,
                    max_duration_ms.map(Duration::from_millis),
                    checkback_interval_ms.map(Duration::from_millis),
                    kind,
                    emit,
                )?;
                Ok(Control::Continue)
            }
            Inbound::Skip {
                skip_frame,
                checkback_interval_ms,
                kind,
            } => {
                self.skip(skip_frame, checkback_interval_ms.map(Duration::from_millis), kind, emit)?;
                Ok(Control::Continue)
            }
            Inbound::UpdateConfig { config } => {
                let sim = self.live("UPDATE_CONFIG")?;
                Self::absorb_pause(sim.update_config(config))?;
                Ok(Control::Continue)
            }
            Inbound::UpdateEntry { entry } => {
                let sim = self.live("UPDATE_ENTRY")?;
                Self::absorb_pause(sim.update_entry(entry))?;
                Ok(Control::Continue)
            }
            Inbound::TaskEnded => Ok(Control::Finished),
        }
    }

    /// Creates the simulation. Allowed once.
    pub fn begin(&mut self, config: &Value) -> Result<(), StepError> {
        if self.simulation.is_some() {
            return Err(StepError::ProtocolViolation("second BEGIN".into()));
        }
        let sim = self.game.create(config, &self.modules).map_err(|e| match e {
            SimulationError::Pause => SimulationError::fault("paused during creation"),
            fault => fault,
        })?;
        debug!(game = %self.game.name(), frame = sim.frame(), "Simulation created");
        self.simulation = Some(sim);
        Ok(())
    }

    /// Runs one batch and emits its snapshots.
    pub fn step(
        &mut self,
        steps: i64,
        max_duration: Option<Duration>,
        checkback_interval: Option<Duration>,
        kind: StepKind,
        emit: &mut dyn FnMut(Outbound),
    ) -> Result<BatchSummary, StepError> {
        let ctx = Arc::clone(&self.ctx);
        let started = self.started;
        let sim = self.live("STEP")?;

        let batch_start = ctx.now();
        let deadline = max_duration.map(|d| batch_start + d);
        let interval = checkback_interval.filter(|i| !i.is_zero());
        let mut checkback = interval.map(|i| next_checkback(batch_start, i));
        let mut summary = BatchSummary::default();

        while (steps < 0 || (summary.ticks as i64) < steps) && !sim.is_over() {
            match sim.step(kind) {
                Ok(()) => {}
                Err(SimulationError::Pause) => {
                    summary.paused = true;
                    break;
                }
                Err(fault) => return Err(fault.into()),
            }
            summary.ticks += 1;

            let now = ctx.now();
            if deadline.is_some_and(|d| now >= d) {
                break;
            }
            if let (Some(i), Some(at)) = (interval, checkback) {
                if now >= at {
                    let following = next_checkback(now, i);
                    if deadline.is_some_and(|d| following > d) {
                        break;
                    }
                    checkback = Some(following);
                    summary.checkbacks += 1;
                    emit(Outbound::StepIncomplete { state: sim.state() });
                }
            }
        }

        let elapsed = ctx.now().saturating_sub(started);
        emit(Outbound::StepComplete {
            state: sim.state(),
            pause_triggered: summary.paused,
            elapsed_ms: elapsed.as_millis() as u64,
        });
        self.batches += 1;
        debug!(
            ticks = summary.ticks,
            checkbacks = summary.checkbacks,
            paused = summary.paused,
            "Batch finished"
        );
        Ok(summary)
    }

    /// Fast-forwards to `skip_frame`. A no-op when already there or past it.
    pub fn skip(
        &mut self,
        skip_frame: u64,
        checkback_interval: Option<Duration>,
        kind: StepKind,
        emit: &mut dyn FnMut(Outbound),
    ) -> Result<Option<BatchSummary>, StepError> {
        let current = self.live("SKIP")?.frame();
        let steps = match skip_frame.checked_sub(current) {
            Some(ahead) if ahead > 0 => i64::try_from(ahead).unwrap_or(i64::MAX),
            _ => {
                debug!(skip_frame, current, "Skip target already reached");
                return Ok(None);
            }
        };
        self.step(steps, None, checkback_interval, kind, emit).map(Some)
    }

    fn live(&mut self, action: &str) -> Result<&mut Box<dyn Simulation>, StepError> {
        self.simulation
            .as_mut()
            .ok_or_else(|| StepError::ProtocolViolation(format!("{action} before BEGIN")))
    }

    fn absorb_pause(result: Result<(), SimulationError>) -> Result<(), StepError> {
        match result {
            Err(SimulationError::Pause) => {
                warn!("Pause raised outside a batch ignored");
                Ok(())
            }
            other => other.map_err(StepError::from),
        }
    }
}

// =============================================================================
// UNIT PROGRAM
// =============================================================================

/// Hosts a [`StepRunner`] inside an execution unit.
///
/// The modules injected during the handshake (participant entries) are
/// handed to [`GameDefinition::create`] on BEGIN.
pub struct StepProgram<C: GauntletContext> {
    ctx: Arc<C>,
    game: Arc<dyn GameDefinition>,
}

impl<C: GauntletContext> StepProgram<C> {
    pub fn new(ctx: Arc<C>, game: Arc<dyn GameDefinition>) -> Self {
        Self { ctx, game }
    }
}

#[async_trait]
impl<C: GauntletContext> UnitProgram for StepProgram<C> {
    fn name(&self) -> &str {
        self.game.name()
    }

    async fn run(&self, boot: UnitBootstrap) -> Result<(), UnitError> {
        let scope = boot.ready();
        let mut runner = StepRunner::new(Arc::clone(&self.ctx), Arc::clone(&self.game), scope.modules().to_vec());
        let mut inbox = scope.add_listener();

        while let Some(msg) = inbox.recv().await {
            let action = msg.action();
            let mut emit = |out: Outbound| {
                let _ = scope.post(out);
            };
            match runner.handle(msg, &mut emit) {
                Ok(Control::Continue) => {}
                Ok(Control::Finished) => {
                    debug!(unit = %scope.id(), batches = runner.batches(), "Task ended");
                    return Ok(());
                }
                Err(StepError::ProtocolViolation(reason)) => {
                    return Err(UnitError::violation(scope.id(), format!("{action}: {reason}")));
                }
                Err(StepError::Fault(fault)) => {
                    return Err(UnitError::Program(format!("{action}: {fault}")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauntlet_unit::{ExecutionUnit, UnitStatus};
    use crate::testing::ManualContext;
    use gauntlet_env::StaticLoader;
    use serde_json::json;

    /// Counts ticks; each tick advances the shared clock by `tick`.
    struct Counter {
        ctx: Arc<ManualContext>,
        tick: Duration,
        frame: u64,
        over_at: Option<u64>,
        pause_at: Option<u64>,
        fault_at: Option<u64>,
        config: Value,
    }

    impl Simulation for Counter {
        fn state(&self) -> Value {
            json!({ "frame": self.frame, "config": self.config })
        }

        fn is_over(&self) -> bool {
            self.over_at.is_some_and(|n| self.frame >= n)
        }

        fn frame(&self) -> u64 {
            self.frame
        }

        fn step(&mut self, _kind: StepKind) -> Result<(), SimulationError> {
            self.frame += 1;
            self.ctx.advance(self.tick);
            if self.pause_at == Some(self.frame) {
                return Err(SimulationError::Pause);
            }
            if self.fault_at == Some(self.frame) {
                return Err(SimulationError::fault("counter overflow"));
            }
            Ok(())
        }

        fn update_config(&mut self, config: Value) -> Result<(), SimulationError> {
            self.config = config;
            Ok(())
        }

        fn update_entry(&mut self, _entry: Value) -> Result<(), SimulationError> {
            Err(SimulationError::fault("entries are fixed"))
        }
    }

    struct CounterGame {
        ctx: Arc<ManualContext>,
    }

    impl GameDefinition for CounterGame {
        fn name(&self) -> &str {
            "counter"
        }

        fn create(&self, config: &Value, _modules: &[ModuleSource]) -> Result<Box<dyn Simulation>, SimulationError> {
            Ok(Box::new(Counter {
                ctx: Arc::clone(&self.ctx),
                tick: Duration::from_millis(config["tick_ms"].as_u64().unwrap_or(1)),
                frame: 0,
                over_at: config["over_at"].as_u64(),
                pause_at: config["pause_at"].as_u64(),
                fault_at: config["fault_at"].as_u64(),
                config: config.clone(),
            }))
        }

        fn result(&self, _state: &Value) -> Option<MatchResult> {
            None
        }

        fn progress(&self, _state: &Value) -> f64 {
            0.0
        }
    }

    fn runner_with(config: Value) -> (StepRunner<ManualContext>, Arc<ManualContext>) {
        let ctx = Arc::new(ManualContext::new());
        let game = Arc::new(CounterGame { ctx: Arc::clone(&ctx) });
        let mut runner = StepRunner::new(Arc::clone(&ctx), game, Vec::new());
        runner.begin(&config).unwrap();
        (runner, ctx)
    }

    fn collect(runner: &mut StepRunner<ManualContext>, msg: Inbound) -> (Result<Control, StepError>, Vec<Outbound>) {
        let mut out = Vec::new();
        let result = runner.handle(msg, &mut |o| out.push(o));
        (result, out)
    }

    fn frame_of(msg: &Outbound) -> u64 {
        match msg {
            Outbound::StepComplete { state, .. } | Outbound::StepIncomplete { state } => state["frame"].as_u64().unwrap(),
            Outbound::Disconnected { .. } => panic!("unexpected disconnect"),
        }
    }

    #[test]
    fn test_next_checkback() {
        let ms = Duration::from_millis;
        assert_eq!(next_checkback(ms(0), ms(10)), ms(10));
        assert_eq!(next_checkback(ms(10), ms(10)), ms(20));
        assert_eq!(next_checkback(ms(15), ms(10)), ms(30));
    }

    #[test]
    fn test_fixed_step_count_runs_exactly_until_over() {
        let (mut runner, _ctx) = runner_with(json!({ "over_at": 5 }));
        let (result, out) = collect(&mut runner, StepPlan::default().with_steps(5).with_max_duration(None).with_checkback_interval(None).to_message());

        assert_eq!(result.unwrap(), Control::Continue);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Outbound::StepComplete { pause_triggered: false, .. }));
        assert_eq!(frame_of(&out[0]), 5);
    }

    #[test]
    fn test_checkbacks_every_interval_until_deadline() {
        let (mut runner, _ctx) = runner_with(json!({ "tick_ms": 1 }));
        let (_, out) = collect(
            &mut runner,
            Inbound::Step {
                steps: -1,
                max_duration_ms: Some(100),
                checkback_interval_ms: Some(10),
                kind: StepKind::All,
            },
        );

        let incomplete: Vec<u64> = out
            .iter()
            .filter(|m| matches!(m, Outbound::StepIncomplete { .. }))
            .map(frame_of)
            .collect();
        assert_eq!(incomplete, vec![10, 20, 30, 40, 50, 60, 70, 80, 90]);

        let complete: Vec<&Outbound> = out.iter().filter(|m| matches!(m, Outbound::StepComplete { .. })).collect();
        assert_eq!(complete.len(), 1);
        assert!(frame_of(complete[0]) >= 100);
        assert!(matches!(out.last(), Some(Outbound::StepComplete { .. })));
    }

    #[test]
    fn test_checkback_past_deadline_ends_batch_early() {
        let (mut runner, ctx) = runner_with(json!({ "tick_ms": 10 }));
        let mut out = Vec::new();
        let summary = runner
            .step(-1, Some(Duration::from_millis(25)), Some(Duration::from_millis(20)), StepKind::All, &mut |o| out.push(o))
            .unwrap();

        // At t=20 the following boundary (40) lies past the deadline (25).
        assert_eq!(summary.ticks, 2);
        assert_eq!(summary.checkbacks, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(ctx.now(), Duration::from_millis(20));
    }

    #[test]
    fn test_pause_ends_batch_with_flag() {
        let (mut runner, _ctx) = runner_with(json!({ "pause_at": 3 }));
        let (result, out) = collect(&mut runner, StepPlan::default().with_max_duration(None).to_message());

        assert!(result.is_ok());
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Outbound::StepComplete { pause_triggered: true, .. }));
        assert_eq!(frame_of(&out[0]), 3);

        // The runner is still usable afterwards
        let (_, out) = collect(&mut runner, StepPlan::default().with_steps(2).to_message());
        assert_eq!(frame_of(&out[0]), 5);
    }

    #[test]
    fn test_fault_is_fatal_and_emits_nothing() {
        let (mut runner, _ctx) = runner_with(json!({ "fault_at": 2 }));
        let (result, out) = collect(&mut runner, StepPlan::default().with_steps(10).to_message());

        assert!(matches!(result, Err(StepError::Fault(SimulationError::Fault(_)))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_skip_forward_and_noop_when_behind() {
        let (mut runner, _ctx) = runner_with(json!({}));
        let mut out = Vec::new();

        let summary = runner.skip(7, None, StepKind::All, &mut |o| out.push(o)).unwrap();
        assert_eq!(summary.map(|s| s.ticks), Some(7));
        assert_eq!(frame_of(&out[0]), 7);

        out.clear();
        assert_eq!(runner.skip(4, None, StepKind::All, &mut |o| out.push(o)).unwrap(), None);
        assert!(out.is_empty());
    }

    #[test]
    fn test_skip_to_far_frame_runs_until_over() {
        let (mut runner, _ctx) = runner_with(json!({ "over_at": 5 }));
        let mut out = Vec::new();

        let summary = runner.skip(u64::MAX, None, StepKind::All, &mut |o| out.push(o)).unwrap();
        assert_eq!(summary.map(|s| s.ticks), Some(5));
        assert_eq!(frame_of(out.last().unwrap()), 5);
    }

    #[tokio::test]
    async fn test_second_begin_disconnects_hosted_unit() {
        let ctx = Arc::new(ManualContext::new());
        let game = Arc::new(CounterGame { ctx: Arc::clone(&ctx) });
        let program = Arc::new(StepProgram::new(Arc::clone(&ctx), game));
        let mut unit =
            ExecutionUnit::spawn(ctx.as_ref(), Arc::new(StaticLoader::new()), program, Vec::new()).unwrap();
        let mut inbox = unit.add_listener();

        unit.post_message(Inbound::Begin { config: json!({}) }).unwrap();
        unit.post_message(Inbound::Begin { config: json!({}) }).unwrap();

        match inbox.recv().await {
            Some(Outbound::Disconnected { reason }) => assert!(reason.contains("second BEGIN"), "{reason}"),
            other => panic!("expected a disconnect, got {other:?}"),
        }
        assert!(matches!(unit.wait_exit().await, UnitStatus::Failed(ref r) if r.contains("second BEGIN")));
    }

    #[test]
    fn test_protocol_violations() {
        let ctx = Arc::new(ManualContext::new());
        let game = Arc::new(CounterGame { ctx: Arc::clone(&ctx) });
        let mut runner = StepRunner::new(ctx, game, Vec::new());

        let (result, _) = collect(&mut runner, StepPlan::default().to_message());
        assert!(matches!(result, Err(StepError::ProtocolViolation(_))));

        let (result, _) = collect(&mut runner, Inbound::UpdateConfig { config: json!({}) });
        assert!(matches!(result, Err(StepError::ProtocolViolation(_))));

        runner.begin(&json!({})).unwrap();
        let (result, _) = collect(&mut runner, Inbound::Begin { config: json!({}) });
        assert_eq!(result, Err(StepError::ProtocolViolation("second BEGIN".into())));
    }

    #[test]
    fn test_updates_forwarded_verbatim() {
        let (mut runner, _ctx) = runner_with(json!({}));
        let (result, _) = collect(&mut runner, Inbound::UpdateConfig { config: json!({ "speed": 3 }) });
        assert!(result.is_ok());

        let (_, out) = collect(&mut runner, StepPlan::default().with_steps(1).to_message());
        match &out[0] {
            Outbound::StepComplete { state, .. } => assert_eq!(state["config"], json!({ "speed": 3 })),
            other => panic!("unexpected {other:?}"),
        }

        // The simulation's own rejection surfaces as a fault
        let (result, _) = collect(&mut runner, Inbound::UpdateEntry { entry: json!({}) });
        assert!(matches!(result, Err(StepError::Fault(_))));
    }

    #[test]
    fn test_task_ended_finishes() {
        let (mut runner, _ctx) = runner_with(json!({}));
        let (result, out) = collect(&mut runner, Inbound::TaskEnded);
        assert_eq!(result.unwrap(), Control::Finished);
        assert!(out.is_empty());
    }
}
