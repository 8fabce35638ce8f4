//! Scenario runner - executes tournament scenarios against a fresh world.
//!
//! Every scenario is played twice from identical worlds; the second run
//! must reproduce the first bit for bit.

use crate::error::SimError;
use crate::exporter::SimExport;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use gauntlet_core::{BracketError, GamePreview, MatchResult, PoolStats, ProgressReport, ProgressSink, Seed, TournamentOutcome};
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Root tournament seed drawn from the world
    pub root_seed: Option<Seed>,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final ranking, when the tournament finished
    pub result: Option<MatchResult>,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Progress reports seen by the caller
    pub progress_reports: usize,

    /// Last progress fraction reported
    pub final_fraction: f64,

    /// Times the reported fraction went down
    pub progress_regressions: usize,

    /// Pool counters after the first run
    pub pool: PoolStats,
}

/// One played tournament.
struct Execution {
    root_seed: Seed,
    outcome: Result<TournamentOutcome, BracketError>,
    reports: Vec<ProgressReport>,
    pool: PoolStats,
}

impl Execution {
    fn metrics(&self) -> ScenarioMetrics {
        let progress_regressions = self
            .reports
            .windows(2)
            .filter(|pair| pair[1].fraction < pair[0].fraction)
            .count();
        ScenarioMetrics {
            progress_reports: self.reports.len(),
            final_fraction: self.reports.last().map(|r| r.fraction).unwrap_or(0.0),
            progress_regressions,
            pool: self.pool,
        }
    }

    fn result_json(&self) -> Option<String> {
        self.outcome
            .as_ref()
            .ok()
            .and_then(|o| serde_json::to_string(&o.result).ok())
    }
}

/// Runs tournament scenarios.
pub struct ScenarioRunner {
    /// Harness configuration (seed, participants, pool, plan)
    config: SimConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, participants: usize) -> Self {
        Self {
            config: SimConfig::default().with_seed(seed).with_participants(participants),
        }
    }

    /// Creates a runner from a full configuration, seed included.
    pub fn from_config(config: SimConfig) -> Self {
        Self { config }
    }

    /// Replaces the configuration, seed and participant count included.
    pub fn with_config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config = self.config.with_seed(seed);
        self
    }

    /// Sets the idle-worker bound of the pool.
    pub fn with_pool_size(mut self, max_idle: usize) -> Self {
        self.config = self.config.with_pool_size(max_idle);
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.config.seed);
        match self.check(scenario) {
            Ok(result) => result,
            Err(e) => self.harness_failure(scenario, e),
        }
    }

    /// Runs a scenario once, recording every progress report into an export.
    pub fn run_with_export(&self, scenario: ScenarioId) -> Result<(ScenarioResult, SimExport), SimError> {
        let result = self.run(scenario);
        let execution = self.execute(scenario)?;

        let mut export = SimExport::new(scenario.name(), self.config.seed);
        export.root_seed = Some(execution.root_seed.to_string());
        export.pool = execution.pool;
        for report in &execution.reports {
            export.add_report(report);
        }
        export.finalize(result.passed, result.result.clone(), result.failure_reason.clone());
        Ok((result, export))
    }

    /// A representative game of the scenario's bracket, without playing it.
    pub fn preview(&self, scenario: ScenarioId) -> Result<GamePreview, SimError> {
        let world = SimWorld::new(self.config.clone())?;
        let tournament = world.tournament(scenario);
        let seed = tournament.resolve_seed(None);
        Ok(tournament.preview(&seed, &world.participants)?)
    }

    fn check(&self, scenario: ScenarioId) -> Result<ScenarioResult, SimError> {
        let first = self.execute(scenario)?;
        let metrics = first.metrics();

        let verdict = match scenario {
            ScenarioId::CrashIsolation => self.check_crash(&first),
            ScenarioId::PauseResume => self.check_completed(&first).and_then(|_| {
                // Pausing must not change anything: compare with uninterrupted play
                let baseline = self.execute(ScenarioId::RaceRoundRobin)?;
                Self::check_same(&first, &baseline, "paused run differs from uninterrupted run")
            }),
            _ => self.check_completed(&first).and_then(|_| {
                let replay = self.execute(scenario)?;
                Self::check_same(&first, &replay, "replay with the same seed differs")
            }),
        };

        let failure_reason = match verdict {
            Ok(()) => None,
            Err(SimError::Config(reason)) => Some(reason),
            Err(e) => return Err(e),
        };

        Ok(ScenarioResult {
            scenario,
            seed: self.config.seed,
            root_seed: Some(first.root_seed.clone()),
            passed: failure_reason.is_none(),
            result: first.outcome.ok().map(|o| o.result),
            failure_reason,
            metrics,
        })
    }

    /// Plays the scenario's tournament once in a fresh world.
    fn execute(&self, scenario: ScenarioId) -> Result<Execution, SimError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| SimError::Runtime(e.to_string()))?;

        let mut world = SimWorld::new(self.config.clone())?;
        if scenario.expects_failure() {
            let last = world.participants.len() - 1;
            if let Some(victim) = world.sabotage(last, 3) {
                debug!(victim = %victim.id, "Entry sabotaged");
            }
        }

        let tournament = world.tournament(scenario);
        let root_seed = tournament.resolve_seed(None);
        let (sink, mut reports_rx) = ProgressSink::channel();
        let participants = world.participants.clone();

        let outcome = runtime.block_on(tournament.begin(Some(root_seed.clone()), participants, sink));

        let mut reports = Vec::new();
        while let Ok(report) = reports_rx.try_recv() {
            reports.push(report);
        }
        let pool = world.pool.stats();
        debug!(?pool, reports = reports.len(), "Execution finished");

        Ok(Execution {
            root_seed,
            outcome,
            reports,
            pool,
        })
    }

    fn check_completed(&self, execution: &Execution) -> Result<(), SimError> {
        let outcome = execution
            .outcome
            .as_ref()
            .map_err(|e| SimError::Config(format!("tournament failed at {:?}: {e}", e.path())))?;

        if outcome.result.len() != self.config.participants {
            return Err(SimError::Config(format!(
                "expected {} ranked participants, got {}",
                self.config.participants,
                outcome.result.len()
            )));
        }
        let metrics = execution.metrics();
        if metrics.progress_regressions > 0 {
            return Err(SimError::Config(format!(
                "progress went backwards {} times",
                metrics.progress_regressions
            )));
        }
        if (metrics.final_fraction - 1.0).abs() > f64::EPSILON {
            return Err(SimError::Config(format!(
                "final progress {:.3} instead of 1.0",
                metrics.final_fraction
            )));
        }
        Ok(())
    }

    fn check_crash(&self, execution: &Execution) -> Result<(), SimError> {
        let error = match &execution.outcome {
            Ok(_) => return Err(SimError::Config("tournament finished despite a faulting entry".into())),
            Err(e) => e,
        };

        let path = error.path();
        info!(?path, seed = ?error.failing_seed().map(|s| s.to_string()), "Failure isolated");
        if path.is_empty() {
            return Err(SimError::Config(format!("failure carries no branch path: {error}")));
        }
        if execution.pool.discarded == 0 {
            return Err(SimError::Config("crashed unit's worker was recycled".into()));
        }
        if execution.pool.active != 0 {
            return Err(SimError::Config(format!(
                "{} units still counted active after the failure",
                execution.pool.active
            )));
        }
        Ok(())
    }

    fn check_same(a: &Execution, b: &Execution, what: &str) -> Result<(), SimError> {
        if a.root_seed != b.root_seed {
            return Err(SimError::Config(format!(
                "root seeds differ: {} vs {}",
                a.root_seed, b.root_seed
            )));
        }
        if a.result_json() != b.result_json() {
            warn!(root = %a.root_seed, "Result mismatch");
            return Err(SimError::Config(what.to_string()));
        }
        Ok(())
    }

    fn harness_failure(&self, scenario: ScenarioId, e: SimError) -> ScenarioResult {
        warn!("Scenario {} could not run: {e}", scenario.name());
        ScenarioResult {
            scenario,
            seed: self.config.seed,
            root_seed: None,
            passed: false,
            result: None,
            failure_reason: Some(e.to_string()),
            metrics: ScenarioMetrics::default(),
        }
    }
}
