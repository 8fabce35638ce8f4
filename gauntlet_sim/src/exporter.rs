//! JSON exporter for tournament runs.
//!
//! Captures the progress stream and the final result tree of one scenario
//! run so it can be inspected or diffed offline.

use gauntlet_core::{MatchResult, PoolStats, ProgressReport};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// One progress report as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFrame {
    /// Position in the progress stream
    pub index: usize,

    /// Completed fraction in `[0, 1]`
    pub fraction: f64,

    /// Current leaders of the partial aggregate
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub leaders: Vec<String>,
}

impl ProgressFrame {
    pub fn new(index: usize, report: &ProgressReport) -> Self {
        Self {
            index,
            fraction: report.fraction,
            leaders: report
                .aggregated
                .as_ref()
                .map(|r| r.winners().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

/// Complete scenario export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Context seed used
    pub seed: u64,

    /// Root tournament seed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_seed: Option<String>,

    /// Progress stream
    pub frames: Vec<ProgressFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<MatchResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Pool counters at the end of the run
    pub pool: PoolStats,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            root_seed: None,
            frames: Vec::new(),
            passed: false,
            result: None,
            failure_reason: None,
            pool: PoolStats::default(),
        }
    }

    /// Adds a progress report.
    pub fn add_report(&mut self, report: &ProgressReport) {
        let frame = ProgressFrame::new(self.frames.len(), report);
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, result: Option<MatchResult>, failure_reason: Option<String>) {
        self.passed = passed;
        self.result = result;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
