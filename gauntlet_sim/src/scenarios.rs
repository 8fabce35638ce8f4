//! Tournament scenarios for the harness.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// GNT-001: every pair races once, wins counted
    RaceRoundRobin,

    /// GNT-002: one race with everyone (degenerate composite)
    RaceFreeForAll,

    /// GNT-003: best-of-N hoard matches nested inside a round robin
    HoardBestOf,

    /// GNT-004: one entry faults mid-game; the failure must name its branch
    CrashIsolation,

    /// GNT-005: games pause every few frames and are resumed
    PauseResume,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::RaceRoundRobin,
            ScenarioId::RaceFreeForAll,
            ScenarioId::HoardBestOf,
            ScenarioId::CrashIsolation,
            ScenarioId::PauseResume,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::RaceRoundRobin => "race_round_robin",
            ScenarioId::RaceFreeForAll => "race_free_for_all",
            ScenarioId::HoardBestOf => "hoard_best_of",
            ScenarioId::CrashIsolation => "crash_isolation",
            ScenarioId::PauseResume => "pause_resume",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::RaceRoundRobin => "DiceRace round robin (pairs), ranked by wins",
            ScenarioId::RaceFreeForAll => "Single DiceRace with every participant, ranked by distance",
            ScenarioId::HoardBestOf => "Hoard best-of-N per pair, nested inside a round robin",
            ScenarioId::CrashIsolation => "One faulting entry: tournament fails naming the branch, worker discarded",
            ScenarioId::PauseResume => "Races pause every few frames; resumed results match uninterrupted play",
        }
    }

    /// Returns true if a successful run is expected to end in an error.
    pub fn expects_failure(&self) -> bool {
        matches!(self, ScenarioId::CrashIsolation)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "race_round_robin" | "roundrobin" | "gnt-001" => Ok(ScenarioId::RaceRoundRobin),
            "race_free_for_all" | "freeforall" | "ffa" | "gnt-002" => Ok(ScenarioId::RaceFreeForAll),
            "hoard_best_of" | "bestof" | "gnt-003" => Ok(ScenarioId::HoardBestOf),
            "crash_isolation" | "crash" | "gnt-004" => Ok(ScenarioId::CrashIsolation),
            "pause_resume" | "pause" | "gnt-005" => Ok(ScenarioId::PauseResume),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("GNT-004".parse::<ScenarioId>(), Ok(ScenarioId::CrashIsolation));
        assert_eq!("ffa".parse::<ScenarioId>(), Ok(ScenarioId::RaceFreeForAll));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
