//! Wire messages exchanged with an execution unit.
//!
//! Both directions are tagged unions serialized with an `action` tag, so a
//! captured conversation reads like:
//!
//! ```text
//! -> {"action":"BEGIN","config":{...}}
//! -> {"action":"STEP","steps":-1,"max_duration_ms":20,"checkback_interval_ms":5,"kind":"all"}
//! <- {"action":"STEP_INCOMPLETE","state":{...}}
//! <- {"action":"STEP_COMPLETE","state":{...},"pause_triggered":false,"elapsed_ms":21}
//! -> {"action":"TASK_ENDED"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Granularity of a single simulation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Advance one participant's turn
    Single,

    /// Advance a full round
    #[default]
    All,
}

/// Messages from the supervisor to a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Inbound {
    /// Create the simulation. Allowed once per unit lifetime.
    Begin { config: Value },

    /// Run a batch of ticks. `steps < 0` means "until over or deadline".
    Step {
        steps: i64,
        #[serde(default)]
        max_duration_ms: Option<u64>,
        #[serde(default)]
        checkback_interval_ms: Option<u64>,
        #[serde(default)]
        kind: StepKind,
    },

    /// Fast-forward to an absolute frame.
    Skip {
        skip_frame: u64,
        #[serde(default)]
        checkback_interval_ms: Option<u64>,
        #[serde(default)]
        kind: StepKind,
    },

    /// Replace the live simulation's config.
    UpdateConfig { config: Value },

    /// Replace one participant entry in the live simulation.
    UpdateEntry { entry: Value },

    /// The caller is done with this unit; the program should exit cleanly.
    TaskEnded,
}

impl Inbound {
    /// Short action name for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Inbound::Begin { .. } => "BEGIN",
            Inbound::Step { .. } => "STEP",
            Inbound::Skip { .. } => "SKIP",
            Inbound::UpdateConfig { .. } => "UPDATE_CONFIG",
            Inbound::UpdateEntry { .. } => "UPDATE_ENTRY",
            Inbound::TaskEnded => "TASK_ENDED",
        }
    }
}

/// Messages from a unit to its listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outbound {
    /// Final snapshot of a batch.
    StepComplete {
        state: Value,
        pause_triggered: bool,
        /// Wall-clock time since the unit's own start
        elapsed_ms: u64,
    },

    /// Partial snapshot emitted at a checkback boundary.
    StepIncomplete { state: Value },

    /// Synthetic message: the unit terminated abnormally.
    Disconnected { reason: String },
}
