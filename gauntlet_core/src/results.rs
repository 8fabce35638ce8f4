//! Participants, results and progress reporting.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A competitor in a bracket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    /// Stable identifier, used to match records across child results
    pub id: String,

    /// Logical module path of the participant's code
    pub entry: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entry: entry.into(),
        }
    }
}

/// One participant's outcome in a game or sub-bracket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantResult {
    pub id: String,

    pub score: f64,

    pub winner: bool,

    /// Game-specific extra fields (kept sorted for stable output)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,

    /// This participant's records from the child runs that produced it
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested_results: Vec<ParticipantResult>,
}

impl ParticipantResult {
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
            winner: false,
            fields: BTreeMap::new(),
            nested_results: Vec::new(),
        }
    }

    /// Builder-style extra field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Ordered per-participant outcome list (best first).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchResult {
    pub participants: Vec<ParticipantResult>,
}

impl MatchResult {
    /// Ranks records by score (descending, stable for ties) and marks
    /// every record sharing the top score as a winner.
    pub fn ranked(mut participants: Vec<ParticipantResult>) -> Self {
        participants.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        let top = participants.first().map(|p| p.score);
        for record in participants.iter_mut() {
            record.winner = Some(record.score) == top;
        }
        Self { participants }
    }

    /// Looks up a participant's record.
    pub fn get(&self, id: &str) -> Option<&ParticipantResult> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Returns the ids of all winners.
    pub fn winners(&self) -> Vec<&str> {
        self.participants
            .iter()
            .filter(|p| p.winner)
            .map(|p| p.id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

// =============================================================================
// PROGRESS
// =============================================================================

/// Progress of a run at some level of the bracket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Completed fraction in `[0, 1]`
    pub fraction: f64,

    /// Best-effort aggregate of whatever results exist so far
    pub aggregated: Option<MatchResult>,
}

impl ProgressReport {
    pub fn new(fraction: f64, aggregated: Option<MatchResult>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            aggregated,
        }
    }

    /// A finished report carrying the final result.
    pub fn complete(result: MatchResult) -> Self {
        Self::new(1.0, Some(result))
    }
}

/// Destination for progress reports.
///
/// Cheap to clone; each bracket level wraps its parent's sink.
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn Fn(ProgressReport) + Send + Sync>);

impl ProgressSink {
    /// Wraps a callback.
    pub fn new(f: impl Fn(ProgressReport) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// A sink that discards everything.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// A sink that forwards into an unbounded channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(move |report| {
            let _ = tx.send(report);
        });
        (sink, rx)
    }

    pub fn report(&self, report: ProgressReport) {
        (self.0)(report)
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressSink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranked_orders_and_marks_ties() {
        let result = MatchResult::ranked(vec![
            ParticipantResult::new("a", 1.0),
            ParticipantResult::new("b", 3.0),
            ParticipantResult::new("c", 3.0),
        ]);

        let order: Vec<&str> = result.participants.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert_eq!(result.winners(), vec!["b", "c"]);
        assert!(!result.get("a").unwrap().winner);
    }

    #[test]
    fn test_progress_report_clamps() {
        assert_eq!(ProgressReport::new(1.7, None).fraction, 1.0);
        assert_eq!(ProgressReport::new(-0.2, None).fraction, 0.0);
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.report(ProgressReport::new(0.25, None));
        sink.report(ProgressReport::new(0.5, None));

        assert_eq!(rx.recv().await.unwrap().fraction, 0.25);
        assert_eq!(rx.recv().await.unwrap().fraction, 0.5);
    }

    #[test]
    fn test_empty_fields_skipped_in_json() {
        let json = serde_json::to_value(ParticipantResult::new("a", 2.0)).unwrap();
        assert!(json.get("fields").is_none());
        assert!(json.get("nested_results").is_none());
    }
}
