//! Point-in-time engine statistics for operators.

use std::fmt;

use serde::Serialize;

// ── Lifecycle state ──────────────────────────────────────────────────

/// Engine lifecycle. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Built, recovery not finished.
    Starting,
    Running,
    /// No new admissions; waiting for in-flight executions.
    Draining,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Draining => "draining",
            EngineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ── Snapshots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub name: String,
    pub module: String,
    pub slot: usize,
    /// Executions holding an admission slot.
    pub running: usize,
    pub capacity: usize,
    /// Job references waiting in the queue, when the queue could be read.
    pub queued: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub name: String,
    pub state: EngineState,
    /// Tracked execution units, including delayed retries.
    pub in_flight: usize,
    pub tasks: Vec<TaskStats>,
}

impl EngineStats {
    pub fn running_total(&self) -> usize {
        self.tasks.iter().map(|t| t.running).sum()
    }

    pub fn task(&self, name: &str) -> Option<&TaskStats> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_orders_forward() {
        assert!(EngineState::Starting < EngineState::Running);
        assert!(EngineState::Running < EngineState::Draining);
        assert!(EngineState::Draining < EngineState::Stopped);
    }

    #[test]
    fn stats_serialize_state_lowercase() {
        let stats = EngineStats {
            name: "billing".into(),
            state: EngineState::Draining,
            in_flight: 2,
            tasks: vec![TaskStats {
                name: "send-email".into(),
                module: "mail".into(),
                slot: 0,
                running: 2,
                capacity: 4,
                queued: Some(7),
            }],
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "draining");
        assert_eq!(json["tasks"][0]["queued"], 7);
        assert_eq!(stats.running_total(), 2);
        assert!(stats.task("send-email").is_some());
    }
}
