/// Health sample payloads: what the worker and its supervisor report.
use serde::Deserialize;
use std::collections::BTreeMap;

/// Kind of work loop running inside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    Scheduled,
    ScheduledProducer,
    Periodic,
    #[serde(other)]
    Other,
}

/// One entry of the worker's `loops` map.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoopSnapshot {
    pub loop_type: LoopType,
    #[serde(default)]
    pub schedule: Option<String>,
    /// Seconds between iterations, for periodic loops.
    #[serde(default)]
    pub period: Option<f64>,
    #[serde(default)]
    pub counter: Option<u64>,
}

/// JSON body of the worker's status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerStatus {
    pub loops: BTreeMap<String, LoopSnapshot>,
    pub collected_counter: Option<u64>,
    pub submitted_counter: Option<u64>,
    pub purged_records: Option<u64>,
}

/// Program state as reported by the process supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Running { pid: Option<u32> },
    Starting,
    Stopping,
    Stopped,
    Backoff,
    Exited,
    Fatal,
    Unknown,
}

impl ProgramState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProgramState::Running { .. })
    }

    pub fn is_starting(&self) -> bool {
        matches!(self, ProgramState::Starting | ProgramState::Backoff)
    }

    pub fn is_stopping(&self) -> bool {
        matches!(self, ProgramState::Stopping)
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            ProgramState::Running { pid } => *pid,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_status() {
        let status: WorkerStatus = serde_json::from_str(
            r#"{
                "loops": {
                    "ping_module_loop": {"loop_type": "scheduled", "schedule": "*/5 * * * *", "counter": 12},
                    "submitter": {"loop_type": "periodic", "period": 30, "counter": 7},
                    "heartbeat": {"loop_type": "server_push", "counter": 1}
                },
                "collected_counter": 100,
                "submitted_counter": 90,
                "purged_records": 3
            }"#,
        )
        .unwrap();

        assert_eq!(status.loops.len(), 3);
        let ping = &status.loops["ping_module_loop"];
        assert_eq!(ping.loop_type, LoopType::Scheduled);
        assert_eq!(ping.schedule.as_deref(), Some("*/5 * * * *"));
        assert_eq!(ping.counter, Some(12));
        assert_eq!(status.loops["submitter"].period, Some(30.0));
        assert_eq!(status.loops["heartbeat"].loop_type, LoopType::Other);
        assert_eq!(status.collected_counter, Some(100));
        assert_eq!(status.submitted_counter, Some(90));
        assert_eq!(status.purged_records, Some(3));
    }

    #[test]
    fn test_parse_sparse_status() {
        let status: WorkerStatus = serde_json::from_str("{}").unwrap();
        assert!(status.loops.is_empty());
        assert_eq!(status.collected_counter, None);

        let status: WorkerStatus =
            serde_json::from_str(r#"{"loops": {"x": {"loop_type": "scheduled_producer"}}}"#).unwrap();
        assert_eq!(status.loops["x"].loop_type, LoopType::ScheduledProducer);
        assert_eq!(status.loops["x"].counter, None);
    }

    #[test]
    fn test_loop_without_type_is_rejected() {
        let result: Result<WorkerStatus, _> =
            serde_json::from_str(r#"{"loops": {"x": {"counter": 1}}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_program_state_predicates() {
        let running = ProgramState::Running { pid: Some(42) };
        assert!(running.is_running());
        assert_eq!(running.pid(), Some(42));
        assert!(ProgramState::Starting.is_starting());
        assert!(ProgramState::Backoff.is_starting());
        assert!(ProgramState::Stopping.is_stopping());
        assert!(!ProgramState::Fatal.is_running());
        assert_eq!(ProgramState::Stopped.pid(), None);
    }
}
