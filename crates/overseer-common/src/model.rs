// Core data model: build requests, runs and step results.
// These types cross the wire and are persisted, so every field carries a
// camelCase serde rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Build requests
// ---------------------------------------------------------------------------

/// One shell-level unit of work inside a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "command")]
    pub command: String,
    #[serde(default, rename = "args")]
    pub args: Vec<String>,
}

/// Provenance recorded on every submission: who asked for the build and why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    #[serde(default, rename = "requestedBy")]
    pub requested_by: String,
    #[serde(default, rename = "reason")]
    pub reason: String,
}

/// Lifecycle of a build request.
///
/// Retry handling is explicit state on the request rather than control flow:
/// a request that loses its worker goes back to `Queued` with `retry_count`
/// bumped, until the retry limit moves it to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "dispatched")]
    Dispatched,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "aborted")]
    Aborted,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "succeeded")]
    Succeeded,
}

/// A queued unit of build work.
///
/// Immutable once enqueued except for `state` and `retry_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
    /// What is being built (repository, branch, configuration name...).
    #[serde(rename = "target")]
    pub target: String,
    #[serde(rename = "steps")]
    pub steps: Vec<BuildStep>,
    /// Higher dispatches first.
    #[serde(default, rename = "priority")]
    pub priority: i32,
    /// Capability tags a worker must declare to be eligible.
    #[serde(default, rename = "requiredCapabilities")]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default, rename = "trigger")]
    pub trigger: TriggerInfo,
    #[serde(rename = "submittedAt")]
    pub submitted_at: DateTime<Utc>,
    #[serde(default, rename = "retryCount")]
    pub retry_count: u32,
    #[serde(rename = "state")]
    pub state: RequestState,
}

impl BuildRequest {
    /// Create a freshly queued request.
    pub fn new(
        target: impl Into<String>,
        steps: Vec<BuildStep>,
        priority: i32,
        required_capabilities: BTreeSet<String>,
        trigger: TriggerInfo,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            target: target.into(),
            steps,
            priority,
            required_capabilities,
            trigger,
            submitted_at: Utc::now(),
            retry_count: 0,
            state: RequestState::Queued,
        }
    }
}

// ---------------------------------------------------------------------------
// Build runs
// ---------------------------------------------------------------------------

/// Terminal (or in-flight) status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failure")]
    Failure,
    #[serde(rename = "aborted")]
    Aborted,
}

impl RunOutcome {
    /// Whether this outcome is terminal.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            RunOutcome::Success | RunOutcome::Failure | RunOutcome::Aborted
        )
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
    /// Not executed because an earlier step failed or the run was aborted.
    #[serde(rename = "skipped")]
    Skipped,
}

/// Ordered log output plus terminal status for one step.
///
/// Owned exclusively by its run; chunks are append-only until the run
/// terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(rename = "stepIndex")]
    pub step_index: usize,
    #[serde(rename = "name")]
    pub name: String,
    #[serde(default, rename = "chunks")]
    pub chunks: Vec<String>,
    #[serde(rename = "status")]
    pub status: StepStatus,
}

impl StepResult {
    pub fn started(step_index: usize, name: impl Into<String>) -> Self {
        Self {
            step_index,
            name: name.into(),
            chunks: Vec::new(),
            status: StepStatus::Running,
        }
    }
}

/// The live (and later persisted) binding of one request to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRun {
    #[serde(rename = "runId")]
    pub run_id: Uuid,
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
    #[serde(rename = "workerId")]
    pub worker_id: Uuid,
    #[serde(rename = "target")]
    pub target: String,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(default, rename = "finishedAt")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "steps")]
    pub steps: Vec<StepResult>,
    #[serde(rename = "outcome")]
    pub outcome: RunOutcome,
}

impl BuildRun {
    /// Create a new run binding at dispatch time.
    pub fn new(request: &BuildRequest, worker_id: Uuid) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            request_id: request.request_id,
            worker_id,
            target: request.target.clone(),
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
            outcome: RunOutcome::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_request_starts_queued() {
        let request = BuildRequest::new(
            "demo",
            vec![BuildStep {
                name: "compile".into(),
                command: "make".into(),
                args: vec![],
            }],
            5,
            caps(&["linux"]),
            TriggerInfo::default(),
        );
        assert_eq!(request.state, RequestState::Queued);
        assert_eq!(request.retry_count, 0);
    }

    #[test]
    fn test_run_outcome_finality() {
        assert!(!RunOutcome::Pending.is_final());
        assert!(!RunOutcome::Running.is_final());
        assert!(RunOutcome::Success.is_final());
        assert!(RunOutcome::Failure.is_final());
        assert!(RunOutcome::Aborted.is_final());
    }

    #[test]
    fn test_request_round_trips_through_json() {
        let request = BuildRequest::new("demo", vec![], 0, caps(&["linux"]), TriggerInfo::default());
        let json = serde_json::to_string(&request).unwrap();
        let back: BuildRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id, request.request_id);
        assert_eq!(back.state, RequestState::Queued);
    }
}
