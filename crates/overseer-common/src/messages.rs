// Wire protocol between the master and its workers, and between the master
// and trigger clients. Every message is one JSON frame (see `codec`).

use crate::model::{BuildStep, RunOutcome, StepStatus, TriggerInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Worker channel
// ---------------------------------------------------------------------------

/// Messages a worker sends to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Registration handshake; must be the first frame on the connection.
    #[serde(rename = "register")]
    Register {
        #[serde(rename = "workerName")]
        worker_name: String,
        /// The shared registration token, sent in the clear over the
        /// (deployment-secured) channel and digest-compared on the master.
        #[serde(rename = "token")]
        token: String,
        #[serde(default, rename = "capabilities")]
        capabilities: BTreeSet<String>,
        #[serde(rename = "capacity")]
        capacity: u32,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(rename = "workerId")]
        worker_id: Uuid,
    },

    /// One chunk of log output for a step.
    #[serde(rename = "stepOutput")]
    StepOutput {
        #[serde(rename = "runId")]
        run_id: Uuid,
        #[serde(rename = "stepIndex")]
        step_index: usize,
        #[serde(rename = "chunk")]
        chunk: String,
    },

    /// Terminal status for one step.
    #[serde(rename = "stepCompleted")]
    StepCompleted {
        #[serde(rename = "runId")]
        run_id: Uuid,
        #[serde(rename = "stepIndex")]
        step_index: usize,
        #[serde(rename = "status")]
        status: StepStatus,
    },

    /// Terminal outcome for the whole run.
    #[serde(rename = "runCompleted")]
    RunCompleted {
        #[serde(rename = "runId")]
        run_id: Uuid,
        #[serde(rename = "outcome")]
        outcome: RunOutcome,
    },

    /// Acknowledges an abort request for a run.
    #[serde(rename = "abortAck")]
    AbortAck {
        #[serde(rename = "runId")]
        run_id: Uuid,
    },
}

/// Messages the master sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MasterMessage {
    /// Registration accepted; the assigned id keys all later traffic.
    #[serde(rename = "registered")]
    Registered {
        #[serde(rename = "workerId")]
        worker_id: Uuid,
    },

    /// Registration rejected; the master closes the connection afterwards.
    #[serde(rename = "rejected")]
    Rejected {
        #[serde(rename = "reason")]
        reason: String,
    },

    #[serde(rename = "heartbeatAck")]
    HeartbeatAck,

    /// Dispatch: run these steps and stream results back.
    #[serde(rename = "startRun")]
    StartRun {
        #[serde(rename = "runId")]
        run_id: Uuid,
        #[serde(rename = "target")]
        target: String,
        #[serde(rename = "steps")]
        steps: Vec<BuildStep>,
    },

    /// Operator or dispatcher abort for an in-flight run.
    #[serde(rename = "abortRun")]
    AbortRun {
        #[serde(rename = "runId")]
        run_id: Uuid,
    },

    /// Master is shutting down; the worker should stop accepting work.
    #[serde(rename = "shutdown")]
    Shutdown,
}

// ---------------------------------------------------------------------------
// Trigger channel
// ---------------------------------------------------------------------------

/// A build submission from a trigger client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TriggerMessage {
    #[serde(rename = "submit")]
    Submit {
        #[serde(rename = "target")]
        target: String,
        #[serde(rename = "steps")]
        steps: Vec<BuildStep>,
        #[serde(default, rename = "priority")]
        priority: i32,
        #[serde(default, rename = "requiredCapabilities")]
        required_capabilities: BTreeSet<String>,
        #[serde(default, rename = "trigger")]
        trigger: TriggerInfo,
    },

    /// Operator abort for an in-flight run.
    #[serde(rename = "abort")]
    Abort {
        #[serde(rename = "runId")]
        run_id: Uuid,
    },
}

/// The master's answer to a trigger submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TriggerReply {
    #[serde(rename = "accepted")]
    Accepted {
        #[serde(rename = "requestId")]
        request_id: Uuid,
    },
    #[serde(rename = "aborting")]
    Aborting {
        #[serde(rename = "runId")]
        run_id: Uuid,
    },
    #[serde(rename = "invalid")]
    Invalid {
        #[serde(rename = "reason")]
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_wire_shape() {
        let msg = WorkerMessage::Register {
            worker_name: "bot1".into(),
            token: "secret".into(),
            capabilities: ["linux".to_string()].into_iter().collect(),
            capacity: 2,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "register");
        assert_eq!(json["workerName"], "bot1");
        assert_eq!(json["capacity"], 2);
    }

    #[test]
    fn test_start_run_round_trip() {
        let msg = MasterMessage::StartRun {
            run_id: Uuid::new_v4(),
            target: "demo".into(),
            steps: vec![BuildStep {
                name: "compile".into(),
                command: "make".into(),
                args: vec!["-j4".into()],
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        match serde_json::from_str::<MasterMessage>(&json).unwrap() {
            MasterMessage::StartRun { steps, target, .. } => {
                assert_eq!(target, "demo");
                assert_eq!(steps[0].args, vec!["-j4".to_string()]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_submit_defaults() {
        let json = r#"{"type":"submit","target":"demo","steps":[]}"#;
        match serde_json::from_str::<TriggerMessage>(json).unwrap() {
            TriggerMessage::Submit {
                priority,
                required_capabilities,
                ..
            } => {
                assert_eq!(priority, 0);
                assert!(required_capabilities.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
