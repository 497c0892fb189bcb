// Result collector: receives step output and terminal statuses from
// workers, keeps the authoritative run record, persists it on finalize.

use crate::notifier::BuildNotifier;
use crate::persistence::BuildStore;

use dashmap::DashMap;
use overseer_common::error::CoordinationError;
use overseer_common::model::{BuildRun, BuildStep, RunOutcome, StepResult, StepStatus};
use std::sync::Arc;
use uuid::Uuid;

struct RunSlot {
    run: BuildRun,
    /// Step names from the originating request, indexed by step index.
    step_names: Vec<String>,
}

/// Collects per-step results for live runs and finalizes their records.
pub struct ResultCollector {
    runs: DashMap<Uuid, RunSlot>,
    store: Arc<dyn BuildStore>,
    notifier: Arc<dyn BuildNotifier>,
}

impl ResultCollector {
    pub fn new(store: Arc<dyn BuildStore>, notifier: Arc<dyn BuildNotifier>) -> Self {
        Self {
            runs: DashMap::new(),
            store,
            notifier,
        }
    }

    /// Begin tracking a freshly dispatched run.
    pub fn start_run(&self, mut run: BuildRun, steps: &[BuildStep]) {
        run.outcome = RunOutcome::Running;
        let step_names = steps.iter().map(|s| s.name.clone()).collect();
        self.runs.insert(run.run_id, RunSlot { run, step_names });
    }

    /// Append one chunk of log output to a step.
    ///
    /// A chunk may extend the step currently being recorded or start the
    /// next one; a chunk that skips ahead is rejected with
    /// `OrderingViolation` and the run carries on.
    pub fn append_step_output(
        &self,
        run_id: Uuid,
        step_index: usize,
        chunk: String,
    ) -> Result<(), CoordinationError> {
        let mut slot = self
            .runs
            .get_mut(&run_id)
            .ok_or(CoordinationError::UnknownRun { run_id })?;

        if slot.run.outcome.is_final() {
            return Err(CoordinationError::Protocol(format!(
                "run {} is already finalized",
                run_id
            )));
        }

        let started = slot.run.steps.len();
        if step_index > started {
            return Err(CoordinationError::OrderingViolation {
                run_id,
                expected: started,
                got: step_index,
            });
        }

        if step_index == started {
            let name = slot
                .step_names
                .get(step_index)
                .cloned()
                .ok_or_else(|| {
                    CoordinationError::Protocol(format!(
                        "run {} has no step index {}",
                        run_id, step_index
                    ))
                })?;
            slot.run.steps.push(StepResult::started(step_index, name));
        }

        slot.run.steps[step_index].chunks.push(chunk);
        Ok(())
    }

    /// Record the terminal status of a step.
    ///
    /// Accepts the step currently being recorded, or starts-and-closes the
    /// next step when it produced no output at all.
    pub fn complete_step(
        &self,
        run_id: Uuid,
        step_index: usize,
        status: StepStatus,
    ) -> Result<(), CoordinationError> {
        let mut slot = self
            .runs
            .get_mut(&run_id)
            .ok_or(CoordinationError::UnknownRun { run_id })?;

        if slot.run.outcome.is_final() {
            return Err(CoordinationError::Protocol(format!(
                "run {} is already finalized",
                run_id
            )));
        }

        let started = slot.run.steps.len();
        if step_index > started {
            return Err(CoordinationError::OrderingViolation {
                run_id,
                expected: started,
                got: step_index,
            });
        }

        if step_index == started {
            let name = slot
                .step_names
                .get(step_index)
                .cloned()
                .ok_or_else(|| {
                    CoordinationError::Protocol(format!(
                        "run {} has no step index {}",
                        run_id, step_index
                    ))
                })?;
            slot.run.steps.push(StepResult::started(step_index, name));
        }

        slot.run.steps[step_index].status = status;
        Ok(())
    }

    /// Finalize a run with its terminal outcome.
    ///
    /// Idempotent: a second call is a no-op that returns the recorded
    /// outcome. The first call persists the record and notifies the
    /// status collaborator.
    pub async fn finalize(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
    ) -> Result<RunOutcome, CoordinationError> {
        // Mutate under the map guard, then persist from a clone so no lock
        // is held across the await points below.
        let record = {
            let mut slot = self
                .runs
                .get_mut(&run_id)
                .ok_or(CoordinationError::UnknownRun { run_id })?;

            if slot.run.outcome.is_final() {
                return Ok(slot.run.outcome);
            }

            slot.run.outcome = if outcome.is_final() {
                outcome
            } else {
                RunOutcome::Aborted
            };
            slot.run.finished_at = Some(chrono::Utc::now());
            slot.run.clone()
        };

        if let Err(e) = self.store.save(&record).await {
            // Persistence failure must not take the master down; the
            // in-memory record still holds the outcome.
            tracing::error!("Failed to persist run {}: {:#}", run_id, e);
        }
        self.notifier.run_finalized(&record).await;

        Ok(record.outcome)
    }

    /// Snapshot of a tracked run.
    pub fn run(&self, run_id: Uuid) -> Option<BuildRun> {
        self.runs.get(&run_id).map(|slot| slot.run.clone())
    }

    /// Drop a finalized run from the live table (its record is on disk).
    pub fn evict(&self, run_id: Uuid) {
        self.runs.remove(&run_id);
    }
}
