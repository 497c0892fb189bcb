// Status/notification collaborator. The master reports finalized runs and
// permanent request failures here; what happens next (display, alerting) is
// somebody else's problem.

use async_trait::async_trait;
use overseer_common::error::CoordinationError;
use overseer_common::model::{BuildRequest, BuildRun};

/// Receives finalized outcomes and permanent failures.
#[async_trait]
pub trait BuildNotifier: Send + Sync {
    /// A run reached a terminal outcome.
    async fn run_finalized(&self, run: &BuildRun);

    /// A request failed permanently (retries exhausted) or was rejected.
    async fn request_failed(&self, request: &BuildRequest, error: &CoordinationError);
}

/// Default notifier: writes outcomes to the log.
pub struct LogNotifier;

#[async_trait]
impl BuildNotifier for LogNotifier {
    async fn run_finalized(&self, run: &BuildRun) {
        tracing::info!(
            "Build run {} for '{}' finished: {:?} ({} step(s) recorded)",
            run.run_id,
            run.target,
            run.outcome,
            run.steps.len()
        );
    }

    async fn request_failed(&self, request: &BuildRequest, error: &CoordinationError) {
        tracing::error!(
            "Build request {} for '{}' failed permanently: {}",
            request.request_id,
            request.target,
            error
        );
    }
}
