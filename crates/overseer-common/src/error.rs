// Protocol-level error kinds shared by the master and worker.
// Application code wraps these in `anyhow` at the edges; nothing in this
// enum is allowed to terminate the master process.

use uuid::Uuid;

/// Errors arising from the coordination protocol itself.
///
/// Disconnects and timeouts are recoverable (the request is re-queued up to
/// the retry limit); `RetryExhausted` and `AuthenticationFailure` are surfaced
/// outward to the trigger/notifier collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    /// Registration presented a credential that does not match the
    /// configured token.
    #[error("authentication failure for worker '{worker_name}'")]
    AuthenticationFailure { worker_name: String },

    /// A worker with the same name is already registered and live.
    #[error("worker '{worker_name}' is already registered")]
    DuplicateWorker { worker_name: String },

    /// No connected worker's capabilities satisfy the request's required
    /// tags. The request stays queued.
    #[error("no worker satisfies required capabilities {required:?}")]
    CapabilityMismatch { required: Vec<String> },

    /// A worker missed its heartbeat window; treated as a disconnect.
    #[error("worker '{worker_name}' timed out")]
    WorkerTimeout { worker_name: String },

    /// A step output chunk arrived for a step index ahead of the next
    /// expected step. The chunk is rejected; the run continues.
    #[error("out-of-order step chunk for run {run_id}: expected index <= {expected}, got {got}")]
    OrderingViolation {
        run_id: Uuid,
        expected: usize,
        got: usize,
    },

    /// The request lost its worker more times than the retry limit allows
    /// and is now permanently failed.
    #[error("request {request_id} exhausted its {limit} retries")]
    RetryExhausted { request_id: Uuid, limit: u32 },

    /// A message referenced a worker id the registry does not know.
    #[error("unknown worker id {worker_id}")]
    UnknownWorker { worker_id: Uuid },

    /// A message referenced a run id the collector does not know.
    #[error("unknown run id {run_id}")]
    UnknownRun { run_id: Uuid },

    /// A dispatch was attempted for a request that already has a live run.
    #[error("request {request_id} already has an active run")]
    RunAlreadyActive { request_id: Uuid },

    /// Malformed or oversized traffic on a connection.
    #[error("protocol error: {0}")]
    Protocol(String),
}
