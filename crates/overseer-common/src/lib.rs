// overseer-common: shared model, wire protocol and infrastructure for the
// Overseer build coordination system.

pub mod backoff;
pub mod codec;
pub mod config_store;
pub mod constants;
pub mod credential;
pub mod error;
pub mod messages;
pub mod model;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use backoff::Backoff;
pub use codec::{CodecError, FrameCodec};
pub use config_store::{ConfigurationStore, MasterSettings, WorkerSettings};
pub use error::CoordinationError;
pub use messages::{MasterMessage, TriggerMessage, TriggerReply, WorkerMessage};
pub use model::{
    BuildRequest, BuildRun, BuildStep, RequestState, RunOutcome, StepResult, StepStatus,
    TriggerInfo,
};
