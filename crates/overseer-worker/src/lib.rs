// overseer-worker: the build worker agent - master connection, heartbeats
// and step execution.

pub mod agent;
pub mod step_runner;

pub use agent::Agent;
pub use step_runner::StepRunner;
