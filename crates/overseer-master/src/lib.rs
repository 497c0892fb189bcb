// overseer-master: the build coordination master - connection layer, worker
// registry, build queue, dispatcher and result collector.

pub mod collector;
pub mod connection;
pub mod dispatcher;
pub mod master;
pub mod notifier;
pub mod persistence;
pub mod queue;
pub mod registry;
pub mod trigger;

pub use collector::ResultCollector;
pub use dispatcher::{DispatchEvent, Dispatcher};
pub use master::Master;
pub use notifier::{BuildNotifier, LogNotifier};
pub use persistence::{BuildStore, FileBuildStore};
pub use queue::BuildQueue;
pub use registry::{WorkerRegistry, WorkerSnapshot};
