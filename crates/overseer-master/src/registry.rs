// Worker registry: tracks connected workers, their capabilities, capacity,
// load and liveness. Owned by the master; explicit init/teardown, no global
// state.

use dashmap::DashMap;
use overseer_common::constants::HEARTBEAT_SCAN_INTERVAL;
use overseer_common::credential;
use overseer_common::error::CoordinationError;
use overseer_common::messages::MasterMessage;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Registry-side state for one connected worker.
pub struct WorkerEntry {
    pub worker_id: Uuid,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
    /// Number of runs currently assigned to this worker.
    pub load: u32,
    pub last_heartbeat: Instant,
    /// Outbound channel into the worker's connection task.
    pub sender: mpsc::Sender<MasterMessage>,
    /// Cancelling this tears down the worker's connection.
    pub connection_cancel: CancellationToken,
}

/// A copy-out view of a worker used by the dispatcher's matching step.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub worker_id: Uuid,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
    pub load: u32,
}

/// Tracks connected workers and their liveness.
pub struct WorkerRegistry {
    workers: DashMap<Uuid, WorkerEntry>,
    /// SHA-256 hex digest registrations are checked against.
    token_digest: String,
}

impl WorkerRegistry {
    pub fn new(token_digest: impl Into<String>) -> Self {
        Self {
            workers: DashMap::new(),
            token_digest: token_digest.into(),
        }
    }

    /// Register a worker from its handshake.
    ///
    /// Rejects on credential mismatch and on a duplicate live name (the
    /// incumbent keeps its registration; the newcomer is turned away).
    pub fn register(
        &self,
        name: &str,
        token: &str,
        capabilities: BTreeSet<String>,
        capacity: u32,
        sender: mpsc::Sender<MasterMessage>,
        connection_cancel: CancellationToken,
    ) -> Result<Uuid, CoordinationError> {
        if !credential::verify_token(token, &self.token_digest) {
            return Err(CoordinationError::AuthenticationFailure {
                worker_name: name.to_string(),
            });
        }

        if self.workers.iter().any(|entry| entry.name == name) {
            return Err(CoordinationError::DuplicateWorker {
                worker_name: name.to_string(),
            });
        }

        let worker_id = Uuid::new_v4();
        let capacity = capacity.max(1);
        self.workers.insert(
            worker_id,
            WorkerEntry {
                worker_id,
                name: name.to_string(),
                capabilities,
                capacity,
                load: 0,
                last_heartbeat: Instant::now(),
                sender,
                connection_cancel,
            },
        );

        tracing::info!(
            "Worker '{}' registered as {} (capacity={})",
            name,
            worker_id,
            capacity
        );
        Ok(worker_id)
    }

    /// Record a heartbeat. Returns `false` for an unknown worker.
    pub fn heartbeat(&self, worker_id: Uuid) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(mut entry) => {
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a worker. Returns its name if it was registered.
    pub fn deregister(&self, worker_id: Uuid) -> Option<String> {
        self.workers.remove(&worker_id).map(|(_, entry)| {
            tracing::info!("Worker '{}' ({}) deregistered", entry.name, worker_id);
            entry.name
        })
    }

    /// Reserve one capacity slot on the worker.
    ///
    /// Returns `false` when the worker is unknown or already at capacity.
    /// Callers serialize this with queue removal (the dispatcher holds its
    /// dispatch lock across both) so a slot is never double-assigned.
    pub fn try_reserve_slot(&self, worker_id: Uuid) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(mut entry) if entry.load < entry.capacity => {
                entry.load += 1;
                true
            }
            _ => false,
        }
    }

    /// Release one capacity slot on the worker (no-op if it disconnected).
    pub fn release_slot(&self, worker_id: Uuid) {
        if let Some(mut entry) = self.workers.get_mut(&worker_id) {
            entry.load = entry.load.saturating_sub(1);
        }
    }

    /// Outbound sender for a worker, if it is still connected.
    pub fn sender(&self, worker_id: Uuid) -> Option<mpsc::Sender<MasterMessage>> {
        self.workers.get(&worker_id).map(|e| e.sender.clone())
    }

    /// Force-disconnect a worker by cancelling its connection task.
    pub fn force_disconnect(&self, worker_id: Uuid) {
        if let Some(entry) = self.workers.get(&worker_id) {
            tracing::warn!("Force-disconnecting worker '{}' ({})", entry.name, worker_id);
            entry.connection_cancel.cancel();
        }
    }

    /// Snapshots of all connected workers.
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .iter()
            .map(|entry| WorkerSnapshot {
                worker_id: entry.worker_id,
                name: entry.name.clone(),
                capabilities: entry.capabilities.clone(),
                capacity: entry.capacity,
                load: entry.load,
            })
            .collect()
    }

    /// Workers whose last heartbeat is older than `timeout`.
    pub fn stale_workers(&self, timeout: Duration) -> Vec<(Uuid, String)> {
        let now = Instant::now();
        self.workers
            .iter()
            .filter(|entry| now.duration_since(entry.last_heartbeat) > timeout)
            .map(|entry| (entry.worker_id, entry.name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Periodic liveness scan.
///
/// A stale worker's connection is cancelled; the connection task then runs
/// the normal disconnect path (deregister + offline event to the dispatcher),
/// so timeout and disconnect share one recovery route.
pub async fn run_heartbeat_monitor(
    registry: Arc<WorkerRegistry>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_SCAN_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => {
                tracing::debug!("Heartbeat monitor stopping");
                return;
            }
        }

        for (worker_id, name) in registry.stale_workers(timeout) {
            tracing::warn!(
                "Worker '{}' ({}) missed its heartbeat window ({}s) — disconnecting",
                name,
                worker_id,
                timeout.as_secs()
            );
            registry.force_disconnect(worker_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_common::credential::token_digest;

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    fn test_registry() -> WorkerRegistry {
        WorkerRegistry::new(token_digest("secret"))
    }

    fn register(registry: &WorkerRegistry, name: &str, capacity: u32) -> Uuid {
        let (tx, _rx) = mpsc::channel(8);
        registry
            .register(
                name,
                "secret",
                caps(&["linux"]),
                capacity,
                tx,
                CancellationToken::new(),
            )
            .unwrap()
    }

    #[test]
    fn test_register_and_heartbeat() {
        let registry = test_registry();
        let id = register(&registry, "bot1", 1);
        assert!(registry.heartbeat(id));
        assert!(!registry.heartbeat(Uuid::new_v4()));
    }

    #[test]
    fn test_bad_token_rejected() {
        let registry = test_registry();
        let (tx, _rx) = mpsc::channel(8);
        let err = registry
            .register(
                "bot1",
                "wrong",
                caps(&[]),
                1,
                tx,
                CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::AuthenticationFailure { .. }
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = test_registry();
        register(&registry, "bot1", 1);

        let (tx, _rx) = mpsc::channel(8);
        let err = registry
            .register(
                "bot1",
                "secret",
                caps(&[]),
                1,
                tx,
                CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CoordinationError::DuplicateWorker { .. }));

        // Name becomes free again after deregistration.
        let ids: Vec<Uuid> = registry.snapshots().iter().map(|s| s.worker_id).collect();
        registry.deregister(ids[0]);
        register(&registry, "bot1", 1);
    }

    #[test]
    fn test_slot_reservation_respects_capacity() {
        let registry = test_registry();
        let id = register(&registry, "bot1", 2);

        assert!(registry.try_reserve_slot(id));
        assert!(registry.try_reserve_slot(id));
        assert!(!registry.try_reserve_slot(id));

        registry.release_slot(id);
        assert!(registry.try_reserve_slot(id));
    }

    #[test]
    fn test_stale_detection() {
        let registry = test_registry();
        let id = register(&registry, "bot1", 1);

        assert!(registry.stale_workers(Duration::from_secs(60)).is_empty());
        let stale = registry.stale_workers(Duration::ZERO);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, id);
    }
}
