// Dispatcher: matches queued build requests to under-capacity workers and
// owns the run lifecycle (bind, complete, abort, worker-loss recovery).
//
// All matching runs through a single event-consumer loop; the queue-removal
// plus capacity-reservation pair happens under one lock so a worker slot is
// never double-assigned.

use crate::collector::ResultCollector;
use crate::notifier::BuildNotifier;
use crate::queue::BuildQueue;
use crate::registry::{WorkerRegistry, WorkerSnapshot};

use dashmap::DashMap;
use overseer_common::error::CoordinationError;
use overseer_common::messages::MasterMessage;
use overseer_common::model::{BuildRequest, BuildRun, BuildStep, RequestState, RunOutcome, TriggerInfo};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Events that wake the dispatch loop.
#[derive(Debug)]
pub enum DispatchEvent {
    /// Something was enqueued.
    QueueChanged,
    /// A worker registered or released a capacity slot.
    WorkerReady { worker_id: Uuid },
    /// A worker disconnected or timed out; its in-flight runs need the
    /// re-queue-or-fail decision.
    WorkerOffline { worker_id: Uuid, name: String },
}

/// The live binding of one request to one worker.
struct ActiveRun {
    request: BuildRequest,
    worker_id: Uuid,
    /// Signalled when the worker acknowledges an abort.
    abort_ack: Arc<Notify>,
    /// Set once an operator abort is in flight, so worker-loss handling
    /// does not re-queue a run that was deliberately cancelled.
    aborting: AtomicBool,
}

/// Assigns queued work to available workers.
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    collector: Arc<ResultCollector>,
    notifier: Arc<dyn BuildNotifier>,
    queue: Mutex<BuildQueue>,
    /// request id -> run id, guaranteeing at most one active run per request.
    active_by_request: DashMap<Uuid, Uuid>,
    /// run id -> binding.
    active_runs: DashMap<Uuid, ActiveRun>,
    events_tx: mpsc::Sender<DispatchEvent>,
    retry_limit: u32,
    abort_grace: Duration,
}

impl Dispatcher {
    /// Create the dispatcher and the event receiver its loop consumes.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        collector: Arc<ResultCollector>,
        notifier: Arc<dyn BuildNotifier>,
        retry_limit: u32,
        abort_grace: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<DispatchEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let dispatcher = Arc::new(Self {
            registry,
            collector,
            notifier,
            queue: Mutex::new(BuildQueue::new()),
            active_by_request: DashMap::new(),
            active_runs: DashMap::new(),
            events_tx,
            retry_limit,
            abort_grace,
        });
        (dispatcher, events_rx)
    }

    /// Sender used by the connection layer to report worker events.
    pub fn events_tx(&self) -> mpsc::Sender<DispatchEvent> {
        self.events_tx.clone()
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Accept a new build request from the trigger collaborator.
    pub fn submit(
        &self,
        target: String,
        steps: Vec<BuildStep>,
        priority: i32,
        required_capabilities: BTreeSet<String>,
        trigger: TriggerInfo,
    ) -> Uuid {
        let request = BuildRequest::new(target, steps, priority, required_capabilities, trigger);
        let request_id = request.request_id;
        tracing::info!(
            "Request {} queued for '{}' (priority={})",
            request_id,
            request.target,
            request.priority
        );
        self.queue.lock().enqueue(request);
        self.wake(DispatchEvent::QueueChanged);
        request_id
    }

    /// Number of requests currently queued.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Number of runs currently bound to workers.
    pub fn active_run_count(&self) -> usize {
        self.active_runs.len()
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Consume dispatch events until cancelled.
    ///
    /// Single consumer: every capacity decision flows through this task (or
    /// a direct test call into the same handlers), never two at once.
    pub async fn dispatch_loop(
        self: Arc<Self>,
        mut events_rx: mpsc::Receiver<DispatchEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                _ = cancel.cancelled() => {
                    tracing::debug!("Dispatch loop stopping");
                    return;
                }
            };

            if let DispatchEvent::WorkerOffline { worker_id, name } = &event {
                self.handle_worker_offline(*worker_id, name).await;
            }
            self.dispatch_pending().await;
        }
    }

    /// Match queued requests to every under-capacity worker.
    pub async fn dispatch_pending(&self) {
        for worker in self.registry.snapshots() {
            loop {
                // Critical section: queue removal and slot reservation are
                // one atomic decision under the queue lock.
                let request = {
                    let mut queue = self.queue.lock();
                    match queue.next_eligible(&worker.capabilities) {
                        Some(request) => {
                            if self.registry.try_reserve_slot(worker.worker_id) {
                                Some(request)
                            } else {
                                queue.enqueue(request);
                                None
                            }
                        }
                        None => None,
                    }
                };

                let Some(request) = request else { break };
                if !self.bind_and_send(request, &worker).await {
                    break;
                }
            }
        }
    }

    /// Bind a request to a worker and send the step list.
    ///
    /// Returns `false` when the worker could not take the run (its slot is
    /// released and the request returns to the queue).
    async fn bind_and_send(&self, mut request: BuildRequest, worker: &WorkerSnapshot) -> bool {
        if self.active_by_request.contains_key(&request.request_id) {
            // The queue is the only source of dispatchable requests, so an
            // already-active request here is a bookkeeping bug.
            tracing::error!(
                "Request {} already has an active run — refusing second dispatch",
                request.request_id
            );
            self.registry.release_slot(worker.worker_id);
            return false;
        }

        let Some(sender) = self.registry.sender(worker.worker_id) else {
            self.registry.release_slot(worker.worker_id);
            self.queue.lock().enqueue(request);
            return false;
        };

        request.state = RequestState::Dispatched;
        let run = BuildRun::new(&request, worker.worker_id);
        let run_id = run.run_id;

        let message = MasterMessage::StartRun {
            run_id,
            target: request.target.clone(),
            steps: request.steps.clone(),
        };

        self.collector.start_run(run, &request.steps);
        self.active_by_request.insert(request.request_id, run_id);
        self.active_runs.insert(
            run_id,
            ActiveRun {
                request: {
                    let mut r = request.clone();
                    r.state = RequestState::Running;
                    r
                },
                worker_id: worker.worker_id,
                abort_ack: Arc::new(Notify::new()),
                aborting: AtomicBool::new(false),
            },
        );

        if sender.send(message).await.is_err() {
            // Connection dropped between snapshot and send; the run never
            // reached the worker, so it goes straight back to the queue
            // without burning a retry.
            tracing::warn!(
                "Worker '{}' vanished during dispatch of {} — re-queueing",
                worker.name,
                request.request_id
            );
            self.active_by_request.remove(&request.request_id);
            self.active_runs.remove(&run_id);
            self.collector.evict(run_id);
            self.registry.release_slot(worker.worker_id);
            self.queue.lock().enqueue(request);
            return false;
        }

        tracing::info!(
            "Dispatched request {} as run {} to worker '{}'",
            request.request_id,
            run_id,
            worker.name
        );
        true
    }

    // -----------------------------------------------------------------------
    // Completion and recovery
    // -----------------------------------------------------------------------

    /// A worker reported the terminal outcome of a run.
    pub async fn on_run_completed(&self, worker_id: Uuid, run_id: Uuid, outcome: RunOutcome) {
        let Some((_, active)) = self.active_runs.remove(&run_id) else {
            // Late report for a run already settled (abort or worker loss).
            tracing::debug!("Completion for unknown run {} ignored", run_id);
            return;
        };
        self.active_by_request.remove(&active.request.request_id);

        match self.collector.finalize(run_id, outcome).await {
            Ok(recorded) => {
                tracing::info!("Run {} finalized with outcome {:?}", run_id, recorded);
            }
            Err(e) => {
                tracing::warn!("Failed to finalize run {}: {}", run_id, e);
            }
        }
        self.collector.evict(run_id);
        self.registry.release_slot(worker_id);
        self.wake(DispatchEvent::WorkerReady { worker_id });
    }

    /// The worker acknowledged an abort for this run.
    pub fn on_abort_ack(&self, run_id: Uuid) {
        if let Some(active) = self.active_runs.get(&run_id) {
            active.abort_ack.notify_one();
        }
    }

    /// Abort an in-flight run (operator request).
    ///
    /// Sends the abort to the worker and waits a bounded grace period for
    /// the acknowledgement; a silent worker is force-disconnected. The
    /// capacity slot is released either way.
    pub async fn abort_run(self: &Arc<Self>, run_id: Uuid) -> Result<(), CoordinationError> {
        let (worker_id, abort_ack) = {
            let active = self
                .active_runs
                .get(&run_id)
                .ok_or(CoordinationError::UnknownRun { run_id })?;
            active.aborting.store(true, Ordering::SeqCst);
            (active.worker_id, active.abort_ack.clone())
        };

        if let Some(sender) = self.registry.sender(worker_id) {
            let _ = sender.send(MasterMessage::AbortRun { run_id }).await;
        }

        let dispatcher = Arc::clone(self);
        let grace = self.abort_grace;
        tokio::spawn(async move {
            let acknowledged = tokio::select! {
                _ = abort_ack.notified() => true,
                _ = tokio::time::sleep(grace) => false,
            };
            if !acknowledged {
                tracing::warn!(
                    "No abort acknowledgement for run {} within {}s — forcing disconnect",
                    run_id,
                    grace.as_secs()
                );
                dispatcher.registry.force_disconnect(worker_id);
            }
            dispatcher.settle_aborted(run_id).await;
        });

        Ok(())
    }

    /// Settle an aborted run: finalize, release the slot, free the worker.
    /// Safe to race with completion and worker-loss handling; whoever
    /// removes the binding first does the settling.
    async fn settle_aborted(&self, run_id: Uuid) {
        let Some((_, active)) = self.active_runs.remove(&run_id) else {
            return;
        };
        self.active_by_request.remove(&active.request.request_id);

        if let Err(e) = self.collector.finalize(run_id, RunOutcome::Aborted).await {
            tracing::warn!("Failed to finalize aborted run {}: {}", run_id, e);
        }
        self.collector.evict(run_id);
        self.registry.release_slot(active.worker_id);
        self.wake(DispatchEvent::WorkerReady {
            worker_id: active.worker_id,
        });
    }

    /// A worker disconnected or timed out with runs in flight.
    ///
    /// Each run is aborted; its request is re-queued at its original
    /// priority unless the retry limit is exhausted, in which case it is
    /// marked permanently failed and reported outward.
    pub async fn handle_worker_offline(&self, worker_id: Uuid, name: &str) {
        let run_ids: Vec<Uuid> = self
            .active_runs
            .iter()
            .filter(|entry| entry.worker_id == worker_id)
            .map(|entry| *entry.key())
            .collect();

        if !run_ids.is_empty() {
            tracing::warn!(
                "Worker '{}' went offline with {} run(s) in flight",
                name,
                run_ids.len()
            );
        }

        for run_id in run_ids {
            let Some((_, active)) = self.active_runs.remove(&run_id) else {
                continue;
            };
            self.active_by_request.remove(&active.request.request_id);

            if let Err(e) = self.collector.finalize(run_id, RunOutcome::Aborted).await {
                tracing::warn!("Failed to finalize orphaned run {}: {}", run_id, e);
            }
            self.collector.evict(run_id);

            if active.aborting.load(Ordering::SeqCst) {
                // Operator abort in progress; the run must not come back.
                continue;
            }
            self.requeue_or_fail(active.request).await;
        }
    }

    /// The re-queue-or-fail decision for a request that lost its worker.
    async fn requeue_or_fail(&self, mut request: BuildRequest) {
        request.retry_count += 1;

        if request.retry_count > self.retry_limit {
            request.state = RequestState::Failed;
            let error = CoordinationError::RetryExhausted {
                request_id: request.request_id,
                limit: self.retry_limit,
            };
            self.notifier.request_failed(&request, &error).await;
            return;
        }

        tracing::info!(
            "Re-queueing request {} (retry {}/{})",
            request.request_id,
            request.retry_count,
            self.retry_limit
        );
        self.queue.lock().enqueue(request);
        self.wake(DispatchEvent::QueueChanged);
    }

    fn wake(&self, event: DispatchEvent) {
        // A full channel already has a dispatch pass pending; dropping the
        // event is safe because every pass scans all workers.
        let _ = self.events_tx.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::LogNotifier;
    use crate::persistence::BuildStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use overseer_common::credential::token_digest;

    struct NullStore;

    #[async_trait]
    impl BuildStore for NullStore {
        async fn save(&self, _run: &BuildRun) -> Result<()> {
            Ok(())
        }
        async fn load(&self, _run_id: Uuid) -> Result<Option<BuildRun>> {
            Ok(None)
        }
        async fn list(&self) -> Result<Vec<Uuid>> {
            Ok(vec![])
        }
    }

    struct RecordingNotifier {
        failures: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl BuildNotifier for RecordingNotifier {
        async fn run_finalized(&self, _run: &BuildRun) {}
        async fn request_failed(&self, request: &BuildRequest, _error: &CoordinationError) {
            self.failures.lock().push(request.request_id);
        }
    }

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    struct Harness {
        registry: Arc<WorkerRegistry>,
        dispatcher: Arc<Dispatcher>,
        notifier: Arc<RecordingNotifier>,
        _events_rx: mpsc::Receiver<DispatchEvent>,
    }

    fn harness(retry_limit: u32) -> Harness {
        let registry = Arc::new(WorkerRegistry::new(token_digest("secret")));
        let notifier = Arc::new(RecordingNotifier {
            failures: Mutex::new(Vec::new()),
        });
        let collector = Arc::new(ResultCollector::new(
            Arc::new(NullStore),
            Arc::new(LogNotifier),
        ));
        let (dispatcher, events_rx) = Dispatcher::new(
            registry.clone(),
            collector,
            notifier.clone(),
            retry_limit,
            Duration::from_millis(50),
        );
        Harness {
            registry,
            dispatcher,
            notifier,
            _events_rx: events_rx,
        }
    }

    fn add_worker(
        harness: &Harness,
        name: &str,
        capacity: u32,
        tags: &[&str],
    ) -> (Uuid, mpsc::Receiver<MasterMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let id = harness
            .registry
            .register(
                name,
                "secret",
                caps(tags),
                capacity,
                tx,
                CancellationToken::new(),
            )
            .unwrap();
        (id, rx)
    }

    fn submit(harness: &Harness, target: &str, priority: i32, tags: &[&str]) -> Uuid {
        harness.dispatcher.submit(
            target.to_string(),
            vec![BuildStep {
                name: "step".into(),
                command: "true".into(),
                args: vec![],
            }],
            priority,
            caps(tags),
            TriggerInfo::default(),
        )
    }

    fn expect_start_run(rx: &mut mpsc::Receiver<MasterMessage>) -> (Uuid, String) {
        match rx.try_recv().expect("expected a StartRun message") {
            MasterMessage::StartRun { run_id, target, .. } => (run_id, target),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_priority_dispatches_first() {
        let h = harness(3);
        let (worker_id, mut rx) = add_worker(&h, "bot1", 1, &["linux"]);

        submit(&h, "r1", 1, &["linux"]);
        submit(&h, "r2", 5, &["linux"]);
        h.dispatcher.dispatch_pending().await;

        let (run_id, target) = expect_start_run(&mut rx);
        assert_eq!(target, "r2");
        // Capacity 1: nothing else dispatched yet.
        assert!(rx.try_recv().is_err());
        assert_eq!(h.dispatcher.queue_len(), 1);

        h.dispatcher
            .on_run_completed(worker_id, run_id, RunOutcome::Success)
            .await;
        h.dispatcher.dispatch_pending().await;

        let (_, target) = expect_start_run(&mut rx);
        assert_eq!(target, "r1");
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let h = harness(3);
        let (_, mut rx) = add_worker(&h, "bot1", 2, &["linux"]);

        for i in 0..5 {
            submit(&h, &format!("r{}", i), 0, &["linux"]);
        }
        h.dispatcher.dispatch_pending().await;
        // Run a second pass to show it does not over-assign.
        h.dispatcher.dispatch_pending().await;

        let mut started = 0;
        while rx.try_recv().is_ok() {
            started += 1;
        }
        assert_eq!(started, 2);
        assert_eq!(h.dispatcher.queue_len(), 3);
        assert_eq!(h.dispatcher.active_run_count(), 2);
    }

    #[tokio::test]
    async fn test_capability_mismatch_stays_queued() {
        let h = harness(3);
        let (_, mut rx) = add_worker(&h, "bot1", 1, &["linux"]);

        submit(&h, "needs-windows", 9, &["windows"]);
        h.dispatcher.dispatch_pending().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(h.dispatcher.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_worker_loss_requeues_then_fails() {
        let h = harness(3);

        let request_id = submit(&h, "r1", 0, &["linux"]);

        // Lose the worker mid-run four times; the first three re-queue,
        // the fourth exhausts the retry limit.
        for round in 0..4 {
            let (worker_id, mut rx) = add_worker(&h, &format!("bot{}", round), 1, &["linux"]);
            h.dispatcher.dispatch_pending().await;
            let _ = expect_start_run(&mut rx);

            h.registry.deregister(worker_id);
            h.dispatcher
                .handle_worker_offline(worker_id, &format!("bot{}", round))
                .await;

            if round < 3 {
                assert_eq!(h.dispatcher.queue_len(), 1, "round {}", round);
                assert!(h.notifier.failures.lock().is_empty());
            }
        }

        assert_eq!(h.dispatcher.queue_len(), 0);
        assert_eq!(h.notifier.failures.lock().as_slice(), &[request_id]);
    }

    #[tokio::test]
    async fn test_at_most_one_active_run_per_request() {
        let h = harness(3);
        let (_, mut rx1) = add_worker(&h, "bot1", 1, &["linux"]);
        let (_, mut rx2) = add_worker(&h, "bot2", 1, &["linux"]);

        submit(&h, "r1", 0, &["linux"]);
        h.dispatcher.dispatch_pending().await;
        h.dispatcher.dispatch_pending().await;

        let started = [rx1.try_recv().is_ok(), rx2.try_recv().is_ok()];
        assert_eq!(started.iter().filter(|s| **s).count(), 1);
        assert_eq!(h.dispatcher.active_run_count(), 1);
    }

    #[tokio::test]
    async fn test_abort_without_ack_releases_slot() {
        let h = harness(3);
        let (_, mut rx) = add_worker(&h, "bot1", 1, &["linux"]);

        submit(&h, "r1", 0, &["linux"]);
        h.dispatcher.dispatch_pending().await;
        let (run_id, _) = expect_start_run(&mut rx);

        h.dispatcher.abort_run(run_id).await.unwrap();

        // Worker never acks; after the grace period the run settles and
        // the slot frees up.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.dispatcher.active_run_count(), 0);

        submit(&h, "r2", 0, &["linux"]);
        h.dispatcher.dispatch_pending().await;
        let abort_msg = rx.try_recv().expect("expected AbortRun");
        assert!(matches!(abort_msg, MasterMessage::AbortRun { .. }));
        let (_, target) = expect_start_run(&mut rx);
        assert_eq!(target, "r2");
    }

    #[tokio::test]
    async fn test_abort_unknown_run() {
        let h = harness(3);
        let err = h.dispatcher.abort_run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoordinationError::UnknownRun { .. }));
    }
}
