// Connection layer: accepts worker connections, runs the registration
// handshake and one session task per worker.

use crate::collector::ResultCollector;
use crate::dispatcher::{DispatchEvent, Dispatcher};
use crate::registry::WorkerRegistry;

use anyhow::{Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use overseer_common::backoff::Backoff;
use overseer_common::codec::FrameCodec;
use overseer_common::messages::{MasterMessage, WorkerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A worker must complete the registration handshake within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Depth of the per-connection outbound queue.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

type WireSink = SplitSink<Framed<TcpStream, FrameCodec<WorkerMessage>>, MasterMessage>;
type WireStream = SplitStream<Framed<TcpStream, FrameCodec<WorkerMessage>>>;

/// Bind the worker listener and accept connections until cancelled.
pub async fn run_worker_listener(
    bind: &str,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    collector: Arc<ResultCollector>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind worker listener on {}", bind))?;
    tracing::info!("Worker listener on {}", bind);
    serve_worker_listener(listener, registry, dispatcher, collector, cancel).await
}

/// Accept worker connections on an already-bound listener.
pub async fn serve_worker_listener(
    listener: TcpListener,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    collector: Arc<ResultCollector>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut backoff = Backoff::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => {
                tracing::debug!("Worker listener stopping");
                return Ok(());
            }
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff.reset();
                tracing::debug!("Worker connection from {}", peer);
                let registry = registry.clone();
                let dispatcher = dispatcher.clone();
                let collector = collector.clone();
                let conn_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_worker_connection(stream, registry, dispatcher, collector, conn_cancel)
                            .await
                    {
                        tracing::warn!("Worker connection from {} ended with error: {:#}", peer, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Accept failed on worker listener: {}", e);
                if !backoff.increment_and_wait(&cancel).await {
                    return Ok(());
                }
            }
        }
    }
}

/// Run one worker session: handshake, then the duplex message loop.
async fn handle_worker_connection(
    stream: TcpStream,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    collector: Arc<ResultCollector>,
    conn_cancel: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, FrameCodec::<WorkerMessage>::new());

    // Handshake: the first frame must be Register, within the timeout.
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .context("Worker did not register within the handshake window")?;

    let (worker_name, token, capabilities, capacity) = match first {
        Some(Ok(WorkerMessage::Register {
            worker_name,
            token,
            capabilities,
            capacity,
        })) => (worker_name, token, capabilities, capacity),
        Some(Ok(other)) => {
            anyhow::bail!("Expected registration handshake, got {:?}", other);
        }
        Some(Err(e)) => return Err(e).context("Failed to decode registration frame"),
        None => anyhow::bail!("Connection closed before registration"),
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<MasterMessage>(OUTBOUND_QUEUE_DEPTH);

    let worker_id = match registry.register(
        &worker_name,
        &token,
        capabilities,
        capacity,
        outbound_tx,
        conn_cancel.clone(),
    ) {
        Ok(worker_id) => worker_id,
        Err(e) => {
            tracing::warn!("Rejecting worker '{}': {}", worker_name, e);
            let _ = framed
                .send(MasterMessage::Rejected {
                    reason: e.to_string(),
                })
                .await;
            return Ok(());
        }
    };

    framed
        .send(MasterMessage::Registered { worker_id })
        .await
        .context("Failed to send registration acceptance")?;

    let events_tx = dispatcher.events_tx();
    let _ = events_tx.try_send(DispatchEvent::WorkerReady { worker_id });

    let (mut sink, mut stream): (WireSink, WireStream) = framed.split();
    let result = session_loop(
        &mut sink,
        &mut stream,
        &mut outbound_rx,
        worker_id,
        &registry,
        &dispatcher,
        &collector,
        &conn_cancel,
    )
    .await;

    // One exit path for disconnect, timeout and shutdown: deregister and
    // hand in-flight runs to the dispatcher.
    registry.deregister(worker_id);
    let _ = events_tx
        .send(DispatchEvent::WorkerOffline {
            worker_id,
            name: worker_name.clone(),
        })
        .await;

    result
}

async fn session_loop(
    sink: &mut WireSink,
    stream: &mut WireStream,
    outbound_rx: &mut mpsc::Receiver<MasterMessage>,
    worker_id: Uuid,
    registry: &Arc<WorkerRegistry>,
    dispatcher: &Arc<Dispatcher>,
    collector: &Arc<ResultCollector>,
    conn_cancel: &CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { return Ok(()) };
                sink.send(message)
                    .await
                    .context("Failed to send message to worker")?;
            }

            inbound = stream.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        return Err(e).context("Failed to decode worker frame");
                    }
                    None => {
                        tracing::info!("Worker {} disconnected", worker_id);
                        return Ok(());
                    }
                };
                handle_message(sink, message, worker_id, registry, dispatcher, collector)
                    .await?;
            }

            _ = conn_cancel.cancelled() => {
                let _ = sink.send(MasterMessage::Shutdown).await;
                return Ok(());
            }
        }
    }
}

async fn handle_message(
    sink: &mut WireSink,
    message: WorkerMessage,
    worker_id: Uuid,
    registry: &Arc<WorkerRegistry>,
    dispatcher: &Arc<Dispatcher>,
    collector: &Arc<ResultCollector>,
) -> Result<()> {
    match message {
        WorkerMessage::Heartbeat { worker_id: claimed } => {
            if registry.heartbeat(claimed) {
                sink.send(MasterMessage::HeartbeatAck)
                    .await
                    .context("Failed to send heartbeat ack")?;
            } else {
                tracing::warn!("Heartbeat for unknown worker {}", claimed);
            }
        }

        WorkerMessage::StepOutput {
            run_id,
            step_index,
            chunk,
        } => {
            if let Err(e) = collector.append_step_output(run_id, step_index, chunk) {
                // Out-of-order chunks are rejected but never kill the run.
                tracing::warn!("Rejected step output from worker {}: {}", worker_id, e);
            }
        }

        WorkerMessage::StepCompleted {
            run_id,
            step_index,
            status,
        } => {
            if let Err(e) = collector.complete_step(run_id, step_index, status) {
                tracing::warn!("Rejected step completion from worker {}: {}", worker_id, e);
            }
        }

        WorkerMessage::RunCompleted { run_id, outcome } => {
            dispatcher.on_run_completed(worker_id, run_id, outcome).await;
        }

        WorkerMessage::AbortAck { run_id } => {
            dispatcher.on_abort_ack(run_id);
        }

        WorkerMessage::Register { worker_name, .. } => {
            anyhow::bail!(
                "Worker {} sent a second registration as '{}'",
                worker_id,
                worker_name
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::notifier::BuildNotifier;
    use crate::persistence::BuildStore;
    use async_trait::async_trait;
    use overseer_common::config_store::WorkerSettings;
    use overseer_common::credential::token_digest;
    use overseer_common::model::{BuildRequest, BuildRun, BuildStep, RunOutcome, TriggerInfo};
    use overseer_common::error::CoordinationError;
    use overseer_worker::Agent;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

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

    /// Notifier that forwards finalized runs into a channel the test reads.
    struct ChannelNotifier {
        finalized_tx: mpsc::Sender<BuildRun>,
    }

    #[async_trait]
    impl BuildNotifier for ChannelNotifier {
        async fn run_finalized(&self, run: &BuildRun) {
            let _ = self.finalized_tx.send(run.clone()).await;
        }
        async fn request_failed(&self, _request: &BuildRequest, _error: &CoordinationError) {}
    }

    struct TestMaster {
        addr: String,
        registry: Arc<WorkerRegistry>,
        dispatcher: Arc<Dispatcher>,
        finalized_rx: mpsc::Receiver<BuildRun>,
        cancel: CancellationToken,
    }

    async fn start_master(token: &str) -> TestMaster {
        let (finalized_tx, finalized_rx) = mpsc::channel(16);
        let registry = Arc::new(WorkerRegistry::new(token_digest(token)));
        let collector = Arc::new(ResultCollector::new(
            Arc::new(NullStore),
            Arc::new(ChannelNotifier { finalized_tx }),
        ));
        let (dispatcher, events_rx) = Dispatcher::new(
            registry.clone(),
            collector.clone(),
            Arc::new(crate::notifier::LogNotifier),
            3,
            Duration::from_secs(1),
        );

        let cancel = CancellationToken::new();
        tokio::spawn(
            dispatcher
                .clone()
                .dispatch_loop(events_rx, cancel.child_token()),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_worker_listener(
            listener,
            registry.clone(),
            dispatcher.clone(),
            collector,
            cancel.child_token(),
        ));

        TestMaster {
            addr,
            registry,
            dispatcher,
            finalized_rx,
            cancel,
        }
    }

    fn worker_settings(master: &TestMaster, token: &str, work_dir: PathBuf) -> WorkerSettings {
        WorkerSettings {
            master_address: master.addr.clone(),
            worker_name: "bot1".into(),
            token: token.into(),
            capabilities: vec!["linux".into()],
            capacity: 1,
            work_directory: work_dir,
        }
    }

    async fn wait_for_registration(master: &TestMaster) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while master.registry.is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker never registered"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_end_to_end_build() {
        let mut master = start_master("secret").await;
        let work_dir = tempfile::tempdir().unwrap();

        let agent = Agent::new(worker_settings(&master, "secret", work_dir.path().into()));
        let agent_cancel = master.cancel.child_token();
        tokio::spawn(async move { agent.run(agent_cancel).await });

        wait_for_registration(&master).await;

        master.dispatcher.submit(
            "demo".into(),
            vec![BuildStep {
                name: "greet".into(),
                command: "sh".into(),
                args: vec!["-c".into(), "echo hello".into()],
            }],
            0,
            caps(&["linux"]),
            TriggerInfo::default(),
        );

        let run = tokio::time::timeout(Duration::from_secs(10), master.finalized_rx.recv())
            .await
            .expect("build did not finish in time")
            .expect("notifier channel closed");

        assert_eq!(run.outcome, RunOutcome::Success);
        assert_eq!(run.steps.len(), 1);
        assert!(run.steps[0].chunks.contains(&"hello".to_string()));

        master.cancel.cancel();
    }

    #[tokio::test]
    async fn test_wrong_token_rejected_end_to_end() {
        let master = start_master("secret").await;
        let work_dir = tempfile::tempdir().unwrap();

        let agent = Agent::new(worker_settings(&master, "wrong", work_dir.path().into()));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            agent.run(master.cancel.child_token()),
        )
        .await
        .expect("agent did not give up in time");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("registration rejected"));
        assert!(master.registry.is_empty());

        master.cancel.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_worker_name_rejected_end_to_end() {
        let master = start_master("secret").await;
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let first = Agent::new(worker_settings(&master, "secret", dir_a.path().into()));
        let first_cancel = master.cancel.child_token();
        tokio::spawn(async move { first.run(first_cancel).await });
        wait_for_registration(&master).await;

        // Same name, valid token: turned away while the incumbent lives.
        let second = Agent::new(worker_settings(&master, "secret", dir_b.path().into()));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            second.run(master.cancel.child_token()),
        )
        .await
        .expect("second agent did not give up in time");

        assert!(result.unwrap_err().to_string().contains("registration rejected"));
        assert_eq!(master.registry.len(), 1);

        master.cancel.cancel();
    }
}
