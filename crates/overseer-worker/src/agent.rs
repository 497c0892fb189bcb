// Worker agent: connects to the master, registers, heartbeats, and runs
// dispatched builds until told to stop.

use crate::step_runner::StepRunner;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use overseer_common::backoff::Backoff;
use overseer_common::codec::FrameCodec;
use overseer_common::config_store::WorkerSettings;
use overseer_common::constants::{return_code, HEARTBEAT_INTERVAL};
use overseer_common::messages::{MasterMessage, WorkerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The master must answer the registration handshake within this window.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Depth of the outbound message queue (step output passes through here).
const OUTBOUND_QUEUE_DEPTH: usize = 256;

type WireSink = SplitSink<Framed<TcpStream, FrameCodec<MasterMessage>>, WorkerMessage>;
type WireStream = SplitStream<Framed<TcpStream, FrameCodec<MasterMessage>>>;

/// How one session with the master ended.
enum SessionEnd {
    /// The master told us to shut down, or the local cancel fired.
    Shutdown,
    /// The connection dropped; reconnect with backoff.
    Disconnected,
}

/// The worker agent: one persistent master connection plus one task per
/// in-flight run.
pub struct Agent {
    settings: WorkerSettings,
    runner: Arc<StepRunner>,
    /// Cancel tokens for in-flight runs, keyed by run id.
    active_runs: Arc<DashMap<Uuid, CancellationToken>>,
}

impl Agent {
    pub fn new(settings: WorkerSettings) -> Self {
        let runner = Arc::new(StepRunner::new(settings.work_directory.clone()));
        Self {
            settings,
            runner,
            active_runs: Arc::new(DashMap::new()),
        }
    }

    /// Run the agent until the master shuts us down or `cancel` fires.
    ///
    /// The connection is re-established with exponential backoff after a
    /// drop; a registration rejection is fatal (retrying with the same
    /// credential cannot succeed).
    pub async fn run(&self, cancel: CancellationToken) -> Result<i32> {
        let mut backoff = Backoff::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(return_code::SUCCESS);
            }

            match self.connect_and_serve(&cancel).await {
                Ok(SessionEnd::Shutdown) => {
                    tracing::info!("Agent stopping");
                    return Ok(return_code::SUCCESS);
                }
                Ok(SessionEnd::Disconnected) => {
                    tracing::warn!("Lost connection to master — reconnecting");
                    backoff.reset();
                    backoff.increment_and_wait(&cancel).await;
                }
                Err(e) if is_rejection(&e) => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Session with master failed: {:#}", e);
                    if !backoff.increment_and_wait(&cancel).await {
                        return Ok(return_code::SUCCESS);
                    }
                }
            }
        }
    }

    /// Connect, register, and serve one session.
    async fn connect_and_serve(&self, cancel: &CancellationToken) -> Result<SessionEnd> {
        let address = &self.settings.master_address;
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("Failed to connect to master at {}", address))?;
        let mut framed = Framed::new(stream, FrameCodec::<MasterMessage>::new());

        let worker_name = self.settings.effective_name();
        framed
            .send(WorkerMessage::Register {
                worker_name: worker_name.clone(),
                token: self.settings.token.clone(),
                capabilities: self.settings.capabilities.iter().cloned().collect(),
                capacity: self.settings.capacity,
            })
            .await
            .context("Failed to send registration")?;

        let reply = tokio::time::timeout(REGISTRATION_TIMEOUT, framed.next())
            .await
            .context("Master did not answer the registration handshake")?;

        let worker_id = match reply {
            Some(Ok(MasterMessage::Registered { worker_id })) => worker_id,
            Some(Ok(MasterMessage::Rejected { reason })) => {
                anyhow::bail!("registration rejected: {}", reason);
            }
            Some(Ok(other)) => anyhow::bail!("Unexpected handshake reply: {:?}", other),
            Some(Err(e)) => return Err(e).context("Failed to decode handshake reply"),
            None => anyhow::bail!("Connection closed during handshake"),
        };

        tracing::info!(
            "Registered with master as '{}' ({}), capacity={}",
            worker_name,
            worker_id,
            self.settings.capacity
        );

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WorkerMessage>(OUTBOUND_QUEUE_DEPTH);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let (mut sink, mut stream): (WireSink, WireStream) = framed.split();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    sink.send(WorkerMessage::Heartbeat { worker_id })
                        .await
                        .context("Failed to send heartbeat")?;
                }

                outbound = outbound_rx.recv() => {
                    // Senders live as long as `outbound_tx` below, so this
                    // arm always yields a message.
                    if let Some(message) = outbound {
                        sink.send(message)
                            .await
                            .context("Failed to send message to master")?;
                    }
                }

                inbound = stream.next() => {
                    let message = match inbound {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(e).context("Failed to decode master frame"),
                        None => {
                            self.cancel_all_runs();
                            return Ok(SessionEnd::Disconnected);
                        }
                    };
                    if self.handle_message(message, &outbound_tx, &mut sink).await? {
                        self.cancel_all_runs();
                        return Ok(SessionEnd::Shutdown);
                    }
                }

                _ = cancel.cancelled() => {
                    tracing::info!("Local shutdown requested");
                    self.cancel_all_runs();
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    /// Handle one inbound master message. Returns `true` on shutdown.
    async fn handle_message(
        &self,
        message: MasterMessage,
        outbound_tx: &mpsc::Sender<WorkerMessage>,
        sink: &mut WireSink,
    ) -> Result<bool> {
        match message {
            MasterMessage::StartRun {
                run_id,
                target,
                steps,
            } => {
                self.start_run(run_id, target, steps, outbound_tx.clone());
            }

            MasterMessage::AbortRun { run_id } => {
                if let Some(token) = self.active_runs.get(&run_id) {
                    tracing::info!("Aborting run {} on master request", run_id);
                    token.cancel();
                } else {
                    tracing::warn!("Abort for unknown run {}", run_id);
                }
                sink.send(WorkerMessage::AbortAck { run_id })
                    .await
                    .context("Failed to send abort ack")?;
            }

            MasterMessage::Shutdown => {
                tracing::info!("Master requested shutdown");
                return Ok(true);
            }

            MasterMessage::HeartbeatAck => {}

            other => {
                tracing::warn!("Unexpected message from master: {:?}", other);
            }
        }
        Ok(false)
    }

    /// Spawn the task that executes one run and reports its outcome.
    fn start_run(
        &self,
        run_id: Uuid,
        target: String,
        steps: Vec<overseer_common::model::BuildStep>,
        outbound_tx: mpsc::Sender<WorkerMessage>,
    ) {
        if self.active_runs.contains_key(&run_id) {
            tracing::warn!("Run {} is already in flight — ignoring duplicate dispatch", run_id);
            return;
        }
        if self.active_runs.len() >= self.settings.capacity as usize {
            tracing::warn!(
                "Master dispatched run {} beyond declared capacity {}",
                run_id,
                self.settings.capacity
            );
        }

        let run_cancel = CancellationToken::new();
        self.active_runs.insert(run_id, run_cancel.clone());

        let runner = self.runner.clone();
        let active_runs = self.active_runs.clone();
        tokio::spawn(async move {
            let outcome = runner
                .run(run_id, &target, &steps, outbound_tx.clone(), run_cancel)
                .await;
            active_runs.remove(&run_id);
            let _ = outbound_tx
                .send(WorkerMessage::RunCompleted { run_id, outcome })
                .await;
        });
    }

    fn cancel_all_runs(&self) {
        for entry in self.active_runs.iter() {
            entry.value().cancel();
        }
    }
}

/// Whether a session error is a registration rejection (fatal, no retry).
fn is_rejection(error: &anyhow::Error) -> bool {
    error.to_string().contains("registration rejected")
}
