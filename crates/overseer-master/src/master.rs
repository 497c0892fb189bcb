// The master orchestrator: wires the registry, queue, dispatcher and
// collector together, runs the listeners, and coordinates shutdown.

use crate::collector::ResultCollector;
use crate::connection;
use crate::dispatcher::Dispatcher;
use crate::notifier::{BuildNotifier, LogNotifier};
use crate::persistence::{BuildStore, FileBuildStore};
use crate::registry::{self, WorkerRegistry};
use crate::trigger;

use anyhow::{Context, Result};
use overseer_common::config_store::MasterSettings;
use overseer_common::messages::MasterMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Grace period for workers to drain after the shutdown broadcast.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// The coordinating process: owns every component and its lifecycle.
pub struct Master {
    settings: MasterSettings,
}

impl Master {
    pub fn new(settings: MasterSettings) -> Self {
        Self { settings }
    }

    /// Run the master until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<i32> {
        let store: Arc<dyn BuildStore> = Arc::new(
            FileBuildStore::new(&self.settings.store_directory)
                .context("Failed to open the build store")?,
        );
        let notifier: Arc<dyn BuildNotifier> = Arc::new(LogNotifier);

        let registry = Arc::new(WorkerRegistry::new(self.settings.token_digest.clone()));
        let collector = Arc::new(ResultCollector::new(store.clone(), notifier.clone()));
        let (dispatcher, events_rx) = Dispatcher::new(
            registry.clone(),
            collector.clone(),
            notifier,
            self.settings.retry_limit,
            Duration::from_secs(self.settings.abort_grace_secs),
        );

        match store.list().await {
            Ok(history) => {
                tracing::info!("Build store holds {} finished run(s)", history.len());
            }
            Err(e) => {
                tracing::warn!("Could not read build store history: {:#}", e);
            }
        }

        let dispatch_task = tokio::spawn(
            dispatcher
                .clone()
                .dispatch_loop(events_rx, cancel.child_token()),
        );

        let heartbeat_task = tokio::spawn(registry::run_heartbeat_monitor(
            registry.clone(),
            Duration::from_secs(self.settings.heartbeat_timeout_secs),
            cancel.child_token(),
        ));

        let worker_bind = self.settings.worker_bind.clone();
        let worker_listener = {
            let registry = registry.clone();
            let dispatcher = dispatcher.clone();
            let collector = collector.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = connection::run_worker_listener(
                    &worker_bind,
                    registry,
                    dispatcher,
                    collector,
                    cancel.clone(),
                )
                .await
                {
                    tracing::error!("Worker listener failed: {:#}", e);
                    cancel.cancel();
                }
            })
        };

        let trigger_bind = self.settings.trigger_bind.clone();
        let trigger_listener = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) =
                    trigger::run_trigger_listener(&trigger_bind, dispatcher, cancel.clone()).await
                {
                    tracing::error!("Trigger listener failed: {:#}", e);
                    cancel.cancel();
                }
            })
        };

        tracing::info!("Master running");
        cancel.cancelled().await;
        tracing::info!("Master shutting down");

        // Tell every connected worker to stop taking work, then give the
        // connection tasks a moment to flush.
        for worker in registry.snapshots() {
            if let Some(sender) = registry.sender(worker.worker_id) {
                let _ = sender.try_send(MasterMessage::Shutdown);
            }
        }
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;

        let _ = worker_listener.await;
        let _ = trigger_listener.await;
        let _ = heartbeat_task.await;
        let _ = dispatch_task.await;

        Ok(overseer_common::constants::return_code::SUCCESS)
    }
}
