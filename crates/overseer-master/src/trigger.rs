// Trigger endpoint: accepts build submissions and operator aborts over the
// shared frame codec.

use crate::dispatcher::Dispatcher;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use overseer_common::backoff::Backoff;
use overseer_common::codec::FrameCodec;
use overseer_common::messages::{TriggerMessage, TriggerReply};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Bind the trigger listener and accept connections until cancelled.
pub async fn run_trigger_listener(
    bind: &str,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind trigger listener on {}", bind))?;
    tracing::info!("Trigger listener on {}", bind);
    serve_trigger_listener(listener, dispatcher, cancel).await
}

/// Accept trigger connections on an already-bound listener.
pub async fn serve_trigger_listener(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut backoff = Backoff::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = cancel.cancelled() => {
                tracing::debug!("Trigger listener stopping");
                return Ok(());
            }
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff.reset();
                let dispatcher = dispatcher.clone();
                let conn_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = handle_trigger_connection(stream, dispatcher, conn_cancel).await
                    {
                        tracing::warn!("Trigger connection from {} ended with error: {:#}", peer, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Accept failed on trigger listener: {}", e);
                if !backoff.increment_and_wait(&cancel).await {
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_trigger_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, FrameCodec::<TriggerMessage>::new());

    loop {
        let message = tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e).context("Failed to decode trigger frame"),
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        };

        let reply = handle_trigger_message(&dispatcher, message).await;
        framed
            .send(&reply)
            .await
            .context("Failed to send trigger reply")?;
    }
}

async fn handle_trigger_message(
    dispatcher: &Arc<Dispatcher>,
    message: TriggerMessage,
) -> TriggerReply {
    match message {
        TriggerMessage::Submit {
            target,
            steps,
            priority,
            required_capabilities,
            trigger,
        } => {
            if target.is_empty() {
                return TriggerReply::Invalid {
                    reason: "target must not be empty".to_string(),
                };
            }
            if steps.is_empty() {
                return TriggerReply::Invalid {
                    reason: "a build needs at least one step".to_string(),
                };
            }
            let request_id =
                dispatcher.submit(target, steps, priority, required_capabilities, trigger);
            TriggerReply::Accepted { request_id }
        }

        TriggerMessage::Abort { run_id } => match dispatcher.abort_run(run_id).await {
            Ok(()) => TriggerReply::Aborting { run_id },
            Err(e) => TriggerReply::Invalid {
                reason: e.to_string(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ResultCollector;
    use crate::notifier::LogNotifier;
    use crate::persistence::BuildStore;
    use crate::registry::WorkerRegistry;
    use async_trait::async_trait;
    use overseer_common::credential::token_digest;
    use overseer_common::model::{BuildRun, BuildStep, TriggerInfo};
    use std::time::Duration;
    use uuid::Uuid;

    struct NullStore;

    #[async_trait]
    impl BuildStore for NullStore {
        async fn save(&self, _run: &BuildRun) -> anyhow::Result<()> {
            Ok(())
        }
        async fn load(&self, _run_id: Uuid) -> anyhow::Result<Option<BuildRun>> {
            Ok(None)
        }
        async fn list(&self) -> anyhow::Result<Vec<Uuid>> {
            Ok(vec![])
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let registry = Arc::new(WorkerRegistry::new(token_digest("secret")));
        let collector = Arc::new(ResultCollector::new(
            Arc::new(NullStore),
            Arc::new(LogNotifier),
        ));
        let (dispatcher, _rx) = Dispatcher::new(
            registry,
            collector,
            Arc::new(LogNotifier),
            3,
            Duration::from_secs(1),
        );
        dispatcher
    }

    #[tokio::test]
    async fn test_submit_accepted() {
        let dispatcher = dispatcher();
        let reply = handle_trigger_message(
            &dispatcher,
            TriggerMessage::Submit {
                target: "demo".into(),
                steps: vec![BuildStep {
                    name: "s".into(),
                    command: "true".into(),
                    args: vec![],
                }],
                priority: 0,
                required_capabilities: Default::default(),
                trigger: TriggerInfo::default(),
            },
        )
        .await;
        assert!(matches!(reply, TriggerReply::Accepted { .. }));
        assert_eq!(dispatcher.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_empty_submission_rejected() {
        let dispatcher = dispatcher();
        let reply = handle_trigger_message(
            &dispatcher,
            TriggerMessage::Submit {
                target: "demo".into(),
                steps: vec![],
                priority: 0,
                required_capabilities: Default::default(),
                trigger: TriggerInfo::default(),
            },
        )
        .await;
        assert!(matches!(reply, TriggerReply::Invalid { .. }));
        assert_eq!(dispatcher.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_abort_unknown_run_invalid() {
        let dispatcher = dispatcher();
        let reply =
            handle_trigger_message(&dispatcher, TriggerMessage::Abort { run_id: Uuid::new_v4() })
                .await;
        assert!(matches!(reply, TriggerReply::Invalid { .. }));
    }
}
