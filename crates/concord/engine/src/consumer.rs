//! Change-feed consumer: the reactive path into the router and the
//! consensus coordinator.
//!
//! Notifications are hints. A dropped or lagged notification is harmless
//! because the stale sweeps pick up whatever is still unprocessed.

use crate::engine::Engine;
use concord_types::ChangeNotification;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Handle one notification. Errors are logged, never propagated.
pub async fn handle_change(engine: &Engine, change: ChangeNotification) {
    match change {
        ChangeNotification::MessageInserted(message_id) => {
            if let Err(e) = engine.process_message(&message_id).await {
                tracing::warn!(message_id = %message_id, error = %e, "Message notification not processed");
            }
        }
        ChangeNotification::ProposalInserted(proposal_id) => {
            if let Err(e) = engine.process_proposal(&proposal_id).await {
                tracing::warn!(proposal_id = %proposal_id, error = %e, "Proposal notification not processed");
            }
        }
    }
}

/// Spawn the consumer loop. Each notification is processed on its own task
/// so a slow message never holds up the feed.
pub fn spawn_change_consumer(
    engine: Arc<Engine>,
    mut changes: broadcast::Receiver<ChangeNotification>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Change consumer started");
        loop {
            tokio::select! {
                received = changes.recv() => match received {
                    Ok(change) => {
                        let engine = engine.clone();
                        tokio::spawn(async move { handle_change(&engine, change).await });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Change consumer lagged; stale sweep will catch up");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Change feed closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Change consumer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use concord_storage::{ChangeFeed, InMemoryConcordStore, MessageStore};
    use concord_types::{Agent, Message, MessageId};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn inserted_message_is_routed_without_a_sweep() {
        let store = Arc::new(InMemoryConcordStore::new());
        let engine = Arc::new(Engine::new(store.clone(), EngineConfig::default()));
        engine.register_agent(Agent::new("s", "sender")).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = spawn_change_consumer(engine.clone(), store.subscribe(), rx);

        engine
            .submit_message(Message::new("s", "request", json!({})).with_id("m-1"))
            .await
            .unwrap();

        let id = MessageId::new("m-1");
        let mut processed = false;
        for _ in 0..100 {
            let stored = store.get_message(&id).await.unwrap().unwrap();
            if stored.processed {
                processed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(processed);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
