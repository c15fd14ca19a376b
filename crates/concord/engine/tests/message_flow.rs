use concord_engine::{Engine, EngineConfig, EngineEvent};
use concord_storage::{
    ActivityStore, AgentStore, InMemoryConcordStore, MessageStore, TaskStore,
};
use concord_types::{
    ActivityId, ActivityRecord, Agent, AgentId, IdentityProof, Message, MessageId, MessageStatus,
    Priority, TaskId,
};
use serde_json::json;
use std::sync::Arc;

fn setup() -> (Arc<InMemoryConcordStore>, Engine) {
    let store = Arc::new(InMemoryConcordStore::new());
    let engine = Engine::new(store.clone(), EngineConfig::default());
    (store, engine)
}

async fn seed_confirmed(store: &InMemoryConcordStore, agent: &str, n: usize) {
    for i in 0..n {
        store
            .record_activity(ActivityRecord::confirmed(
                ActivityId::new(format!("seed:{agent}:{i}")),
                AgentId::new(agent),
                "escrow_created",
                json!({}),
            ))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn reference_sender_gets_medium_priority_and_capable_targets() {
    let (store, engine) = setup();
    // 5 * 10 + 100 * 5 + min(200, 50 * 2) = 650
    engine
        .register_agent(Agent::new("a", "alice").with_history(100.0, 50))
        .await
        .unwrap();
    seed_confirmed(&store, "a", 5).await;
    engine
        .register_agent(Agent::new("b", "bob").with_capabilities(["analysis"]))
        .await
        .unwrap();
    engine
        .register_agent(Agent::new("c", "carol").with_capabilities(["design"]))
        .await
        .unwrap();

    let mut events = engine.subscribe_events();
    let id = engine
        .submit_message(
            Message::new("a", "request", json!({ "required_capabilities": ["analysis"] }))
                .with_id("m-1"),
        )
        .await
        .unwrap();

    let outcome = engine.process_message(&id).await.unwrap();
    assert_eq!(outcome.status, MessageStatus::Processed);
    assert_eq!(outcome.reputation_score, Some(650));
    assert_eq!(outcome.priority, Some(Priority::Medium));
    assert_eq!(outcome.target_agents, vec![AgentId::new("b")]);
    assert_eq!(outcome.tasks_created, 1);

    let tasks = store.list_tasks_for_message(&id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(
        tasks[0].task_id,
        TaskId::for_assignment(&id, &AgentId::new("b"))
    );

    match events.try_recv().unwrap() {
        EngineEvent::TaskAssigned { agent_id, priority, .. } => {
            assert_eq!(agent_id.as_str(), "b");
            assert_eq!(priority, Priority::Medium);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let stored = store.get_message(&id).await.unwrap().unwrap();
    assert!(stored.processed);
    assert!(stored.processed_at.is_some());
    assert!(stored.claim.is_none());
}

#[tokio::test]
async fn reprocessing_replays_the_stored_outcome() {
    let (store, engine) = setup();
    engine.register_agent(Agent::new("a", "alice")).await.unwrap();
    engine.register_agent(Agent::new("b", "bob")).await.unwrap();
    let id = engine
        .submit_message(Message::new("a", "note", json!({})).with_id("m-1"))
        .await
        .unwrap();

    let first = engine.process_message(&id).await.unwrap();
    assert!(!first.replayed);
    let activities_after_first = store
        .count_confirmed_activities(&AgentId::new("a"))
        .await
        .unwrap();

    let second = engine.process_message(&id).await.unwrap();
    assert!(second.replayed);
    assert_eq!(second.status, first.status);
    assert_eq!(second.target_agents, first.target_agents);
    assert_eq!(store.list_tasks_for_message(&id).await.unwrap().len(), 1);
    assert_eq!(
        store
            .count_confirmed_activities(&AgentId::new("a"))
            .await
            .unwrap(),
        activities_after_first
    );
}

#[tokio::test]
async fn sender_without_identity_is_failed_without_tasks() {
    let (store, engine) = setup();
    store.upsert_agent(Agent::new("anon", "anon")).await.unwrap();
    engine.register_agent(Agent::new("b", "bob")).await.unwrap();
    let id = engine
        .submit_message(Message::new("anon", "request", json!({})).with_id("m-1"))
        .await
        .unwrap();

    let outcome = engine.process_message(&id).await.unwrap();
    assert_eq!(outcome.status, MessageStatus::Failed);
    assert!(!outcome.retryable);
    assert!(outcome
        .reason
        .as_deref()
        .unwrap_or_default()
        .contains("No blockchain configuration"));
    assert_eq!(outcome.tasks_created, 0);
    assert!(store.list_tasks_for_message(&id).await.unwrap().is_empty());

    // Terminal: a retry is a replay.
    assert!(engine.process_message(&id).await.unwrap().replayed);
}

#[tokio::test]
async fn low_reputation_sender_is_filtered() {
    let (store, engine) = setup();
    // 60 * 5 = 300 < 400
    engine
        .register_agent(Agent::new("a", "alice").with_history(60.0, 0))
        .await
        .unwrap();
    engine.register_agent(Agent::new("b", "bob")).await.unwrap();
    let id = engine
        .submit_message(Message::new("a", "request", json!({})).with_id("m-1"))
        .await
        .unwrap();

    let outcome = engine.process_message(&id).await.unwrap();
    assert_eq!(outcome.status, MessageStatus::Filtered);
    assert_eq!(outcome.reputation_score, Some(300));
    assert!(store.list_tasks_for_message(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn explicit_recipients_skip_inactive_agents() {
    let (_store, engine) = setup();
    engine.register_agent(Agent::new("a", "alice")).await.unwrap();
    engine.register_agent(Agent::new("b", "bob")).await.unwrap();
    engine
        .register_agent(
            Agent::new("c", "carol").with_status(concord_types::AgentStatus::Inactive),
        )
        .await
        .unwrap();
    let id = engine
        .submit_message(
            Message::new("a", "request", json!({}))
                .with_id("m-1")
                .with_recipients(vec![AgentId::new("b"), AgentId::new("c"), AgentId::new("x")]),
        )
        .await
        .unwrap();

    let outcome = engine.process_message(&id).await.unwrap();
    assert_eq!(outcome.target_agents, vec![AgentId::new("b")]);
}

#[tokio::test]
async fn unverified_agents_never_receive_tasks() {
    let (store, engine) = setup();
    engine.register_agent(Agent::new("a", "alice")).await.unwrap();
    engine.register_agent(Agent::new("b", "bob")).await.unwrap();
    store.upsert_agent(Agent::new("bare", "bare")).await.unwrap();
    let mut forged = Agent::new("forged", "forged");
    forged.identity_proof = Some(IdentityProof::new("0xdead"));
    store.upsert_agent(forged).await.unwrap();

    let explicit = engine
        .submit_message(
            Message::new("a", "request", json!({}))
                .with_id("m-1")
                .with_recipients(vec![
                    AgentId::new("bare"),
                    AgentId::new("forged"),
                    AgentId::new("b"),
                ]),
        )
        .await
        .unwrap();
    let outcome = engine.process_message(&explicit).await.unwrap();
    assert_eq!(outcome.status, MessageStatus::Processed);
    assert_eq!(outcome.target_agents, vec![AgentId::new("b")]);

    let selected = engine
        .submit_message(Message::new("a", "request", json!({})).with_id("m-2"))
        .await
        .unwrap();
    let outcome = engine.process_message(&selected).await.unwrap();
    assert_eq!(outcome.target_agents, vec![AgentId::new("b")]);
    assert!(store
        .list_tasks_for_message(&selected)
        .await
        .unwrap()
        .iter()
        .all(|task| task.agent_id.as_str() == "b"));
}

#[tokio::test]
async fn store_outage_is_retryable_and_recovers() {
    let (store, engine) = setup();
    engine.register_agent(Agent::new("a", "alice")).await.unwrap();
    engine.register_agent(Agent::new("b", "bob")).await.unwrap();
    let id = engine
        .submit_message(Message::new("a", "request", json!({})).with_id("m-1"))
        .await
        .unwrap();

    store.set_offline(true);
    let outcome = engine.process_message(&id).await.unwrap();
    assert_eq!(outcome.status, MessageStatus::Failed);
    assert!(outcome.retryable);

    store.set_offline(false);
    let stored = store.get_message(&id).await.unwrap().unwrap();
    assert!(!stored.processed);

    let outcome = engine.process_message(&id).await.unwrap();
    assert_eq!(outcome.status, MessageStatus::Processed);
    assert!(!outcome.replayed);
}

#[tokio::test]
async fn unknown_message_is_an_error() {
    let (_store, engine) = setup();
    let err = engine
        .process_message(&MessageId::new("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, concord_engine::EngineError::NotFound(_)));
}

#[tokio::test]
async fn concurrent_processing_creates_each_task_once() {
    let (store, engine) = setup();
    let engine = Arc::new(engine);
    engine.register_agent(Agent::new("a", "alice")).await.unwrap();
    for peer in ["b", "c", "d"] {
        engine.register_agent(Agent::new(peer, peer)).await.unwrap();
    }
    let id = engine
        .submit_message(Message::new("a", "request", json!({})).with_id("m-1"))
        .await
        .unwrap();

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.process_message(&id).await })
        })
        .collect();
    for attempt in attempts {
        attempt.await.unwrap().unwrap();
    }

    assert_eq!(store.list_tasks_for_message(&id).await.unwrap().len(), 3);
    let stored = store.get_message(&id).await.unwrap().unwrap();
    assert!(stored.processed);
}
