use std::time::Duration;

use serde_json::json;

use agent_sync::{
    Action, ConnectionState, Delivery, EventFilter, FailureReason, HeartbeatConfig, MemoryServer,
    MemoryStore, MemoryTransport, OverflowPolicy, OverflowStrategy, RetryPolicy, Session,
    SyncClient, SyncConfig, SyncError,
};

fn config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            max_attempts: Some(5),
            ..RetryPolicy::default()
        }
        .without_jitter(),
        heartbeat: HeartbeatConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        },
        ..SyncConfig::default()
    }
}

fn client_with(config: SyncConfig, store: MemoryStore) -> (SyncClient, MemoryServer) {
    let transport = MemoryTransport::new();
    let server = transport.server();
    let client = SyncClient::builder()
        .config(config)
        .transport(transport)
        .store(store)
        .build();
    (client, server)
}

fn client() -> (SyncClient, MemoryServer) {
    client_with(config(), MemoryStore::new())
}

fn session() -> Session {
    Session::new("mem://agent", "c1")
}

async fn connected(client: &SyncClient) {
    client
        .wait_for_state(ConnectionState::is_connected)
        .await
        .unwrap();
}

/// Contents of the message actions the server received, in write order.
fn messages(server: &MemoryServer) -> Vec<String> {
    server
        .sent_events()
        .iter()
        .filter_map(|event| match event.as_action() {
            Some(Action::Message(args)) => Some(args.content.clone()),
            _ => None,
        })
        .collect()
}

fn agent_message(id: u64, text: &str) -> serde_json::Value {
    json!({
        "id": id,
        "timestamp": "2026-03-01T12:00:00Z",
        "source": "agent",
        "action": "message",
        "args": {"content": text}
    })
}

fn file_changed(id: u64, path: &str) -> serde_json::Value {
    json!({
        "id": id,
        "timestamp": "2026-03-01T12:00:00Z",
        "source": "environment",
        "observation": "file_changed",
        "content": "",
        "extras": {"path": path, "change": "modified"}
    })
}

#[tokio::test(start_paused = true)]
async fn actions_queued_while_disconnected_are_sent_once_in_order() {
    let (client, server) = client();

    let mut sequences = Vec::new();
    for text in ["one", "two", "three"] {
        sequences.push(client.send(Action::message(text)).await.unwrap());
    }
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(server.sent_frames().is_empty());

    client.connect(session()).await.unwrap();
    server.wait_for_sent(3).await;
    assert_eq!(messages(&server), vec!["one", "two", "three"]);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.sent_frames().len(), 3);
    assert!(client.pending_actions().await.unwrap().is_empty());
    assert_eq!(client.metrics().outbound.sent, 3);
}

#[tokio::test(start_paused = true)]
async fn fourth_action_waits_for_the_third() {
    let (client, server) = client();
    server.send_delay(Duration::from_secs(1));

    for text in ["1", "2", "3"] {
        client.send(Action::message(text)).await.unwrap();
    }
    client.connect(session()).await.unwrap();
    connected(&client).await;
    client.send(Action::message("4")).await.unwrap();

    server.wait_for_sent(3).await;
    assert_eq!(messages(&server), vec!["1", "2", "3"]);

    server.wait_for_sent(4).await;
    assert_eq!(messages(&server), vec!["1", "2", "3", "4"]);
}

#[tokio::test(start_paused = true)]
async fn actions_sent_during_an_outage_follow_the_reconnect() {
    let (client, server) = client();
    client.connect(session()).await.unwrap();
    connected(&client).await;

    client.send(Action::message("before")).await.unwrap();
    server.wait_for_sent(1).await;

    server.drop_link();
    client
        .wait_for_state(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await
        .unwrap();
    client.send(Action::message("during")).await.unwrap();
    client.send(Action::message("still during")).await.unwrap();

    connected(&client).await;
    server.wait_for_sent(3).await;
    assert_eq!(messages(&server), vec!["before", "during", "still during"]);
    assert_eq!(server.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn server_close_is_treated_as_link_loss() {
    let (client, server) = client();
    client.connect(session()).await.unwrap();
    server.wait_for_link().await;
    connected(&client).await;

    server.close_link();
    let state = client
        .wait_for_state(|s| !s.is_connected())
        .await
        .unwrap();
    assert_eq!(
        state,
        ConnectionState::Reconnecting {
            attempt: 1,
            max_attempts: Some(5)
        }
    );
    assert!(!server.is_linked());

    connected(&client).await;
    assert!(server.is_linked());
    assert_eq!(client.metrics().connection.connects, 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_becomes_one_error_and_flow_continues() {
    let (client, server) = client();
    let mut events = client.subscribe(EventFilter::All);
    client.connect(session()).await.unwrap();
    connected(&client).await;

    assert!(server.push_json(json!({
        "id": 4,
        "timestamp": "2026-03-01T12:00:00Z",
        "source": "agent",
        "content": "no discriminator"
    })));
    assert!(server.push("{not json"));
    assert!(server.push_json(agent_message(5, "still here")));

    let first = events.recv().await.unwrap();
    assert!(first.is_error());
    assert_eq!(first.id, Some(4));
    let second = events.recv().await.unwrap();
    assert!(second.is_error());
    let third = events.recv().await.unwrap();
    assert_eq!(third.id, Some(5));
    assert_eq!(third.type_tag(), "message");

    let metrics = client.metrics();
    assert_eq!(metrics.inbound.protocol_errors, 2);
    assert_eq!(metrics.inbound.routed, 3);
    assert_eq!(client.cursor(), Some(5));
}

#[tokio::test(start_paused = true)]
async fn file_change_burst_is_delivered_as_one_batch() {
    let (client, server) = client();
    let mut scheduled = client.scheduled(EventFilter::All);
    client.connect(session()).await.unwrap();
    connected(&client).await;

    for id in 1..=5 {
        server.push_json(file_changed(id, "src/main.rs"));
    }
    match scheduled.next().await.unwrap() {
        Delivery::Batch {
            event_type,
            subject,
            events,
        } => {
            assert_eq!(event_type, "file_changed");
            assert_eq!(subject.as_deref(), Some("src/main.rs"));
            let ids: Vec<_> = events.iter().map(|e| e.id).collect();
            assert_eq!(ids, vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);
        }
        other => panic!("expected a batch, got {other:?}"),
    }

    // Spaced wider than the window: one delivery each.
    server.push_json(file_changed(6, "src/main.rs"));
    assert!(matches!(scheduled.next().await, Some(Delivery::Single(_))));
    tokio::time::sleep(Duration::from_millis(600)).await;
    server.push_json(file_changed(7, "src/main.rs"));
    assert!(matches!(scheduled.next().await, Some(Delivery::Single(_))));
}

#[tokio::test(start_paused = true)]
async fn urgent_events_overtake_pending_batches() {
    let (client, server) = client();
    let mut scheduled = client.scheduled(EventFilter::All);
    client.connect(session()).await.unwrap();
    connected(&client).await;

    server.push_json(file_changed(1, "a.rs"));
    server.push_json(json!({
        "id": 2,
        "timestamp": "2026-03-01T12:00:00Z",
        "source": "agent",
        "observation": "error",
        "content": "sandbox crashed",
        "extras": {"error_id": "sandbox_crash"}
    }));

    let first = scheduled.next().await.unwrap();
    assert_eq!(first.events()[0].type_tag(), "error");
    let second = scheduled.next().await.unwrap();
    assert_eq!(second.events()[0].type_tag(), "file_changed");
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_reconnects_from_the_cursor() {
    let (client, server) = client();
    let mut events = client.subscribe(EventFilter::All);
    client.connect(session()).await.unwrap();
    connected(&client).await;

    server.push_json(agent_message(9, "working on it"));
    assert_eq!(events.recv().await.unwrap().id, Some(9));

    server.auto_pong(false);
    let start = tokio::time::Instant::now();
    client
        .wait_for_state(|s| !s.is_connected())
        .await
        .unwrap();
    assert!(start.elapsed() <= Duration::from_secs(25));
    assert_eq!(client.metrics().connection.heartbeat_timeouts, 1);

    server.auto_pong(true);
    connected(&client).await;
    assert_eq!(server.handshakes()[1].latest_event_id, Some(9));
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_reconnecting_stops_all_attempts() {
    let (client, server) = client();
    server.fail_next_connects(3);
    client.connect(session()).await.unwrap();
    client
        .wait_for_state(|s| matches!(s, ConnectionState::Reconnecting { attempt: 2, .. }))
        .await
        .unwrap();
    let attempts = server.connect_attempts();

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.connect_attempts(), attempts);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_fail_until_retried() {
    let (client, server) = client();
    server.reject_auth(Some("bad token"));
    client
        .connect(session().with_auth_token("stale"))
        .await
        .unwrap();

    let state = client
        .wait_for_state(ConnectionState::is_failed)
        .await
        .unwrap();
    assert_eq!(
        state,
        ConnectionState::Failed {
            reason: FailureReason::AuthRejected {
                message: "bad token".into()
            }
        }
    );

    server.reject_auth(None);
    client.retry().await.unwrap();
    connected(&client).await;
    assert_eq!(
        server.handshakes()[1].auth_token.as_deref(),
        Some("stale")
    );
}

#[tokio::test(start_paused = true)]
async fn queued_actions_survive_a_restart() {
    let store = MemoryStore::new();
    {
        let (client, server) = client_with(config(), store.clone());
        server.fail_next_connects(100);
        client.connect(session()).await.unwrap();
        client.send(Action::message("left behind")).await.unwrap();
        client.disconnect().await.unwrap();
    }

    let (client, server) = client_with(config(), store);
    client.connect(session()).await.unwrap();
    server.wait_for_sent(1).await;
    assert_eq!(messages(&server), vec!["left behind"]);
}

#[tokio::test(start_paused = true)]
async fn bounded_queue_rejects_and_warns() {
    let mut config = config();
    config.queue.overflow = OverflowPolicy::Bounded {
        capacity: 2,
        strategy: OverflowStrategy::RejectNew,
    };
    let (client, _server) = client_with(config, MemoryStore::new());
    let mut warnings = client.subscribe(EventFilter::Type("queue_warning".into()));

    client.send(Action::message("a")).await.unwrap();
    client.send(Action::message("b")).await.unwrap();
    let err = client.send(Action::message("c")).await.unwrap_err();
    assert_eq!(
        err,
        SyncError::QueueOverflow {
            pending: 2,
            capacity: 2
        }
    );
    assert_eq!(err.error_code(), "queue_overflow");

    let warning = warnings.recv().await.unwrap();
    assert_eq!(warning.type_tag(), "queue_warning");
    assert_eq!(client.pending_actions().await.unwrap().len(), 2);
}
