// tests/integration/cluster_test.rs

//! Multi-node scenarios: two or more gateway nodes sharing one store and one
//! broker, with their kick listeners and dispatchers running.

use super::fixtures::*;
use super::test_helpers::*;
use spinelgate::core::protocol::ResponseMessage;
use spinelgate::core::protocol::message::Post;
use spinelgate::core::routing::RouteDecision;
use spinelgate::core::session::SessionRecord;

#[tokio::test]
async fn test_login_on_second_node_kicks_first() {
    let cluster = TestCluster::new();
    let a = cluster.started_node(NODE_A).await;
    let b = cluster.started_node(NODE_B).await;

    let (old_conn, mut old_rx) = a.login(ALICE).await.unwrap();
    let (new_conn, _new_rx) = b.login(ALICE).await.unwrap();

    assert!(wait_until(|| old_conn.is_stopped()).await);
    assert!(wait_until(|| a.state.registry.user_count() == 0).await);
    assert_eq!(old_rx.recv().await, None);
    assert!(!new_conn.is_stopped());

    let coordinator = b.state.registry.coordinator();
    assert_eq!(
        coordinator.owner_of(ALICE).await.unwrap().as_deref(),
        Some(NODE_B)
    );
    assert_eq!(
        coordinator.get_user_session(ALICE).await.unwrap(),
        Some(SessionRecord::new(new_conn.id(), NODE_B))
    );
    // The kick went over pub/sub; the broker fallback was not needed.
    assert_eq!(cluster.broker.published_count("user-kick-topic"), 0);
}

#[tokio::test]
async fn test_post_crosses_nodes_through_broker() {
    let cluster = TestCluster::new();
    let a = cluster.started_node(NODE_A).await;
    let b = cluster.started_node(NODE_B).await;
    let (_alice, _alice_rx) = a.login(ALICE).await.unwrap();
    let (_bob, mut bob_rx) = b.login(BOB).await.unwrap();

    let post = text_post(ALICE, BOB, "hello from a");
    let decision = a
        .state
        .router
        .route_response(BOB, &ResponseMessage::Post(post.clone()))
        .await
        .unwrap();

    assert_eq!(decision, RouteDecision::CrossNode(NODE_B.to_string()));
    assert_eq!(recv_response(&mut bob_rx).await, ResponseMessage::Post(post));
}

#[tokio::test]
async fn test_posts_to_remote_user_arrive_in_order_with_one_worker() {
    let cluster = TestCluster::new();
    let a = cluster.started_node(NODE_A).await;
    let b = cluster.started_node(NODE_B).await;
    let (_bob, mut bob_rx) = b.login(BOB).await.unwrap();

    for i in 0..20 {
        let post = text_post(ALICE, BOB, &format!("msg-{i}"));
        a.state
            .router
            .route_response(BOB, &ResponseMessage::Post(post))
            .await
            .unwrap();
    }

    for i in 0..20 {
        match recv_response(&mut bob_rx).await {
            ResponseMessage::Post(Post { content, .. }) => {
                assert_eq!(content, format!("msg-{i}").into_bytes());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_kick_falls_back_to_broker_when_pubsub_fails() {
    let cluster = TestCluster::new();
    let a = cluster.started_node(NODE_A).await;
    let b = cluster.started_node(NODE_B).await;
    let (old_conn, _old_rx) = a.login(ALICE).await.unwrap();

    cluster.store.set_publish_unavailable(true);
    let (new_conn, _new_rx) = b.login(ALICE).await.unwrap();

    assert_eq!(cluster.broker.published_count("user-kick-topic"), 1);
    assert!(wait_until(|| old_conn.is_stopped()).await);
    assert!(!new_conn.is_stopped());
    assert_eq!(
        b.state.coordinator.owner_of(ALICE).await.unwrap().as_deref(),
        Some(NODE_B)
    );
}

#[tokio::test]
async fn test_concurrent_logins_leave_one_binding() {
    let cluster = TestCluster::new();
    let a = cluster.started_node(NODE_A).await;
    let b = cluster.started_node(NODE_B).await;

    let (res_a, res_b) = tokio::join!(a.login(ALICE), b.login(ALICE));
    assert!(res_a.is_ok() || res_b.is_ok());
    for res in [&res_a, &res_b] {
        if let Err(e) = res {
            assert!(e.is_retryable(), "unexpected login error: {e}");
        }
    }

    assert!(
        wait_until(|| a.state.registry.user_count() + b.state.registry.user_count() == 1).await
    );
    let owner = a.state.coordinator.owner_of(ALICE).await.unwrap().unwrap();
    let winner = if owner == NODE_A { &a } else { &b };
    assert!(winner.state.registry.get_connection_by_user(ALICE).is_some());
    let record = a.state.coordinator.get_user_session(ALICE).await.unwrap().unwrap();
    assert!(record.is_owned_by(&owner));
}

#[tokio::test]
async fn test_many_users_spread_over_nodes() {
    let cluster = TestCluster::new();
    let a = cluster.started_node(NODE_A).await;
    let b = cluster.started_node(NODE_B).await;
    let mut receivers = Vec::new();

    for i in 0..10 {
        let user = unique_user("user", i);
        let node = if i % 2 == 0 { &a } else { &b };
        let (_conn, rx) = node.login(&user).await.unwrap();
        receivers.push((user, rx));
    }
    assert_eq!(a.state.registry.user_count(), 5);
    assert_eq!(b.state.registry.user_count(), 5);

    let recipients: Vec<String> = receivers.iter().map(|(u, _)| u.clone()).collect();
    let payload = encoded_post(ALICE, "everyone", "hi all");
    a.state
        .router
        .broadcast_message(&recipients, payload.clone())
        .await
        .unwrap();

    for (_, rx) in receivers.iter_mut() {
        assert_eq!(recv_payload(rx).await, payload);
    }
}

#[tokio::test]
async fn test_shutdown_stops_background_tasks() {
    let cluster = TestCluster::new();
    let a = cluster.started_node(NODE_A).await;

    tokio::time::timeout(EVENT_TIMEOUT, a.shutdown())
        .await
        .expect("node tasks did not stop");
}
