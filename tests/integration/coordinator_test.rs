// tests/integration/coordinator_test.rs

//! Integration tests for the distributed session coordinator against the
//! in-memory shared store.

use super::fixtures::*;
use super::test_helpers::*;
use spinelgate::core::GatewayError;
use spinelgate::core::protocol::kick::{kick_channel, parse_kick_notification};
use spinelgate::core::protocol::{Envelope, EnvelopeType, KickCommand};
use spinelgate::core::session::record::{lock_key, session_key};
use spinelgate::core::session::{KickPath, RecordRemoval, SessionRecord};
use spinelgate::core::store::SharedStore;
use std::time::Duration;

#[tokio::test]
async fn test_user_lock_is_exclusive() {
    let cluster = TestCluster::new();
    let a = cluster.node(NODE_A);
    let b = cluster.node(NODE_B);

    let lease = a
        .state
        .coordinator
        .acquire_user_lock(ALICE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.user_id(), ALICE);
    assert!(b.state.coordinator.acquire_user_lock(ALICE).await.unwrap().is_none());
    // Other users are unaffected.
    assert!(b.state.coordinator.acquire_user_lock(BOB).await.unwrap().is_some());

    a.state.coordinator.release_user_lock(lease).await.unwrap();
    assert!(b.state.coordinator.acquire_user_lock(ALICE).await.unwrap().is_some());
}

#[tokio::test]
async fn test_user_lock_has_lease_ttl() {
    let cluster = TestCluster::new();
    let node = cluster.node(NODE_A);

    let _lease = node.state.coordinator.acquire_user_lock(ALICE).await.unwrap();

    let ttl = cluster.store.ttl(&lock_key(ALICE)).unwrap();
    assert!(ttl <= node.state.config.session.lock_ttl);
    assert!(ttl > Duration::ZERO);
}

#[tokio::test]
async fn test_expired_lease_release_keeps_successor_lock() {
    let cluster = TestCluster::new();
    let mut config = test_config(NODE_A);
    config.session.lock_ttl = Duration::from_millis(30);
    let a = cluster.node_with_config(config);
    let b = cluster.node(NODE_B);

    let stale = a.state.coordinator.acquire_user_lock(ALICE).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let _fresh = b.state.coordinator.acquire_user_lock(ALICE).await.unwrap().unwrap();

    a.state.coordinator.release_user_lock(stale).await.unwrap();

    assert!(cluster.store.get(&lock_key(ALICE)).await.unwrap().is_some());
    assert!(a.state.coordinator.acquire_user_lock(ALICE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_session_record_round_trips_through_store() {
    let cluster = TestCluster::new();
    let node = cluster.node(NODE_A);
    let coordinator = &node.state.coordinator;

    coordinator.set_user_session(ALICE, "10.0.0.7:5123").await.unwrap();

    assert_eq!(
        cluster.store.get(&session_key(ALICE)).await.unwrap().as_deref(),
        Some("10.0.0.7:5123:node-a")
    );
    let record = coordinator.get_user_session(ALICE).await.unwrap().unwrap();
    assert_eq!(record, SessionRecord::new("10.0.0.7:5123", NODE_A));
    assert!(record.is_owned_by(NODE_A));

    let ttl = cluster.store.ttl(&session_key(ALICE)).unwrap();
    assert!(ttl > Duration::from_secs(23 * 60 * 60));
}

#[tokio::test]
async fn test_unreadable_session_record_is_treated_as_absent() {
    let cluster = TestCluster::new();
    let node = cluster.node(NODE_A);
    cluster
        .store
        .set_px(&session_key(ALICE), "garbage", Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(node.state.coordinator.get_user_session(ALICE).await.unwrap(), None);
}

#[tokio::test]
async fn test_remove_user_session_if_owned() {
    let cluster = TestCluster::new();
    let a = cluster.node(NODE_A);
    let b = cluster.node(NODE_B);

    assert_eq!(
        a.state.coordinator.remove_user_session_if_owned(ALICE, "c1").await.unwrap(),
        RecordRemoval::Absent
    );

    b.state.coordinator.set_user_session(ALICE, "c2").await.unwrap();
    assert_eq!(
        a.state.coordinator.remove_user_session_if_owned(ALICE, "c1").await.unwrap(),
        RecordRemoval::OwnedElsewhere
    );
    assert!(a.state.coordinator.get_user_session(ALICE).await.unwrap().is_some());

    assert_eq!(
        b.state.coordinator.remove_user_session_if_owned(ALICE, "c2").await.unwrap(),
        RecordRemoval::Removed
    );
    assert_eq!(b.state.coordinator.get_user_session(ALICE).await.unwrap(), None);
}

#[tokio::test]
async fn test_verify_ownership_accepts_absent_or_own_record() {
    let cluster = TestCluster::new();
    let node = cluster.node(NODE_A);

    node.state.coordinator.verify_ownership(ALICE).await.unwrap();

    node.state.coordinator.set_user_session(ALICE, "c1").await.unwrap();
    node.state.coordinator.verify_ownership(ALICE).await.unwrap();
    // Our own record is never overridden.
    assert!(node.state.coordinator.get_user_session(ALICE).await.unwrap().is_some());
}

#[tokio::test]
async fn test_verify_ownership_waits_for_remote_release() {
    let cluster = TestCluster::new();
    let a = cluster.node(NODE_A);
    let b = cluster.node(NODE_B);
    b.state.coordinator.set_user_session(ALICE, "c-remote").await.unwrap();

    let releaser = {
        let coordinator = b.state.coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            coordinator.remove_user_session_if_owned(ALICE, "c-remote").await
        })
    };

    a.state.coordinator.verify_ownership(ALICE).await.unwrap();
    let removal = releaser.await.unwrap().unwrap();
    assert_ne!(removal, RecordRemoval::OwnedElsewhere);
    assert_eq!(a.state.coordinator.get_user_session(ALICE).await.unwrap(), None);
}

#[tokio::test]
async fn test_verify_ownership_overrides_stuck_record() {
    let cluster = TestCluster::new();
    let a = cluster.node(NODE_A);
    let b = cluster.node(NODE_B);
    b.state.coordinator.set_user_session(ALICE, "c-stuck").await.unwrap();

    a.state.coordinator.verify_ownership(ALICE).await.unwrap();

    assert_eq!(a.state.coordinator.get_user_session(ALICE).await.unwrap(), None);
}

#[tokio::test]
async fn test_verify_ownership_reports_conflict_when_record_reappears() {
    let cluster = TestCluster::new();
    let a = cluster.node(NODE_A);
    let b = cluster.node(NODE_B);
    b.state.coordinator.set_user_session(ALICE, "c-stubborn").await.unwrap();

    // Node B keeps rewriting its record.
    let writer = {
        let coordinator = b.state.coordinator.clone();
        tokio::spawn(async move {
            loop {
                let _ = coordinator.set_user_session(ALICE, "c-stubborn").await;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let err = a.state.coordinator.verify_ownership(ALICE).await.unwrap_err();
    writer.abort();

    assert_eq!(err, GatewayError::LoginConflict(ALICE.to_string()));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_kick_notification_uses_pubsub() {
    let cluster = TestCluster::new();
    let a = cluster.node(NODE_A);
    let b = cluster.node(NODE_B);
    let mut notifications = a.state.coordinator.subscribe_kick_notifications().await.unwrap();

    let path = b
        .state
        .coordinator
        .publish_kick_notification(ALICE, NODE_A)
        .await
        .unwrap();

    assert_eq!(path, KickPath::PubSub);
    let body = tokio::time::timeout(EVENT_TIMEOUT, notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&body[..], b"KICK:alice");
    assert_eq!(parse_kick_notification(&body).as_deref(), Some(ALICE));
    assert_eq!(cluster.broker.published_count("user-kick-topic"), 0);
}

#[tokio::test]
async fn test_kick_with_no_subscriber_does_not_fall_back() {
    let cluster = TestCluster::new();
    let b = cluster.node(NODE_B);

    let path = b
        .state
        .coordinator
        .publish_kick_notification(ALICE, NODE_A)
        .await
        .unwrap();

    assert_eq!(path, KickPath::PubSub);
    assert_eq!(cluster.store.publish_count(), 1);
    assert_eq!(cluster.broker.total_published(), 0);
}

#[tokio::test]
async fn test_kick_falls_back_to_broker_when_publish_fails() {
    let cluster = TestCluster::new();
    let b = cluster.node(NODE_B);
    cluster.store.set_publish_unavailable(true);

    let path = b
        .state
        .coordinator
        .publish_kick_notification(ALICE, NODE_A)
        .await
        .unwrap();

    assert_eq!(path, KickPath::Broker);
    let published = cluster.broker.published("user-kick-topic");
    assert_eq!(published.len(), 1);
    let envelope = Envelope::decode(&published[0]).unwrap();
    assert_eq!(envelope.kind, EnvelopeType::LegacyText);
    assert_eq!(envelope.text().unwrap(), "DELETE USER alice TARGET node-a");
    assert_eq!(
        KickCommand::parse(envelope.text().unwrap()),
        Some(KickCommand::new(ALICE, NODE_A))
    );
}

#[tokio::test]
async fn test_kick_fails_when_both_paths_fail() {
    let cluster = TestCluster::new();
    let b = cluster.node(NODE_B);
    cluster.store.set_publish_unavailable(true);
    cluster.broker.set_unavailable(true);

    let err = b
        .state
        .coordinator
        .publish_kick_notification(ALICE, NODE_A)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Broker(_)));
}

#[tokio::test]
async fn test_kick_channel_is_per_node() {
    assert_eq!(kick_channel(NODE_A), "user_kick:node-a");
    assert_ne!(kick_channel(NODE_A), kick_channel(NODE_B));
}

#[tokio::test]
async fn test_register_and_unregister_connection() {
    let cluster = TestCluster::new();
    let node = cluster.node(NODE_A);
    let coordinator = &node.state.coordinator;

    coordinator.register_connection(ALICE, "c1").await.unwrap();
    coordinator.register_connection(BOB, "c2").await.unwrap();
    assert_eq!(coordinator.owner_of(ALICE).await.unwrap().as_deref(), Some(NODE_A));
    assert_eq!(
        coordinator.registered_connections().await.unwrap(),
        vec!["c1".to_string(), "c2".to_string()]
    );

    assert!(coordinator.unregister_connection(ALICE, "c1").await.unwrap());
    assert_eq!(coordinator.owner_of(ALICE).await.unwrap(), None);
    assert_eq!(
        coordinator.registered_connections().await.unwrap(),
        vec!["c2".to_string()]
    );
}

#[tokio::test]
async fn test_unregister_keeps_mapping_owned_by_other_node() {
    let cluster = TestCluster::new();
    let a = cluster.node(NODE_A);
    let b = cluster.node(NODE_B);

    a.state.coordinator.register_connection(ALICE, "c1").await.unwrap();
    b.state.coordinator.register_connection(ALICE, "c2").await.unwrap();

    let removed = a.state.coordinator.unregister_connection(ALICE, "c1").await.unwrap();

    assert!(!removed);
    assert_eq!(
        a.state.coordinator.owner_of(ALICE).await.unwrap().as_deref(),
        Some(NODE_B)
    );
    assert!(a.state.coordinator.registered_connections().await.unwrap().is_empty());
    assert_eq!(
        b.state.coordinator.registered_connections().await.unwrap(),
        vec!["c2".to_string()]
    );
}

#[tokio::test]
async fn test_store_outage_surfaces_as_store_error() {
    let cluster = TestCluster::new();
    let node = cluster.node(NODE_A);
    cluster.store.set_unavailable(true);

    let err = node.state.coordinator.owner_of(ALICE).await.unwrap_err();
    assert!(matches!(err, GatewayError::Store(_)));
    assert!(err.is_transient());

    cluster.store.set_unavailable(false);
    assert!(node.state.coordinator.store().ping().await.is_ok());
}
