// tests/integration/session_table_test.rs

//! Integration tests for the local session table and idle-session reaping.

use super::fixtures::*;
use super::test_helpers::*;
use chrono::Utc;
use spinelgate::core::session::{LocalSessionTable, SessionReaperTask};
use std::time::Duration;
use tokio::sync::broadcast;

#[tokio::test]
async fn test_create_and_get() {
    let table = LocalSessionTable::new();

    assert!(table.create(ALICE, "conn-1").is_none());

    let session = table.get(ALICE).unwrap();
    assert_eq!(session.user_id, ALICE);
    assert_eq!(session.connection_id, "conn-1");
    assert!(session.active);
    assert_eq!(table.count(), 1);
}

#[tokio::test]
async fn test_create_displaces_previous_session() {
    let table = LocalSessionTable::new();
    table.create(ALICE, "conn-1");

    let displaced = table.create(ALICE, "conn-2").unwrap();

    assert_eq!(displaced.connection_id, "conn-1");
    assert_eq!(table.get(ALICE).unwrap().connection_id, "conn-2");
    assert_eq!(table.count(), 1);
}

#[tokio::test]
async fn test_touch_updates_last_active() {
    let table = LocalSessionTable::new();
    table.create(ALICE, "conn-1");
    let before = table.get(ALICE).unwrap().last_active;

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(table.touch(ALICE));

    assert!(table.get(ALICE).unwrap().last_active > before);
    assert!(!table.touch(BOB));
}

#[tokio::test]
async fn test_remove_if_connection_ignores_other_connection() {
    let table = LocalSessionTable::new();
    table.create(ALICE, "conn-2");

    assert!(!table.remove_if_connection(ALICE, "conn-1"));
    assert!(table.get(ALICE).is_some());
    assert!(table.remove_if_connection(ALICE, "conn-2"));
    assert!(table.get(ALICE).is_none());
}

#[tokio::test]
async fn test_active_sessions_lists_every_user() {
    let table = LocalSessionTable::new();
    table.create(ALICE, "conn-1");
    table.create(BOB, "conn-2");

    let mut users: Vec<String> = table
        .active_sessions()
        .into_iter()
        .map(|s| s.user_id)
        .collect();
    users.sort();
    assert_eq!(users, vec![ALICE.to_string(), BOB.to_string()]);
}

#[tokio::test]
async fn test_idle_for_is_measured_from_last_activity() {
    let table = LocalSessionTable::new();
    table.create(ALICE, "conn-1");

    let session = table.get(ALICE).unwrap();
    let later = session.last_active + chrono::Duration::seconds(30);
    assert_eq!(session.idle_for(later), Duration::from_secs(30));
    // A clock reading before the last activity counts as not idle.
    assert_eq!(session.idle_for(session.last_active - chrono::Duration::seconds(1)), Duration::ZERO);
    assert!(session.idle_for(Utc::now()) < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cleanup_inactive_logs_out_idle_sessions() {
    let cluster = TestCluster::new();
    let node = cluster.node(NODE_A);
    let (idle, _rx_idle) = node.login(ALICE).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (fresh, _rx_fresh) = node.login(BOB).await.unwrap();

    let removed = node
        .state
        .registry
        .sessions()
        .cleanup_inactive(Duration::from_millis(100), &node.state.registry)
        .await;

    assert_eq!(removed, 1);
    assert!(idle.is_stopped());
    assert!(!fresh.is_stopped());
    assert_eq!(node.state.registry.bound_users(), vec![BOB.to_string()]);
    assert_eq!(
        node.state
            .registry
            .coordinator()
            .owner_of(ALICE)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_reaper_task_closes_idle_sessions() {
    let cluster = TestCluster::new();
    let node = cluster.node(NODE_A);
    let (conn, _rx) = node.login(ALICE).await.unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let reaper = SessionReaperTask::new(
        node.state.registry.clone(),
        Duration::from_millis(50),
        Duration::from_millis(20),
    );
    let handle = tokio::spawn(reaper.run(shutdown_rx));

    assert!(wait_until(|| conn.is_stopped()).await);
    assert_eq!(node.state.registry.sessions().count(), 0);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}
