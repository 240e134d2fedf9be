// tests/property/binding_test.rs

//! Property-based tests for the per-node binding invariants: whatever sequence
//! of connects, logins and disconnects a node sees, every user has at most one
//! live connection, and the local tables agree with the shared mapping.

use crate::test_helpers::TestCluster;
use proptest::prelude::*;
use spinelgate::core::GatewayError;
use std::collections::HashMap;
use std::sync::Arc;

const USERS: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Debug, Clone)]
enum Op {
    Connect,
    Login { conn: usize, user: usize },
    Remove { conn: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => Just(Op::Connect),
        3 => (any::<usize>(), 0..USERS.len()).prop_map(|(conn, user)| Op::Login { conn, user }),
        1 => any::<usize>().prop_map(|conn| Op::Remove { conn }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_at_most_one_binding_per_user(ops in prop::collection::vec(op(), 1..30)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let cluster = TestCluster::new();
            let node = cluster.node("node-a");
            let registry = node.state.registry.clone();
            let mut conns = Vec::new();
            let mut receivers = Vec::new();

            for op in &ops {
                match op {
                    Op::Connect => {
                        let (conn, rx) = node.connect();
                        conns.push(conn);
                        receivers.push(rx);
                    }
                    Op::Login { conn, user } => {
                        if conns.is_empty() {
                            continue;
                        }
                        let conn = &conns[conn % conns.len()];
                        let user_id = USERS[*user];
                        match registry.login(conn.id(), user_id).await {
                            Ok(()) => {
                                assert_eq!(conn.user_id().as_deref(), Some(user_id));
                                assert!(!conn.is_stopped());
                            }
                            Err(GatewayError::AlreadyBound { .. }) => {
                                assert!(conn.user_id().is_some_and(|u| u != user_id));
                            }
                            Err(GatewayError::ConnectionNotFound(_)) => {
                                assert!(conn.is_stopped());
                            }
                            Err(e) => panic!("unexpected login error: {e}"),
                        }
                    }
                    Op::Remove { conn } => {
                        if conns.is_empty() {
                            continue;
                        }
                        let conn = Arc::clone(&conns[conn % conns.len()]);
                        registry.remove_connection(conn.id()).await;
                        assert!(conn.is_stopped());
                    }
                }

                // Every user has at most one live connection bound to it.
                let mut live: HashMap<String, usize> = HashMap::new();
                for conn in conns.iter().filter(|c| !c.is_stopped()) {
                    if let Some(user_id) = conn.user_id() {
                        *live.entry(user_id).or_default() += 1;
                    }
                }
                assert!(live.values().all(|n| *n == 1), "duplicate bindings: {live:?}");

                // The local tables and the shared mapping agree.
                for user_id in USERS {
                    let bound = registry.get_connection_by_user(user_id);
                    let session = registry.sessions().get(user_id);
                    let owner = registry.coordinator().owner_of(user_id).await.unwrap();
                    let record = registry.coordinator().get_user_session(user_id).await.unwrap();
                    match bound {
                        Some(conn) => {
                            assert!(!conn.is_stopped());
                            assert_eq!(conn.user_id().as_deref(), Some(user_id));
                            assert_eq!(session.map(|s| s.connection_id).as_deref(), Some(conn.id()));
                            assert_eq!(owner.as_deref(), Some("node-a"));
                            assert_eq!(record.map(|r| r.connection_id).as_deref(), Some(conn.id()));
                        }
                        None => {
                            assert!(!live.contains_key(user_id));
                            assert!(session.is_none());
                            assert_eq!(owner, None);
                            assert_eq!(record, None);
                        }
                    }
                }
            }
        });
    }
}
