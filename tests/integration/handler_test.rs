// tests/integration/handler_test.rs

//! End-to-end tests driving real WebSocket clients against a node's
//! connection handler.

use super::fixtures::*;
use super::test_helpers::*;
use futures::{SinkExt, StreamExt};
use spinelgate::core::protocol::envelope::{decode, encode};
use spinelgate::core::protocol::message::{
    LoginResult, RequestMessage, RequestPayload, ResponseMessage, SignupResult,
};
use spinelgate::core::protocol::storage::{StoragePayload, StorageRequest};
use spinelgate::core::protocol::{Envelope, EnvelopeType};
use spinelgate::core::session::record::lock_key;
use spinelgate::core::state::GatewayState;
use spinelgate::core::store::SharedStore;
use spinelgate::server::{AnyStream, serve_connection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Accepts connections for `node` on an ephemeral port.
async fn listen(node: &TestNode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state: Arc<GatewayState> = node.state.clone();
    let shutdown_tx = node.shutdown_tx.clone();
    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let state = state.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let _ = serve_connection(stream, peer, state, shutdown_rx).await;
            });
        }
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Client, request: &RequestMessage) {
    ws.send(Message::binary(encode(request).unwrap()))
        .await
        .unwrap();
}

/// Reads frames until a binary one arrives. `None` means the server closed.
async fn recv(ws: &mut Client) -> Option<ResponseMessage> {
    loop {
        let frame = tokio::time::timeout(EVENT_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Binary(data))) => return Some(decode(&data).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn login(ws: &mut Client, account: &str) -> ResponseMessage {
    send(ws, &login_request(account, PASSWORD)).await;
    recv(ws).await.expect("connection closed during login")
}

#[tokio::test]
async fn test_login_over_websocket() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut ws = connect(addr).await;
    match login(&mut ws, ALICE).await {
        ResponseMessage::Login(rsp) => {
            assert_eq!(rsp.result, LoginResult::Ok);
            assert_eq!(rsp.user_id, MockAuth::user_id_of(ALICE));
            assert_eq!(rsp.token, MockAuth::token_of(ALICE));
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let user_id = MockAuth::user_id_of(ALICE);
    assert!(node.state.registry.get_connection_by_user(&user_id).is_some());
    assert_eq!(node.state.stats.get_total_logins(), 1);
}

#[tokio::test]
async fn test_bad_password_keeps_connection_unauthenticated() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut ws = connect(addr).await;
    send(&mut ws, &login_request(ALICE, "wrong")).await;
    match recv(&mut ws).await {
        Some(ResponseMessage::Login(rsp)) => {
            assert_eq!(rsp.result, LoginResult::PasswordError);
            assert!(rsp.token.is_empty());
        }
        other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(node.state.registry.user_count(), 0);

    // A second attempt on the same socket still works.
    assert!(matches!(
        login(&mut ws, ALICE).await,
        ResponseMessage::Login(rsp) if rsp.result == LoginResult::Ok
    ));
}

#[tokio::test]
async fn test_wrong_path_is_rejected() {
    let cluster = TestCluster::new();
    let node = cluster.node(NODE_A);
    let addr = listen(&node).await;

    let err = connect_async(format!("ws://{addr}/elsewhere"))
        .await
        .unwrap_err();

    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(node.state.registry.connection_count(), 0);
}

#[tokio::test]
async fn test_post_before_login_is_refused_and_closed() {
    let cluster = TestCluster::new();
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut ws = connect(addr).await;
    send(&mut ws, &post_request("", BOB, "sneaky")).await;

    assert_eq!(
        recv(&mut ws).await,
        Some(ResponseMessage::Refused {
            reason: "login required".to_string()
        })
    );
    assert_eq!(recv(&mut ws).await, None);
    assert!(wait_until(|| node.state.registry.connection_count() == 0).await);
}

#[tokio::test]
async fn test_garbage_before_login_closes_connection() {
    let cluster = TestCluster::new();
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut ws = connect(addr).await;
    ws.send(Message::binary(vec![0xff, 0x00, 0x13]))
        .await
        .unwrap();

    assert_eq!(recv(&mut ws).await, None);
}

#[tokio::test]
async fn test_post_between_clients() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    cluster.auth.add_account(BOB, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    login(&mut alice, ALICE).await;
    login(&mut bob, BOB).await;

    let bob_id = MockAuth::user_id_of(BOB);
    let mut request = post_request(&MockAuth::token_of(ALICE), &bob_id, "hi bob");
    if let RequestPayload::Post(post) = &mut request.payload {
        // The gateway overwrites a forged sender and fills the timestamp.
        post.from_id = "mallory".to_string();
        post.timestamp = 0;
    }
    send(&mut alice, &request).await;

    match recv(&mut bob).await {
        Some(ResponseMessage::Post(post)) => {
            assert_eq!(post.from_id, MockAuth::user_id_of(ALICE));
            assert_eq!(post.to_id, bob_id);
            assert_eq!(post.content, b"hi bob");
            assert!(post.timestamp > 0);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_post_with_session_token_and_bad_token() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    cluster.auth.add_account(BOB, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    login(&mut alice, ALICE).await;
    login(&mut bob, BOB).await;
    let bob_id = MockAuth::user_id_of(BOB);

    // An empty request token falls back to the session token.
    send(&mut alice, &post_request("", &bob_id, "implicit")).await;
    assert!(matches!(recv(&mut bob).await, Some(ResponseMessage::Post(_))));

    send(&mut alice, &post_request("forged", &bob_id, "nope")).await;
    assert_eq!(
        recv(&mut alice).await,
        Some(ResponseMessage::Refused {
            reason: "invalid token".to_string()
        })
    );
}

#[tokio::test]
async fn test_group_post_is_refused() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut alice = connect(addr).await;
    login(&mut alice, ALICE).await;
    let mut request = post_request(&MockAuth::token_of(ALICE), "group-1", "to all");
    if let RequestPayload::Post(post) = &mut request.payload {
        post.is_group = true;
    }
    send(&mut alice, &request).await;

    assert!(matches!(
        recv(&mut alice).await,
        Some(ResponseMessage::Refused { .. })
    ));
    assert_eq!(cluster.broker.total_published(), 0);
}

#[tokio::test]
async fn test_post_to_offline_user_goes_to_storage() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut alice = connect(addr).await;
    login(&mut alice, ALICE).await;
    send(
        &mut alice,
        &post_request(&MockAuth::token_of(ALICE), "uid-nobody", "see you"),
    )
    .await;

    assert!(wait_until(|| cluster.broker.published_count("storage-service") == 1).await);
}

#[tokio::test]
async fn test_storage_query_publishes_request() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut alice = connect(addr).await;
    login(&mut alice, ALICE).await;
    send(
        &mut alice,
        &RequestMessage {
            token: MockAuth::token_of(ALICE),
            payload: RequestPayload::QuerySyncMessages { since: 42 },
        },
    )
    .await;

    assert!(wait_until(|| cluster.broker.published_count("storage-service") == 1).await);
    let published = cluster.broker.published("storage-service");
    let envelope = Envelope::decode(&published[0]).unwrap();
    assert_eq!(envelope.kind, EnvelopeType::StorageRequest);
    let request: StorageRequest = envelope.open().unwrap();
    assert_eq!(request.from_topic, NODE_A);
    assert_eq!(request.target_user_id, MockAuth::user_id_of(ALICE));
    assert_eq!(
        request.payload,
        StoragePayload::QuerySyncMessages {
            user_id: MockAuth::user_id_of(ALICE),
            since: 42
        }
    );
}

#[tokio::test]
async fn test_logout_closes_and_clears_session() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut alice = connect(addr).await;
    login(&mut alice, ALICE).await;
    send(
        &mut alice,
        &RequestMessage {
            token: String::new(),
            payload: RequestPayload::Logout,
        },
    )
    .await;

    assert_eq!(recv(&mut alice).await, None);
    assert!(wait_until(|| node.state.registry.connection_count() == 0).await);
    let user_id = MockAuth::user_id_of(ALICE);
    assert_eq!(node.state.coordinator.owner_of(&user_id).await.unwrap(), None);
}

#[tokio::test]
async fn test_signup_then_login() {
    let cluster = TestCluster::new();
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut ws = connect(addr).await;
    send(
        &mut ws,
        &RequestMessage {
            token: String::new(),
            payload: RequestPayload::Signup {
                account: "carol".to_string(),
                password: PASSWORD.to_string(),
                user_name: "Carol".to_string(),
            },
        },
    )
    .await;

    match recv(&mut ws).await {
        Some(ResponseMessage::Signup(rsp)) => {
            assert_eq!(rsp.result, SignupResult::Ok);
            assert_eq!(rsp.user_id, MockAuth::user_id_of("carol"));
        }
        other => panic!("unexpected response: {other:?}"),
    }
    assert!(matches!(
        login(&mut ws, "carol").await,
        ResponseMessage::Login(rsp) if rsp.result == LoginResult::Ok
    ));
}

#[tokio::test]
async fn test_second_login_on_other_node_closes_first_socket() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let a = cluster.started_node(NODE_A).await;
    let b = cluster.started_node(NODE_B).await;
    let addr_a = listen(&a).await;
    let addr_b = listen(&b).await;

    let mut first = connect(addr_a).await;
    login(&mut first, ALICE).await;
    let mut second = connect(addr_b).await;
    assert!(matches!(
        login(&mut second, ALICE).await,
        ResponseMessage::Login(rsp) if rsp.result == LoginResult::Ok
    ));

    assert_eq!(recv(&mut first).await, None);
    assert!(wait_until(|| a.state.registry.connection_count() == 0).await);
}

#[tokio::test]
async fn test_auth_outage_reports_service_error() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    cluster.auth.set_unavailable(true);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut ws = connect(addr).await;
    assert!(matches!(
        login(&mut ws, ALICE).await,
        ResponseMessage::Login(rsp) if rsp.result == LoginResult::ServiceError
    ));
}

fn login_result(response: ResponseMessage) -> LoginResult {
    match response {
        ResponseMessage::Login(rsp) => rsp.result,
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_login_while_lock_is_held_asks_to_try_again() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;
    let user_id = MockAuth::user_id_of(ALICE);
    // Another node is in the middle of logging the same user in.
    assert!(
        cluster
            .store
            .set_nx_px(&lock_key(&user_id), "other-login", Duration::from_secs(30))
            .await
            .unwrap()
    );

    let mut ws = connect(addr).await;
    assert_eq!(login_result(login(&mut ws, ALICE).await), LoginResult::TryAgain);
    assert_eq!(node.state.registry.user_count(), 0);

    // Once the other login finishes, the same socket can retry.
    cluster.store.del(&lock_key(&user_id)).await.unwrap();
    assert_eq!(login_result(login(&mut ws, ALICE).await), LoginResult::Ok);
}

#[tokio::test]
async fn test_login_conflict_after_override_asks_to_try_again() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let a = cluster.started_node(NODE_A).await;
    let b = cluster.node(NODE_B);
    let addr = listen(&a).await;
    let user_id = MockAuth::user_id_of(ALICE);

    // Node B keeps rewriting its record, so it is back after the override settles.
    let writer = {
        let coordinator = b.state.coordinator.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            loop {
                let _ = coordinator.set_user_session(&user_id, "c-stubborn").await;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let mut ws = connect(addr).await;
    assert_eq!(login_result(login(&mut ws, ALICE).await), LoginResult::TryAgain);
    assert_eq!(a.state.registry.user_count(), 0);

    writer.abort();
    let _ = writer.await;
    assert_eq!(login_result(login(&mut ws, ALICE).await), LoginResult::Ok);
    let record = a.state.coordinator.get_user_session(&user_id).await.unwrap().unwrap();
    assert!(record.is_owned_by(NODE_A));
}

#[tokio::test]
async fn test_store_outage_during_bind_asks_to_try_again() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let addr = listen(&node).await;

    let mut ws = connect(addr).await;
    cluster.store.set_unavailable(true);
    assert_eq!(login_result(login(&mut ws, ALICE).await), LoginResult::TryAgain);
    assert_eq!(node.state.registry.user_count(), 0);

    cluster.store.set_unavailable(false);
    assert_eq!(login_result(login(&mut ws, ALICE).await), LoginResult::Ok);
}

#[tokio::test]
async fn test_plain_transport_serves_websocket() {
    let cluster = TestCluster::new();
    cluster.auth.add_account(ALICE, PASSWORD);
    let node = cluster.started_node(NODE_A).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = node.state.clone();
    let shutdown_rx = node.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let (socket, peer) = listener.accept().await.unwrap();
        let stream = AnyStream::accept(socket, None).await.unwrap();
        assert_eq!(stream.scheme(), "ws");
        let _ = serve_connection(stream, peer, state, shutdown_rx).await;
    });

    let mut ws = connect(addr).await;
    assert_eq!(login_result(login(&mut ws, ALICE).await), LoginResult::Ok);
}
