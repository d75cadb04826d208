//! RpcChannel behavior against a scripted gateway.

mod support;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use gateway_client::channel::{ChannelConfig, ChannelEvent, RpcChannel};
use gateway_client::storage::{DeviceAuthCache, DeviceAuthEntry, IdentityStore, MemoryStorage};
use protocol::error::ProtocolError;
use protocol::frames::ClientInfo;

use support::{init_tracing, GatewayConn, MockTransport};

fn client_info() -> ClientInfo {
    ClientInfo {
        id: "gatelink-app".to_string(),
        version: "0.3.0".to_string(),
        platform: "linux".to_string(),
        mode: "ui".to_string(),
        instance_id: Some("inst-1".to_string()),
        display_name: None,
    }
}

struct Fixture {
    channel: Arc<RpcChannel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    conns: mpsc::UnboundedReceiver<GatewayConn>,
    storage: Arc<MemoryStorage>,
}

fn fixture(role: &str) -> Fixture {
    init_tracing();
    let storage = Arc::new(MemoryStorage::new());
    let (transport, conns) = MockTransport::new();
    let identity = IdentityStore::new(storage.clone()).load_or_create(0).unwrap();
    let config = ChannelConfig::new("ws://gateway.test/ws", role, client_info());
    let (events_tx, events) = mpsc::unbounded_channel();
    let channel = Arc::new(RpcChannel::new(
        config,
        identity,
        DeviceAuthCache::new(storage.clone()),
        transport,
        events_tx,
    ));
    Fixture {
        channel,
        events,
        conns,
        storage,
    }
}

async fn connect_ready(fx: &mut Fixture) -> GatewayConn {
    let connect = fx.channel.connect();
    let accept = async {
        let mut conn = fx.conns.recv().await.unwrap();
        conn.accept("nonce-1", None).await;
        conn
    };
    let (hello, conn) = tokio::join!(connect, accept);
    hello.unwrap();
    conn
}

#[tokio::test]
async fn test_connect_caches_issued_token() {
    let mut fx = fixture("operator");
    let connect = fx.channel.connect();
    let accept = async {
        let mut conn = fx.conns.recv().await.unwrap();
        conn.accept("nonce-1", Some("t1")).await
    };
    let (hello, params) = tokio::join!(connect, accept);

    let hello = hello.unwrap();
    assert_eq!(hello.protocol, 3);
    assert_eq!(hello.auth.unwrap().device_token, "t1");
    assert_eq!(params.role.as_deref(), Some("operator"));

    let cached = DeviceAuthCache::new(fx.storage.clone())
        .get(fx.channel.device_id(), "operator")
        .unwrap()
        .unwrap();
    assert_eq!(cached.token, "t1");
}

#[tokio::test]
async fn test_cached_token_is_offered_on_next_connect() {
    let mut fx = fixture("operator");
    let connect = fx.channel.connect();
    let accept = async {
        let mut conn = fx.conns.recv().await.unwrap();
        conn.accept("nonce-1", Some("t1")).await
    };
    let (hello, _) = tokio::join!(connect, accept);
    hello.unwrap();

    // A fresh channel over the same storage offers the cached token.
    let storage = fx.storage.clone();
    let (transport, mut conns) = MockTransport::new();
    let identity = IdentityStore::new(storage.clone()).load_or_create(0).unwrap();
    let (events_tx, _events) = mpsc::unbounded_channel();
    let channel = Arc::new(RpcChannel::new(
        ChannelConfig::new("ws://gateway.test/ws", "operator", client_info()),
        identity,
        DeviceAuthCache::new(storage),
        transport,
        events_tx,
    ));
    let connect = channel.connect();
    let accept = async {
        let mut conn = conns.recv().await.unwrap();
        conn.accept("nonce-2", None).await
    };
    let (hello, params) = tokio::join!(connect, accept);
    hello.unwrap();
    assert_eq!(params.auth.unwrap().token.as_deref(), Some("t1"));
}

#[tokio::test]
async fn test_concurrent_connects_share_one_handshake() {
    let mut fx = fixture("operator");
    let a = tokio::spawn({
        let channel = fx.channel.clone();
        async move { channel.connect().await }
    });
    let b = tokio::spawn({
        let channel = fx.channel.clone();
        async move { channel.connect().await }
    });

    let mut conn = fx.conns.recv().await.unwrap();
    conn.accept("nonce-1", None).await;

    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());
    // Exactly one connection was opened.
    assert!(fx.conns.try_recv().is_err());
}

#[tokio::test]
async fn test_responses_correlate_out_of_order() {
    let mut fx = fixture("operator");
    let mut conn = connect_ready(&mut fx).await;

    let first = tokio::spawn({
        let channel = fx.channel.clone();
        async move { channel.request("status.get", None).await }
    });
    let second = tokio::spawn({
        let channel = fx.channel.clone();
        async move { channel.request("chat.send", Some(json!({"text": "hi"}))).await }
    });

    let req_a = conn.recv_request().await;
    let req_b = conn.recv_request().await;
    let (status_req, chat_req) = if req_a.method == "status.get" {
        (req_a, req_b)
    } else {
        (req_b, req_a)
    };

    // Answer in reverse send order.
    conn.send_ok(&chat_req.id, json!({"delivered": true}));
    conn.send_ok(&status_req.id, json!({"phase": "ready"}));

    assert_eq!(first.await.unwrap().unwrap()["phase"], "ready");
    assert_eq!(second.await.unwrap().unwrap()["delivered"], true);
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out_and_late_response_is_dropped() {
    let mut fx = fixture("operator");
    let mut conn = connect_ready(&mut fx).await;

    let pending = tokio::spawn({
        let channel = fx.channel.clone();
        async move { channel.request("slow.call", None).await }
    });
    let req = conn.recv_request().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout(_)), "{err}");

    // The late response has no pending request left and is dropped.
    conn.send_ok(&req.id, json!({"late": true}));

    let follow_up = tokio::spawn({
        let channel = fx.channel.clone();
        async move { channel.request("fast.call", None).await }
    });
    let req = conn.recv_request().await;
    conn.send_ok(&req.id, json!({"ok": true}));
    assert_eq!(follow_up.await.unwrap().unwrap()["ok"], true);
}

#[tokio::test]
async fn test_request_before_connect_fails() {
    let fx = fixture("operator");
    let err = fx.channel.request("status.get", None).await.unwrap_err();
    assert!(matches!(err, ProtocolError::NotConnected));
}

#[tokio::test]
async fn test_server_error_rejects_only_that_request() {
    let mut fx = fixture("operator");
    let mut conn = connect_ready(&mut fx).await;

    let failing = tokio::spawn({
        let channel = fx.channel.clone();
        async move { channel.request("bad.call", None).await }
    });
    let fine = tokio::spawn({
        let channel = fx.channel.clone();
        async move { channel.request("good.call", None).await }
    });

    let req_a = conn.recv_request().await;
    let req_b = conn.recv_request().await;
    let (bad, good) = if req_a.method == "bad.call" {
        (req_a, req_b)
    } else {
        (req_b, req_a)
    };
    conn.send_err(&bad.id, "INVALID_REQUEST", "no such method");
    conn.send_ok(&good.id, json!({"ok": true}));

    let err = failing.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "INVALID_REQUEST");
    assert_eq!(fine.await.unwrap().unwrap()["ok"], true);
}

#[tokio::test]
async fn test_close_before_handshake_rejects_connect() {
    let mut fx = fixture("operator");
    let connect = fx.channel.connect();
    let script = async {
        let conn = fx.conns.recv().await.unwrap();
        conn.close(Some(4008), "policy");
    };
    let (result, ()) = tokio::join!(connect, script);
    let err = result.unwrap_err();
    assert!(
        err.to_string().contains("closed before connect (4008)"),
        "{err}"
    );
}

#[tokio::test]
async fn test_wrong_first_frame_is_protocol_violation() {
    let mut fx = fixture("operator");
    let connect = fx.channel.connect();
    let script = async {
        let conn = fx.conns.recv().await.unwrap();
        conn.send_event("chat", json!({"text": "hi"}));
    };
    let (result, ()) = tokio::join!(connect, script);
    assert!(matches!(
        result.unwrap_err(),
        ProtocolError::ProtocolViolation(_)
    ));
}

#[tokio::test]
async fn test_empty_nonce_is_protocol_violation() {
    let mut fx = fixture("operator");
    let connect = fx.channel.connect();
    let script = async {
        let conn = fx.conns.recv().await.unwrap();
        conn.send_challenge("");
    };
    let (result, ()) = tokio::join!(connect, script);
    assert!(matches!(
        result.unwrap_err(),
        ProtocolError::ProtocolViolation(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_missing_challenge_times_out() {
    let mut fx = fixture("operator");
    let connect = fx.channel.connect();
    let script = async {
        // Accept the connection but never send the challenge.
        fx.conns.recv().await.unwrap()
    };
    let (result, _conn) = tokio::join!(connect, script);
    let err = result.unwrap_err();
    assert!(err.to_string().contains("challenge timeout"), "{err}");
}

#[tokio::test]
async fn test_token_mismatch_clears_cache() {
    let fx = fixture("operator");
    let cache = DeviceAuthCache::new(fx.storage.clone());
    cache
        .put(
            fx.channel.device_id(),
            &DeviceAuthEntry {
                token: "stale".to_string(),
                role: "operator".to_string(),
                scopes: vec![],
                updated_at: 1,
            },
        )
        .unwrap();

    let mut conns = fx.conns;
    let connect = fx.channel.connect();
    let script = async {
        let mut conn = conns.recv().await.unwrap();
        conn.send_challenge("nonce-1");
        let req = conn.recv_request().await;
        let params: protocol::frames::ConnectParams =
            serde_json::from_value(req.params.unwrap()).unwrap();
        assert_eq!(params.auth.unwrap().token.as_deref(), Some("stale"));
        conn.send_err(&req.id, "UNAUTHORIZED", "device token mismatch");
    };
    let (result, ()) = tokio::join!(connect, script);
    assert!(result.is_err());
    assert!(cache
        .get(fx.channel.device_id(), "operator")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unexpected_close_is_reported() {
    let mut fx = fixture("operator");
    let conn = connect_ready(&mut fx).await;

    conn.close(Some(1006), "gateway restart");
    match fx.events.recv().await.unwrap() {
        ChannelEvent::Closed { code, reason } => {
            assert_eq!(code, Some(1006));
            assert_eq!(reason, "gateway restart");
        }
        other => panic!("expected close event, got {other:?}"),
    }
    assert!(!fx.channel.is_ready());
}

#[tokio::test]
async fn test_owner_close_is_not_reported() {
    let mut fx = fixture("operator");
    let _conn = connect_ready(&mut fx).await;

    fx.channel.disconnect(None, "done").await;
    tokio::task::yield_now().await;
    assert!(fx.events.try_recv().is_err());
    assert!(!fx.channel.is_ready());
}

#[tokio::test]
async fn test_disconnect_flushes_pending_requests() {
    let mut fx = fixture("operator");
    let mut conn = connect_ready(&mut fx).await;

    let pending = tokio::spawn({
        let channel = fx.channel.clone();
        async move { channel.request("slow.call", None).await }
    });
    conn.recv_request().await;

    fx.channel.disconnect(None, "done").await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionClosed(_)), "{err}");

    // Disconnect is idempotent.
    fx.channel.disconnect(None, "done").await;
}

#[tokio::test]
async fn test_events_are_forwarded() {
    let mut fx = fixture("operator");
    let conn = connect_ready(&mut fx).await;

    conn.send_event("chat", json!({"sessionKey": "s1", "text": "hi"}));
    match fx.events.recv().await.unwrap() {
        ChannelEvent::Event(frame) => {
            assert_eq!(frame.event, "chat");
            assert_eq!(frame.payload.unwrap()["sessionKey"], "s1");
        }
        other => panic!("expected event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_post_handshake_challenge_is_not_forwarded() {
    let mut fx = fixture("operator");
    let conn = connect_ready(&mut fx).await;

    // A stray challenge after the handshake is noise, not an event.
    conn.send_challenge("late-nonce");
    conn.send_event("chat", json!({"text": "hi"}));
    match fx.events.recv().await.unwrap() {
        ChannelEvent::Event(frame) => assert_eq!(frame.event, "chat"),
        other => panic!("expected chat event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unparseable_frames_are_dropped() {
    let mut fx = fixture("operator");
    let mut conn = connect_ready(&mut fx).await;

    conn.send_text("not json".to_string());
    conn.send_text(r#"{"type":"frob"}"#.to_string());

    // The channel is still usable afterwards.
    let request = tokio::spawn({
        let channel = fx.channel.clone();
        async move { channel.request("status.get", None).await }
    });
    let req = conn.recv_request().await;
    conn.send_ok(&req.id, json!({"ok": true}));
    assert_eq!(request.await.unwrap().unwrap()["ok"], true);
}
