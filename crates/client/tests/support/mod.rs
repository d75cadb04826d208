//! Scripted in-process gateway for the integration tests.
//!
//! `MockTransport` hands each `open` call to the test as a `GatewayConn`,
//! which the test drives like the real gateway would: push the challenge,
//! read the signed connect request, answer with hello-ok or an error.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use gateway_client::transport::{
    Transport, TransportEvent, TransportPair, TransportSink, TransportStream,
};
use protocol::crypto::{build_device_auth_payload, verify_signature, DeviceAuthPayload};
use protocol::error::{ProtocolError, Result};
use protocol::frames::{ConnectParams, Frame, RequestFrame, ResponseFrame, CONNECT_METHOD};

/// Installs the test log subscriber. Safe to call from every test; only the
/// first call takes effect. Run with `RUST_LOG=debug` to see channel logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Transport whose connections surface as scripted `GatewayConn`s.
pub struct MockTransport {
    conns: mpsc::UnboundedSender<GatewayConn>,
    fail_opens: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<GatewayConn>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                conns: tx,
                fail_opens: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    /// Makes the next `count` open calls fail as if the gateway were down.
    pub fn fail_next_opens(&self, count: usize) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _url: &str) -> Result<TransportPair> {
        let failed = self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ProtocolError::ConnectionClosed(
                "connection refused".to_string(),
            ));
        }
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
        self.conns
            .send(GatewayConn {
                to_client: to_client_tx,
                from_client: from_client_rx,
            })
            .map_err(|_| ProtocolError::ConnectionClosed("gateway gone".to_string()))?;
        Ok(TransportPair {
            sink: Box::new(MockSink { tx: from_client_tx }),
            stream: Box::new(MockStream {
                rx: to_client_rx,
                done: false,
            }),
        })
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.tx
            .send(text)
            .map_err(|_| ProtocolError::ConnectionClosed("peer gone".to_string()))
    }

    async fn close(&mut self, _code: Option<u16>, _reason: &str) -> Result<()> {
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    done: bool,
}

#[async_trait]
impl TransportStream for MockStream {
    async fn next(&mut self) -> Option<TransportEvent> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                if matches!(event, TransportEvent::Closed { .. }) {
                    self.done = true;
                }
                Some(event)
            }
            None => {
                self.done = true;
                Some(TransportEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                })
            }
        }
    }
}

/// The gateway's side of one client connection.
pub struct GatewayConn {
    to_client: mpsc::UnboundedSender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl GatewayConn {
    pub fn send_text(&self, text: String) {
        let _ = self.to_client.send(TransportEvent::Text(text));
    }

    pub fn send_frame(&self, frame: &Frame) {
        self.send_text(frame.to_json().expect("frame serializes"));
    }

    pub fn send_challenge(&self, nonce: &str) {
        self.send_text(
            json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": nonce}})
                .to_string(),
        );
    }

    pub fn send_event(&self, event: &str, payload: Value) {
        self.send_text(json!({"type": "event", "event": event, "payload": payload}).to_string());
    }

    pub fn send_ok(&self, id: &str, payload: Value) {
        self.send_frame(&Frame::Res(ResponseFrame {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }));
    }

    pub fn send_err(&self, id: &str, code: &str, message: &str) {
        self.send_text(
            json!({
                "type": "res",
                "id": id,
                "ok": false,
                "error": {"code": code, "message": message}
            })
            .to_string(),
        );
    }

    pub fn close(&self, code: Option<u16>, reason: &str) {
        let _ = self.to_client.send(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    /// Reads the next request frame the client sends.
    pub async fn recv_request(&mut self) -> RequestFrame {
        loop {
            let text = self.from_client.recv().await.expect("client hung up");
            match Frame::from_json(&text).expect("client sent invalid frame") {
                Frame::Req(req) => return req,
                other => panic!("unexpected client frame: {other:?}"),
            }
        }
    }

    /// Runs the gateway side of a full handshake: challenge, verify the
    /// signed connect request, answer hello-ok (optionally issuing a device
    /// token). Returns the connect params for further assertions.
    pub async fn accept(&mut self, nonce: &str, device_token: Option<&str>) -> ConnectParams {
        self.send_challenge(nonce);
        let req = self.recv_request().await;
        assert_eq!(req.method, CONNECT_METHOD);
        let params: ConnectParams =
            serde_json::from_value(req.params.expect("connect has params"))
                .expect("connect params parse");

        let scopes = params.scopes.clone().unwrap_or_default();
        let payload = build_device_auth_payload(&DeviceAuthPayload {
            device_id: &params.device.id,
            client_id: &params.client.id,
            client_mode: &params.client.mode,
            role: params.role.as_deref().expect("connect carries a role"),
            scopes: &scopes,
            signed_at_ms: params.device.signed_at,
            token: params.auth.as_ref().and_then(|a| a.token.as_deref()),
            nonce: params.device.nonce.as_deref(),
        });
        verify_signature(&params.device.public_key, &payload, &params.device.signature)
            .expect("device signature verifies");
        assert_eq!(params.device.nonce.as_deref(), Some(nonce));

        let mut hello = json!({"type": "hello-ok", "protocol": 3});
        if let Some(token) = device_token {
            hello["auth"] = json!({
                "role": params.role,
                "scopes": scopes,
                "deviceToken": token,
            });
        }
        self.send_ok(&req.id, hello);
        params
    }
}

/// Spawns a gateway that accepts every connection and keeps it open.
pub fn spawn_auto_gateway(mut conns: mpsc::UnboundedReceiver<GatewayConn>) {
    tokio::spawn(async move {
        while let Some(mut conn) = conns.recv().await {
            tokio::spawn(async move {
                conn.accept("auto-nonce", None).await;
                // Hold the connection open for the rest of the test.
                std::future::pending::<()>().await;
            });
        }
    });
}
