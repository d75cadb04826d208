//! One RPC channel: transport connection, connect handshake, request
//! correlation, event delivery.
//!
//! A channel is single-use. It goes through
//! `idle → opening → awaiting-challenge → authenticating → ready → closed`
//! exactly once; reconnection creates a fresh instance. The session manager
//! owns that policy, the channel never retries on its own.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use protocol::crypto::{build_device_auth_payload, DeviceAuthPayload, DeviceIdentity};
use protocol::error::{ProtocolError, Result};
use protocol::frames::{
    ChallengePayload, ClientInfo, ConnectAuth, ConnectParams, DeviceInfo, EventFrame, Frame,
    HelloOk, RequestFrame, ResponseFrame, CHALLENGE_EVENT, CONNECT_METHOD, PROTOCOL_MAX,
    PROTOCOL_MIN,
};

use crate::storage::{DeviceAuthCache, DeviceAuthEntry};
use crate::transport::{Transport, TransportEvent, TransportSink, TransportStream};

/// Default timeout for the whole connect handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for the gateway's challenge after the transport opens.
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for one RPC request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-channel connection parameters.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    /// Connection role, `node` or `operator`.
    pub role: String,
    /// Scopes requested for this role. Sorted before transmit and signing.
    pub scopes: Vec<String>,
    pub caps: Option<Vec<String>>,
    pub commands: Option<Vec<String>>,
    pub permissions: Option<BTreeMap<String, bool>>,
    pub client: ClientInfo,
    pub auth_token: Option<String>,
    pub device_token: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub challenge_timeout: Duration,
    pub request_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>, role: impl Into<String>, client: ClientInfo) -> Self {
        Self {
            url: url.into(),
            role: role.into(),
            scopes: Vec::new(),
            caps: None,
            commands: None,
            permissions: None,
            client,
            auth_token: None,
            device_token: None,
            password: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            challenge_timeout: DEFAULT_CHALLENGE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Out-of-band notifications a channel delivers to its owner.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A server-push event (everything except the connect challenge).
    Event(EventFrame),
    /// The connection closed without the owner asking for it.
    Closed { code: Option<u16>, reason: String },
}

type ConnectOutcome = Option<Result<HelloOk>>;

/// The single-in-flight-connect guard, as an explicit state value.
enum ConnectState {
    NotStarted,
    InFlight(watch::Receiver<ConnectOutcome>),
    Done(Result<HelloOk>),
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>>;

/// One authenticated RPC connection to the gateway.
pub struct RpcChannel {
    config: ChannelConfig,
    identity: DeviceIdentity,
    auth_cache: DeviceAuthCache,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    next_id: AtomicU64,
    connect_state: Mutex<ConnectState>,
    sink: Mutex<Option<Box<dyn TransportSink>>>,
    pending: PendingMap,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    ready: Arc<AtomicBool>,
    closing_by_client: Arc<AtomicBool>,
}

impl RpcChannel {
    pub fn new(
        config: ChannelConfig,
        identity: DeviceIdentity,
        auth_cache: DeviceAuthCache,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            config,
            identity,
            auth_cache,
            transport,
            events,
            next_id: AtomicU64::new(1),
            connect_state: Mutex::new(ConnectState::NotStarted),
            sink: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            recv_task: Mutex::new(None),
            ready: Arc::new(AtomicBool::new(false)),
            closing_by_client: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn role(&self) -> &str {
        &self.config.role
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Performs the connect handshake.
    ///
    /// Only one handshake is ever in flight; concurrent callers await the
    /// same outcome, and callers after completion get the recorded result
    /// (the channel is single-use, it never reconnects).
    pub async fn connect(&self) -> Result<HelloOk> {
        let outcome_tx = {
            let mut state = self.connect_state.lock().await;
            match &*state {
                ConnectState::Done(result) => return result.clone(),
                ConnectState::InFlight(rx) => {
                    let mut rx = rx.clone();
                    drop(state);
                    return await_shared_outcome(&mut rx).await;
                }
                ConnectState::NotStarted => {
                    let (tx, rx) = watch::channel(None);
                    *state = ConnectState::InFlight(rx);
                    tx
                }
            }
        };

        let result = tokio::time::timeout(self.config.connect_timeout, self.do_connect())
            .await
            .unwrap_or_else(|_| Err(ProtocolError::Timeout("connect timeout".to_string())));

        if let Err(err) = &result {
            // A token the gateway rejected must not be offered again.
            if indicates_token_mismatch(err) {
                if let Err(cache_err) = self
                    .auth_cache
                    .clear(self.identity.device_id(), &self.config.role)
                {
                    warn!(%cache_err, role = %self.config.role, "failed to clear cached device token");
                }
            }
        }

        *self.connect_state.lock().await = ConnectState::Done(result.clone());
        let _ = outcome_tx.send(Some(result.clone()));
        result
    }

    async fn do_connect(&self) -> Result<HelloOk> {
        let pair = self.transport.open(&self.config.url).await?;
        let mut sink = pair.sink;
        let mut stream = pair.stream;

        let nonce = tokio::time::timeout(
            self.config.challenge_timeout,
            read_challenge(stream.as_mut()),
        )
        .await
        .unwrap_or_else(|_| Err(ProtocolError::Timeout("challenge timeout".to_string())))?;

        let request_id = self.next_request_id();
        let params = self.build_connect_params(&nonce)?;
        let frame = Frame::Req(RequestFrame {
            id: request_id.clone(),
            method: CONNECT_METHOD.to_string(),
            params: Some(serde_json::to_value(&params)?),
        });
        sink.send(frame.to_json()?).await?;

        let hello = self.read_hello(stream.as_mut(), &request_id).await?;

        if let Some(issued) = &hello.auth {
            let entry = DeviceAuthEntry {
                token: issued.device_token.clone(),
                role: issued.role.clone(),
                scopes: issued.scopes.clone(),
                updated_at: now_ms(),
            };
            self.auth_cache.put(self.identity.device_id(), &entry)?;
            debug!(role = %issued.role, "cached freshly issued device token");
        }

        *self.sink.lock().await = Some(sink);
        *self.recv_task.lock().await = Some(spawn_receive_loop(
            stream,
            Arc::clone(&self.pending),
            self.events.clone(),
            Arc::clone(&self.ready),
            Arc::clone(&self.closing_by_client),
        ));
        self.ready.store(true, Ordering::SeqCst);
        debug!(role = %self.config.role, protocol = hello.protocol, "channel ready");
        Ok(hello)
    }

    fn build_connect_params(&self, nonce: &str) -> Result<ConnectParams> {
        let mut scopes = self.config.scopes.clone();
        scopes.sort();

        // Effective token: explicit token > explicit device token > cached.
        let effective_token = match (&self.config.auth_token, &self.config.device_token) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(token)) => Some(token.clone()),
            (None, None) => self
                .auth_cache
                .get(self.identity.device_id(), &self.config.role)?
                .map(|entry| entry.token),
        };

        let signed_at = now_ms() as i64;
        let payload = build_device_auth_payload(&DeviceAuthPayload {
            device_id: self.identity.device_id(),
            client_id: &self.config.client.id,
            client_mode: &self.config.client.mode,
            role: &self.config.role,
            scopes: &scopes,
            signed_at_ms: signed_at,
            token: effective_token.as_deref(),
            nonce: Some(nonce),
        });
        let signature = self.identity.sign(&payload);

        let auth = ConnectAuth {
            token: effective_token,
            device_token: None,
            password: self.config.password.clone(),
        };
        Ok(ConnectParams {
            min_protocol: PROTOCOL_MIN,
            max_protocol: PROTOCOL_MAX,
            client: self.config.client.clone(),
            role: Some(self.config.role.clone()),
            scopes: if scopes.is_empty() {
                None
            } else {
                Some(scopes)
            },
            caps: self.config.caps.clone(),
            commands: self.config.commands.clone(),
            permissions: self.config.permissions.clone(),
            auth: if auth.is_empty() { None } else { Some(auth) },
            device: DeviceInfo {
                id: self.identity.device_id().to_string(),
                public_key: self.identity.public_key_encoded(),
                signature,
                signed_at,
                nonce: Some(nonce.to_string()),
            },
        })
    }

    /// Waits for the response to the connect request, forwarding any events
    /// the gateway pushes in the meantime.
    async fn read_hello(&self, stream: &mut dyn TransportStream, request_id: &str) -> Result<HelloOk> {
        loop {
            match stream.next().await {
                Some(TransportEvent::Text(text)) => match Frame::from_json(&text) {
                    Ok(Frame::Res(res)) if res.id == request_id => {
                        return hello_from_response(res);
                    }
                    Ok(Frame::Res(res)) => {
                        debug!(id = %res.id, "dropping response with no pending request");
                    }
                    Ok(Frame::Event(event)) if event.event == CHALLENGE_EVENT => {
                        debug!("dropping duplicate connect challenge");
                    }
                    Ok(Frame::Event(event)) => {
                        let _ = self.events.send(ChannelEvent::Event(event));
                    }
                    Ok(Frame::Req(req)) => {
                        debug!(method = %req.method, "dropping unexpected request frame");
                    }
                    Err(err) => debug!(%err, "dropping unparseable frame"),
                },
                Some(TransportEvent::Closed { code, reason }) => {
                    return Err(ProtocolError::ConnectionClosed(closed_before_connect(
                        code, &reason,
                    )));
                }
                None => {
                    return Err(ProtocolError::ConnectionClosed(closed_before_connect(
                        None, "",
                    )));
                }
            }
        }
    }

    /// Sends one RPC request and waits for its response.
    ///
    /// Correlation is by id, not send order; concurrent requests settle
    /// independently. A timeout removes the pending entry, so a late
    /// response is dropped as noise rather than resolved twice.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let frame = Frame::Req(RequestFrame {
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(err) => {
                self.pending.lock().await.remove(&id);
                return Err(err);
            }
        };
        let sent = {
            let mut sink = self.sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink.send(text).await,
                None => Err(ProtocolError::NotConnected),
            }
        };
        if let Err(err) = sent {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed("disconnected".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Timeout(format!("request timeout: {method}")))
            }
        }
    }

    /// Closes the channel: rejects all pending requests and closes the
    /// transport. Idempotent; the close is not reported as unexpected.
    pub async fn disconnect(&self, code: Option<u16>, reason: &str) {
        self.closing_by_client.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        flush_pending(
            &self.pending,
            ProtocolError::ConnectionClosed("disconnected".to_string()),
        )
        .await;
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close(code, reason).await;
        }
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
    }

    fn next_request_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

async fn await_shared_outcome(rx: &mut watch::Receiver<ConnectOutcome>) -> Result<HelloOk> {
    match rx.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => outcome
            .clone()
            .unwrap_or_else(|| Err(ProtocolError::HandshakeFailed("connect aborted".to_string()))),
        Err(_) => Err(ProtocolError::HandshakeFailed("connect aborted".to_string())),
    }
}

/// Reads the gateway's first frame, which must be a `connect.challenge`
/// event carrying a non-empty nonce. Anything else aborts the attempt.
async fn read_challenge(stream: &mut dyn TransportStream) -> Result<String> {
    match stream.next().await {
        Some(TransportEvent::Text(text)) => {
            let frame = Frame::from_json(&text)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("bad first frame: {e}")))?;
            let Frame::Event(event) = frame else {
                return Err(ProtocolError::ProtocolViolation(
                    "first frame is not the connect challenge".to_string(),
                ));
            };
            if event.event != CHALLENGE_EVENT {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "unexpected first event: {}",
                    event.event
                )));
            }
            let challenge: ChallengePayload =
                serde_json::from_value(event.payload.unwrap_or(Value::Null))
                    .map_err(|e| ProtocolError::ProtocolViolation(format!("bad challenge: {e}")))?;
            if challenge.nonce.is_empty() {
                return Err(ProtocolError::ProtocolViolation(
                    "challenge nonce is empty".to_string(),
                ));
            }
            Ok(challenge.nonce)
        }
        Some(TransportEvent::Closed { code, reason }) => Err(ProtocolError::ConnectionClosed(
            closed_before_connect(code, &reason),
        )),
        None => Err(ProtocolError::ConnectionClosed(closed_before_connect(
            None, "",
        ))),
    }
}

fn hello_from_response(res: ResponseFrame) -> Result<HelloOk> {
    if res.ok {
        let payload = res.payload.ok_or_else(|| {
            ProtocolError::ProtocolViolation("hello-ok is missing its payload".to_string())
        })?;
        Ok(serde_json::from_value(payload)?)
    } else {
        match res.error {
            Some(error) => Err(ProtocolError::Rpc {
                code: error.code,
                message: error.message,
                details: error.details,
            }),
            None => Err(ProtocolError::HandshakeFailed(
                "connect rejected without an error".to_string(),
            )),
        }
    }
}

fn response_result(res: ResponseFrame) -> Result<Value> {
    if res.ok {
        Ok(res.payload.unwrap_or(Value::Null))
    } else {
        match res.error {
            Some(error) => Err(ProtocolError::Rpc {
                code: error.code,
                message: error.message,
                details: error.details,
            }),
            None => Err(ProtocolError::Rpc {
                code: "UNKNOWN".to_string(),
                message: "request failed without an error".to_string(),
                details: None,
            }),
        }
    }
}

fn spawn_receive_loop(
    mut stream: Box<dyn TransportStream>,
    pending: PendingMap,
    events: mpsc::UnboundedSender<ChannelEvent>,
    ready: Arc<AtomicBool>,
    closing_by_client: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            match event {
                TransportEvent::Text(text) => match Frame::from_json(&text) {
                    Ok(Frame::Res(res)) => {
                        let sender = pending.lock().await.remove(&res.id);
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(response_result(res));
                            }
                            None => {
                                debug!(id = %res.id, "dropping response with no pending request")
                            }
                        }
                    }
                    Ok(Frame::Event(event)) if event.event == CHALLENGE_EVENT => {
                        debug!("dropping post-handshake connect challenge")
                    }
                    Ok(Frame::Event(event)) => {
                        let _ = events.send(ChannelEvent::Event(event));
                    }
                    Ok(Frame::Req(req)) => {
                        debug!(method = %req.method, "dropping unexpected request frame")
                    }
                    Err(err) => debug!(%err, "dropping unparseable frame"),
                },
                TransportEvent::Closed { code, reason } => {
                    ready.store(false, Ordering::SeqCst);
                    flush_pending(
                        &pending,
                        ProtocolError::ConnectionClosed("disconnected".to_string()),
                    )
                    .await;
                    if !closing_by_client.load(Ordering::SeqCst) {
                        let _ = events.send(ChannelEvent::Closed { code, reason });
                    }
                    break;
                }
            }
        }
    })
}

async fn flush_pending(pending: &PendingMap, err: ProtocolError) {
    let drained: Vec<_> = pending.lock().await.drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(err.clone()));
    }
}

fn closed_before_connect(code: Option<u16>, reason: &str) -> String {
    match code {
        Some(code) => format!("closed before connect ({code})"),
        None if !reason.is_empty() => format!("closed before connect ({reason})"),
        None => "closed before connect".to_string(),
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// True when a failed connect points at a stale or revoked device token.
fn indicates_token_mismatch(err: &ProtocolError) -> bool {
    let text = match err {
        ProtocolError::Rpc { code, message, .. } => format!("{code} {message}").to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    text.contains("token")
        && (text.contains("mismatch")
            || text.contains("invalid")
            || text.contains("unknown")
            || text.contains("expired")
            || text.contains("unauthorized"))
}
