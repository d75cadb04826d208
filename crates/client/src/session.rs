//! Session manager: one logical gateway session over two role channels.
//!
//! The manager owns the *desired* state (does the user want to be
//! connected), drives a node-role and an operator-role `RpcChannel` as one
//! unit, classifies connect failures, and runs the reconnect/backoff state
//! machine. All retry policy lives here; channels never retry themselves.
//!
//! Pairing and auth failures are terminal: the session pauses until the user
//! resolves them out-of-band and calls `connect` again. Everything else
//! reconnects with capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use protocol::error::{ProtocolError, Result};
use protocol::frames::{roles, scopes, EventFrame};

use crate::channel::{ChannelConfig, ChannelEvent, RpcChannel};
use crate::config::{CapabilityConfig, SessionConfig};
use crate::storage::{DeviceAuthCache, IdentityStore, Storage};
use crate::transport::Transport;

/// First reconnect delay; doubles per consecutive failure.
const BACKOFF_BASE_MS: u64 = 1000;

/// Reconnect delay ceiling.
const BACKOFF_CAP_MS: u64 = 15_000;

/// Buffer size for the session event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 64;

/// Externally observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Offline,
    Connecting,
    Connected,
    /// The gateway wants this device approved before it may connect.
    PairingRequired,
    /// Credentials were rejected; reconnecting would not help.
    AuthRequired,
    Error,
}

/// Phase plus the human-readable status string that drives UI.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PhaseUpdate {
    pub phase: ConnectionPhase,
    /// Status detail, e.g. "Reconnecting…" or the verbatim error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Events the session publishes to feature code.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A `chat` event, keyed by the session it belongs to.
    Chat { session: String, payload: Value },
    /// An `agent` or `talk.mode` notice.
    Notice { event: String, payload: Value },
    /// Every event, tagged with the role channel that produced it.
    Raw { role: String, frame: EventFrame },
}

/// How a failed connect attempt is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    PairingRequired,
    AuthRequired,
    Retryable,
}

/// Reconnect scheduling as an explicit state; cancellation is always safe.
enum ReconnectTimer {
    Idle,
    Scheduled(JoinHandle<()>),
}

impl ReconnectTimer {
    fn cancel(&mut self) {
        if let ReconnectTimer::Scheduled(handle) = std::mem::replace(self, ReconnectTimer::Idle) {
            handle.abort();
        }
    }
}

struct SessionState {
    config: Option<SessionConfig>,
    desired_connected: bool,
    paused: bool,
    attempts: u32,
    reconnect: ReconnectTimer,
    node: Option<Arc<RpcChannel>>,
    operator: Option<Arc<RpcChannel>>,
    router_tasks: Vec<JoinHandle<()>>,
    identity_loaded: Option<protocol::crypto::DeviceIdentity>,
}

struct SessionInner {
    storage: Arc<dyn Storage>,
    identity_store: IdentityStore,
    transport: Arc<dyn Transport>,
    phase_tx: watch::Sender<PhaseUpdate>,
    events_tx: broadcast::Sender<SessionEvent>,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn set_phase(&self, phase: ConnectionPhase, detail: Option<String>) {
        debug!(?phase, ?detail, "session phase");
        let _ = self.phase_tx.send(PhaseUpdate { phase, detail });
    }

    fn route_event(&self, role: &'static str, frame: EventFrame) {
        let _ = self.events_tx.send(SessionEvent::Raw {
            role: role.to_string(),
            frame: frame.clone(),
        });
        match frame.event.as_str() {
            "chat" => {
                let payload = frame.payload.unwrap_or(Value::Null);
                let session = payload
                    .get("sessionKey")
                    .and_then(Value::as_str)
                    .or_else(|| payload.get("sessionId").and_then(Value::as_str))
                    .unwrap_or_default()
                    .to_string();
                let _ = self.events_tx.send(SessionEvent::Chat { session, payload });
            }
            "agent" | "talk.mode" => {
                let _ = self.events_tx.send(SessionEvent::Notice {
                    event: frame.event,
                    payload: frame.payload.unwrap_or(Value::Null),
                });
            }
            _ => {}
        }
    }
}

/// One logical gateway session backed by two role-scoped channels.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>, transport: Arc<dyn Transport>) -> Self {
        let (phase_tx, _) = watch::channel(PhaseUpdate {
            phase: ConnectionPhase::Offline,
            detail: None,
        });
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            inner: Arc::new(SessionInner {
                identity_store: IdentityStore::new(storage.clone()),
                storage,
                transport,
                phase_tx,
                events_tx,
                state: Mutex::new(SessionState {
                    config: None,
                    desired_connected: false,
                    paused: false,
                    attempts: 0,
                    reconnect: ReconnectTimer::Idle,
                    node: None,
                    operator: None,
                    router_tasks: Vec::new(),
                    identity_loaded: None,
                }),
            }),
        }
    }

    /// Watch the connection phase.
    pub fn subscribe_phase(&self) -> watch::Receiver<PhaseUpdate> {
        self.inner.phase_tx.subscribe()
    }

    /// Subscribe to routed session events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// The current phase snapshot.
    pub fn phase(&self) -> PhaseUpdate {
        self.inner.phase_tx.borrow().clone()
    }

    /// The operator channel, for feature code RPCs. `None` while offline.
    pub async fn operator_channel(&self) -> Option<Arc<RpcChannel>> {
        self.inner.state.lock().await.operator.clone()
    }

    /// The node channel. `None` while offline.
    pub async fn node_channel(&self) -> Option<Arc<RpcChannel>> {
        self.inner.state.lock().await.node.clone()
    }

    /// Connects (or re-connects) the session with the given configuration.
    ///
    /// On a retryable failure a reconnect is scheduled and the error is
    /// returned. On a pairing/auth failure the session pauses instead: the
    /// caller must resolve it externally and call `connect` again.
    pub async fn connect(&self, config: SessionConfig) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.config = Some(config);
        state.desired_connected = true;
        state.paused = false;
        state.attempts = 0;
        state.reconnect.cancel();
        Self::teardown_channels(&mut state).await;
        self.inner
            .set_phase(ConnectionPhase::Connecting, Some("Connecting…".to_string()));
        match Self::establish(&self.inner, &mut state).await {
            Ok(()) => Ok(()),
            Err(err) => {
                Self::handle_connect_failure(&self.inner, &mut state, &err);
                Err(err)
            }
        }
    }

    /// Disconnects and stays offline until the next `connect`. Idempotent.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        state.desired_connected = false;
        state.paused = false;
        state.attempts = 0;
        state.reconnect.cancel();
        Self::teardown_channels(&mut state).await;
        self.inner.set_phase(ConnectionPhase::Offline, None);
    }

    /// Stores a new capability snapshot and, if currently connected, redoes
    /// the full dual handshake with it. Capabilities are negotiated only at
    /// connect time, so this is the only way to change them.
    pub async fn reconnect_with_capabilities(
        &self,
        capabilities: CapabilityConfig,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(config) = state.config.as_mut() {
            config.capabilities = capabilities;
        }
        if state.node.is_none() && state.operator.is_none() {
            return Ok(());
        }
        Self::teardown_channels(&mut state).await;
        self.inner
            .set_phase(ConnectionPhase::Connecting, Some("Connecting…".to_string()));
        match Self::establish(&self.inner, &mut state).await {
            Ok(()) => Ok(()),
            Err(err) => {
                Self::handle_connect_failure(&self.inner, &mut state, &err);
                Err(err)
            }
        }
    }

    /// Opens both role channels. Either both succeed or both are torn down.
    async fn establish(inner: &Arc<SessionInner>, state: &mut SessionState) -> Result<()> {
        let config = state
            .config
            .clone()
            .ok_or_else(|| ProtocolError::HandshakeFailed("no session configuration".to_string()))?;
        let identity = match &state.identity_loaded {
            Some(identity) => identity.clone(),
            None => {
                let identity = inner.identity_store.load_or_create(now_ms())?;
                state.identity_loaded = Some(identity.clone());
                identity
            }
        };
        let auth_cache = DeviceAuthCache::new(inner.storage.clone());

        let (node_events, node_rx) = mpsc::unbounded_channel();
        let mut node_config = ChannelConfig::new(&config.url, roles::NODE, config.client_info());
        node_config.caps = Some(config.capabilities.caps());
        node_config.commands = Some(config.capabilities.commands());
        node_config.permissions = Some(config.capabilities.permissions());
        node_config.auth_token = config.auth_token.clone();
        node_config.device_token = config.device_token.clone();
        node_config.password = config.password.clone();
        let node = Arc::new(RpcChannel::new(
            node_config,
            identity.clone(),
            auth_cache.clone(),
            inner.transport.clone(),
            node_events,
        ));
        if let Err(err) = node.connect().await {
            node.disconnect(None, "handshake failed").await;
            return Err(err);
        }

        let (operator_events, operator_rx) = mpsc::unbounded_channel();
        let mut operator_config =
            ChannelConfig::new(&config.url, roles::OPERATOR, config.client_info());
        operator_config.scopes = vec![
            scopes::OPERATOR_READ.to_string(),
            scopes::OPERATOR_WRITE.to_string(),
            scopes::OPERATOR_TALK_SECRETS.to_string(),
        ];
        operator_config.auth_token = config.auth_token.clone();
        operator_config.device_token = config.device_token.clone();
        operator_config.password = config.password.clone();
        let operator = Arc::new(RpcChannel::new(
            operator_config,
            identity,
            auth_cache,
            inner.transport.clone(),
            operator_events,
        ));
        if let Err(err) = operator.connect().await {
            // Both channels go down together.
            node.disconnect(None, "handshake failed").await;
            operator.disconnect(None, "handshake failed").await;
            return Err(err);
        }

        state
            .router_tasks
            .push(spawn_router(inner.clone(), roles::NODE, node.clone(), node_rx));
        state.router_tasks.push(spawn_router(
            inner.clone(),
            roles::OPERATOR,
            operator.clone(),
            operator_rx,
        ));
        state.node = Some(node);
        state.operator = Some(operator);
        state.attempts = 0;
        info!("session connected");
        inner.set_phase(ConnectionPhase::Connected, None);
        Ok(())
    }

    fn handle_connect_failure(
        inner: &Arc<SessionInner>,
        state: &mut SessionState,
        err: &ProtocolError,
    ) {
        match classify_connect_error(err) {
            FailureClass::PairingRequired => {
                warn!(%err, "connect failed: pairing required");
                state.paused = true;
                state.desired_connected = false;
                inner.set_phase(ConnectionPhase::PairingRequired, Some(err.to_string()));
            }
            FailureClass::AuthRequired => {
                warn!(%err, "connect failed: authentication required");
                state.paused = true;
                state.desired_connected = false;
                inner.set_phase(ConnectionPhase::AuthRequired, Some(err.to_string()));
            }
            FailureClass::Retryable => {
                warn!(%err, "connect failed, will retry");
                inner.set_phase(ConnectionPhase::Error, Some(err.to_string()));
                Self::schedule_reconnect(inner, state);
            }
        }
    }

    fn schedule_reconnect(inner: &Arc<SessionInner>, state: &mut SessionState) {
        state.reconnect.cancel();
        let delay = backoff_delay(state.attempts);
        state.attempts = state.attempts.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        let inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::run_reconnect(inner).await;
        });
        state.reconnect = ReconnectTimer::Scheduled(handle);
    }

    async fn run_reconnect(inner: Arc<SessionInner>) {
        let mut state = inner.state.lock().await;
        state.reconnect = ReconnectTimer::Idle;
        if !state.desired_connected || state.paused {
            return;
        }
        inner.set_phase(
            ConnectionPhase::Connecting,
            Some("Reconnecting…".to_string()),
        );
        if let Err(err) = Self::establish(&inner, &mut state).await {
            Self::handle_connect_failure(&inner, &mut state, &err);
        }
    }

    async fn handle_unexpected_close(inner: Arc<SessionInner>, channel: Arc<RpcChannel>) {
        let mut state = inner.state.lock().await;
        let is_current = state
            .node
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, &channel))
            || state
                .operator
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &channel));
        if !is_current {
            return;
        }
        Self::teardown_channels(&mut state).await;
        if state.desired_connected && !state.paused {
            inner.set_phase(
                ConnectionPhase::Connecting,
                Some("Reconnecting…".to_string()),
            );
            Self::schedule_reconnect(&inner, &mut state);
        } else {
            inner.set_phase(ConnectionPhase::Offline, None);
        }
    }

    async fn teardown_channels(state: &mut SessionState) {
        for task in state.router_tasks.drain(..) {
            task.abort();
        }
        if let Some(node) = state.node.take() {
            node.disconnect(None, "session teardown").await;
        }
        if let Some(operator) = state.operator.take() {
            operator.disconnect(None, "session teardown").await;
        }
    }
}

fn spawn_router(
    inner: Arc<SessionInner>,
    role: &'static str,
    channel: Arc<RpcChannel>,
    mut rx: mpsc::UnboundedReceiver<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ChannelEvent::Event(frame) => inner.route_event(role, frame),
                ChannelEvent::Closed { code, reason } => {
                    warn!(role, ?code, reason, "channel closed unexpectedly");
                    let inner = Arc::clone(&inner);
                    let channel = Arc::clone(&channel);
                    // Teardown aborts this router task, so recover elsewhere.
                    tokio::spawn(async move {
                        SessionManager::handle_unexpected_close(inner, channel).await;
                    });
                    break;
                }
            }
        }
    })
}

fn classify_connect_error(err: &ProtocolError) -> FailureClass {
    let text = match err {
        ProtocolError::Rpc { code, message, .. } => format!("{code} {message}"),
        other => other.to_string(),
    }
    .to_lowercase();
    if text.contains("pair") || text.contains("approval") {
        return FailureClass::PairingRequired;
    }
    let auth_markers = [
        "auth",
        "unauthorized",
        "token",
        "password",
        "device identity",
        "device nonce",
        "device signature",
    ];
    if auth_markers.iter().any(|marker| text.contains(marker)) {
        return FailureClass::AuthRequired;
    }
    FailureClass::Retryable
}

fn backoff_delay(attempts: u32) -> Duration {
    let factor = 1u64 << attempts.min(16);
    Duration::from_millis((BACKOFF_BASE_MS.saturating_mul(factor)).min(BACKOFF_CAP_MS))
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
