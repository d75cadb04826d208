//! Gatelink gateway client.
//!
//! The client library behind every Gatelink surface. It provides:
//! - `storage` — persistence capability, device identity store, token cache
//! - `transport` — duplex transport seam and the WebSocket implementation
//! - `channel` — one authenticated RPC connection (handshake, correlation)
//! - `session` — two role channels run as one session, with reconnect policy
//! - `config` — session configuration and capability declarations
//!
//! Typical embedding:
//!
//! ```no_run
//! use std::sync::Arc;
//! use gateway_client::config::{CapabilityConfig, SessionConfig};
//! use gateway_client::session::SessionManager;
//! use gateway_client::storage::FileStorage;
//! use gateway_client::transport::WsTransport;
//!
//! # async fn run() -> protocol::Result<()> {
//! let storage = Arc::new(FileStorage::open("gatelink.json")?);
//! let session = SessionManager::new(storage, Arc::new(WsTransport::new()));
//! session
//!     .connect(SessionConfig {
//!         url: "wss://gateway.example/ws".to_string(),
//!         client_id: "gatelink-app".to_string(),
//!         client_mode: "ui".to_string(),
//!         client_version: env!("CARGO_PKG_VERSION").to_string(),
//!         platform: "linux".to_string(),
//!         instance_id: None,
//!         display_name: None,
//!         auth_token: None,
//!         device_token: None,
//!         password: None,
//!         capabilities: CapabilityConfig::default(),
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod session;
pub mod storage;
pub mod transport;

pub use channel::{ChannelConfig, ChannelEvent, RpcChannel};
pub use config::{CapabilityConfig, SessionConfig};
pub use session::{ConnectionPhase, PhaseUpdate, SessionEvent, SessionManager};
pub use storage::{DeviceAuthCache, DeviceAuthEntry, FileStorage, IdentityStore, MemoryStorage, Storage};
pub use transport::{Transport, TransportEvent, TransportPair, TransportSink, TransportStream, WsTransport};
