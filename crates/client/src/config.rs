//! Session configuration and the capability declaration derived from it.

use std::collections::BTreeMap;

use protocol::frames::ClientInfo;

/// Feature flags that drive the node role's capability declaration.
///
/// This is an immutable snapshot: capabilities are negotiated only at
/// handshake time, so changing a flag requires a full reconnect (see
/// `SessionManager::reconnect_with_capabilities`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityConfig {
    pub camera_enabled: bool,
    pub location_enabled: bool,
    pub voice_wake_enabled: bool,
    pub talk_enabled: bool,
}

impl CapabilityConfig {
    /// Capability names declared at connect time.
    pub fn caps(&self) -> Vec<String> {
        let mut caps = Vec::new();
        if self.camera_enabled {
            caps.push("camera".to_string());
        }
        if self.location_enabled {
            caps.push("location".to_string());
        }
        if self.voice_wake_enabled {
            caps.push("voice.wake".to_string());
        }
        if self.talk_enabled {
            caps.push("talk".to_string());
        }
        caps
    }

    /// Command names the node offers for its enabled capabilities.
    pub fn commands(&self) -> Vec<String> {
        let mut commands = Vec::new();
        if self.camera_enabled {
            commands.push("camera.snapshot".to_string());
            commands.push("camera.clip".to_string());
        }
        if self.location_enabled {
            commands.push("location.get".to_string());
        }
        commands
    }

    /// Permission map mirroring the flags, keyed by capability name.
    pub fn permissions(&self) -> BTreeMap<String, bool> {
        BTreeMap::from([
            ("camera".to_string(), self.camera_enabled),
            ("location".to_string(), self.location_enabled),
            ("voice.wake".to_string(), self.voice_wake_enabled),
            ("talk".to_string(), self.talk_enabled),
        ])
    }
}

/// Everything the session manager needs to run one logical session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Gateway endpoint, `ws://` or `wss://`.
    pub url: String,
    /// Stable client identifier, e.g. `gatelink-app`.
    pub client_id: String,
    /// Client mode string bound into the auth signature, e.g. `ui`.
    pub client_mode: String,
    pub client_version: String,
    pub platform: String,
    pub instance_id: Option<String>,
    pub display_name: Option<String>,
    /// Explicit gateway token; takes precedence over any device token.
    pub auth_token: Option<String>,
    /// Explicit device token; takes precedence over the cached one.
    pub device_token: Option<String>,
    pub password: Option<String>,
    pub capabilities: CapabilityConfig,
}

impl SessionConfig {
    /// The client identification block sent with `connect`.
    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            id: self.client_id.clone(),
            version: self.client_version.clone(),
            platform: self.platform.clone(),
            mode: self.client_mode.clone(),
            instance_id: self.instance_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_capabilities_disabled() {
        let config = CapabilityConfig::default();
        assert!(config.caps().is_empty());
        assert!(config.commands().is_empty());
        assert_eq!(
            config.permissions(),
            BTreeMap::from([
                ("camera".to_string(), false),
                ("location".to_string(), false),
                ("voice.wake".to_string(), false),
                ("talk".to_string(), false),
            ])
        );
    }

    #[test]
    fn test_camera_capability_derivation() {
        let config = CapabilityConfig {
            camera_enabled: true,
            ..Default::default()
        };
        assert_eq!(config.caps(), vec!["camera"]);
        assert_eq!(config.commands(), vec!["camera.snapshot", "camera.clip"]);
        assert!(config.permissions()["camera"]);
        assert!(!config.permissions()["talk"]);
    }

    #[test]
    fn test_full_capability_derivation() {
        let config = CapabilityConfig {
            camera_enabled: true,
            location_enabled: true,
            voice_wake_enabled: true,
            talk_enabled: true,
        };
        assert_eq!(config.caps(), vec!["camera", "location", "voice.wake", "talk"]);
        assert_eq!(
            config.commands(),
            vec!["camera.snapshot", "camera.clip", "location.get"]
        );
        assert!(config.permissions().values().all(|&v| v));
    }
}
