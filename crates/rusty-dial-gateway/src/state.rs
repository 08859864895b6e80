//! Gateway shared state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use rusty_dial_core::config::{CallSettings, Config};
use rusty_dial_core::error::Result;
use rusty_dial_media::call::Collaborators;
use rusty_dial_providers::Telephony;

use crate::bridge::MediaBridge;
use crate::callbacks::CallbackNotifier;
use crate::policy::DestinationPolicy;
use crate::registry::{CallRegistry, RegistryLimits};

/// Shared gateway state accessible from all handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    /// Validated per-call settings handed to every new call.
    pub settings: Arc<CallSettings>,
    pub registry: Arc<CallRegistry>,
    pub policy: DestinationPolicy,
    pub collaborators: Collaborators,
    pub bridge: Arc<MediaBridge>,
    /// Places outbound calls; the media bridge unless replaced.
    pub telephony: Arc<dyn Telephony>,
    /// Cancelled when the gateway shuts down.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        let settings = config.call_settings()?;
        let calls = config.calls();
        let policy = DestinationPolicy::from_config(&calls)?;
        let gateway = config.gateway.clone().unwrap_or_default();
        let bridge = Arc::new(
            MediaBridge::new(media_base(&config), gateway.dial_webhook)
                .with_transfer_webhook(gateway.transfer_webhook),
        );
        let registry = Arc::new(
            CallRegistry::new(RegistryLimits::new(&calls, &settings))
                .with_callbacks(CallbackNotifier::new(calls.callback_url.clone())),
        );

        Ok(Self {
            settings,
            registry,
            policy,
            collaborators,
            telephony: bridge.clone(),
            bridge,
            shutdown: CancellationToken::new(),
            config: Arc::new(config),
        })
    }

    /// Use another telephony provider for outbound calls.
    pub fn with_telephony(mut self, telephony: Arc<dyn Telephony>) -> Self {
        self.telephony = telephony;
        self
    }

    /// Number presented to callees.
    pub fn caller_id(&self) -> Option<String> {
        self.config.calls.as_ref().and_then(|c| c.caller_id.clone())
    }
}

/// Origin used in media socket URLs handed to telephony.
fn media_base(config: &Config) -> String {
    if let Some(url) = config.gateway.as_ref().and_then(|g| g.public_url.clone()) {
        return url;
    }
    let bind = config.gateway_bind();
    let host = if bind == "0.0.0.0" { "127.0.0.1".to_string() } else { bind };
    format!("ws://{host}:{}", config.gateway_port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::collaborators;
    use rusty_dial_core::config::GatewayConfig;

    #[test]
    fn test_media_base_defaults_to_loopback() {
        let config = Config::default();
        assert_eq!(media_base(&config), "ws://127.0.0.1:8302");

        let config = Config {
            gateway: Some(GatewayConfig {
                public_url: Some("wss://dial.example.com".into()),
                ..GatewayConfig::default()
            }),
            ..Config::default()
        };
        assert_eq!(media_base(&config), "wss://dial.example.com");
    }

    #[test]
    fn test_registry_limits_follow_call_settings() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "calls": { "max_concurrent": 3, "max_duration_secs": 90, "archive_size": 7 }
        }))
        .unwrap();
        let state = GatewayState::new(config, collaborators()).unwrap();
        let limits = state.registry.limits();
        assert_eq!(limits.max_concurrent, 3);
        assert_eq!(limits.max_duration, state.settings.max_duration);
        assert_eq!(limits.max_duration.as_secs(), 90);
        assert_eq!(limits.archive_size, 7);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "barge_in": { "window_frames": 2, "min_frames": 3 }
        }))
        .unwrap();
        let err = GatewayState::new(config, collaborators()).err().unwrap();
        assert_eq!(err.code(), "config");
    }
}
