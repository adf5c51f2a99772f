// ABOUTME: Orchestrator configuration with validated environment overrides
// ABOUTME: Explicitly injected into components, never read as ambient globals

use drydock_core::{
    DEFAULT_AGENT_TIMEOUT_SECS, DEFAULT_MAX_SANDBOX_DURATION_SECS, DEFAULT_SANDBOX_IMAGE,
};
use std::time::Duration;

/// Default capacity for the event broadcast channel
const DEFAULT_EVENT_CHANNEL_SIZE: usize = 200;

/// Default reaper sweep interval in seconds
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Name of the registered sandbox provider backend
    pub provider_name: String,
    pub default_image: String,
    /// Sandbox lifetime; keep-alive follow-ups reset this countdown
    pub max_sandbox_duration: chrono::Duration,
    /// Ceiling for one agent invocation
    pub agent_timeout: Duration,
    /// Automatic re-attempts after a rejected push
    pub push_retry_limit: u32,
    pub reaper_interval: Duration,
    pub event_channel_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider_name: "docker".to_string(),
            default_image: DEFAULT_SANDBOX_IMAGE.to_string(),
            max_sandbox_duration: chrono::Duration::seconds(
                DEFAULT_MAX_SANDBOX_DURATION_SECS as i64,
            ),
            agent_timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
            push_retry_limit: 1,
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            event_channel_size: DEFAULT_EVENT_CHANNEL_SIZE,
        }
    }
}

impl OrchestratorConfig {
    /// Build the config once at startup, applying validated environment
    /// overrides on top of the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(image) = std::env::var("DRYDOCK_SANDBOX_IMAGE") {
            if !image.trim().is_empty() {
                config.default_image = image;
            }
        }

        if let Some(secs) = read_env_u64("DRYDOCK_MAX_SANDBOX_DURATION_SECS", 60, 86_400) {
            config.max_sandbox_duration = chrono::Duration::seconds(secs as i64);
        }

        if let Some(secs) = read_env_u64("DRYDOCK_AGENT_TIMEOUT_SECS", 30, 21_600) {
            config.agent_timeout = Duration::from_secs(secs);
        }

        if let Some(limit) = read_env_u64("DRYDOCK_PUSH_RETRY_LIMIT", 0, 5) {
            config.push_retry_limit = limit as u32;
        }

        if let Some(secs) = read_env_u64("DRYDOCK_REAPER_INTERVAL_SECS", 5, 3_600) {
            config.reaper_interval = Duration::from_secs(secs);
        }

        if let Some(size) = read_env_u64("DRYDOCK_EVENT_CHANNEL_SIZE", 10, 10_000) {
            config.event_channel_size = size as usize;
        }

        config
    }
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| (min..=max).contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.push_retry_limit, 1);
        assert_eq!(config.provider_name, "docker");
        assert_eq!(config.max_sandbox_duration, chrono::Duration::hours(1));
    }
}
