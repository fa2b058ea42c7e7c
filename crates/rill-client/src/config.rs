// Client defaults and configuration overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_LISTENER_QUEUE_DEPTH: usize = 256;
pub const DEFAULT_COMMAND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where the dialer should connect.
    pub url: String,
    /// Requested client identifier; the server may assign a different one.
    pub client_id: Option<String>,
    /// Delay before the single pending reconnection attempt fires.
    pub reconnect_delay: Duration,
    /// Per-listener delivery queue depth; a full queue drops that
    /// listener's copy of a frame rather than stalling dispatch.
    pub listener_queue_depth: usize,
    /// Depth of the command channel between client handles and the session.
    pub command_queue_depth: usize,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    client_id: Option<String>,
    reconnect_delay_ms: Option<u64>,
    listener_queue_depth: Option<usize>,
    command_queue_depth: Option<usize>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_id: None,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            listener_queue_depth: DEFAULT_LISTENER_QUEUE_DEPTH,
            command_queue_depth: DEFAULT_COMMAND_QUEUE_DEPTH,
        }
    }

    /// Defaults, then `RILL_*` environment variables, then an optional YAML
    /// override file (explicit path or `RILL_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(url: impl Into<String>, config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env(url);
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("RILL_CLIENT_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read client config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env(url: impl Into<String>) -> Self {
        let mut config = Self::new(url);
        if let Ok(value) = std::env::var("RILL_CLIENT_ID") {
            if !value.is_empty() {
                config.client_id = Some(value);
            }
        }
        if let Some(value) = read_u64_env("RILL_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("RILL_LISTENER_QUEUE_DEPTH") {
            config.listener_queue_depth = value;
        }
        if let Some(value) = read_usize_env("RILL_COMMAND_QUEUE_DEPTH") {
            config.command_queue_depth = value;
        }
        config
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = &self.client_id {
            if !value.is_empty() {
                config.client_id = Some(value.clone());
            }
        }
        if let Some(value) = self.reconnect_delay_ms {
            if value > 0 {
                config.reconnect_delay = Duration::from_millis(value);
            }
        }
        if let Some(value) = self.listener_queue_depth {
            if value > 0 {
                config.listener_queue_depth = value;
            }
        }
        if let Some(value) = self.command_queue_depth {
            if value > 0 {
                config.command_queue_depth = value;
            }
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
