// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::errors::ConfigError;

const DEFAULT_COLLECTOR_ADDRESS: &str = "127.0.0.1:8181";
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_WRITE_STALL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 1_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_RECONNECT_BUFFER_CAPACITY: usize = 1_000;

/// What to do with a push when the outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait for room, up to the write-stall timeout.
    #[default]
    Block,
    /// Drop the new message and count it.
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop" | "drop_newest" => Ok(Self::DropNewest),
            other => Err(format!("unknown overflow policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub agent_id: String,
    pub agent_version: String,
    /// host:port of the collector
    pub collector_address: String,
    pub handshake_timeout: Duration,
    /// how long an agent-initiated request waits for its response
    pub request_timeout: Duration,
    /// how long a single write or a blocked push may wait before the channel is
    /// considered stalled
    pub write_stall_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_frame_bytes: usize,
    /// pushes held by the supervisor while no connection is up
    pub reconnect_buffer_capacity: usize,
}

impl StreamingConfig {
    #[must_use]
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            collector_address: DEFAULT_COLLECTOR_ADDRESS.to_string(),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            write_stall_timeout: Duration::from_millis(DEFAULT_WRITE_STALL_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::Block,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reconnect_buffer_capacity: DEFAULT_RECONNECT_BUFFER_CAPACITY,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_iter(std::env::vars())
    }

    pub fn from_env_iter<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut agent_id = None;
        let mut config = Self::new(String::new());

        for (key, value) in vars {
            let value: String = value.into();
            match key.as_ref() {
                "APM_AGENT_ID" => agent_id = Some(value.trim().to_string()),
                "APM_AGENT_VERSION" => config.agent_version = value.trim().to_string(),
                "APM_COLLECTOR_ADDRESS" => {
                    let address = value.trim();
                    if !address.contains(':') {
                        return Err(ConfigError::InvalidAddress(address.to_string()));
                    }
                    config.collector_address = address.to_string();
                }
                "APM_HANDSHAKE_TIMEOUT_MS" => {
                    config.handshake_timeout = parse_millis(key.as_ref(), &value)
                        .unwrap_or(config.handshake_timeout);
                }
                "APM_REQUEST_TIMEOUT_MS" => {
                    config.request_timeout =
                        parse_millis(key.as_ref(), &value).unwrap_or(config.request_timeout);
                }
                "APM_WRITE_STALL_TIMEOUT_MS" => {
                    config.write_stall_timeout = parse_millis(key.as_ref(), &value)
                        .unwrap_or(config.write_stall_timeout);
                }
                "APM_SHUTDOWN_TIMEOUT_MS" => {
                    config.shutdown_timeout =
                        parse_millis(key.as_ref(), &value).unwrap_or(config.shutdown_timeout);
                }
                "APM_OUTBOUND_QUEUE_CAPACITY" => {
                    config.outbound_queue_capacity = parse_or_warn(key.as_ref(), &value)
                        .unwrap_or(config.outbound_queue_capacity);
                }
                "APM_OUTBOUND_OVERFLOW_POLICY" => {
                    config.overflow_policy =
                        parse_or_warn(key.as_ref(), &value).unwrap_or(config.overflow_policy);
                }
                "APM_MAX_FRAME_BYTES" => {
                    config.max_frame_bytes =
                        parse_or_warn(key.as_ref(), &value).unwrap_or(config.max_frame_bytes);
                }
                "APM_RECONNECT_BUFFER_CAPACITY" => {
                    config.reconnect_buffer_capacity = parse_or_warn(key.as_ref(), &value)
                        .unwrap_or(config.reconnect_buffer_capacity);
                }
                _ => {}
            }
        }

        config.agent_id = agent_id
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::MissingAgentId)?;
        // a zero-capacity queue would make every push fail
        config.outbound_queue_capacity = config.outbound_queue_capacity.max(1);
        Ok(config)
    }
}

fn parse_or_warn<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid value '{}' for {}, using default", value, key);
            None
        }
    }
}

fn parse_millis(key: &str, value: &str) -> Option<Duration> {
    parse_or_warn(key, value).map(Duration::from_millis)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_defaults() {
        let config =
            StreamingConfig::from_env_iter([("APM_AGENT_ID", "web::east::host-1")]).unwrap();
        assert_eq!(config.agent_id, "web::east::host-1");
        assert_eq!(config.collector_address, DEFAULT_COLLECTOR_ADDRESS);
        assert_eq!(config.agent_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(config.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.outbound_queue_capacity, 1_000);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_buffer_capacity, 1_000);
    }

    #[test]
    fn test_overrides() {
        let config = StreamingConfig::from_env_iter([
            ("APM_AGENT_ID", "agent-1"),
            ("APM_AGENT_VERSION", "0.13.2"),
            ("APM_COLLECTOR_ADDRESS", "collector.internal:9000"),
            ("APM_REQUEST_TIMEOUT_MS", "250"),
            ("APM_OUTBOUND_OVERFLOW_POLICY", "drop"),
            ("APM_OUTBOUND_QUEUE_CAPACITY", "0"),
            ("APM_RECONNECT_BUFFER_CAPACITY", "25"),
            ("UNRELATED", "ignored"),
        ])
        .unwrap();
        assert_eq!(config.agent_version, "0.13.2");
        assert_eq!(config.collector_address, "collector.internal:9000");
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.outbound_queue_capacity, 1);
        assert_eq!(config.reconnect_buffer_capacity, 25);
    }

    #[test]
    fn test_missing_agent_id() {
        let err = StreamingConfig::from_env_iter([("APM_AGENT_ID", "  ")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAgentId));
        let err = StreamingConfig::from_env_iter(Vec::<(String, String)>::new()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAgentId));
    }

    #[test]
    fn test_invalid_address() {
        let err = StreamingConfig::from_env_iter([
            ("APM_AGENT_ID", "agent-1"),
            ("APM_COLLECTOR_ADDRESS", "no-port"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(addr) if addr == "no-port"));
    }

    #[test]
    #[traced_test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = StreamingConfig::from_env_iter([
            ("APM_AGENT_ID", "agent-1"),
            ("APM_SHUTDOWN_TIMEOUT_MS", "soon"),
            ("APM_OUTBOUND_OVERFLOW_POLICY", "spill"),
        ])
        .unwrap();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.overflow_policy, OverflowPolicy::Block);
        assert!(logs_contain("Ignoring invalid value 'soon' for APM_SHUTDOWN_TIMEOUT_MS"));
    }
}
