// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use derive_more::Display;
use serde::Serialize;

use crate::errors::ConnectionError;
use crate::version::is_version_greater;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[display("DISCONNECTED")]
    Disconnected,
    #[display("HANDSHAKING")]
    Handshaking,
    #[display("CONNECTED")]
    Connected,
    #[display("CLOSING")]
    Closing,
    #[display("CLOSED")]
    Closed,
}

/// Outcome of the version handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Compatibility {
    /// `None` when the collector never acknowledged the hello
    pub collector_version: Option<String>,
    pub gated_features_enabled: bool,
}

impl Compatibility {
    /// Features are gated off when this agent is newer than the collector.
    #[must_use]
    pub fn negotiate(agent_version: &str, collector_version: &str) -> Self {
        Self {
            collector_version: Some(collector_version.to_string()),
            gated_features_enabled: !is_version_greater(agent_version, collector_version),
        }
    }

    /// A collector that predates the handshake acknowledgement.
    #[must_use]
    pub fn legacy() -> Self {
        Self {
            collector_version: None,
            gated_features_enabled: false,
        }
    }
}

/// Operational view of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub compatibility: Option<Compatibility>,
    pub dropped_pushes: u64,
    pub pending_requests: usize,
    pub in_flight_handlers: usize,
}

static PROCESS_SLOT: OnceLock<Arc<ConnectionSlot>> = OnceLock::new();

/// Admits at most one handshaking or connected collector channel at a time.
#[derive(Debug, Default)]
pub struct ConnectionSlot {
    occupied: AtomicBool,
}

impl ConnectionSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot shared by every connection of this process.
    pub fn process() -> Arc<ConnectionSlot> {
        Arc::clone(PROCESS_SLOT.get_or_init(|| Arc::new(ConnectionSlot::new())))
    }

    pub fn acquire(self: &Arc<Self>) -> Result<SlotGuard, ConnectionError> {
        self.occupied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ConnectionError::AlreadyConnected)?;
        Ok(SlotGuard {
            slot: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::Acquire)
    }
}

/// Releases the slot on drop.
#[derive(Debug)]
pub struct SlotGuard {
    slot: Arc<ConnectionSlot>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.occupied.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        let newer_agent = Compatibility::negotiate("1.10.2", "1.10.1");
        assert!(!newer_agent.gated_features_enabled);
        assert_eq!(newer_agent.collector_version.as_deref(), Some("1.10.1"));

        assert!(Compatibility::negotiate("1.10.2", "1.10.2").gated_features_enabled);
        assert!(Compatibility::negotiate("1.10.2", "2.10.2").gated_features_enabled);
        assert!(Compatibility::negotiate("1.10", "1.10.0").gated_features_enabled);
        assert!(!Compatibility::legacy().gated_features_enabled);
    }

    #[test]
    fn test_slot_admits_one_holder() {
        let slot = Arc::new(ConnectionSlot::new());
        let guard = slot.acquire().expect("first acquire");
        assert!(slot.is_occupied());
        assert!(matches!(
            slot.acquire(),
            Err(ConnectionError::AlreadyConnected)
        ));
        drop(guard);
        assert!(!slot.is_occupied());
        assert!(slot.acquire().is_ok());
    }

    #[test]
    fn test_state_display_and_json() {
        assert_eq!(ConnectionState::Handshaking.to_string(), "HANDSHAKING");
        assert_eq!(
            serde_json::to_value(ConnectionState::Closed).expect("serialize"),
            serde_json::json!("CLOSED")
        );
    }
}
