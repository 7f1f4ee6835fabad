// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::StreamingConfig;
use crate::stream::connection::StreamingConnection;
use crate::stream::handler::RequestRouter;
use crate::stream::state::ConnectionSlot;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential reconnect delay: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Sleeps for the next delay. Returns `false` if cancelled first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            () = sleep(delay) => true,
            () = cancel.cancelled() => false,
        }
    }
}

/// Opens a new connection to the collector, retrying with `backoff` until one
/// handshake succeeds or `cancel` fires.
///
/// Each attempt builds a fresh [`StreamingConnection`]; a closed connection is never
/// reused.
pub async fn connect_with_backoff(
    config: &StreamingConfig,
    router: &RequestRouter,
    slot: Arc<ConnectionSlot>,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Option<StreamingConnection> {
    while !cancel.is_cancelled() {
        let connection =
            StreamingConnection::with_slot(config.clone(), router.clone(), Arc::clone(&slot));
        match connection.connect_tcp().await {
            Ok(compatibility) => {
                debug!(
                    attempts = backoff.attempts() + 1,
                    ?compatibility,
                    "Connected to collector"
                );
                backoff.reset();
                return Some(connection);
            }
            Err(err) => {
                warn!(
                    error = %err,
                    address = %config.collector_address,
                    attempt = backoff.attempts() + 1,
                    "Failed to connect to collector, retrying"
                );
                if !backoff.wait(cancel).await {
                    break;
                }
            }
        }
    }
    debug!("Stopped connecting to collector");
    None
}
