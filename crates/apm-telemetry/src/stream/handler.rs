// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Handlers for collector-initiated requests.
//!
//! Requests are routed by their `kind` string. Kinds without a registered handler are
//! acknowledged with an empty response by the connection, so a newer collector can
//! probe for capabilities without breaking older agents.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::HandlerError;
use crate::rollup::RollupHandle;

pub const REQUEST_KIND_ROLLUP_SNAPSHOT: &str = "rollup_snapshot";

#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produces the response body for one request.
    async fn handle(&self, payload: Vec<u8>) -> Result<Vec<u8>, HandlerError>;
}

#[derive(Clone, Default)]
pub struct RequestRouter {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl RequestRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, kind: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    #[must_use]
    pub fn route(&self, kind: &str) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(kind).cloned()
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Answers with the live, unflushed rollups of the current interval.
pub struct RollupSnapshotHandler {
    rollups: RollupHandle,
}

impl RollupSnapshotHandler {
    #[must_use]
    pub fn new(rollups: RollupHandle) -> Self {
        Self { rollups }
    }
}

#[async_trait]
impl RequestHandler for RollupSnapshotHandler {
    async fn handle(&self, _payload: Vec<u8>) -> Result<Vec<u8>, HandlerError> {
        let payloads = self
            .rollups
            .snapshot()
            .await
            .map_err(HandlerError::Unavailable)?;
        Ok(rmp_serde::to_vec_named(&payloads)?)
    }
}
