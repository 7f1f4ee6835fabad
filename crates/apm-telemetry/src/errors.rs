// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::stream::ConnectionState;

/// Structural inconsistencies detected while merging timer trees.
///
/// These indicate a programming error in the caller and are never
/// swallowed: silently merging mismatched trees would corrupt rollups.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("cannot merge timer '{source_name}' into timer '{accumulator}'")]
    NameMismatch {
        accumulator: String,
        source_name: String,
    },
}

/// Errors raised while encoding or decoding a wire frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame body is empty")]
    Empty,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("a collector connection is already active in this process")]
    AlreadyConnected,
    #[error("operation not allowed while connection is {0}")]
    InvalidState(ConnectionState),
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("collector closed the channel during handshake")]
    ClosedDuringHandshake,
    #[error("outbound channel stalled for more than {0:?}")]
    Stalled(Duration),
    #[error("request {request_id} ({kind}) timed out")]
    RequestTimeout { request_id: u64, kind: String },
    #[error("graceful shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("collector closed the channel")]
    PeerClosed,
    #[error("connection is closed")]
    Closed,
}

impl ConnectionError {
    /// Soft errors are reported to the caller but leave the connection usable.
    #[must_use]
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("request payload is invalid: {0}")]
    InvalidPayload(String),
    #[error("failed to encode response: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("handler unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("APM_AGENT_ID is not set")]
    MissingAgentId,
    #[error("invalid collector address '{0}'")]
    InvalidAddress(String),
}
