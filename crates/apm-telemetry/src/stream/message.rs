// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message bodies exchanged with the collector.
//!
//! Bodies are encoded with named fields, and optional or late-added fields carry
//! `#[serde(default)]`, so an older peer can read a newer peer's messages.

use serde::{Deserialize, Serialize};

use crate::rollup::RollupPayload;
use crate::timer::TimerSnapshot;

/// Version of the framing and message layout spoken by this build.
pub const PROTOCOL_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub agent_id: String,
    pub agent_version: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub collector_version: String,
    #[serde(default)]
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeSample {
    pub name: String,
    pub value: f64,
    pub capture_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub transaction_type: String,
    pub transaction_name: String,
    pub start_time_ms: u64,
    pub duration_nanos: u64,
    pub root_timer: TimerSnapshot,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp_ms: u64,
    pub level: String,
    pub logger: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataPush {
    Rollups(Vec<RollupPayload>),
    Traces(Vec<TraceRecord>),
    Gauges(Vec<GaugeSample>),
    Logs(Vec<LogEvent>),
}

impl DataPush {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rollups(_) => "rollups",
            Self::Traces(_) => "traces",
            Self::Gauges(_) => "gauges",
            Self::Logs(_) => "logs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: u64,
    pub kind: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Response {
    /// Acknowledges a request without a body.
    #[must_use]
    pub fn empty(request_id: u64) -> Self {
        Self {
            request_id,
            payload: Vec::new(),
        }
    }
}
