// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # APM Telemetry
//!
//! In-process building blocks of an application performance monitoring agent.
//!
//! - [`timer`] and [`timer_name`]: hierarchical timer trees recorded per transaction
//!   and merged into per-transaction-type rollups.
//! - [`call_map`]: bounded, insertion-ordered aggregation of per-call statistics.
//! - [`rollup`]: the aggregation service that collects completed transactions from
//!   worker threads and flushes rollups once per interval.
//! - [`stream`]: the long-lived duplex channel to the collector.
//! - [`rollup_id`]: parsing and conversion of hierarchical identifiers between the
//!   legacy `::` form and the current `/` form.
//! - [`version`]: dotted version comparison used by the handshake.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod call_map;
pub mod config;
pub mod errors;
pub mod rollup;
pub mod rollup_id;
pub mod stream;
pub mod timer;
pub mod timer_name;
pub mod version;

pub use call_map::{CallAggregationMap, CallSnapshot, CallStats};
pub use config::{OverflowPolicy, StreamingConfig};
pub use errors::{CodecError, ConfigError, ConnectionError, HandlerError, MergeError};
pub use rollup::{CompletedTransaction, RollupHandle, RollupPayload, RollupService, Rollups};
pub use stream::{
    connect_with_backoff, Backoff, ConnectionState, ConnectionStatus, DataPush, PushOutcome,
    RequestHandler, RequestRouter, RollupSnapshotHandler, StreamingConnection, StreamingSupervisor,
};
pub use timer::{merge_into, TimerNode, TimerSnapshot};
pub use timer_name::{timer_name, TimerName, TimerNameRegistry};
