// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming channel to the collector: framing, handshake, request routing,
//! connection lifecycle and reconnection.

pub mod codec;
pub mod connection;
pub mod handler;
pub mod message;
pub mod reconnect;
pub mod state;
pub mod supervisor;

pub use codec::{length_codec, Frame};
pub use connection::{PushOutcome, StreamingConnection};
pub use handler::{
    RequestHandler, RequestRouter, RollupSnapshotHandler, REQUEST_KIND_ROLLUP_SNAPSHOT,
};
pub use message::{
    DataPush, GaugeSample, Hello, HelloAck, LogEvent, Request, Response, TraceRecord,
    PROTOCOL_VERSION,
};
pub use reconnect::{connect_with_backoff, Backoff};
pub use state::{Compatibility, ConnectionSlot, ConnectionState, ConnectionStatus, SlotGuard};
pub use supervisor::StreamingSupervisor;
