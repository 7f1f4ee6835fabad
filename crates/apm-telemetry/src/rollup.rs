// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rollup accumulators and the single-writer service that owns them.
//!
//! Completed transactions are sent to [`RollupService`] through a cloneable
//! [`RollupHandle`]. The service applies each transaction as one command, so merges
//! from concurrent producers never interleave.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use ustr::Ustr;

use crate::call_map::{CallAggregationMap, CallSnapshot};
use crate::timer::{merge_into, TimerNode, TimerSnapshot};

/// A finished transaction handed over by the instrumentation layer.
#[derive(Debug, Clone)]
pub struct CompletedTransaction {
    pub transaction_type: Ustr,
    pub root: TimerNode,
    pub calls: CallAggregationMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupPayload {
    pub transaction_type: String,
    pub transaction_count: u64,
    pub timers: Vec<TimerSnapshot>,
    #[serde(default)]
    pub calls: Vec<CallSnapshot>,
}

#[derive(Debug, Clone)]
pub struct RollupAccumulator {
    transaction_type: Ustr,
    transaction_count: u64,
    roots: Vec<TimerNode>,
    calls: CallAggregationMap,
}

impl RollupAccumulator {
    #[must_use]
    pub fn new(transaction_type: Ustr) -> Self {
        Self {
            transaction_type,
            transaction_count: 0,
            roots: Vec::new(),
            calls: CallAggregationMap::new(),
        }
    }

    pub fn merge(&mut self, transaction: &CompletedTransaction) {
        self.transaction_count += 1;
        merge_into(&mut self.roots, &transaction.root);
        transaction.calls.merge_into(&mut self.calls);
    }

    #[must_use]
    pub fn transaction_type(&self) -> Ustr {
        self.transaction_type
    }

    #[must_use]
    pub fn transaction_count(&self) -> u64 {
        self.transaction_count
    }

    #[must_use]
    pub fn roots(&self) -> &[TimerNode] {
        &self.roots
    }

    #[must_use]
    pub fn calls(&self) -> &CallAggregationMap {
        &self.calls
    }

    #[must_use]
    pub fn to_payload(&self) -> RollupPayload {
        RollupPayload {
            transaction_type: self.transaction_type.to_string(),
            transaction_count: self.transaction_count,
            timers: self.roots.iter().map(TimerNode::snapshot).collect(),
            calls: self.calls.snapshots(),
        }
    }
}

/// Accumulators for one reporting interval, one per transaction type.
#[derive(Debug, Default)]
pub struct Rollups {
    accumulators: Vec<RollupAccumulator>,
}

impl Rollups {
    pub fn merge(&mut self, transaction: &CompletedTransaction) {
        let index = match self
            .accumulators
            .iter()
            .position(|a| a.transaction_type == transaction.transaction_type)
        {
            Some(index) => index,
            None => {
                self.accumulators
                    .push(RollupAccumulator::new(transaction.transaction_type));
                self.accumulators.len() - 1
            }
        };
        self.accumulators[index].merge(transaction);
    }

    #[must_use]
    pub fn get(&self, transaction_type: Ustr) -> Option<&RollupAccumulator> {
        self.accumulators
            .iter()
            .find(|a| a.transaction_type == transaction_type)
    }

    #[must_use]
    pub fn to_payloads(&self) -> Vec<RollupPayload> {
        self.accumulators
            .iter()
            .map(RollupAccumulator::to_payload)
            .collect()
    }

    /// Returns the interval's payloads and starts a fresh interval.
    pub fn consume(&mut self) -> Vec<RollupPayload> {
        let payloads = self.to_payloads();
        self.accumulators.clear();
        payloads
    }
}

#[derive(Debug)]
pub enum RollupCommand {
    Merge(Box<CompletedTransaction>),
    Flush(oneshot::Sender<Vec<RollupPayload>>),
    Snapshot(oneshot::Sender<Vec<RollupPayload>>),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct RollupHandle {
    tx: mpsc::UnboundedSender<RollupCommand>,
}

impl RollupHandle {
    pub fn merge(
        &self,
        transaction: CompletedTransaction,
    ) -> Result<(), mpsc::error::SendError<RollupCommand>> {
        self.tx.send(RollupCommand::Merge(Box::new(transaction)))
    }

    pub async fn flush(&self) -> Result<Vec<RollupPayload>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(RollupCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))
    }

    /// Current interval's rollups without resetting them.
    pub async fn snapshot(&self) -> Result<Vec<RollupPayload>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(RollupCommand::Snapshot(response_tx))
            .map_err(|e| format!("Failed to send snapshot command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive snapshot response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<RollupCommand>> {
        self.tx.send(RollupCommand::Shutdown)
    }
}

pub struct RollupService {
    rollups: Rollups,
    rx: mpsc::UnboundedReceiver<RollupCommand>,
}

impl RollupService {
    #[must_use]
    pub fn new() -> (Self, RollupHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            rollups: Rollups::default(),
            rx,
        };
        (service, RollupHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Rollup service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                RollupCommand::Merge(transaction) => {
                    self.rollups.merge(&transaction);
                }
                RollupCommand::Flush(response_tx) => {
                    let payloads = self.rollups.consume();
                    if response_tx.send(payloads).is_err() {
                        error!("Failed to send flush response - receiver dropped");
                    }
                }
                RollupCommand::Snapshot(response_tx) => {
                    if response_tx.send(self.rollups.to_payloads()).is_err() {
                        error!("Failed to send snapshot response - receiver dropped");
                    }
                }
                RollupCommand::Shutdown => {
                    debug!("Rollup service shutting down");
                    break;
                }
            }
        }

        debug!("Rollup service stopped");
    }
}
