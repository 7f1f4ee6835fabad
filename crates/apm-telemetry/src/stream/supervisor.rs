// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Keeps a collector connection up across channel failures.
//!
//! The supervisor owns a bounded buffer of pushes. While no connection is up, pushes
//! land in the buffer (oldest dropped first once full); when a connection is lost
//! without an explicit shutdown, its unsent pushes are moved back into the buffer and
//! a new connection is opened with [`connect_with_backoff`]. The buffer is replayed in
//! order before new pushes go straight to the connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::StreamingConfig;
use crate::errors::ConnectionError;
use crate::stream::connection::{lock, PushOutcome, StreamingConnection};
use crate::stream::handler::RequestRouter;
use crate::stream::message::DataPush;
use crate::stream::reconnect::{connect_with_backoff, Backoff};
use crate::stream::state::{ConnectionSlot, ConnectionState};

struct Inner {
    capacity: usize,
    // lock order: `buffer` before `current`
    buffer: Mutex<VecDeque<DataPush>>,
    current: Mutex<Option<Arc<StreamingConnection>>>,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

impl Inner {
    fn buffer_back(&self, buffer: &mut VecDeque<DataPush>, data: DataPush) {
        buffer.push_back(data);
        self.trim(buffer);
    }

    fn requeue(&self, unsent: Vec<DataPush>) {
        if unsent.is_empty() {
            return;
        }
        debug!(count = unsent.len(), "Requeueing pushes of lost connection");
        let mut buffer = lock(&self.buffer);
        for data in unsent.into_iter().rev() {
            buffer.push_front(data);
        }
        self.trim(&mut buffer);
    }

    fn trim(&self, buffer: &mut VecDeque<DataPush>) {
        while buffer.len() > self.capacity {
            buffer.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::AcqRel) + 1;
            warn!(dropped, "Reconnect buffer full, dropping oldest push");
        }
    }

    /// Sends the buffer over `connection`, then publishes it for direct pushes.
    async fn replay(&self, connection: &Arc<StreamingConnection>) {
        let mut replayed = 0usize;
        loop {
            let next = {
                let mut buffer = lock(&self.buffer);
                match buffer.pop_front() {
                    Some(data) => data,
                    None => {
                        *lock(&self.current) = Some(Arc::clone(connection));
                        break;
                    }
                }
            };
            if let Err(err) = connection.push(next.clone()).await {
                debug!(error = %err, replayed, "Replay interrupted by connection failure");
                lock(&self.buffer).push_front(next);
                return;
            }
            replayed += 1;
        }
        if replayed > 0 {
            debug!(replayed, "Replayed buffered pushes");
        }
    }
}

/// A connection to the collector that comes back after channel failures.
pub struct StreamingSupervisor {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), ConnectionError>>>>,
}

impl StreamingSupervisor {
    /// Starts connecting in the background, holding the process-wide slot.
    #[must_use]
    pub fn start(config: StreamingConfig, router: RequestRouter, backoff: Backoff) -> Self {
        Self::start_with_slot(config, router, ConnectionSlot::process(), backoff)
    }

    #[must_use]
    pub fn start_with_slot(
        config: StreamingConfig,
        router: RequestRouter,
        slot: Arc<ConnectionSlot>,
        backoff: Backoff,
    ) -> Self {
        let inner = Arc::new(Inner {
            capacity: config.reconnect_buffer_capacity.max(1),
            buffer: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            Arc::clone(&inner),
            config,
            router,
            slot,
            backoff,
            cancel.clone(),
        ));
        Self {
            inner,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Pushes over the live connection, or buffers when there is none.
    pub async fn push(&self, data: DataPush) -> Result<PushOutcome, ConnectionError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        let connection = {
            let mut buffer = lock(&self.inner.buffer);
            let current = lock(&self.inner.current).clone();
            match current {
                Some(connection) => connection,
                None => {
                    self.inner.buffer_back(&mut buffer, data);
                    return Ok(PushOutcome::Buffered);
                }
            }
        };
        match connection.push(data.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                debug!(error = %err, "Push failed, holding it for the next connection");
                let mut buffer = lock(&self.inner.buffer);
                self.inner.buffer_back(&mut buffer, data);
                Ok(PushOutcome::Buffered)
            }
        }
    }

    #[must_use]
    pub fn connection(&self) -> Option<Arc<StreamingConnection>> {
        lock(&self.inner.current).clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.current).is_some()
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        lock(&self.inner.buffer).len()
    }

    /// Pushes dropped because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Acquire)
    }

    /// Connections lost and replaced so far.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Acquire)
    }

    /// Removes whatever is still buffered, oldest first.
    pub fn take_buffered(&self) -> Vec<DataPush> {
        lock(&self.inner.buffer).drain(..).collect()
    }

    /// Stops reconnecting and closes the live connection gracefully.
    ///
    /// Pushes that never reached the collector stay available through
    /// [`take_buffered`](Self::take_buffered).
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        let Some(task) = task else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "Connection supervisor task failed");
                Err(ConnectionError::Closed)
            }
        }
    }
}

impl Drop for StreamingSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamingSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSupervisor")
            .field("connected", &self.is_connected())
            .field("buffered", &self.buffered())
            .field("reconnects", &self.reconnects())
            .finish()
    }
}

async fn run(
    inner: Arc<Inner>,
    config: StreamingConfig,
    router: RequestRouter,
    slot: Arc<ConnectionSlot>,
    mut backoff: Backoff,
    cancel: CancellationToken,
) -> Result<(), ConnectionError> {
    loop {
        let Some(connection) =
            connect_with_backoff(&config, &router, Arc::clone(&slot), &mut backoff, &cancel)
                .await
        else {
            return Ok(());
        };
        let connection = Arc::new(connection);
        let mut state = connection.subscribe_state();
        inner.replay(&connection).await;

        let lost = tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = closed(&mut state) => true,
        };
        lock(&inner.current).take();

        if !lost {
            let result = connection.close().await;
            inner.requeue(connection.take_unsent());
            return result;
        }

        let reconnects = inner.reconnects.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            error = connection.last_error().as_deref().unwrap_or("unknown"),
            reconnects,
            "Lost collector connection, reconnecting"
        );
        // reaps the failed loops so every unsent push is accounted for
        if let Err(err) = connection.close().await {
            debug!(error = %err, "Closing failed connection");
        }
        inner.requeue(connection.take_unsent());

        if !backoff.wait(&cancel).await {
            return Ok(());
        }
    }
}

async fn closed(state: &mut watch::Receiver<ConnectionState>) {
    loop {
        if *state.borrow_and_update() == ConnectionState::Closed {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
