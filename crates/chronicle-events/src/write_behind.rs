//! Fire-and-forget, batched forwarding of events to persistence.
//!
//! The orchestrator hands each appended event to a [`WriteBehindHandle`],
//! which never blocks. A background tokio task drains the channel in batches
//! of up to `batch_size` events and writes them through an
//! [`EventPersistence`]. Write failures are logged and dropped: correctness
//! of the in-memory core does not depend on them.

use std::sync::Arc;

use chronicle_types::Event;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::persistence::EventPersistence;

/// Default number of events written per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

enum Message {
    Event(Arc<Event>),
    Flush(oneshot::Sender<()>),
}

/// Cheap, cloneable sender side of the write-behind channel.
#[derive(Clone)]
pub struct WriteBehindHandle {
    sender: mpsc::UnboundedSender<Message>,
}

impl core::fmt::Debug for WriteBehindHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WriteBehindHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl WriteBehindHandle {
    /// Queue an event for persistence. Never blocks; if the task has
    /// stopped the event is dropped with a warning.
    pub fn forward(&self, event: Arc<Event>) {
        let id = event.id;
        if self.sender.send(Message::Event(event)).is_err() {
            tracing::warn!(event_id = %id, "write-behind task stopped; event not persisted");
        }
    }

    /// Wait until every event forwarded before this call has been handed to
    /// the persistence backend.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Message::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// The running write-behind task.
#[derive(Debug)]
pub struct WriteBehind {
    handle: WriteBehindHandle,
    task: JoinHandle<u64>,
}

impl WriteBehind {
    /// Spawn the write-behind task on the current tokio runtime.
    ///
    /// A `batch_size` of zero is treated as one.
    pub fn spawn(persistence: Arc<dyn EventPersistence>, batch_size: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(persistence, receiver, batch_size.max(1)));
        Self {
            handle: WriteBehindHandle { sender },
            task,
        }
    }

    /// A handle for forwarding events.
    pub fn handle(&self) -> WriteBehindHandle {
        self.handle.clone()
    }

    /// Close this side of the channel and wait for the task to drain.
    ///
    /// The task ends once every handle has been dropped. Returns the number
    /// of events successfully persisted.
    pub async fn finish(self) -> u64 {
        drop(self.handle);
        self.task.await.unwrap_or_else(|err| {
            tracing::error!(error = %err, "write-behind task failed");
            0
        })
    }
}

async fn run(
    persistence: Arc<dyn EventPersistence>,
    mut receiver: mpsc::UnboundedReceiver<Message>,
    batch_size: usize,
) -> u64 {
    let mut written: u64 = 0;
    let mut batch: Vec<Arc<Event>> = Vec::with_capacity(batch_size);
    let mut acks: Vec<oneshot::Sender<()>> = Vec::new();

    while let Some(first) = receiver.recv().await {
        let mut next = Some(first);
        while let Some(message) = next.take() {
            match message {
                Message::Event(event) => batch.push(event),
                Message::Flush(ack) => acks.push(ack),
            }
            if batch.len() >= batch_size {
                written = written.saturating_add(write_batch(persistence.as_ref(), &mut batch));
            }
            next = receiver.try_recv().ok();
        }

        written = written.saturating_add(write_batch(persistence.as_ref(), &mut batch));
        for ack in acks.drain(..) {
            let _ = ack.send(());
        }
    }

    tracing::debug!(written, "write-behind task drained");
    written
}

fn write_batch(persistence: &dyn EventPersistence, batch: &mut Vec<Arc<Event>>) -> u64 {
    if batch.is_empty() {
        return 0;
    }
    let count = u64::try_from(batch.len()).unwrap_or(u64::MAX);
    let result = persistence.persist_batch(batch);
    let first = batch.first().map(|e| e.id);
    batch.clear();
    match result {
        Ok(()) => {
            tracing::debug!(count, "Persisted event batch");
            count
        }
        Err(err) => {
            tracing::error!(error = %err, first_event = ?first, count, "Failed to persist event batch");
            0
        }
    }
}
