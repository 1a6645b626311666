//! Bounded FIFO of deferred offload operations.
//!
//! Producers (caller threads) never block: a full queue is reported back immediately with the
//! rejected entry. A single worker drains the queue in arrival order, which is what gives
//! transfers on the same endpoint their submission-order guarantee.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::buffer_pool::BufferHandle;
use crate::transfer::{TransferId, TransferRequest, TransferStatus};

/// A transfer with its payload already staged in the shared region.
#[derive(Debug)]
pub struct Staged {
    pub request: TransferRequest,
    pub buffer: BufferHandle,
}

#[derive(Debug)]
pub enum PendingRequest {
    Submit(Staged),
    /// Cancel a transfer that was linked but not yet queued when the dequeue arrived.
    Dequeue {
        id: TransferId,
        status: TransferStatus,
    },
}

#[derive(Debug)]
pub struct RequestQueue {
    entries: Mutex<VecDeque<PendingRequest>>,
    capacity: usize,
    wake: Notify,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            wake: Notify::new(),
        }
    }

    /// Appends `entry` and schedules the worker. On overflow the entry is handed back.
    pub fn push(&self, entry: PendingRequest) -> Result<(), PendingRequest> {
        self.enqueue(entry, |e| e)
    }

    /// [`RequestQueue::push`] for a submission, handing the staged transfer back on overflow.
    pub fn push_submit(&self, staged: Staged) -> Result<(), Staged> {
        self.enqueue(staged, PendingRequest::Submit)
    }

    fn enqueue<T>(&self, value: T, wrap: impl FnOnce(T) -> PendingRequest) -> Result<(), T> {
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            return Err(value);
        }
        entries.push_back(wrap(value));
        drop(entries);
        self.wake.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<PendingRequest> {
        self.lock().pop_front()
    }

    /// Pulls a not-yet-sent submission out of the queue.
    pub fn remove_submit(&self, id: TransferId) -> Option<Staged> {
        let mut entries = self.lock();
        let pos = entries.iter().position(
            |e| matches!(e, PendingRequest::Submit(staged) if staged.request.id() == id),
        )?;
        match entries.remove(pos) {
            Some(PendingRequest::Submit(staged)) => Some(staged),
            _ => None,
        }
    }

    pub fn drain(&self) -> Vec<PendingRequest> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Schedules the worker without queueing anything (e.g. after a state change).
    pub fn kick(&self) {
        self.wake.notify_one();
    }

    /// Resolves once the worker has been scheduled. A wakeup that arrived while the worker was
    /// busy is remembered, so no push is ever missed.
    pub async fn scheduled(&self) {
        self.wake.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
