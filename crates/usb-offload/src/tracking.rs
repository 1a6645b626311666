//! Ownership records for transfers delegated to the coprocessor.
//!
//! Two maps live under one short-held lock:
//!
//! - `inflight`: transfers sent to the coprocessor and not yet completed; the entry owns the
//!   [`TransferRequest`] and its staging buffer
//! - `cancelling`: transfers that were dequeued while in flight; the request has already been
//!   completed locally, only the staging buffer is retained until the coprocessor lets go of it
//!
//! Moving an entry from `inflight` to `cancelling` is the single synchronisation point between
//! cancellation and a completion message: whichever side removes the `inflight` entry first owns
//! the completion, and the other side sees either a `cancelling` entry or nothing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::buffer_pool::BufferHandle;
use crate::transfer::{TransferId, TransferRequest};

#[derive(Debug)]
pub struct InFlight {
    pub request: TransferRequest,
    pub buffer: BufferHandle,
}

/// Outcome of matching a completion message against the lists.
#[derive(Debug)]
pub enum CompletionMatch {
    /// Normal completion; the caller now owns the request.
    InFlight(InFlight),
    /// The transfer was cancelled first; only its buffer is left to release.
    Cancelled(BufferHandle),
    /// Nothing tracked under this tag.
    Unknown,
}

/// A transfer moved to the cancellation list by [`TrackingLists::begin_cancel`].
#[derive(Debug)]
pub struct CancelTicket {
    pub request: TransferRequest,
    pub region: usb_offload_ipc::RegionRef,
}

#[derive(Debug, Default)]
struct Lists {
    inflight: HashMap<TransferId, InFlight>,
    cancelling: HashMap<TransferId, BufferHandle>,
}

/// Everything removed by [`TrackingLists::drain`].
#[derive(Debug, Default)]
pub struct Drained {
    pub inflight: Vec<InFlight>,
    pub cancelling: Vec<BufferHandle>,
}

#[derive(Debug, Default)]
pub struct TrackingLists {
    inner: Mutex<Lists>,
}

impl TrackingLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: TransferRequest, buffer: BufferHandle) {
        let id = request.id();
        let prev = self
            .lock()
            .inflight
            .insert(id, InFlight { request, buffer });
        debug_assert!(prev.is_none(), "transfer {id:?} tracked twice");
    }

    /// Moves `id` from the in-flight list to the cancellation list.
    ///
    /// The buffer stays behind in `cancelling`; the request is handed to the caller for local
    /// completion.
    pub fn begin_cancel(&self, id: TransferId) -> Option<CancelTicket> {
        let mut lists = self.lock();
        let InFlight { request, buffer } = lists.inflight.remove(&id)?;
        let region = buffer.region();
        lists.cancelling.insert(id, buffer);
        Some(CancelTicket { request, region })
    }

    pub fn is_cancelling(&self, id: TransferId) -> bool {
        self.lock().cancelling.contains_key(&id)
    }

    #[cfg(test)]
    pub fn is_inflight(&self, id: TransferId) -> bool {
        self.lock().inflight.contains_key(&id)
    }

    /// Claims the record a completion message refers to. The cancellation list is consulted
    /// first so a completion that raced a dequeue is never delivered.
    pub fn take_for_completion(&self, id: TransferId) -> CompletionMatch {
        let mut lists = self.lock();
        if let Some(buffer) = lists.cancelling.remove(&id) {
            return CompletionMatch::Cancelled(buffer);
        }
        match lists.inflight.remove(&id) {
            Some(entry) => CompletionMatch::InFlight(entry),
            None => CompletionMatch::Unknown,
        }
    }

    /// Empties both lists.
    pub fn drain(&self) -> Drained {
        let mut lists = self.lock();
        Drained {
            inflight: lists.inflight.drain().map(|(_, v)| v).collect(),
            cancelling: lists.cancelling.drain().map(|(_, v)| v).collect(),
        }
    }

    pub fn inflight_len(&self) -> usize {
        self.lock().inflight.len()
    }

    pub fn cancelling_len(&self) -> usize {
        self.lock().cancelling.len()
    }

    fn lock(&self) -> MutexGuard<'_, Lists> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
