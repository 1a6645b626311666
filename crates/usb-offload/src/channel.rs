//! Message channel between the host and the coprocessor.
//!
//! Outbound frames go through a [`Link`]. Two send modes exist:
//!
//! - [`MessageChannel::send_async`]: fire-and-forget, used on the data path
//! - [`MessageChannel::send_sync`]: registers a wait slot keyed by message id, sends, then waits
//!   (bounded) for the matching common ack. Acks carry only the id they answer, so at most one
//!   synchronous call per id may be outstanding; a second caller gets [`OffloadError::Busy`]
//!   immediately.
//!
//! Inbound frames arrive through [`MessageChannel::receive`], which only copies the frame into a
//! lock-free receive FIFO and wakes the dispatcher. Interpretation happens later on the dispatcher
//! task, which is free to take locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Notify};

use usb_offload_ipc::mailbox::{Mailbox, PopError, PushError};
use usb_offload_ipc::{decode_event, encode_command, parse_header, Command, Event};

use crate::error::OffloadError;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("outbound mailbox full")]
    Full,
    #[error("link closed")]
    Closed,
    #[error("frame too large for the link")]
    TooLarge,
}

/// Low-level outbound transport.
pub trait Link: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<(), LinkError>;
}

/// [`Link`] backed by a shared-memory [`Mailbox`] plus a doorbell the peer waits on.
#[derive(Clone)]
pub struct MailboxLink {
    mailbox: Arc<Mailbox>,
    doorbell: Arc<Notify>,
}

impl MailboxLink {
    pub fn new(cells: usize) -> Self {
        Self {
            mailbox: Arc::new(Mailbox::new(cells)),
            doorbell: Arc::new(Notify::new()),
        }
    }

    /// The peer's end: frames sent over this link.
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn doorbell(&self) -> &Arc<Notify> {
        &self.doorbell
    }
}

impl Link for MailboxLink {
    fn send(&self, frame: &[u8]) -> Result<(), LinkError> {
        self.mailbox.try_push(frame).map_err(|e| match e {
            PushError::Full => LinkError::Full,
            PushError::TooLarge => LinkError::TooLarge,
        })?;
        self.doorbell.notify_one();
        Ok(())
    }
}

/// Receiver of every inbound event other than acks.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: Event);
}

#[derive(Debug)]
enum WaitOutcome {
    Ack(i32),
    Aborted,
}

#[derive(Debug)]
struct WaitSlot {
    generation: u64,
    tx: oneshot::Sender<WaitOutcome>,
}

pub struct MessageChannel {
    link: Arc<dyn Link>,
    slots: Mutex<HashMap<u16, WaitSlot>>,
    next_generation: AtomicU64,
    rx_fifo: Mailbox,
    rx_wake: Notify,
    stats: Arc<Stats>,
}

/// Removes this call's wait slot on every exit path (ack, timeout, send failure, or the waiting
/// future being dropped), without touching a slot a later caller registered for the same id.
struct SlotGuard<'a> {
    channel: &'a MessageChannel,
    id: u16,
    generation: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.channel.slots();
        if slots
            .get(&self.id)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            slots.remove(&self.id);
        }
    }
}

impl MessageChannel {
    pub(crate) fn new(
        link: Arc<dyn Link>,
        receive_fifo_frames: usize,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            link,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            rx_fifo: Mailbox::new(receive_fifo_frames),
            rx_wake: Notify::new(),
            stats,
        }
    }

    /// Fire-and-forget send.
    pub fn send_async(&self, cmd: &Command) -> Result<(), LinkError> {
        tracing::trace!(id = cmd.id(), ?cmd, "send");
        self.link.send(&encode_command(cmd))
    }

    /// Sends `cmd` and waits up to `timeout` for its ack. Returns the ack's result code.
    pub async fn send_sync(&self, cmd: &Command, timeout: Duration) -> Result<i32, OffloadError> {
        let id = cmd.id();
        let (tx, rx) = oneshot::channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut slots = self.slots();
            if slots.contains_key(&id) {
                tracing::debug!(id, "synchronous call already outstanding");
                return Err(OffloadError::Busy);
            }
            slots.insert(id, WaitSlot { generation, tx });
        }
        let _guard = SlotGuard {
            channel: self,
            id,
            generation,
        };

        tracing::debug!(id, ?cmd, "send (sync)");
        self.link.send(&encode_command(cmd))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(WaitOutcome::Ack(code))) => Ok(code),
            Ok(Ok(WaitOutcome::Aborted)) => Err(OffloadError::Recovering),
            Ok(Err(_)) => Err(OffloadError::ShutDown),
            Err(_) => {
                Stats::bump(&self.stats.sync_timeouts);
                tracing::warn!(id, ?timeout, "no ack from coprocessor");
                Err(OffloadError::Timeout)
            }
        }
    }

    /// Whether a synchronous call for `id` is waiting on its ack.
    pub fn is_waiting(&self, id: u16) -> bool {
        self.slots().contains_key(&id)
    }

    /// Wakes every pending synchronous call with [`OffloadError::Recovering`].
    pub fn abort_waiters(&self) {
        let drained: Vec<_> = self.slots().drain().collect();
        for (id, slot) in drained {
            tracing::debug!(id, "aborting synchronous wait");
            let _ = slot.tx.send(WaitOutcome::Aborted);
        }
    }

    /// Low-level receive callback. Never blocks; a full FIFO drops the frame.
    pub fn receive(&self, frame: &[u8]) {
        match self.rx_fifo.try_push(frame) {
            Ok(()) => self.rx_wake.notify_one(),
            Err(PushError::Full) => {
                Stats::bump(&self.stats.rx_dropped);
                tracing::warn!(len = frame.len(), "receive FIFO full; frame dropped");
            }
            Err(PushError::TooLarge) => {
                Stats::bump(&self.stats.protocol_errors);
                tracing::warn!(len = frame.len(), "oversized frame dropped");
            }
        }
    }

    /// Inbound dispatch loop; runs until the task is aborted.
    pub async fn run_dispatcher(self: Arc<Self>, handler: Arc<dyn EventHandler>) {
        loop {
            self.rx_wake.notified().await;
            self.dispatch_pending(handler.as_ref());
            tokio::task::yield_now().await;
        }
    }

    /// Interprets every frame currently in the receive FIFO.
    pub fn dispatch_pending(&self, handler: &dyn EventHandler) {
        for frame in self.rx_fifo.drain() {
            match frame {
                Ok(frame) => self.dispatch(frame.as_bytes(), handler),
                Err(PopError::Corrupt) => {
                    Stats::bump(&self.stats.protocol_errors);
                    tracing::warn!("corrupt receive FIFO cell");
                }
                Err(PopError::Empty) => break,
            }
        }
    }

    fn dispatch(&self, bytes: &[u8], handler: &dyn EventHandler) {
        let event = match decode_event(bytes) {
            Ok(event) => event,
            Err(err) => {
                Stats::bump(&self.stats.protocol_errors);
                let id = parse_header(bytes).ok().map(|h| h.id);
                tracing::warn!(?id, len = bytes.len(), "dropping malformed frame: {err}");
                return;
            }
        };
        tracing::trace!(?event, "recv");

        match event {
            Event::Ack { id, result } => self.complete_wait(id, result),
            other => handler.handle_event(other),
        }
    }

    fn complete_wait(&self, id: u16, result: i32) {
        let slot = self.slots().remove(&id);
        match slot {
            Some(slot) => {
                if slot.tx.send(WaitOutcome::Ack(result)).is_err() {
                    tracing::debug!(id, "ack arrived after waiter left");
                }
            }
            None => {
                Stats::bump(&self.stats.protocol_errors);
                tracing::warn!(id, result, "ack for message with no outstanding wait");
            }
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<u16, WaitSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}
