//! The offload path: transfers executed by the coprocessor.
//!
//! Submissions are staged into the shared pool, linked into the standard driver's bookkeeping and
//! queued. A single worker task drains the queue in order and forwards each transfer over the
//! message channel; completions come back as `XFER_DONE` events on the dispatcher task.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use usb_offload_ipc::{Command, Event, SubmitRequest, WireStatus};

use crate::buffer_pool::{BufferHandle, SharedBufferPool};
use crate::channel::{EventHandler, MessageChannel};
use crate::controller::{HostControllerOps, StandardController};
use crate::error::{OffloadError, Result, SubmitError};
use crate::policy::ControlPolicy;
use crate::port::{PortMirror, PortStatus};
use crate::queue::{PendingRequest, RequestQueue, Staged};
use crate::state::{ControllerState, StateCell};
use crate::stats::Stats;
use crate::tracking::{CompletionMatch, TrackingLists};
use crate::transfer::{TransferId, TransferRequest, TransferStatus};

pub struct OffloadController {
    pub(crate) state: StateCell,
    /// Held while the worker checks the state and forwards an entry, and while the switch machine
    /// moves the state away from `Offloaded`. No message goes out after the state has left it.
    gate: Mutex<()>,
    /// Set by the pre-recovery hook; cleared by the forced return to `Origin`.
    pub(crate) recovering: AtomicBool,
    bus_suspended: AtomicBool,
    pub(crate) pool: SharedBufferPool,
    pub(crate) queue: RequestQueue,
    pub(crate) lists: TrackingLists,
    pub(crate) channel: Arc<MessageChannel>,
    pub(crate) standard: Arc<dyn StandardController>,
    policy: ControlPolicy,
    port: PortMirror,
    port_number: AtomicU8,
    pub(crate) stats: Arc<Stats>,
}

impl OffloadController {
    pub(crate) fn new(
        pool: SharedBufferPool,
        queue: RequestQueue,
        channel: Arc<MessageChannel>,
        standard: Arc<dyn StandardController>,
        policy: ControlPolicy,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            state: StateCell::new(),
            gate: Mutex::new(()),
            recovering: AtomicBool::new(false),
            bus_suspended: AtomicBool::new(false),
            pool,
            queue,
            lists: TrackingLists::new(),
            channel,
            standard,
            policy,
            port: PortMirror::new(),
            port_number: AtomicU8::new(0),
            stats,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state.load()
    }

    /// Changes the state with the forwarding gate held. Callers hold the controller lock.
    pub(crate) fn set_state(&self, next: ControllerState) {
        let _gate = self.gate();
        self.state.store(next);
    }

    /// Resets per-session port state on entry to `Offloaded`.
    pub(crate) fn begin_session(&self, port: u8) {
        self.port_number.store(port, Ordering::Relaxed);
        self.port.store(PortStatus::empty());
        self.bus_suspended.store(false, Ordering::Release);
    }

    /// Forgets the coprocessor-side bus state once the standard driver owns the bus again.
    pub(crate) fn end_session(&self) {
        self.bus_suspended.store(false, Ordering::Release);
    }

    pub(crate) fn is_bus_suspended(&self) -> bool {
        self.bus_suspended.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &SharedBufferPool {
        &self.pool
    }

    /// Delivers a completion and drops the transfer from the standard driver's bookkeeping.
    pub(crate) fn finish(
        &self,
        request: TransferRequest,
        status: TransferStatus,
        actual: usize,
        data: Vec<u8>,
    ) {
        self.standard.unlink_transfer(request.id());
        let counter = match status {
            TransferStatus::Success | TransferStatus::ShortTransfer => &self.stats.completed,
            TransferStatus::Cancelled | TransferStatus::NoDevice => &self.stats.cancelled,
            TransferStatus::PeerError => &self.stats.peer_errors,
        };
        Stats::bump(counter);
        tracing::trace!(tag = request.id().tag(), ?status, actual, "transfer complete");
        request.complete(status, actual, data);
    }

    /// Completes every queued and tracked transfer with `status` and frees every staging buffer.
    pub(crate) fn flush(&self, status: TransferStatus) {
        let queued = self.queue.drain();
        let drained = self.lists.drain();
        let (n_queued, n_inflight, n_cancelling) =
            (queued.len(), drained.inflight.len(), drained.cancelling.len());

        for entry in queued {
            if let PendingRequest::Submit(Staged { request, buffer }) = entry {
                self.pool.release(buffer);
                self.finish(request, status, 0, Vec::new());
            }
        }
        for entry in drained.inflight {
            self.pool.release(entry.buffer);
            self.finish(entry.request, status, 0, Vec::new());
        }
        for buffer in drained.cancelling {
            self.pool.release(buffer);
        }
        if n_queued + n_inflight + n_cancelling > 0 {
            tracing::debug!(
                queued = n_queued,
                inflight = n_inflight,
                cancelling = n_cancelling,
                ?status,
                "flushed offload transfers"
            );
        }
    }

    /// Worker loop; runs until the task is aborted.
    pub async fn run_worker(self: Arc<Self>) {
        loop {
            self.queue.scheduled().await;
            self.drain_queue();
            tokio::task::yield_now().await;
        }
    }

    /// Processes queued entries in order. Stops early while a switch to offload is unresolved.
    pub(crate) fn drain_queue(&self) {
        loop {
            let gate = self.gate();
            let state = self.state.load();
            if state == ControllerState::SwitchingToOffload && !self.is_recovering() {
                // Held until the switch resolves; the switch kicks the worker.
                return;
            }
            let Some(entry) = self.queue.pop() else {
                return;
            };
            match entry {
                PendingRequest::Submit(staged) => self.forward(staged, state),
                PendingRequest::Dequeue { id, status } => {
                    if !self.resolve_dequeue(id, status, state) {
                        // Put back behind a submission still on its way into the queue.
                        return;
                    }
                }
            }
            drop(gate);
        }
    }

    fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    fn forward(&self, staged: Staged, state: ControllerState) {
        let Staged { request, buffer } = staged;

        if self.is_recovering() {
            self.pool.release(buffer);
            self.finish(request, TransferStatus::PeerError, 0, Vec::new());
            return;
        }
        if state != ControllerState::Offloaded {
            tracing::debug!(tag = request.id().tag(), ?state, "not offloaded; cancelling");
            self.pool.release(buffer);
            self.finish(request, TransferStatus::Cancelled, 0, Vec::new());
            return;
        }
        if let Some(setup) = request.setup() {
            if self.policy.answers_locally(&setup, self.is_bus_suspended()) {
                tracing::debug!(
                    tag = request.id().tag(),
                    request_type = setup.bm_request_type,
                    request = setup.b_request,
                    "control request answered locally"
                );
                Stats::bump(&self.stats.local_replies);
                self.pool.release(buffer);
                self.finish(request, TransferStatus::Success, 0, Vec::new());
                return;
            }
        }

        let id = request.id();
        let cmd = Command::Submit(SubmitRequest {
            tag: id.tag(),
            endpoint: request.endpoint().address,
            kind: request.endpoint().kind.into(),
            region: buffer.region(),
            length: request.length() as u32,
            setup: request.setup().map(|s| s.to_bytes()),
        });
        self.lists.insert(request, buffer);
        Stats::bump(&self.stats.submitted);

        if let Err(err) = self.channel.send_async(&cmd) {
            tracing::warn!(tag = id.tag(), "submit not sent: {err}");
            match self.lists.take_for_completion(id) {
                CompletionMatch::InFlight(entry) => {
                    self.pool.release(entry.buffer);
                    self.finish(entry.request, TransferStatus::PeerError, 0, Vec::new());
                }
                CompletionMatch::Cancelled(buffer) => self.pool.release(buffer),
                CompletionMatch::Unknown => {}
            }
        }
    }

    /// Handles a `Dequeue` entry. Returns `false` if it had to be queued again because the
    /// submission it targets is linked but not queued yet.
    fn resolve_dequeue(
        &self,
        id: TransferId,
        status: TransferStatus,
        state: ControllerState,
    ) -> bool {
        if self.cancel_tracked(id, status, state == ControllerState::Offloaded)
            || self.cancel_queued(id, status)
        {
            return true;
        }
        if self.standard.is_linked(id) {
            match self.queue.push(PendingRequest::Dequeue { id, status }) {
                Ok(()) => return false,
                Err(_) => tracing::warn!(tag = id.tag(), "deferred dequeue dropped, queue full"),
            }
            return true;
        }
        if let Err(err) = self.standard.dequeue(id, status) {
            tracing::debug!(tag = id.tag(), "deferred dequeue matched nothing: {err}");
        }
        true
    }

    /// Completes a transfer that is still waiting in the queue.
    fn cancel_queued(&self, id: TransferId, status: TransferStatus) -> bool {
        let Some(Staged { request, buffer }) = self.queue.remove_submit(id) else {
            return false;
        };
        self.pool.release(buffer);
        self.finish(request, status, 0, Vec::new());
        true
    }

    /// Moves an in-flight transfer to the cancellation list and completes it locally.
    fn cancel_tracked(&self, id: TransferId, status: TransferStatus, notify_peer: bool) -> bool {
        let Some(ticket) = self.lists.begin_cancel(id) else {
            return false;
        };
        if notify_peer {
            let cmd = Command::Dequeue {
                tag: id.tag(),
                region: ticket.region,
            };
            if let Err(err) = self.channel.send_async(&cmd) {
                // The buffer stays on the cancellation list until the next return to origin.
                tracing::warn!(tag = id.tag(), "dequeue not sent: {err}");
            }
        }
        self.finish(ticket.request, status, 0, Vec::new());
        true
    }

    fn on_transfer_done(&self, tag: u32, status: WireStatus, actual: u32) {
        let id = TransferId::from_tag(tag);
        match self.lists.take_for_completion(id) {
            CompletionMatch::InFlight(entry) => {
                let request = entry.request;
                let actual = (actual as usize).min(request.length());
                let data = if request.is_in() && actual > 0 {
                    match self.pool.read(&entry.buffer, actual) {
                        Ok(data) => data,
                        Err(err) => {
                            tracing::warn!(tag, "reading IN data failed: {err}");
                            Vec::new()
                        }
                    }
                } else {
                    Vec::new()
                };
                self.pool.release(entry.buffer);
                let status = map_status(status, request.is_in(), actual, request.length());
                self.finish(request, status, actual, data);
            }
            CompletionMatch::Cancelled(buffer) => {
                tracing::debug!(tag, "completion raced a dequeue; dropped");
                self.pool.release(buffer);
            }
            CompletionMatch::Unknown => {
                Stats::bump(&self.stats.protocol_errors);
                tracing::warn!(tag, ?status, "completion for unknown transfer");
            }
        }
    }

    fn on_port_status(&self, port: u8, bits: u16) {
        let state = self.state();
        if !matches!(
            state,
            ControllerState::Offloaded | ControllerState::SwitchingToOrigin
        ) {
            tracing::debug!(port, bits, ?state, "port status ignored while not offloaded");
            return;
        }
        let ours = self.port_number.load(Ordering::Relaxed);
        if port != ours {
            tracing::debug!(port, ours, "port status for another port ignored");
            return;
        }
        self.port.store(PortStatus::from_bits_retain(bits));
    }

    fn stage(&self, request: &TransferRequest) -> Result<BufferHandle> {
        let buffer = self.pool.acquire(request.length())?;
        if !request.is_in() && !request.out_data().is_empty() {
            if let Err(err) = self.pool.write(&buffer, request.out_data()) {
                self.pool.release(buffer);
                return Err(err.into());
            }
        }
        Ok(buffer)
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn map_status(status: WireStatus, is_in: bool, actual: usize, length: usize) -> TransferStatus {
    match status {
        WireStatus::Success if is_in && actual < length => TransferStatus::ShortTransfer,
        WireStatus::Success => TransferStatus::Success,
        WireStatus::ShortPacket => TransferStatus::ShortTransfer,
        WireStatus::Cancelled => TransferStatus::Cancelled,
        WireStatus::Error => TransferStatus::PeerError,
        WireStatus::NoDevice => TransferStatus::NoDevice,
    }
}

impl HostControllerOps for OffloadController {
    fn submit(&self, request: TransferRequest) -> std::result::Result<(), SubmitError> {
        let buffer = match self.stage(&request) {
            Ok(buffer) => buffer,
            Err(err) => {
                tracing::debug!(tag = request.id().tag(), "submit rejected: {err}");
                return Err(SubmitError::new(err, request));
            }
        };
        let id = request.id();
        self.standard.link_transfer(id, request.endpoint());
        tracing::trace!(tag = id.tag(), len = request.length(), "transfer queued");

        match self.queue.push_submit(Staged { request, buffer }) {
            Ok(()) => Ok(()),
            Err(Staged { request, buffer }) => {
                self.pool.release(buffer);
                self.standard.unlink_transfer(id);
                tracing::debug!(tag = id.tag(), "request queue full");
                Err(SubmitError::new(OffloadError::QueueFull, request))
            }
        }
    }

    fn dequeue(&self, id: TransferId, status: TransferStatus) -> Result<()> {
        if self.cancel_queued(id, status) {
            return Ok(());
        }

        {
            let _gate = self.gate();
            let notify_peer = self.state() == ControllerState::Offloaded;
            if self.cancel_tracked(id, status, notify_peer) {
                return Ok(());
            }
        }
        if self.lists.is_cancelling(id) {
            return Err(OffloadError::Busy);
        }
        if self.standard.is_linked(id) {
            // Linked but not queued yet; the worker resolves it in order.
            return self
                .queue
                .push(PendingRequest::Dequeue { id, status })
                .map_err(|_| OffloadError::QueueFull);
        }
        self.standard.dequeue(id, status)
    }

    fn port_status(&self, _port: u8) -> PortStatus {
        self.port.load()
    }

    fn bus_suspend(&self) -> Result<()> {
        self.channel.send_async(&Command::BusSuspend)?;
        self.bus_suspended.store(true, Ordering::Release);
        Ok(())
    }

    fn bus_resume(&self) -> Result<()> {
        self.channel.send_async(&Command::BusResume)?;
        self.bus_suspended.store(false, Ordering::Release);
        Ok(())
    }
}

impl EventHandler for OffloadController {
    fn handle_event(&self, event: Event) {
        match event {
            Event::TransferDone {
                tag,
                status,
                actual,
            } => self.on_transfer_done(tag, status, actual),
            Event::PortStatus { port, bits } => self.on_port_status(port, bits),
            Event::Pong { seq } => {
                tracing::debug!(seq, "pong");
                self.stats.record_pong(seq);
            }
            Event::Ack { id, .. } => {
                // Acks are consumed by the channel.
                tracing::warn!(id, "ack reached the event handler");
            }
        }
    }
}

impl std::fmt::Debug for OffloadController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadController")
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .field("inflight", &self.lists.inflight_len())
            .field("cancelling", &self.lists.cancelling_len())
            .field("used_slots", &self.pool.used_slots())
            .finish()
    }
}
