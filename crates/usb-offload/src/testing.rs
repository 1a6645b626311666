//! Doubles for the unit tests that need an offload path without the full facade.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use usb_offload_ipc::{DescriptorBundle, RingCursor, RingSnapshot};

use crate::buffer_pool::SharedBufferPool;
use crate::channel::{MailboxLink, MessageChannel};
use crate::config::CLASS_AUDIO;
use crate::controller::{HostControllerOps, Peripheral, StandardController};
use crate::error::{OffloadError, Result, SubmitError};
use crate::offload::OffloadController;
use crate::policy::{default_quirks, ControlPolicy};
use crate::port::PortStatus;
use crate::queue::RequestQueue;
use crate::stats::Stats;
use crate::transfer::{Endpoint, TransferId, TransferRequest, TransferStatus, TransferType};

type LinkHook = Box<dyn Fn(TransferId) + Send + Sync>;

/// Standard driver that only keeps link bookkeeping and records fallback dequeues.
#[derive(Default)]
pub(crate) struct LinkOnlyStandard {
    linked: Mutex<HashSet<TransferId>>,
    dequeued: Mutex<Vec<TransferId>>,
    on_link: Mutex<Option<LinkHook>>,
}

impl LinkOnlyStandard {
    /// Runs `hook` right after every `link_transfer`.
    pub fn on_link(&self, hook: impl Fn(TransferId) + Send + Sync + 'static) {
        *self.on_link.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn linked_len(&self) -> usize {
        self.linked.lock().unwrap().len()
    }

    pub fn dequeued(&self) -> Vec<TransferId> {
        self.dequeued.lock().unwrap().clone()
    }
}

impl HostControllerOps for LinkOnlyStandard {
    fn submit(&self, request: TransferRequest) -> std::result::Result<(), SubmitError> {
        request.complete_with(TransferStatus::Success);
        Ok(())
    }

    fn dequeue(&self, id: TransferId, _status: TransferStatus) -> Result<()> {
        self.dequeued.lock().unwrap().push(id);
        Err(OffloadError::NotFound)
    }

    fn port_status(&self, _port: u8) -> PortStatus {
        PortStatus::empty()
    }

    fn bus_suspend(&self) -> Result<()> {
        Ok(())
    }

    fn bus_resume(&self) -> Result<()> {
        Ok(())
    }
}

impl StandardController for LinkOnlyStandard {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn pending_ops(&self) -> usize {
        0
    }

    fn ring_idle(&self, _endpoint: u8) -> bool {
        true
    }

    fn gather_descriptors(&self, peripheral: &Peripheral) -> Result<DescriptorBundle> {
        Ok(DescriptorBundle {
            slot_id: peripheral.slot_id,
            speed: peripheral.speed,
            dcbaa: 0x1000,
            device_context: 0x2000,
            event_ring: 0x3000,
            rings: vec![RingCursor {
                endpoint: 0,
                dequeue: 0x4000,
                cycle: true,
            }],
        })
    }

    fn resume_ownership(&self, _snapshot: Option<&RingSnapshot>) {}

    fn link_transfer(&self, id: TransferId, _endpoint: Endpoint) {
        self.linked.lock().unwrap().insert(id);
        if let Some(hook) = self.on_link.lock().unwrap().as_ref() {
            hook(id);
        }
    }

    fn unlink_transfer(&self, id: TransferId) {
        self.linked.lock().unwrap().remove(&id);
    }

    fn is_linked(&self, id: TransferId) -> bool {
        self.linked.lock().unwrap().contains(&id)
    }

    fn disable_irq(&self) {}

    fn abort_command_pipeline(&self) {}
}

/// An offload path over a small pool, with no worker or dispatcher running. The returned link's
/// mailbox holds every frame sent to the coprocessor.
pub(crate) fn offload_controller(
    standard: Arc<dyn StandardController>,
) -> (Arc<OffloadController>, MailboxLink) {
    let link = MailboxLink::new(16);
    let stats = Arc::new(Stats::new());
    let channel = Arc::new(MessageChannel::new(
        Arc::new(link.clone()),
        16,
        stats.clone(),
    ));
    let offload = OffloadController::new(
        SharedBufferPool::new(0, 64, 8),
        RequestQueue::new(8),
        channel,
        standard,
        ControlPolicy::new(default_quirks()),
        stats,
    );
    (Arc::new(offload), link)
}

pub(crate) fn audio_peripheral() -> Peripheral {
    Peripheral {
        slot_id: 1,
        address: 2,
        port: 1,
        speed: 3,
        interface_class: CLASS_AUDIO,
        endpoints: vec![Endpoint::new(0x81, TransferType::Interrupt)],
    }
}
