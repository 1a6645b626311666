//! Host-controller operation sets.
//!
//! [`HostControllerOps`] is what the bus stack calls. Both the wrapped standard driver and the
//! offload path implement it; the facade picks one per call based on the controller state.
//! [`StandardController`] adds the hooks the switch machine needs to quiesce the standard driver
//! and hand its rings back and forth.

use serde::Serialize;

use usb_offload_ipc::{DescriptorBundle, RingSnapshot};

use crate::error::{Result, SubmitError};
use crate::port::PortStatus;
use crate::transfer::{Endpoint, TransferId, TransferRequest, TransferStatus};

/// The peripheral attached to the controller's root port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peripheral {
    /// Device slot assigned by the standard driver.
    pub slot_id: u8,
    pub address: u8,
    /// Root port number (1-based).
    pub port: u8,
    pub speed: u8,
    pub interface_class: u8,
    #[serde(skip)]
    pub endpoints: Vec<Endpoint>,
}

impl Peripheral {
    pub fn is_offloadable(&self, classes: &[u8]) -> bool {
        classes.contains(&self.interface_class)
    }
}

pub trait HostControllerOps: Send + Sync {
    /// Queues `request`. The implementation owns it from here on and completes it exactly once.
    /// On error the request is handed back uncompleted.
    fn submit(&self, request: TransferRequest) -> std::result::Result<(), SubmitError>;

    /// Cancels a submitted transfer, completing it with `status`.
    fn dequeue(&self, id: TransferId, status: TransferStatus) -> Result<()>;

    fn port_status(&self, port: u8) -> PortStatus;

    fn bus_suspend(&self) -> Result<()>;

    fn bus_resume(&self) -> Result<()>;
}

/// The wrapped standard host-controller driver.
pub trait StandardController: HostControllerOps {
    fn start(&self) -> Result<()>;

    fn stop(&self);

    /// Hardware operations (commands, transfers) the driver has started and not yet retired.
    fn pending_ops(&self) -> usize;

    /// Whether the transfer ring of `endpoint` has nothing left to execute.
    fn ring_idle(&self, endpoint: u8) -> bool;

    /// Snapshot of the live descriptors the coprocessor needs to take over `peripheral`.
    fn gather_descriptors(&self, peripheral: &Peripheral) -> Result<DescriptorBundle>;

    /// Retakes the rings. `None` means the coprocessor did not report final positions and the
    /// driver has to reset them.
    fn resume_ownership(&self, snapshot: Option<&RingSnapshot>);

    /// Records a transfer executed by the offload path in the driver's bookkeeping.
    fn link_transfer(&self, id: TransferId, endpoint: Endpoint);

    fn unlink_transfer(&self, id: TransferId);

    fn is_linked(&self, id: TransferId) -> bool;

    fn disable_irq(&self);

    /// Stops the command pipeline without waiting for outstanding commands.
    fn abort_command_pipeline(&self);
}
