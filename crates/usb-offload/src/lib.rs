//! USB transfer offload proxy.
//!
//! Sits between the bus stack and a standard host-controller driver, and can hand a peripheral's
//! transfer rings to a low-power coprocessor while the main processor sleeps. This crate provides:
//!
//! - [`OffloadHcd`]: the host-controller facade; routes each call to the standard driver or the
//!   offload path depending on [`ControllerState`]
//! - [`SharedBufferPool`]: fixed-slot allocator over the region shared with the coprocessor
//! - [`MessageChannel`]: framed fire-and-forget and ack-waited messaging, plus the inbound
//!   dispatcher
//! - [`OffloadConfig`]: JSON-loadable tuning and the local control-request quirk table
//!
//! The wire contract itself lives in `usb-offload-ipc`.

mod buffer_pool;
mod channel;
mod config;
mod controller;
mod error;
mod hcd;
mod offload;
mod pm;
mod policy;
mod port;
mod queue;
mod state;
mod stats;
mod switch;
#[cfg(test)]
mod testing;
mod tracking;
mod transfer;

pub use usb_offload_ipc as ipc;

pub use buffer_pool::{BufferHandle, PoolError, SharedBufferPool, SharedRegion};
pub use channel::{EventHandler, Link, LinkError, MailboxLink, MessageChannel};
pub use config::{
    ConfigError, OffloadConfig, CLASS_AUDIO, MAX_QUEUE_CAPACITY, MAX_RECEIVE_FIFO_FRAMES,
};
pub use controller::{HostControllerOps, Peripheral, StandardController};
pub use error::{OffloadError, Result, SubmitError};
pub use hcd::OffloadHcd;
pub use policy::{default_quirks, ControlPolicy, ControlQuirk};
pub use port::{Capability, PortStatus};
pub use state::ControllerState;
pub use stats::StatsSnapshot;
pub use transfer::{
    Direction, Endpoint, SetupPacket, TransferHandle, TransferId, TransferRequest, TransferResult,
    TransferStatus, TransferType,
};
