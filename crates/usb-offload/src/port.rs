//! Root-port status mirrored from the coprocessor.

use core::sync::atomic::{AtomicU16, Ordering};

use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// `wPortStatus` / `wPortChange` packed into one word, as reported by `PORT_STATUS`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PortStatus: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;

        const C_CONNECTION = 1 << 11;
        const C_ENABLE = 1 << 12;
        const C_SUSPEND = 1 << 13;
        const C_RESET = 1 << 14;
    }
}

/// Last port status received while offloaded.
#[derive(Debug, Default)]
pub struct PortMirror(AtomicU16);

impl PortMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> PortStatus {
        PortStatus::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: PortStatus) {
        self.0.store(status.bits(), Ordering::Release);
    }
}

/// Offload capability of the attached peripheral, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    NotAttached,
    /// Attached and served by the standard driver, whether or not its class is offloadable.
    AttachedNotOffloadable,
    AttachedOffloaded,
}
