//! Runtime power-management votes.
//!
//! The controller may only be idle-suspended by the power-management layer while nobody holds a
//! [`KeepActive`] vote. The switch machine holds one for as long as the controller is offloaded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct RuntimePm {
    usage: AtomicUsize,
}

impl RuntimePm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Takes a vote; it is returned when the guard drops.
    pub fn keep_active(self: &Arc<Self>) -> KeepActive {
        let prev = self.usage.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(usage = prev + 1, "pm get");
        KeepActive { pm: self.clone() }
    }

    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    pub fn is_idle_suspendable(&self) -> bool {
        self.usage() == 0
    }
}

#[derive(Debug)]
#[must_use = "dropping the vote immediately allows idle suspend"]
pub struct KeepActive {
    pm: Arc<RuntimePm>,
}

impl Drop for KeepActive {
    fn drop(&mut self) {
        let prev = self.pm.usage.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pm usage underflow");
        tracing::trace!(usage = prev.saturating_sub(1), "pm put");
    }
}
