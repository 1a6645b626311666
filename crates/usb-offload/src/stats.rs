use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// Running counters for the offload path.
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) local_replies: AtomicU64,
    pub(crate) peer_errors: AtomicU64,

    // Channel
    pub(crate) protocol_errors: AtomicU64,
    pub(crate) rx_dropped: AtomicU64,
    pub(crate) sync_timeouts: AtomicU64,
    pub(crate) pongs: AtomicU64,
    pub(crate) last_pong_seq: AtomicU32,

    // Transitions
    pub(crate) offload_entries: AtomicU64,
    pub(crate) offload_exits: AtomicU64,
    pub(crate) offload_failures: AtomicU64,
    pub(crate) forced_recoveries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub local_replies: u64,
    pub peer_errors: u64,
    pub protocol_errors: u64,
    pub rx_dropped: u64,
    pub sync_timeouts: u64,
    pub pongs: u64,
    pub last_pong_seq: u32,
    pub offload_entries: u64,
    pub offload_exits: u64,
    pub offload_failures: u64,
    pub forced_recoveries: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pong(&self, seq: u32) {
        Self::bump(&self.pongs);
        self.last_pong_seq.store(seq, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            submitted: get(&self.submitted),
            completed: get(&self.completed),
            cancelled: get(&self.cancelled),
            local_replies: get(&self.local_replies),
            peer_errors: get(&self.peer_errors),
            protocol_errors: get(&self.protocol_errors),
            rx_dropped: get(&self.rx_dropped),
            sync_timeouts: get(&self.sync_timeouts),
            pongs: get(&self.pongs),
            last_pong_seq: self.last_pong_seq.load(Ordering::Relaxed),
            offload_entries: get(&self.offload_entries),
            offload_exits: get(&self.offload_exits),
            offload_failures: get(&self.offload_failures),
            forced_recoveries: get(&self.forced_recoveries),
        }
    }
}
