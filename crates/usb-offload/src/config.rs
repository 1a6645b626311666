use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use usb_offload_ipc::layout::{DEFAULT_SLOT_COUNT, DEFAULT_SLOT_SIZE};

use crate::policy::{default_quirks, ControlQuirk};

/// USB interface class for audio devices.
pub const CLASS_AUDIO: u8 = 0x01;

/// Upper bound on `receive_fifo_frames`; the FIFO is allocated up front.
pub const MAX_RECEIVE_FIFO_FRAMES: usize = 1 << 16;
/// Upper bound on `queue_capacity`.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid offload config: {0}")]
    Invalid(&'static str),
    #[error("invalid json: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OffloadConfig {
    /// Bus address of the shared staging region as seen by the coprocessor.
    pub region_base: u64,
    pub slot_size: usize,
    pub slot_count: usize,
    pub queue_capacity: usize,
    pub receive_fifo_frames: usize,
    pub sync_timeout_ms: u64,
    pub quiesce_retries: u32,
    pub quiesce_interval_ms: u64,
    /// Interface classes whose peripherals may be offloaded.
    pub offload_classes: Vec<u8>,
    pub control_quirks: Vec<ControlQuirk>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            region_base: 0,
            slot_size: DEFAULT_SLOT_SIZE,
            slot_count: DEFAULT_SLOT_COUNT,
            queue_capacity: 64,
            receive_fifo_frames: 64,
            sync_timeout_ms: 1000,
            quiesce_retries: 20,
            quiesce_interval_ms: 5,
            offload_classes: vec![CLASS_AUDIO],
            control_quirks: default_quirks(),
        }
    }
}

impl OffloadConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_size == 0 {
            return Err(ConfigError::Invalid("slot_size must be non-zero"));
        }
        if self.slot_count == 0 {
            return Err(ConfigError::Invalid("slot_count must be non-zero"));
        }
        let region = self
            .slot_size
            .checked_mul(self.slot_count)
            .ok_or(ConfigError::Invalid("shared region size overflows"))?;
        if u32::try_from(region).is_err() {
            // Region references on the wire are 32-bit offsets.
            return Err(ConfigError::Invalid("shared region exceeds 4 GiB"));
        }
        if self.region_base.checked_add(region as u64).is_none() {
            return Err(ConfigError::Invalid("shared region wraps the address space"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be non-zero"));
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::Invalid("queue_capacity too large"));
        }
        if self.receive_fifo_frames == 0 {
            return Err(ConfigError::Invalid("receive_fifo_frames must be non-zero"));
        }
        if self.receive_fifo_frames > MAX_RECEIVE_FIFO_FRAMES {
            return Err(ConfigError::Invalid("receive_fifo_frames too large"));
        }
        if self.sync_timeout_ms == 0 {
            return Err(ConfigError::Invalid("sync_timeout_ms must be non-zero"));
        }
        if self.quiesce_retries == 0 {
            return Err(ConfigError::Invalid("quiesce_retries must be non-zero"));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn quiesce_interval(&self) -> Duration {
        Duration::from_millis(self.quiesce_interval_ms)
    }

    /// Worst-case time spent quiescing before a switch gives up.
    pub fn quiesce_budget(&self) -> Duration {
        self.quiesce_interval() * self.quiesce_retries
    }
}
