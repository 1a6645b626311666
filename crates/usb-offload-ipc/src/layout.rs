//! Shared memory layout contract between the host and the offload coprocessor.
//!
//! Two regions are shared:
//!
//! - the message mailboxes, which carry small fixed-size frames in each direction
//! - the staging region, a physically contiguous block of `slot_count * slot_size` bytes that
//!   holds transfer payloads and the larger control-plane blobs (descriptor bundle, ring
//!   snapshot)
//!
//! Nothing in either region is a pointer. Payload locations are exchanged as byte offsets from
//! the start of the staging region.

/// Largest frame (header + payload) the mailbox carries.
pub const MAX_MESSAGE_BYTES: usize = 32;

/// Size of the message header: `id: u16`, `length: u16`, `source_tag: u8`.
pub const HEADER_BYTES: usize = 5;

/// Largest payload that fits in a single frame.
pub const MAX_PAYLOAD_BYTES: usize = MAX_MESSAGE_BYTES - HEADER_BYTES;

/// Mailbox cells hold a `u32` frame length followed by the frame bytes.
pub const FRAME_CELL_BYTES: usize = 4 + MAX_MESSAGE_BYTES;

/// Default staging slot size (bytes).
pub const DEFAULT_SLOT_SIZE: usize = 1024;

/// Default number of staging slots.
pub const DEFAULT_SLOT_COUNT: usize = 32;

/// Header field offsets within a frame.
pub mod header {
    pub const ID: usize = 0;
    pub const LENGTH: usize = 2;
    pub const SOURCE_TAG: usize = 4;
}

/// Identifies which side produced a frame.
pub mod source_tag {
    pub const HOST: u8 = 0x01;
    pub const COPROCESSOR: u8 = 0x02;
}

/// Ids with the top bit set flow from the coprocessor to the host; the rest flow the other way.
pub const FROM_COPROCESSOR_BIT: u16 = 0x8000;

/// Message ids sent by the host.
pub mod to_coprocessor {
    pub const START: u16 = 0x0001;
    pub const STOP: u16 = 0x0002;
    pub const GET_STATUS: u16 = 0x0003;
    pub const SUBMIT: u16 = 0x0010;
    pub const DEQUEUE: u16 = 0x0011;
    pub const BUS_SUSPEND: u16 = 0x0012;
    pub const BUS_RESUME: u16 = 0x0013;
    pub const PING: u16 = 0x0020;
}

/// Message ids sent by the coprocessor.
pub mod from_coprocessor {
    pub const ACK: u16 = 0x8001;
    pub const XFER_DONE: u16 = 0x8010;
    pub const PORT_STATUS: u16 = 0x8020;
    pub const PONG: u16 = 0x8030;
}

#[inline]
pub const fn is_from_coprocessor(id: u16) -> bool {
    id & FROM_COPROCESSOR_BIT != 0
}

/// Number of slots needed to hold `len` bytes.
///
/// Zero-length payloads still occupy one slot so every transfer has a valid region reference.
pub const fn slots_for_len(len: usize, slot_size: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(slot_size)
    }
}
