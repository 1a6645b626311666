//! Lock-free bounded mailbox of fixed-size frame cells.
//!
//! Each cell holds one frame of at most [`MAX_MESSAGE_BYTES`] bytes, prefixed by its length.
//! Because every record has the same footprint there is no wrap marker or padding: the cursors
//! count cells, not bytes.
//!
//! Producers reserve a cell by advancing `tail_reserve` and publish it by advancing
//! `tail_commit` in reservation order, so several producers may push concurrently. There is a
//! single consumer. `try_push` never blocks or allocates, which makes it safe to call from a
//! receive callback running in a restricted context.

use core::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::layout::{FRAME_CELL_BYTES, MAX_MESSAGE_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("mailbox full")]
    Full,
    #[error("frame larger than a mailbox cell")]
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PopError {
    #[error("mailbox empty")]
    Empty,
    /// A cell carried a length that cannot be a frame.
    #[error("mailbox corrupt")]
    Corrupt,
}

/// One frame popped from a [`Mailbox`].
#[derive(Clone, Copy)]
pub struct Frame {
    len: usize,
    bytes: [u8; MAX_MESSAGE_BYTES],
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Frame").field(&self.as_bytes()).finish()
    }
}

pub struct Mailbox {
    cells: u32,
    head: AtomicU32,
    tail_reserve: AtomicU32,
    tail_commit: AtomicU32,

    data_ptr: *mut u8,
    _storage: Box<[u8]>,
}

// The storage is only touched through cells owned by exactly one side at a time (reserved by a
// producer or published to the consumer), as arbitrated by the atomic cursors.
unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

impl Mailbox {
    /// Creates a mailbox with room for at least `cells` frames.
    ///
    /// The cell count is rounded up to a power of two so cursor wrap-around at `u32::MAX` stays
    /// aligned with the cell index.
    pub fn new(cells: usize) -> Self {
        assert!(cells > 0);
        let cells = cells.next_power_of_two();
        assert!(cells <= (u32::MAX / 2) as usize);
        let mut storage = vec![0u8; cells * FRAME_CELL_BYTES].into_boxed_slice();
        let data_ptr = storage.as_mut_ptr();
        Self {
            cells: cells as u32,
            head: AtomicU32::new(0),
            tail_reserve: AtomicU32::new(0),
            tail_commit: AtomicU32::new(0),
            data_ptr,
            _storage: storage,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells as usize
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail_commit.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail_commit.load(Ordering::Acquire)
    }

    pub fn try_push(&self, frame: &[u8]) -> Result<(), PushError> {
        if frame.len() > MAX_MESSAGE_BYTES {
            return Err(PushError::TooLarge);
        }

        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail_reserve.load(Ordering::Acquire);

            let used = tail.wrapping_sub(head);
            if used > self.cells {
                // Raced with the consumer advancing `head` between the two loads.
                continue;
            }
            if used == self.cells {
                return Err(PushError::Full);
            }

            let new_tail = tail.wrapping_add(1);
            if self
                .tail_reserve
                .compare_exchange(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            unsafe {
                let cell = self.cell_ptr(tail);
                write_u32_le(cell, frame.len() as u32);
                core::ptr::copy_nonoverlapping(frame.as_ptr(), cell.add(4), frame.len());
            }

            // Publish in reservation order.
            while self.tail_commit.load(Ordering::Acquire) != tail {
                core::hint::spin_loop();
            }
            self.tail_commit.store(new_tail, Ordering::Release);
            return Ok(());
        }
    }

    pub fn try_pop(&self) -> Result<Frame, PopError> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail_commit.load(Ordering::Acquire);
        if head == tail {
            return Err(PopError::Empty);
        }

        let mut frame = Frame {
            len: 0,
            bytes: [0u8; MAX_MESSAGE_BYTES],
        };
        let len = unsafe {
            let cell = self.cell_ptr(head);
            let len = read_u32_le(cell) as usize;
            if len <= MAX_MESSAGE_BYTES {
                core::ptr::copy_nonoverlapping(cell.add(4), frame.bytes.as_mut_ptr(), len);
            }
            len
        };

        // The cell is consumed either way; a corrupt one must not wedge the mailbox.
        self.head.store(head.wrapping_add(1), Ordering::Release);
        if len > MAX_MESSAGE_BYTES {
            return Err(PopError::Corrupt);
        }
        frame.len = len;
        Ok(frame)
    }

    /// Pops every queued frame, stopping at the first empty read.
    pub fn drain(&self) -> impl Iterator<Item = Result<Frame, PopError>> + '_ {
        core::iter::from_fn(move || match self.try_pop() {
            Err(PopError::Empty) => None,
            other => Some(other),
        })
    }

    #[inline]
    unsafe fn cell_ptr(&self, cursor: u32) -> *mut u8 {
        let index = (cursor % self.cells) as usize;
        self.data_ptr.add(index * FRAME_CELL_BYTES)
    }
}

fn read_u32_le(ptr: *const u8) -> u32 {
    unsafe {
        let mut tmp = [0u8; 4];
        core::ptr::copy_nonoverlapping(ptr, tmp.as_mut_ptr(), 4);
        u32::from_le_bytes(tmp)
    }
}

fn write_u32_le(ptr: *mut u8, v: u32) {
    unsafe {
        let bytes = v.to_le_bytes();
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, 4);
    }
}
