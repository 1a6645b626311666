//! Fixed-slot allocator over the shared staging region.
//!
//! The region is `slot_count * slot_size` bytes, addressable by both processors. An allocation of
//! `len` bytes takes the first run of `ceil(len / slot_size)` contiguous free slots; the run
//! length is kept in the handle (`count`) so release clears exactly the bits it set. Slot indices
//! and byte offsets are the only cross-processor addressing units.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use usb_offload_ipc::layout::slots_for_len;
use usb_offload_ipc::RegionRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no {slots} contiguous free slots for {len} bytes")]
    Exhausted { len: usize, slots: usize },

    #[error("{len} bytes exceeds the {capacity}-byte region")]
    TooLarge { len: usize, capacity: usize },

    #[error("access at offset={offset} len={len} outside region of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
}

/// Shared memory backing the pool.
///
/// The host reads and writes it through the pool handles; a coprocessor (or a test double of
/// one) uses [`SharedRegion::read`]/[`SharedRegion::write`] with offsets received on the wire.
#[derive(Debug)]
pub struct SharedRegion {
    base_addr: u64,
    bytes: Mutex<Box<[u8]>>,
}

impl SharedRegion {
    pub fn new(base_addr: u64, size: usize) -> Self {
        Self {
            base_addr,
            bytes: Mutex::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), PoolError> {
        let bytes = self.lock();
        let range = checked_range(offset, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), PoolError> {
        let mut bytes = self.lock();
        let range = checked_range(offset, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        // A panic while copying bytes cannot leave the region logically inconsistent.
        self.bytes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn checked_range(
    offset: usize,
    len: usize,
    capacity: usize,
) -> Result<core::ops::Range<usize>, PoolError> {
    let end = offset.checked_add(len).filter(|end| *end <= capacity);
    match end {
        Some(end) => Ok(offset..end),
        None => Err(PoolError::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}

/// A live allocation. Not `Clone`: releasing consumes it, so a window cannot be freed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferHandle {
    first: usize,
    count: usize,
    len: usize,
    slot_size: usize,
    base_addr: u64,
}

impl BufferHandle {
    pub fn first_slot(&self) -> usize {
        self.first
    }

    /// Number of contiguous slots merged into this allocation.
    pub fn merge_count(&self) -> usize {
        self.count
    }

    /// Requested length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Usable bytes (whole slots).
    pub fn capacity(&self) -> usize {
        self.count * self.slot_size
    }

    /// Byte offset from the region base.
    pub fn offset(&self) -> usize {
        self.first * self.slot_size
    }

    /// Bus address as seen by the coprocessor.
    pub fn addr(&self) -> u64 {
        self.base_addr + self.offset() as u64
    }

    /// Wire reference covering the whole allocation.
    pub fn region(&self) -> RegionRef {
        RegionRef {
            offset: self.offset() as u32,
            len: self.capacity() as u32,
        }
    }
}

#[derive(Debug)]
struct SlotBitmap {
    words: Vec<u64>,
    slots: usize,
}

impl SlotBitmap {
    fn new(slots: usize) -> Self {
        Self {
            words: vec![0; slots.div_ceil(64)],
            slots,
        }
    }

    fn is_set(&self, slot: usize) -> bool {
        self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn set_range(&mut self, first: usize, count: usize, used: bool) {
        for slot in first..first + count {
            let bit = 1u64 << (slot % 64);
            if used {
                self.words[slot / 64] |= bit;
            } else {
                self.words[slot / 64] &= !bit;
            }
        }
    }

    /// First position whose `count`-slot window is entirely free.
    fn find_window(&self, count: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        for slot in 0..self.slots {
            if self.is_set(slot) {
                run_len = 0;
                run_start = slot + 1;
                continue;
            }
            run_len += 1;
            if run_len == count {
                return Some(run_start);
            }
        }
        None
    }

    fn used(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[derive(Debug)]
pub struct SharedBufferPool {
    region: Arc<SharedRegion>,
    slot_size: usize,
    slot_count: usize,
    bitmap: Mutex<SlotBitmap>,
}

impl SharedBufferPool {
    pub fn new(base_addr: u64, slot_size: usize, slot_count: usize) -> Self {
        assert!(slot_size > 0 && slot_count > 0);
        let region = Arc::new(SharedRegion::new(base_addr, slot_size * slot_count));
        Self {
            region,
            slot_size,
            slot_count,
            bitmap: Mutex::new(SlotBitmap::new(slot_count)),
        }
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn capacity(&self) -> usize {
        self.slot_size * self.slot_count
    }

    pub fn acquire(&self, len: usize) -> Result<BufferHandle, PoolError> {
        if len > self.capacity() {
            return Err(PoolError::TooLarge {
                len,
                capacity: self.capacity(),
            });
        }
        let count = slots_for_len(len, self.slot_size);
        let mut bitmap = self.bitmap();
        let first = bitmap
            .find_window(count)
            .ok_or(PoolError::Exhausted { len, slots: count })?;
        bitmap.set_range(first, count, true);
        drop(bitmap);

        tracing::trace!(first, count, len, "shared buffer acquired");
        Ok(BufferHandle {
            first,
            count,
            len,
            slot_size: self.slot_size,
            base_addr: self.region.base_addr(),
        })
    }

    pub fn release(&self, handle: BufferHandle) {
        let mut bitmap = self.bitmap();
        debug_assert!(
            (handle.first..handle.first + handle.count).all(|s| bitmap.is_set(s)),
            "releasing a window that is not fully allocated"
        );
        bitmap.set_range(handle.first, handle.count, false);
        drop(bitmap);
        tracing::trace!(
            first = handle.first,
            count = handle.count,
            "shared buffer released"
        );
    }

    pub fn write(&self, handle: &BufferHandle, data: &[u8]) -> Result<(), PoolError> {
        if data.len() > handle.capacity() {
            return Err(PoolError::OutOfBounds {
                offset: handle.offset(),
                len: data.len(),
                capacity: handle.capacity(),
            });
        }
        self.region.write(handle.offset(), data)
    }

    /// Reads the first `len` bytes of an allocation.
    pub fn read(&self, handle: &BufferHandle, len: usize) -> Result<Vec<u8>, PoolError> {
        let len = len.min(handle.capacity());
        let mut out = vec![0u8; len];
        self.region.read(handle.offset(), &mut out)?;
        Ok(out)
    }

    pub fn used_slots(&self) -> usize {
        self.bitmap().used()
    }

    /// Per-slot usage, for diagnostics and invariant checks.
    pub fn usage(&self) -> Vec<bool> {
        let bitmap = self.bitmap();
        (0..self.slot_count).map(|s| bitmap.is_set(s)).collect()
    }

    fn bitmap(&self) -> MutexGuard<'_, SlotBitmap> {
        self.bitmap.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn merged_allocation_spans_three_slots() {
        let pool = SharedBufferPool::new(0x4000_0000, 1024, 10);
        let h = pool.acquire(2500).unwrap();
        assert_eq!(h.merge_count(), 3);
        assert_eq!(h.capacity(), 3072);
        assert_eq!(pool.used_slots(), 3);
        pool.release(h);
        assert!(pool.usage().iter().all(|used| !used));
    }

    #[test]
    fn freed_window_is_reused_by_next_scan() {
        let pool = SharedBufferPool::new(0, 1024, 4);
        let a = pool.acquire(1024).unwrap();
        let b = pool.acquire(2048).unwrap();
        assert_eq!(b.first_slot(), 1);
        pool.release(a);
        let c = pool.acquire(10).unwrap();
        assert_eq!(c.first_slot(), 0);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.used_slots(), 0);
    }

    #[test]
    fn fragmented_pool_reports_exhaustion() {
        let pool = SharedBufferPool::new(0, 1024, 4);
        let a = pool.acquire(1).unwrap();
        let b = pool.acquire(1).unwrap();
        let c = pool.acquire(1).unwrap();
        pool.release(b);
        // Slots 1 and 3 are free but not contiguous.
        assert_eq!(
            pool.acquire(2048),
            Err(PoolError::Exhausted {
                len: 2048,
                slots: 2
            })
        );
        pool.release(a);
        pool.release(c);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let pool = SharedBufferPool::new(0, 512, 2);
        assert!(matches!(
            pool.acquire(1025),
            Err(PoolError::TooLarge { .. })
        ));
    }

    #[test]
    fn handle_addresses_are_base_plus_offset() {
        let pool = SharedBufferPool::new(0x1000_0000, 256, 8);
        let _a = pool.acquire(300).unwrap();
        let b = pool.acquire(1).unwrap();
        assert_eq!(b.offset(), 512);
        assert_eq!(b.addr(), 0x1000_0200);
        assert_eq!(b.region().len, 256);
    }

    #[test]
    fn data_written_through_handle_is_visible_in_region() {
        let pool = SharedBufferPool::new(0, 64, 4);
        let _pad = pool.acquire(64).unwrap();
        let h = pool.acquire(5).unwrap();
        pool.write(&h, b"hello").unwrap();
        let mut raw = [0u8; 5];
        pool.region().read(h.offset(), &mut raw).unwrap();
        assert_eq!(&raw, b"hello");
        assert_eq!(pool.read(&h, 5).unwrap(), b"hello");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            rng_algorithm: proptest::test_runner::RngAlgorithm::ChaCha,
            rng_seed: proptest::test_runner::RngSeed::Fixed(0x5107),
            .. ProptestConfig::default()
        })]

        #[test]
        fn acquire_release_restores_bitmap(
            pre in proptest::collection::vec(1usize..=3000, 0..4),
            len in 1usize..=10 * 1024,
        ) {
            let pool = SharedBufferPool::new(0, 1024, 10);
            let held: Vec<_> = pre.iter().filter_map(|l| pool.acquire(*l).ok()).collect();
            let before = pool.usage();

            match pool.acquire(len) {
                Ok(h) => {
                    prop_assert_eq!(h.merge_count(), len.div_ceil(1024));
                    let during = pool.usage();
                    let window = h.first_slot()..h.first_slot() + h.merge_count();
                    for (slot, used) in during.iter().enumerate() {
                        if window.contains(&slot) {
                            prop_assert!(*used);
                            prop_assert!(!before[slot]);
                        } else {
                            prop_assert_eq!(*used, before[slot]);
                        }
                    }
                    pool.release(h);
                    prop_assert_eq!(pool.usage(), before);
                }
                Err(PoolError::Exhausted { slots, .. }) => {
                    prop_assert_eq!(slots, len.div_ceil(1024));
                    prop_assert_eq!(pool.usage(), before);
                }
                Err(other) => prop_assert!(false, "unexpected {other:?}"),
            }

            for h in held {
                pool.release(h);
            }
            prop_assert_eq!(pool.used_slots(), 0);
        }
    }
}
