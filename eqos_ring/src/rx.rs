//! The receive descriptor ring engine.
//!
//! Every ring slot is kept armed with an empty buffer; the device fills them
//! in ring order and writes back the frame length and status. Draining walks
//! completed slots from the oldest, hands finished frames to the caller, and
//! re-arms the freed slots with fresh buffers. If the allocator runs dry the
//! freed slots stay empty (a *stall*); the next drain resumes re-arming from
//! where refilling stopped, so a stall heals as soon as buffers come back.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;

use log::{error, warn};

use eqos_buffers::{
    DeviceAddress, Direction, DmaMapper, MapHandle, ReceiveBuffer, RxBufferAllocator,
};
use eqos_descriptors::RxDescriptor;

use crate::{descriptor_addr, DescriptorArena, RingIndex};

/// The receive-channel ring registers, as a capability the ring engine is
/// handed at construction.
pub trait RxRingRegisters {
    /// Programs the device address of the first descriptor.
    fn set_rx_ring_base(&mut self, lo: u32, hi: u32);
    /// Programs the number of descriptors in the ring.
    fn set_rx_ring_len(&mut self, len: u16);
    /// Programs the tail pointer: the device address of the last armed
    /// descriptor. Writing it releases newly armed slots to the device.
    fn set_rx_tail(&mut self, tail: DeviceAddress);
    /// Starts the channel's receive DMA.
    fn enable_rx(&mut self);
    /// Asks the channel's receive DMA to stop after the current descriptor.
    fn disable_rx(&mut self);
    /// Whether the receive DMA has actually come to rest after a disable.
    fn rx_idle(&self) -> bool;
}

/// What one drain pass produced.
#[derive(Default)]
pub struct DrainBatch {
    /// Completed frames, oldest first, each trimmed to its received length.
    pub frames: Vec<ReceiveBuffer>,
    /// Frames the device flagged as errored; dropped, buffers recycled.
    pub errored: usize,
    /// Zero-length write-backs; dropped, buffers recycled.
    pub empty: usize,
    /// Slots drained but left unarmed because the allocator ran dry.
    pub stalled: usize,
}

struct RxSlot {
    buffer: ReceiveBuffer,
    handle: MapHandle,
}

/// The receive ring engine. Not internally synchronized; the driver wraps it
/// in a lock.
pub struct RxRing<R: RxRingRegisters> {
    arena: DescriptorArena<RxDescriptor>,
    slots: Box<[Option<RxSlot>]>,
    /// Oldest armed slot: the next one the device will complete.
    cur: RingIndex,
    /// Next slot to re-arm. Slots between `refill` and `cur` are the stalled
    /// holes; when none are stalled, `refill == cur`.
    refill: RingIndex,
    /// Number of slots currently armed with a buffer.
    armed: u16,
    base: DeviceAddress,
    regs: R,
}

impl<R: RxRingRegisters> RxRing<R> {
    /// Allocates a ring of `capacity` descriptors over `regs`. No buffers are
    /// armed until [`fill_all`](RxRing::fill_all).
    pub fn new(capacity: u16, regs: R, mapper: &dyn DmaMapper) -> Result<RxRing<R>, &'static str> {
        let arena = DescriptorArena::new(capacity)?;
        let base = mapper.coherent_device_addr(arena.base_ptr());
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || None);
        Ok(RxRing {
            arena,
            slots: slots.into_boxed_slice(),
            cur: RingIndex::zero(capacity),
            refill: RingIndex::zero(capacity),
            armed: 0,
            base,
            regs,
        })
    }

    pub fn capacity(&self) -> u16 {
        self.arena.capacity()
    }

    pub fn armed(&self) -> u16 {
        self.armed
    }

    /// Whether the device has nowhere left to put an incoming frame.
    pub fn is_stalled(&self) -> bool {
        self.armed == 0
    }

    /// Arms every slot with a fresh buffer. Fails if the allocator or the
    /// mapping service cannot cover the full ring; the ring is left partially
    /// armed and the caller is expected to [`reset`](RxRing::reset) it.
    pub fn fill_all(
        &mut self,
        mapper: &dyn DmaMapper,
        allocator: &dyn RxBufferAllocator,
    ) -> Result<(), &'static str> {
        self.refill_from(mapper, allocator);
        if self.armed == self.capacity() {
            Ok(())
        } else {
            Err("rx: could not arm every descriptor")
        }
    }

    /// Programs the ring into the channel registers and starts receive DMA.
    /// Call after [`fill_all`](RxRing::fill_all).
    pub fn start(&mut self) {
        self.regs.set_rx_ring_base(self.base.lower_32(), self.base.upper_32());
        self.regs.set_rx_ring_len(self.capacity());
        self.regs.set_rx_tail(self.tail_addr());
        self.regs.enable_rx();
    }

    /// Asks the receive DMA to stop. Poll [`is_idle`](RxRing::is_idle) before
    /// reset.
    pub fn disable(&mut self) {
        self.regs.disable_rx();
    }

    pub fn is_idle(&self) -> bool {
        self.regs.rx_idle()
    }

    /// Collects completed frames and re-arms the freed slots.
    ///
    /// Stalled slots left over from earlier allocation failures are re-armed
    /// first, so delivering buffers back to the pool is all it takes to
    /// recover from a stall.
    pub fn drain(
        &mut self,
        mapper: &dyn DmaMapper,
        allocator: &dyn RxBufferAllocator,
    ) -> DrainBatch {
        let mut batch = DrainBatch::default();

        while self.armed > 0 {
            let desc = self.arena.get(self.cur.value());
            if desc.is_owned_by_hw() {
                break;
            }
            let slot = match self.slots[usize::from(self.cur.value())].take() {
                Some(slot) => slot,
                None => {
                    error!("rx: completed slot {} has no armed buffer", self.cur.value());
                    self.cur = self.cur.next();
                    self.armed -= 1;
                    continue;
                }
            };
            mapper.unmap(slot.handle);
            self.armed -= 1;

            let mut buffer = slot.buffer;
            let len = desc.frame_len();
            if desc.has_error() {
                batch.errored += 1;
                // Dropping the buffer recycles it to the pool.
            } else if len == 0 {
                batch.empty += 1;
            } else if buffer.set_length(len).is_err() {
                warn!("rx: device reported {} bytes into a {}-byte buffer", len, buffer.capacity());
                batch.errored += 1;
            } else {
                batch.frames.push(buffer);
            }
            self.cur = self.cur.next();
        }

        self.refill_from(mapper, allocator);
        batch.stalled = usize::from(self.stalled_holes());
        if batch.stalled > 0 {
            warn!("rx: {} slot(s) stalled awaiting buffers", batch.stalled);
        }
        batch
    }

    /// Number of slots drained but not yet re-armed.
    fn stalled_holes(&self) -> u16 {
        self.capacity() - self.armed
    }

    /// Arms empty slots starting at `refill` until the ring is full or the
    /// allocator/mapping service runs dry. Returns how many were armed; a
    /// single tail write releases them all.
    fn refill_from(&mut self, mapper: &dyn DmaMapper, allocator: &dyn RxBufferAllocator) -> u16 {
        let mut armed_now = 0;
        while self.armed < self.capacity() {
            debug_assert!(self.slots[usize::from(self.refill.value())].is_none());
            let buffer = match allocator.alloc_receive_buffer() {
                Some(buffer) => buffer,
                None => break,
            };
            let region = match mapper.map_for_device(buffer.storage(), Direction::FromDevice) {
                Ok(region) => region,
                Err(err) => {
                    // The buffer goes back to the pool on drop; retry later.
                    warn!("rx: failed to map receive buffer: {:?}", err);
                    break;
                }
            };
            if region.fragments.len() != 1 {
                // Pool buffers are physically contiguous; anything else means
                // a misconfigured mapping service.
                error!("rx: receive buffer mapped to {} fragments", region.fragments.len());
                mapper.unmap(region.handle);
                break;
            }
            self.arena
                .get_mut(self.refill.value())
                .arm(region.fragments[0].addr);
            self.slots[usize::from(self.refill.value())] = Some(RxSlot {
                buffer,
                handle: region.handle,
            });
            self.refill = self.refill.next();
            self.armed += 1;
            armed_now += 1;
        }
        if armed_now > 0 {
            // Tail names the last armed descriptor.
            self.regs.set_rx_tail(self.tail_addr());
        }
        armed_now
    }

    fn tail_addr(&self) -> DeviceAddress {
        descriptor_addr(self.base, self.refill.back(1), mem::size_of::<RxDescriptor>())
    }

    /// Returns all armed buffers to their pool and clears every descriptor.
    /// Only meaningful after the channel has been disabled.
    pub fn reset(&mut self, mapper: &dyn DmaMapper) {
        for slot in self.slots.iter_mut() {
            if let Some(slot) = slot.take() {
                mapper.unmap(slot.handle);
                // Buffer recycles on drop.
            }
        }
        for i in 0..self.capacity() {
            self.arena.get_mut(i).clear();
        }
        self.cur = RingIndex::zero(self.capacity());
        self.refill = RingIndex::zero(self.capacity());
        self.armed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::ptr::write_volatile;
    use eqos_buffers::mock::{FlakyAllocator, MockMapper};
    use eqos_buffers::BufferPool;
    use eqos_descriptors::{RDES3_ES, RDES3_FD, RDES3_LD, RDES3_OWN};
    use spin::Mutex;

    #[derive(Default)]
    struct RxRegState {
        base: u64,
        len: u16,
        tail: u64,
        enabled: bool,
        tail_writes: usize,
    }

    #[derive(Clone, Default)]
    struct FakeRxRegs(Arc<Mutex<RxRegState>>);

    impl RxRingRegisters for FakeRxRegs {
        fn set_rx_ring_base(&mut self, lo: u32, hi: u32) {
            self.0.lock().base = (u64::from(hi) << 32) | u64::from(lo);
        }
        fn set_rx_ring_len(&mut self, len: u16) {
            self.0.lock().len = len;
        }
        fn set_rx_tail(&mut self, tail: DeviceAddress) {
            let mut state = self.0.lock();
            state.tail = tail.value();
            state.tail_writes += 1;
        }
        fn enable_rx(&mut self) {
            self.0.lock().enabled = true;
        }
        fn disable_rx(&mut self) {
            self.0.lock().enabled = false;
        }
        fn rx_idle(&self) -> bool {
            !self.0.lock().enabled
        }
    }

    /// Plays the device: fills the armed buffer at `slot` with `fill` and
    /// writes back a completed frame of `len` bytes (plus `extra_bits`).
    fn deliver_frame(regs: &FakeRxRegs, slot: u16, len: u16, fill: u8, extra_bits: u32) {
        let base = regs.0.lock().base as usize;
        assert_ne!(base, 0, "ring base was never programmed");
        let desc = (base + usize::from(slot) * 16) as *mut u32;
        unsafe {
            let rdes3 = core::ptr::read_volatile(desc.add(3));
            assert_ne!(rdes3 & RDES3_OWN, 0, "delivering into a descriptor the device does not own");
            let buf_lo = core::ptr::read_volatile(desc);
            let buf_hi = core::ptr::read_volatile(desc.add(1));
            let buf = ((u64::from(buf_hi) << 32) | u64::from(buf_lo)) as *mut u8;
            for i in 0..usize::from(len) {
                write_volatile(buf.add(i), fill);
            }
            write_volatile(
                desc.add(3),
                RDES3_FD | RDES3_LD | u32::from(len) | extra_bits,
            );
        }
    }

    fn ring_of(
        capacity: u16,
        pool_buffers: usize,
        mapper: &MockMapper,
    ) -> (RxRing<FakeRxRegs>, FakeRxRegs, Arc<BufferPool>) {
        let regs = FakeRxRegs::default();
        let pool = BufferPool::new(pool_buffers, 2048);
        let mut ring = RxRing::new(capacity, regs.clone(), mapper).unwrap();
        ring.fill_all(mapper, &pool).unwrap();
        ring.start();
        (ring, regs, pool)
    }

    #[test]
    fn fill_all_arms_every_slot() {
        let mapper = MockMapper::new();
        let (ring, regs, pool) = ring_of(4, 8, &mapper);
        assert_eq!(ring.armed(), 4);
        assert!(!ring.is_stalled());
        assert_eq!(pool.available(), 4);
        assert_eq!(mapper.active_mappings(), 4);

        let state = regs.0.lock();
        assert_eq!(state.len, 4);
        // Tail names the last armed descriptor, slot 3.
        assert_eq!(state.tail, state.base + 3 * 16);
        assert!(state.enabled);
    }

    #[test]
    fn fill_all_fails_when_pool_is_too_small() {
        let mapper = MockMapper::new();
        let pool = BufferPool::new(2, 2048);
        let mut ring = RxRing::new(4, FakeRxRegs::default(), &mapper).unwrap();
        assert!(ring.fill_all(&mapper, &pool).is_err());
        ring.reset(&mapper);
        assert_eq!(pool.available(), 2);
        assert_eq!(mapper.active_mappings(), 0);
    }

    #[test]
    fn drain_delivers_frames_in_order() {
        let mapper = MockMapper::new();
        let (mut ring, regs, _pool) = ring_of(4, 8, &mapper);
        deliver_frame(&regs, 0, 64, 0x11, 0);
        deliver_frame(&regs, 1, 1500, 0x22, 0);

        let batch = ring.drain(&mapper, &_pool);
        assert_eq!(batch.frames.len(), 2);
        assert_eq!(batch.stalled, 0);
        assert_eq!(batch.frames[0].len(), 64);
        assert!(batch.frames[0].iter().all(|&b| b == 0x11));
        assert_eq!(batch.frames[1].len(), 1500);
        assert!(batch.frames[1].iter().all(|&b| b == 0x22));
        // Both slots were re-armed.
        assert_eq!(ring.armed(), 4);
    }

    #[test]
    fn errored_and_empty_writebacks_are_dropped() {
        let mapper = MockMapper::new();
        let (mut ring, regs, pool) = ring_of(4, 8, &mapper);
        let before = pool.available();
        deliver_frame(&regs, 0, 100, 0x33, RDES3_ES);
        deliver_frame(&regs, 1, 0, 0x44, 0);

        let batch = ring.drain(&mapper, &pool);
        assert!(batch.frames.is_empty());
        assert_eq!(batch.errored, 1);
        assert_eq!(batch.empty, 1);
        // Dropped buffers went back to the pool, refill took two out again.
        assert_eq!(pool.available(), before);
        assert_eq!(ring.armed(), 4);
    }

    #[test]
    fn single_completion_rearms_only_that_slot() {
        // Ring of 2, both armed; one 64-byte frame lands in slot 0.
        let mapper = MockMapper::new();
        let (mut ring, regs, _pool) = ring_of(2, 4, &mapper);
        deliver_frame(&regs, 0, 64, 0x12, 0);

        let batch = ring.drain(&mapper, &_pool);
        assert_eq!(batch.frames.len(), 1);
        assert_eq!(batch.frames[0].len(), 64);
        assert_eq!(batch.stalled, 0);
        // Slot 0 was re-armed with a fresh buffer; slot 1 is untouched and
        // still device-owned.
        assert_eq!(ring.armed(), 2);
        assert!(ring.arena.get(0).is_owned_by_hw());
        assert!(ring.arena.get(1).is_owned_by_hw());
    }

    #[test]
    fn stall_heals_once_buffers_return() {
        // Ring of 2 backed by a pool of exactly 2 buffers: delivering a frame
        // to the consumer leaves nothing to re-arm with until they drop it.
        let mapper = MockMapper::new();
        let (mut ring, regs, pool) = ring_of(2, 2, &mapper);
        assert_eq!(pool.available(), 0);

        deliver_frame(&regs, 0, 128, 0x55, 0);
        let batch = ring.drain(&mapper, &pool);
        assert_eq!(batch.frames.len(), 1);
        assert_eq!(batch.stalled, 1);
        assert_eq!(ring.armed(), 1);

        // Second frame lands while the consumer still holds the first.
        deliver_frame(&regs, 1, 256, 0x66, 0);
        let batch2 = ring.drain(&mapper, &pool);
        assert_eq!(batch2.frames.len(), 1);
        assert_eq!(batch2.stalled, 2);
        assert_eq!(ring.armed(), 0);
        assert!(ring.is_stalled());

        // Consumer finishes with both frames; the next drain re-arms both
        // holes even with no new completions.
        drop(batch.frames);
        drop(batch2.frames);
        let tail_writes_before = regs.0.lock().tail_writes;
        let batch3 = ring.drain(&mapper, &pool);
        assert!(batch3.frames.is_empty());
        assert_eq!(batch3.stalled, 0);
        assert_eq!(ring.armed(), 2);
        assert!(!ring.is_stalled());
        assert_eq!(regs.0.lock().tail_writes, tail_writes_before + 1);
    }

    #[test]
    fn flaky_allocator_stalls_then_recovers() {
        let mapper = MockMapper::new();
        let regs = FakeRxRegs::default();
        let pool = BufferPool::new(8, 2048);
        let alloc = FlakyAllocator::new(pool);
        let mut ring = RxRing::new(4, regs.clone(), &mapper).unwrap();
        ring.fill_all(&mapper, &alloc).unwrap();
        ring.start();

        deliver_frame(&regs, 0, 60, 0x77, 0);
        alloc.fail_next(1);
        let batch = ring.drain(&mapper, &alloc);
        assert_eq!(batch.frames.len(), 1);
        assert_eq!(batch.stalled, 1);

        let batch2 = ring.drain(&mapper, &alloc);
        assert_eq!(batch2.stalled, 0);
        assert_eq!(ring.armed(), 4);
    }

    #[test]
    fn reset_recycles_all_buffers() {
        let mapper = MockMapper::new();
        let (mut ring, _regs, pool) = ring_of(4, 4, &mapper);
        assert_eq!(pool.available(), 0);
        ring.disable();
        ring.reset(&mapper);
        assert_eq!(ring.armed(), 0);
        assert_eq!(pool.available(), 4);
        assert_eq!(mapper.active_mappings(), 0);
    }
}
