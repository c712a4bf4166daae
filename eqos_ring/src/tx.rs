//! The transmit descriptor ring engine.
//!
//! A frame occupies one descriptor per mapped fragment, in consecutive ring
//! slots. The engine publishes all of a frame's descriptors before a single
//! tail-register write exposes the batch to the device, so the device never
//! sees a partially-enqueued frame. Completions come back strictly in ring
//! order: reclamation walks forward from the oldest in-flight slot and stops
//! at the first descriptor the device still owns.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;

use log::{error, warn};

use eqos_buffers::{DeviceAddress, Direction, DmaMapper, MapError, MapHandle, TransmitBuffer};
use eqos_descriptors::{TxDescriptor, MAX_BUFFER_LEN};

use crate::{descriptor_addr, DescriptorArena, RingIndex};

/// The transmit-channel ring registers, as a capability the ring engine is
/// handed at construction.
pub trait TxRingRegisters {
    /// Programs the device address of the first descriptor.
    fn set_tx_ring_base(&mut self, lo: u32, hi: u32);
    /// Programs the number of descriptors in the ring.
    fn set_tx_ring_len(&mut self, len: u16);
    /// Programs the tail pointer: the device address one past the last
    /// published descriptor. Writing it releases the batch to the device.
    fn set_tx_tail(&mut self, tail: DeviceAddress);
    /// Starts the channel's transmit DMA.
    fn enable_tx(&mut self);
    /// Asks the channel's transmit DMA to stop after the current descriptor.
    fn disable_tx(&mut self);
    /// Whether the transmit DMA has actually come to rest after a disable.
    fn tx_idle(&self) -> bool;
}

/// Why a frame was refused outright (retrying the same frame cannot help).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RejectReason {
    /// The frame has no payload.
    EmptyFrame,
    /// The frame's mapping needs more descriptors than the ring can ever
    /// dedicate to one frame, or a fragment exceeds the descriptor's length
    /// field.
    TooFragmented,
    /// The engine is not running.
    RingStopped,
}

/// Outcome of [`TxRing::try_enqueue`]. `Deferred` and `Rejected` hand the
/// buffer back so the caller can requeue or drop it.
pub enum EnqueueResult {
    /// The frame was published across this many descriptors.
    Enqueued { fragments: usize },
    /// No ring space (or a transient mapping shortage); retry after the next
    /// reclamation.
    Deferred(TransmitBuffer),
    /// The frame can never be sent as-is.
    Rejected(RejectReason, TransmitBuffer),
}

/// How the device disposed of a completed frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxStatus {
    Sent,
    /// The device could not fetch the frame's descriptors; the channel is in
    /// a suspect state and the caller should treat this as fatal.
    DescriptorError,
    /// The frame was lost to a transmit-path error (e.g. FIFO underflow).
    TransmitError,
}

/// A reclaimed frame: the buffer handed back to the caller and the status the
/// device reported for it.
pub struct TxCompletion {
    pub buffer: TransmitBuffer,
    pub status: TxStatus,
}

/// What a transmit ring slot currently holds.
enum TxSlot {
    Vacant,
    /// A non-final fragment of an in-flight frame; the frame's buffer lives
    /// in the slot of its last fragment.
    MidFragment,
    LastFragment(InFlightTx),
}

struct InFlightTx {
    buffer: TransmitBuffer,
    handle: MapHandle,
}

/// The transmit ring engine. Not internally synchronized; the driver wraps
/// it in a lock.
pub struct TxRing<R: TxRingRegisters> {
    arena: DescriptorArena<TxDescriptor>,
    slots: Box<[TxSlot]>,
    /// Next slot to publish into.
    cur: RingIndex,
    /// Descriptors currently owned by the device (or completed but not yet
    /// reclaimed). Never exceeds `capacity - 1`, so the tail can never catch
    /// the head.
    queued: u16,
    /// Most descriptors one frame may occupy.
    scatter_limit: u16,
    base: DeviceAddress,
    regs: R,
}

impl<R: TxRingRegisters> TxRing<R> {
    /// Allocates a ring of `capacity` descriptors over `regs`, allowing each
    /// frame at most `scatter_limit` fragments. The ring is not programmed
    /// into the device until [`start`](TxRing::start).
    pub fn new(
        capacity: u16,
        scatter_limit: u16,
        regs: R,
        mapper: &dyn DmaMapper,
    ) -> Result<TxRing<R>, &'static str> {
        if scatter_limit == 0 {
            return Err("tx: scatter limit must be nonzero");
        }
        let arena = DescriptorArena::new(capacity)?;
        let base = mapper.coherent_device_addr(arena.base_ptr());
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || TxSlot::Vacant);
        Ok(TxRing {
            arena,
            slots: slots.into_boxed_slice(),
            cur: RingIndex::zero(capacity),
            queued: 0,
            // A frame can never span more than capacity - 1 descriptors.
            scatter_limit: scatter_limit.min(capacity - 1),
            base,
            regs,
        })
    }

    pub fn capacity(&self) -> u16 {
        self.arena.capacity()
    }

    /// Descriptors currently handed to the device or awaiting reclamation.
    pub fn queued(&self) -> u16 {
        self.queued
    }

    /// Descriptors still free for new frames.
    pub fn available(&self) -> u16 {
        self.capacity() - 1 - self.queued
    }

    /// Programs the ring into the channel registers and starts transmit DMA.
    /// The ring must be empty (freshly created or reset).
    pub fn start(&mut self) {
        self.regs.set_tx_ring_base(self.base.lower_32(), self.base.upper_32());
        self.regs.set_tx_ring_len(self.capacity());
        self.regs.set_tx_tail(descriptor_addr(self.base, self.cur, mem::size_of::<TxDescriptor>()));
        self.regs.enable_tx();
    }

    /// Asks the transmit DMA to stop. The descriptor it is currently sending
    /// may still complete; poll [`is_idle`](TxRing::is_idle) before reset.
    pub fn disable(&mut self) {
        self.regs.disable_tx();
    }

    pub fn is_idle(&self) -> bool {
        self.regs.tx_idle()
    }

    /// Maps `buffer` and publishes it across consecutive descriptors,
    /// releasing the whole frame to the device with one tail write.
    pub fn try_enqueue(&mut self, buffer: TransmitBuffer, mapper: &dyn DmaMapper) -> EnqueueResult {
        if buffer.length() == 0 {
            return EnqueueResult::Rejected(RejectReason::EmptyFrame, buffer);
        }

        let region = match mapper.map_for_device(&buffer, Direction::ToDevice) {
            Ok(region) => region,
            Err(MapError::TooFragmented) => {
                return EnqueueResult::Rejected(RejectReason::TooFragmented, buffer);
            }
            Err(MapError::OutOfResources) => {
                // Transient shortage in the mapping service; the frame itself
                // is fine.
                return EnqueueResult::Deferred(buffer);
            }
        };

        let fragments = region.fragments.len();
        if fragments == 0
            || fragments > usize::from(self.scatter_limit)
            || region.fragments.iter().any(|f| f.len > MAX_BUFFER_LEN)
        {
            error!("tx: frame of {} bytes maps to {} fragments, over the {}-fragment limit",
                buffer.length(), fragments, self.scatter_limit);
            mapper.unmap(region.handle);
            return EnqueueResult::Rejected(RejectReason::TooFragmented, buffer);
        }
        if self.queued + fragments as u16 > self.capacity() - 1 {
            mapper.unmap(region.handle);
            return EnqueueResult::Deferred(buffer);
        }

        let frame_len = buffer.length();
        let last = fragments - 1;
        for (i, frag) in region.fragments.iter().enumerate() {
            let slot = self.cur.step(i as u16);
            self.arena
                .get_mut(slot.value())
                .publish(frag.addr, frag.len, i == 0, i == last, frame_len);
            if i != last {
                self.slots[usize::from(slot.value())] = TxSlot::MidFragment;
            }
        }
        let last_slot = self.cur.step(last as u16);
        self.slots[usize::from(last_slot.value())] = TxSlot::LastFragment(InFlightTx {
            buffer,
            handle: region.handle,
        });

        self.cur = self.cur.step(fragments as u16);
        self.queued += fragments as u16;
        // One tail write exposes the whole frame.
        self.regs.set_tx_tail(descriptor_addr(self.base, self.cur, mem::size_of::<TxDescriptor>()));
        EnqueueResult::Enqueued { fragments }
    }

    /// Walks completed descriptors from the oldest in-flight slot, returning
    /// finished frames in the order they were enqueued. Stops at the first
    /// descriptor the device still owns.
    pub fn reclaim(&mut self, mapper: &dyn DmaMapper) -> Vec<TxCompletion> {
        let mut completions = Vec::new();
        let mut oldest = self.cur.back(self.queued);
        while self.queued > 0 {
            let desc = self.arena.get(oldest.value());
            if desc.is_owned_by_hw() {
                break;
            }
            let status = if desc.descriptor_error() {
                TxStatus::DescriptorError
            } else if desc.has_error() {
                TxStatus::TransmitError
            } else {
                TxStatus::Sent
            };
            match mem::replace(&mut self.slots[usize::from(oldest.value())], TxSlot::Vacant) {
                TxSlot::MidFragment => {}
                TxSlot::LastFragment(inflight) => {
                    // Status is reported on the frame's last descriptor.
                    mapper.unmap(inflight.handle);
                    completions.push(TxCompletion {
                        buffer: inflight.buffer,
                        status,
                    });
                }
                TxSlot::Vacant => {
                    error!("tx: reclaiming slot {} with no in-flight record", oldest.value());
                }
            }
            oldest = oldest.next();
            self.queued -= 1;
        }
        completions
    }

    /// Discards all in-flight frames and returns the ring to its freshly
    /// created state. Only meaningful after the channel has been disabled.
    /// Returns the number of frames that were discarded.
    pub fn reset(&mut self, mapper: &dyn DmaMapper) -> usize {
        let mut discarded = 0;
        for slot in self.slots.iter_mut() {
            if let TxSlot::LastFragment(inflight) = mem::replace(slot, TxSlot::Vacant) {
                mapper.unmap(inflight.handle);
                discarded += 1;
            }
        }
        if discarded > 0 {
            warn!("tx: reset discarded {} in-flight frame(s)", discarded);
        }
        for i in 0..self.capacity() {
            self.arena.get_mut(i).clear();
        }
        self.cur = RingIndex::zero(self.capacity());
        self.queued = 0;
        discarded
    }
}
