//! The transmit and receive descriptor ring engines for the EQOS DMA
//! controller.
//!
//! Each ring owns a coherent arena of descriptors, the bookkeeping that pairs
//! in-flight buffers with ring slots, and the channel's ring registers
//! (injected as a capability trait so the engine can be driven against fake
//! registers in tests). The rings never take locks themselves; the driver
//! crate wraps each ring in a lock and serializes access.

#![no_std]

extern crate alloc;

mod arena;
pub mod rx;
pub mod tx;

pub use arena::DescriptorArena;

use eqos_buffers::DeviceAddress;

/// A position in a descriptor ring. Arithmetic on it always wraps at the
/// ring's capacity, so a raw slot number can never escape the valid range.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RingIndex {
    slot: u16,
    capacity: u16,
}

impl RingIndex {
    /// The first slot of a ring with the given capacity.
    pub fn zero(capacity: u16) -> RingIndex {
        RingIndex { slot: 0, capacity }
    }

    pub fn value(&self) -> u16 {
        self.slot
    }

    /// The slot `n` positions ahead, wrapping around the ring.
    pub fn step(self, n: u16) -> RingIndex {
        RingIndex {
            slot: (self.slot + n % self.capacity) % self.capacity,
            capacity: self.capacity,
        }
    }

    /// The next slot, wrapping around the ring.
    pub fn next(self) -> RingIndex {
        self.step(1)
    }

    /// The slot `n` positions behind, wrapping around the ring.
    pub fn back(self, n: u16) -> RingIndex {
        let n = n % self.capacity;
        RingIndex {
            slot: (self.slot + self.capacity - n) % self.capacity,
            capacity: self.capacity,
        }
    }
}

/// Device address of the descriptor at `index` in a ring based at `base`.
pub(crate) fn descriptor_addr(base: DeviceAddress, index: RingIndex, desc_size: usize) -> DeviceAddress {
    DeviceAddress::new(base.value() + u64::from(index.value()) * desc_size as u64)
}
