//! Buffers that are used to send and receive packets, plus the capability
//! traits through which the ring engine reaches the platform's DMA mapping
//! service and receive-buffer allocator.
//!
//! Nothing in this crate touches hardware: the mapping service and the
//! allocator are injected into the engine at construction time, so the whole
//! data path can be driven against fakes.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Deref, DerefMut};

pub mod mock;
mod pool;

pub use pool::BufferPool;

/// A device-visible (bus) address produced by the DMA mapping service.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    pub const fn new(addr: u64) -> DeviceAddress {
        DeviceAddress(addr)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The lower 32 bits, as written into a descriptor's address-low word.
    pub const fn lower_32(&self) -> u32 {
        self.0 as u32
    }

    /// The upper 32 bits, as written into a descriptor's address-high word.
    pub const fn upper_32(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceAddress({:#X})", self.0)
    }
}

/// Direction of a DMA transfer, from the device's point of view.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    /// The device reads from the buffer (transmit).
    ToDevice,
    /// The device writes into the buffer (receive).
    FromDevice,
}

/// One physically-contiguous piece of a buffer's device-visible mapping.
#[derive(Clone, Copy, Debug)]
pub struct Fragment {
    pub addr: DeviceAddress,
    pub len: usize,
}

/// An opaque token identifying one active mapping; handed back to
/// [`DmaMapper::unmap`] exactly once when the transfer completes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MapHandle(u64);

impl MapHandle {
    pub const fn new(raw: u64) -> MapHandle {
        MapHandle(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Why the mapping service refused to map a buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapError {
    /// The buffer crosses more non-contiguous regions than one descriptor
    /// chain can carry. Fatal for that buffer, not for the ring.
    TooFragmented,
    /// The mapping service is transiently out of resources (e.g. bounce
    /// space); the caller may retry later.
    OutOfResources,
}

/// A successful mapping: the fragments to program into descriptors and the
/// handle used to tear the mapping down.
pub struct MappedRegion {
    pub handle: MapHandle,
    pub fragments: Vec<Fragment>,
}

/// The platform's DMA mapping service.
///
/// Implementations translate driver-owned memory into device-visible
/// addresses. The engine holds exactly one mapping per in-flight buffer and
/// releases it exactly once.
pub trait DmaMapper {
    /// Produce a device-visible view of `buf` for a transfer in `dir`.
    fn map_for_device(&self, buf: &[u8], dir: Direction) -> Result<MappedRegion, MapError>;

    /// Tear down a mapping previously returned by `map_for_device`.
    fn unmap(&self, handle: MapHandle);

    /// Device-visible address of driver-owned *coherent* memory, used for the
    /// descriptor rings themselves (which are allocated by the engine, not
    /// mapped per-transfer).
    fn coherent_device_addr(&self, va: *const u8) -> DeviceAddress;
}

/// The platform's receive-buffer source, sized to the device's fixed receive
/// segment size. Returning `None` is a recoverable stall, not an error.
pub trait RxBufferAllocator {
    fn alloc_receive_buffer(&self) -> Option<ReceiveBuffer>;
}

// Lets callers share one mapping service between the driver and other users.
impl<T: DmaMapper + ?Sized> DmaMapper for Arc<T> {
    fn map_for_device(&self, buf: &[u8], dir: Direction) -> Result<MappedRegion, MapError> {
        (**self).map_for_device(buf, dir)
    }

    fn unmap(&self, handle: MapHandle) {
        (**self).unmap(handle)
    }

    fn coherent_device_addr(&self, va: *const u8) -> DeviceAddress {
        (**self).coherent_device_addr(va)
    }
}

/// A buffer holding one outbound packet.
/// Auto-dereferences into the byte slice of its payload.
pub struct TransmitBuffer {
    data: Box<[u8]>,
}

impl TransmitBuffer {
    /// Creates a new zero-filled TransmitBuffer with the given size in bytes.
    /// The size is a `u16` because that is the largest frame the MAC carries.
    pub fn new(size_in_bytes: u16) -> TransmitBuffer {
        TransmitBuffer {
            data: alloc::vec![0; size_in_bytes as usize].into_boxed_slice(),
        }
    }

    /// Creates a TransmitBuffer holding a copy of `payload`.
    pub fn from_slice(payload: &[u8]) -> TransmitBuffer {
        TransmitBuffer {
            data: payload.into(),
        }
    }

    pub fn length(&self) -> u16 {
        self.data.len() as u16
    }
}

impl Deref for TransmitBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for TransmitBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

/// A buffer that receives one packet from the device.
/// Auto-dereferences into the byte slice of its valid payload.
///
/// When dropped, its storage is automatically returned to the pool it was
/// allocated from (if any), so delivered frames recycle themselves once the
/// consumer is done with them.
pub struct ReceiveBuffer {
    storage: Box<[u8]>,
    length: u16,
    pool: Option<Arc<BufferPool>>,
}

impl ReceiveBuffer {
    /// Wraps `storage` as a receive buffer. The valid length starts out equal
    /// to the full capacity; the engine shrinks it to the completed frame
    /// length on delivery.
    pub fn new(storage: Box<[u8]>, pool: Option<Arc<BufferPool>>) -> ReceiveBuffer {
        let length = storage.len() as u16;
        ReceiveBuffer {
            storage,
            length,
            pool,
        }
    }

    /// The full size of the underlying storage, independent of the currently
    /// valid payload length. This is the region handed to the mapping service.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The whole storage region, for mapping; `deref` only covers the valid
    /// payload.
    pub fn storage(&self) -> &[u8] {
        &self.storage
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// Sets the buffer's valid payload length.
    ///
    /// Returns an error if the length exceeds the storage capacity.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if usize::from(length) > self.storage.len() {
            Err("ReceiveBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }
}

impl Deref for ReceiveBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.storage[..usize::from(self.length)]
    }
}

impl DerefMut for ReceiveBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.storage[..usize::from(self.length)]
    }
}

impl Drop for ReceiveBuffer {
    fn drop(&mut self) {
        // Steal the storage out of `self` by swapping in an empty boxed slice,
        // then hand the real allocation back to the pool for reuse.
        if let Some(pool) = self.pool.take() {
            pool.give_back(core::mem::take(&mut self.storage));
        }
    }
}
