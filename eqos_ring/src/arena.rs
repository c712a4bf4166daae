//! The coherent memory that holds a ring's descriptors.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;

use eqos_descriptors::RING_ALIGNMENT;

/// An owned, zero-initialized array of descriptors, aligned for the DMA
/// engine's descriptor fetches. The arena never reallocates or moves, so the
/// device address programmed into the ring-base register stays valid for the
/// arena's whole lifetime.
pub struct DescriptorArena<T> {
    base: NonNull<T>,
    capacity: u16,
    layout: Layout,
}

impl<T> DescriptorArena<T> {
    /// Allocates a zeroed arena of `capacity` descriptors.
    pub fn new(capacity: u16) -> Result<DescriptorArena<T>, &'static str> {
        if capacity == 0 {
            return Err("descriptor arena capacity must be nonzero");
        }
        let layout = Layout::array::<T>(capacity as usize)
            .and_then(|l| l.align_to(RING_ALIGNMENT))
            .map_err(|_| "invalid descriptor arena layout")?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr.cast::<T>()).ok_or("failed to allocate descriptor arena")?;
        Ok(DescriptorArena { base, capacity, layout })
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Host pointer to the first descriptor; the mapping service translates
    /// this into the device address programmed into the ring-base register.
    pub fn base_ptr(&self) -> *const u8 {
        self.base.as_ptr().cast::<u8>()
    }

    pub fn get(&self, index: u16) -> &T {
        assert!(index < self.capacity, "descriptor index out of range");
        unsafe { &*self.base.as_ptr().add(index as usize) }
    }

    pub fn get_mut(&mut self, index: u16) -> &mut T {
        assert!(index < self.capacity, "descriptor index out of range");
        unsafe { &mut *self.base.as_ptr().add(index as usize) }
    }
}

impl<T> Drop for DescriptorArena<T> {
    fn drop(&mut self) {
        // Descriptors are plain words with no drop glue of their own.
        unsafe { dealloc(self.base.as_ptr().cast::<u8>(), self.layout) }
    }
}

// The arena exclusively owns its allocation.
unsafe impl<T: Send> Send for DescriptorArena<T> {}
