//! In-memory fakes of the platform capabilities, used to drive the ring
//! engine without hardware: a mapping service that uses the buffer's own
//! memory address as its device address, and allocator wrappers that can be
//! made to fail on demand.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::{
    DeviceAddress, Direction, DmaMapper, Fragment, MapError, MapHandle, MappedRegion,
    ReceiveBuffer, RxBufferAllocator,
};

/// A mapping service whose device addresses are simply the host addresses of
/// the mapped bytes, so a fake hardware model can follow descriptor pointers
/// straight back into test memory.
///
/// Every map/unmap is tracked; unmapping a handle twice, or a handle that
/// was never issued, panics. The single-release tests rely on that.
pub struct MockMapper {
    next_handle: AtomicU64,
    active: Mutex<BTreeMap<u64, usize>>,
    fragment_size: AtomicUsize,
    fail_next: Mutex<Option<MapError>>,
    maps: AtomicU64,
    unmaps: AtomicU64,
}

impl MockMapper {
    /// A mapper that maps every buffer as a single contiguous fragment.
    pub fn new() -> MockMapper {
        MockMapper {
            next_handle: AtomicU64::new(1),
            active: Mutex::new(BTreeMap::new()),
            fragment_size: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
            maps: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
        }
    }

    /// A mapper that splits every buffer into fragments of at most
    /// `fragment_size` bytes, to exercise scatter-gather paths.
    pub fn with_fragment_size(fragment_size: usize) -> MockMapper {
        let mapper = MockMapper::new();
        mapper.fragment_size.store(fragment_size, Ordering::Relaxed);
        mapper
    }

    /// Makes the next `map_for_device` call fail with `err`.
    pub fn fail_next_map(&self, err: MapError) {
        *self.fail_next.lock() = Some(err);
    }

    /// Number of mappings currently live (mapped but not yet unmapped).
    pub fn active_mappings(&self) -> usize {
        self.active.lock().len()
    }

    /// Total `map_for_device` calls that succeeded.
    pub fn total_maps(&self) -> u64 {
        self.maps.load(Ordering::Relaxed)
    }

    /// Total `unmap` calls.
    pub fn total_unmaps(&self) -> u64 {
        self.unmaps.load(Ordering::Relaxed)
    }
}

impl Default for MockMapper {
    fn default() -> Self {
        MockMapper::new()
    }
}

impl DmaMapper for MockMapper {
    fn map_for_device(&self, buf: &[u8], _dir: Direction) -> Result<MappedRegion, MapError> {
        if let Some(err) = self.fail_next.lock().take() {
            return Err(err);
        }

        let chunk = self.fragment_size.load(Ordering::Relaxed);
        let mut fragments = alloc::vec::Vec::new();
        if chunk == 0 || chunk >= buf.len() {
            fragments.push(Fragment {
                addr: DeviceAddress::new(buf.as_ptr() as u64),
                len: buf.len(),
            });
        } else {
            let mut offset = 0;
            while offset < buf.len() {
                let len = chunk.min(buf.len() - offset);
                fragments.push(Fragment {
                    addr: DeviceAddress::new(buf[offset..].as_ptr() as u64),
                    len,
                });
                offset += len;
            }
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(handle, buf.len());
        self.maps.fetch_add(1, Ordering::Relaxed);
        Ok(MappedRegion {
            handle: MapHandle::new(handle),
            fragments,
        })
    }

    fn unmap(&self, handle: MapHandle) {
        let removed = self.active.lock().remove(&handle.raw());
        assert!(
            removed.is_some(),
            "MockMapper: unmap of unknown or already-released handle {:?}",
            handle
        );
        self.unmaps.fetch_add(1, Ordering::Relaxed);
    }

    fn coherent_device_addr(&self, va: *const u8) -> DeviceAddress {
        DeviceAddress::new(va as u64)
    }
}

/// Wraps an allocator and fails the next `fail_budget` allocations, for
/// exercising the receive stall/recovery path.
pub struct FlakyAllocator<A: RxBufferAllocator> {
    inner: A,
    fail_budget: AtomicUsize,
}

impl<A: RxBufferAllocator> FlakyAllocator<A> {
    pub fn new(inner: A) -> FlakyAllocator<A> {
        FlakyAllocator {
            inner,
            fail_budget: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` allocations fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_budget.store(n, Ordering::Relaxed);
    }
}

impl<A: RxBufferAllocator> RxBufferAllocator for FlakyAllocator<A> {
    fn alloc_receive_buffer(&self) -> Option<ReceiveBuffer> {
        let mut budget = self.fail_budget.load(Ordering::Relaxed);
        while budget > 0 {
            match self.fail_budget.compare_exchange(
                budget,
                budget - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return None,
                Err(actual) => budget = actual,
            }
        }
        self.inner.alloc_receive_buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferPool;

    #[test]
    fn mock_mapper_tracks_balance() {
        let mapper = MockMapper::new();
        let data = [0u8; 32];
        let region = mapper.map_for_device(&data, Direction::ToDevice).unwrap();
        assert_eq!(region.fragments.len(), 1);
        assert_eq!(region.fragments[0].len, 32);
        assert_eq!(mapper.active_mappings(), 1);
        mapper.unmap(region.handle);
        assert_eq!(mapper.active_mappings(), 0);
    }

    #[test]
    #[should_panic]
    fn mock_mapper_panics_on_double_unmap() {
        let mapper = MockMapper::new();
        let data = [0u8; 8];
        let region = mapper.map_for_device(&data, Direction::ToDevice).unwrap();
        mapper.unmap(region.handle);
        mapper.unmap(region.handle);
    }

    #[test]
    fn mock_mapper_splits_fragments() {
        let mapper = MockMapper::with_fragment_size(16);
        let data = [0u8; 40];
        let region = mapper.map_for_device(&data, Direction::ToDevice).unwrap();
        let lens: alloc::vec::Vec<usize> = region.fragments.iter().map(|f| f.len).collect();
        assert_eq!(lens, [16, 16, 8]);
        mapper.unmap(region.handle);
    }

    #[test]
    fn flaky_allocator_counts_down() {
        let pool = BufferPool::new(4, 64);
        let alloc = FlakyAllocator::new(pool);
        alloc.fail_next(2);
        assert!(alloc.alloc_receive_buffer().is_none());
        assert!(alloc.alloc_receive_buffer().is_none());
        assert!(alloc.alloc_receive_buffer().is_some());
    }
}
