//! A recycling pool of fixed-size receive buffers.
//!
//! The pool is the default [`RxBufferAllocator`]: the ring engine takes
//! buffers out of it on refill, and delivered frames return their storage on
//! drop. Running the pool dry is the normal source of the receive
//! allocation-stall path, so `alloc_receive_buffer` returning `None` is
//! expected behavior under load, not a fault.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

use crate::{ReceiveBuffer, RxBufferAllocator};

pub struct BufferPool {
    free: Mutex<VecDeque<Box<[u8]>>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Creates a pool preloaded with `count` buffers of `buffer_size` bytes,
    /// sized to the device's fixed receive segment size.
    pub fn new(count: usize, buffer_size: usize) -> Arc<BufferPool> {
        let mut free = VecDeque::with_capacity(count);
        for _ in 0..count {
            free.push_back(alloc::vec![0u8; buffer_size].into_boxed_slice());
        }
        Arc::new(BufferPool {
            free: Mutex::new(free),
            buffer_size,
        })
    }

    /// Size in bytes of every buffer this pool hands out.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn give_back(&self, storage: Box<[u8]>) {
        // Storage of a foreign size would poison future refills.
        if storage.len() == self.buffer_size {
            self.free.lock().push_back(storage);
        } else {
            log::error!(
                "BufferPool: dropped returned storage of wrong size {} (pool size {})",
                storage.len(),
                self.buffer_size
            );
        }
    }
}

impl RxBufferAllocator for Arc<BufferPool> {
    fn alloc_receive_buffer(&self) -> Option<ReceiveBuffer> {
        let storage = self.free.lock().pop_front()?;
        Some(ReceiveBuffer::new(storage, Some(self.clone())))
    }
}
