//! Scratch buffers for decoded entries, recycled between requests.
//!
//! Every buffer is as large as the largest entry in the archive, so any one
//! of them will do for any request. Holding on to a few of them bounds how
//! much we allocate when pages are being decoded in parallel.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use log::*;

/// A fixed number of slots for idle scratch buffers
pub struct BufferPool {
    buffer_len: usize,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new(buffer_len: usize, capacity: usize) -> Self {
        Self {
            buffer_len,
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Length of every buffer this pool hands out
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Takes an idle buffer, or allocates one if there are none.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let retained = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .find_map(Option::take);
        let buffer = retained.unwrap_or_else(|| {
            trace!("Allocating a {} byte scratch buffer", self.buffer_len);
            vec![0; self.buffer_len]
        });
        PooledBuffer {
            pool: self,
            buffer,
            len: 0,
        }
    }

    /// Keeps `buffer` in the first empty slot, or frees it if there isn't one.
    pub fn release(&self, buffer: Vec<u8>) {
        if buffer.len() != self.buffer_len {
            return;
        }
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(buffer);
        } else {
            trace!("Buffer pool full; freeing a scratch buffer");
        }
    }

    /// How many idle buffers the pool is holding
    pub fn retained(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}

/// A scratch buffer checked out of a [`BufferPool`].
///
/// Derefs to the bytes that have been decoded into it so far,
/// and goes back to its pool when dropped.
pub struct PooledBuffer<'p> {
    pool: &'p BufferPool,
    buffer: Vec<u8>,
    len: usize,
}

impl PooledBuffer<'_> {
    /// The whole buffer, for decoding into
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Marks the first `len` bytes as holding data.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buffer.len());
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.len]
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}

impl std::fmt::Debug for PooledBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reuse() {
        let pool = BufferPool::new(16, 4);
        let mut first = pool.acquire();
        first.spare()[..3].copy_from_slice(b"abc");
        first.set_len(3);
        assert_eq!(&*first, b"abc");
        let address = first.spare().as_ptr();
        drop(first);
        assert_eq!(pool.retained(), 1);

        let mut second = pool.acquire();
        assert_eq!(second.spare().as_ptr(), address);
        assert_eq!(second.len(), 0);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_capacity_bound() {
        let pool = BufferPool::new(8, 4);
        let held: Vec<_> = (0..7).map(|_| pool.acquire()).collect();
        assert_eq!(pool.retained(), 0);
        drop(held);
        assert_eq!(pool.retained(), 4);

        for round in 0..5 {
            let held: Vec<_> = (0..round + 2).map(|_| pool.acquire()).collect();
            assert!(pool.retained() <= 4);
            drop(held);
            assert!(pool.retained() <= 4);
        }
    }

    #[test]
    fn test_foreign_buffers_are_freed() {
        let pool = BufferPool::new(8, 2);
        pool.release(vec![0; 3]);
        assert_eq!(pool.retained(), 0);
        pool.release(vec![0; 8]);
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn test_zero_capacity() {
        let pool = BufferPool::new(8, 0);
        drop(pool.acquire());
        assert_eq!(pool.retained(), 0);
    }
}
