/* Interpose (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

/// Default size of every buffer handed out by the pool.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Fixed-size byte buffer pool shared by every stream in the process.
///
/// Buffers are rented through [`BufferPool::rent`] and come back automatically when the
/// returned [`PooledBuffer`] is dropped, so early returns, `?`, and cancelled futures all
/// hand the memory back without extra bookkeeping.
pub struct BufferPool {
    buffer_size: usize,
    max_retained: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    stats: PoolStats,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_retained", &self.max_retained)
            .field("idle", &self.free.lock().len())
            .finish()
    }
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_retained: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size: buffer_size.max(1),
            max_retained,
            free: Mutex::new(Vec::with_capacity(max_retained.min(64))),
            stats: PoolStats::default(),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Takes a buffer from the idle list or allocates a fresh one.
    pub fn rent(self: &Arc<Self>) -> PooledBuffer {
        let reused = self.free.lock().pop();
        let data = match reused {
            Some(buf) => {
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.stats.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size].into_boxed_slice()
            }
        };
        self.stats.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            data: Some(data),
            pool: Arc::clone(self),
        }
    }

    fn give_back(&self, buf: Box<[u8]>) {
        self.stats.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.free.lock();
        if free.len() < self.max_retained && buf.len() == self.buffer_size {
            free.push(buf);
        }
    }

    pub fn metrics(&self) -> BufferPoolMetrics {
        BufferPoolMetrics {
            allocated: self.stats.allocated.load(Ordering::Relaxed),
            reused: self.stats.reused.load(Ordering::Relaxed),
            outstanding: self.stats.outstanding.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }
}

#[derive(Debug, Default)]
struct PoolStats {
    allocated: AtomicU64,
    reused: AtomicU64,
    outstanding: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPoolMetrics {
    pub allocated: u64,
    pub reused: u64,
    /// Buffers currently rented and not yet dropped.
    pub outstanding: u64,
    pub idle: usize,
}

/// RAII handle for a rented buffer.
pub struct PooledBuffer {
    data: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |buf| buf.len())
    }

    /// The pool this buffer goes back to.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.data.take() {
            self.pool.give_back(buf);
        }
    }
}
