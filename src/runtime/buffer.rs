//! Fixed-capacity buffers, the shared buffer pool, and per-connection
//! send queues.
//!
//! All outbound bytes live in pool buffers. The pool is an index-based
//! arena with an intrusive free list: each slot carries a link field that
//! is meaningful only while the slot sits on the free list or on one send
//! queue. Nothing is allocated after the pool is built.

use std::io;

use crate::limits::{BUF_CAP, POOL_SIZE};

/// A fixed-capacity byte container.
///
/// Bytes past `used` are undefined. Doubles as the per-connection input
/// buffer and as the payload of every pool slot.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) data: [u8; BUF_CAP],
    pub(crate) used: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: [0; BUF_CAP],
            used: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        BUF_CAP - self.used
    }

    /// Copy as much of `bytes` as fits, returning the number copied.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = self.remaining().min(bytes.len());
        self.data[self.used..self.used + n].copy_from_slice(&bytes[..n]);
        self.used += n;
        n
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.used]
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Slot {
    buf: Buffer,
    /// Next slot on the free list or on a send queue.
    next: Option<usize>,
}

/// Shared pool of `POOL_SIZE` fixed-size buffers.
///
/// `take` fails when the free list is empty; the caller treats that as a
/// process-fatal condition, so the error carries the diagnostic rather
/// than a retry hint.
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<Slot>,
    free_head: Option<usize>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_slots(POOL_SIZE)
    }

    pub fn with_slots(count: usize) -> Self {
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(Slot {
                buf: Buffer::new(),
                next: if i + 1 < count { Some(i + 1) } else { None },
            });
        }
        Self {
            slots,
            free_head: if count > 0 { Some(0) } else { None },
        }
    }

    /// Detach the head of the free list, reset for reuse.
    pub fn take(&mut self) -> io::Result<usize> {
        let idx = self.free_head.ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "memory limit exceeded")
        })?;
        self.free_head = self.slots[idx].next;
        self.slots[idx].buf.used = 0;
        self.slots[idx].next = None;
        Ok(idx)
    }

    /// Return a slot to the free list.
    ///
    /// The slot must not be linked into any send queue.
    pub fn release(&mut self, idx: usize) {
        debug_assert!(idx < self.slots.len(), "slot index out of bounds");
        self.slots[idx].next = self.free_head;
        self.free_head = Some(idx);
    }

    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn buffer(&self, idx: usize) -> &Buffer {
        &self.slots[idx].buf
    }

    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn buffer_mut(&mut self, idx: usize) -> &mut Buffer {
        &mut self.slots[idx].buf
    }

    pub(crate) fn link(&self, idx: usize) -> Option<usize> {
        self.slots[idx].next
    }

    pub(crate) fn set_link(&mut self, idx: usize, next: Option<usize>) {
        self.slots[idx].next = next;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently on the free list.
    pub fn available(&self) -> usize {
        let mut count = 0;
        let mut node = self.free_head;
        while let Some(idx) = node {
            count += 1;
            node = self.slots[idx].next;
        }
        count
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO of pool buffers pending transmission on one connection.
///
/// Every non-tail buffer is full: `enqueue` tops up the tail before taking
/// a new slot. `cursor` tracks how much of the head buffer has already
/// reached the socket, so a short write resumes instead of resending.
#[derive(Debug)]
pub struct SendQueue {
    head: Option<usize>,
    tail: Option<usize>,
    cursor: usize,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            cursor: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Append `bytes`, spanning as many pool buffers as needed.
    pub fn enqueue(&mut self, pool: &mut BufferPool, bytes: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < bytes.len() {
            let idx = match self.tail {
                Some(tail) if pool.buffer(tail).remaining() > 0 => tail,
                _ => self.grow(pool)?,
            };
            offset += pool.buffer_mut(idx).fill(&bytes[offset..]);
        }
        Ok(())
    }

    fn grow(&mut self, pool: &mut BufferPool) -> io::Result<usize> {
        let idx = pool.take()?;
        match self.tail {
            Some(tail) => pool.set_link(tail, Some(idx)),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        Ok(idx)
    }

    /// Account for `n` bytes written from the head buffer; once the head
    /// is fully transmitted it goes back to the pool.
    ///
    /// # Panics
    /// Panics if the queue is empty.
    pub fn advance(&mut self, pool: &mut BufferPool, n: usize) {
        let head = self.head.expect("advance on an empty send queue");
        self.cursor += n;
        debug_assert!(self.cursor <= pool.buffer(head).used);
        if self.cursor == pool.buffer(head).used {
            self.head = pool.link(head);
            pool.release(head);
            self.cursor = 0;
            if self.head.is_none() {
                self.tail = None;
            }
        }
    }

    /// Return every queued buffer to the pool without transmitting.
    pub fn release_all(&mut self, pool: &mut BufferPool) {
        while let Some(head) = self.head {
            self.head = pool.link(head);
            pool.release(head);
        }
        self.tail = None;
        self.cursor = 0;
    }

    /// Concatenate all queued bytes, ignoring the transmit cursor.
    #[cfg(test)]
    pub fn assemble(&self, pool: &BufferPool) -> Vec<u8> {
        let mut out = Vec::new();
        let mut node = self.head;
        while let Some(idx) = node {
            out.extend_from_slice(pool.buffer(idx).bytes());
            node = pool.link(idx);
        }
        out
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}
