//! A free-list byte arena used to hand out receive/send buffers without
//! touching the global allocator on the hot path.
//!
//! Each allocation is preceded by a 4-byte header: 24 bits of length plus a
//! 1-bit allocated flag (7 bits reserved). Free regions are walked linearly
//! and merged forward on free; allocations smaller than the spillover
//! threshold consume the whole free region instead of splitting it, trading
//! a little space for fewer, larger free regions.

use std::sync::Mutex;

use tracing::warn;

use crate::error::ArenaError;

const HEADER_SIZE: usize = 4;
const LENGTH_MASK: u32 = 0x00FF_FFFF;
const ALLOCATED_BIT: u32 = 1 << 24;
const MAX_LENGTH: usize = LENGTH_MASK as usize;

/// Bytes below which a split is skipped and the whole free region is handed
/// out instead, to avoid littering the arena with slivers nobody can use.
pub const ALLOCATION_SPILLOVER_THRESHOLD: usize = 128;

struct Inner {
    buffer: Vec<u8>,
}

impl Inner {
    fn header_at(&self, offset: usize) -> u32 {
        let bytes = &self.buffer[offset..offset + HEADER_SIZE];
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    fn set_header_at(&mut self, offset: usize, length: u32, allocated: bool) {
        let mut value = length & LENGTH_MASK;
        if allocated {
            value |= ALLOCATED_BIT;
        }
        self.buffer[offset..offset + HEADER_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    fn length_at(&self, offset: usize) -> usize {
        (self.header_at(offset) & LENGTH_MASK) as usize
    }

    fn is_allocated_at(&self, offset: usize) -> bool {
        self.header_at(offset) & ALLOCATED_BIT != 0
    }

    /// Finds the first free header whose region is at least `size` bytes,
    /// returning its offset. Mirrors `find_free_header` in the original
    /// allocator: the walk terminates once it has covered the whole arena.
    fn find_free_header(&self, size: usize) -> Option<usize> {
        let mut offset = 0;
        while offset < self.buffer.len() {
            let length = self.length_at(offset);
            if length == 0 {
                return None;
            }
            if !self.is_allocated_at(offset) && length >= size {
                return Some(offset);
            }
            offset += HEADER_SIZE + length;
        }
        None
    }

    /// Splits the free region at `offset` (known to be >= `size`) so that
    /// exactly `size` bytes are handed out, unless the remainder would be
    /// too small to be worth keeping as its own free region.
    fn take_region(&mut self, offset: usize, size: usize) {
        let length = self.length_at(offset);
        let remainder = length - size;
        if remainder < ALLOCATION_SPILLOVER_THRESHOLD + HEADER_SIZE {
            self.set_header_at(offset, length as u32, true);
        } else {
            self.set_header_at(offset, size as u32, true);
            let next_offset = offset + HEADER_SIZE + size;
            let next_length = remainder - HEADER_SIZE;
            self.set_header_at(next_offset, next_length as u32, false);
        }
    }

    fn free_at(&mut self, offset: usize, requested: usize) {
        let length = self.length_at(offset);
        let next_offset = offset + HEADER_SIZE + length;

        if requested == 0 || requested >= length {
            self.set_header_at(offset, length as u32, false);
            self.try_merge_forward(offset);
            return;
        }

        // Partial free: shrink this region to `requested` bytes and either
        // extend a free neighbour backwards or carve out a fresh one.
        let freed_len = length - requested;
        self.set_header_at(offset, requested as u32, true);
        let freed_offset = offset + HEADER_SIZE + requested;

        if next_offset < self.buffer.len() && !self.is_allocated_at(next_offset) {
            let next_len = self.length_at(next_offset);
            self.set_header_at(freed_offset, (freed_len - HEADER_SIZE + next_len) as u32, false);
        } else {
            self.set_header_at(freed_offset, (freed_len - HEADER_SIZE) as u32, false);
        }
    }

    fn try_merge_forward(&mut self, offset: usize) {
        let length = self.length_at(offset);
        let next_offset = offset + HEADER_SIZE + length;
        if next_offset < self.buffer.len() && !self.is_allocated_at(next_offset) {
            let next_length = self.length_at(next_offset);
            self.set_header_at(offset, (length + HEADER_SIZE + next_length) as u32, false);
        }
    }

}

/// A single allocation returned by [`Arena::allocate`]. Dropping it without
/// calling [`Arena::free`] leaks the backing region until the arena itself
/// is dropped, matching the original's "the arena reclaims everything on
/// destroy" behaviour for buffers nobody got around to freeing.
#[derive(Debug)]
pub struct Allocation {
    offset: usize,
    len: usize,
}

impl Allocation {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct Arena {
    inner: Mutex<Inner>,
}

impl Arena {
    pub fn new(size: usize) -> Self {
        let mut buffer = vec![0u8; size];
        let length = size.saturating_sub(HEADER_SIZE).min(MAX_LENGTH) as u32;
        buffer[0..HEADER_SIZE].copy_from_slice(&length.to_le_bytes());
        Self { inner: Mutex::new(Inner { buffer }) }
    }

    /// Allocates a fresh region of exactly `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<Allocation, ArenaError> {
        if size == 0 {
            return Err(ArenaError::ZeroSize);
        }
        if size > MAX_LENGTH {
            return Err(ArenaError::TooLarge(size));
        }

        let mut inner = self.inner.lock().unwrap();
        let offset = inner.find_free_header(size).ok_or_else(|| {
            warn!(size, "arena has no free region large enough for allocation");
            ArenaError::NoFit
        })?;
        inner.take_region(offset, size);
        Ok(Allocation { offset, len: size })
    }

    /// Grows an existing allocation in place by extending into the
    /// immediately-following free region, or copy-relocates it into a fresh,
    /// larger region if there isn't enough room to extend. Mirrors
    /// `gracht_arena_allocate(arena, allocation, size)` in the original.
    pub fn grow(&self, allocation: Allocation, additional: usize) -> Result<Allocation, ArenaError> {
        if additional == 0 {
            return Ok(allocation);
        }
        let new_size = allocation
            .len
            .checked_add(additional)
            .ok_or(ArenaError::TooLarge(usize::MAX))?;
        if new_size > MAX_LENGTH {
            return Err(ArenaError::TooLarge(new_size));
        }

        let mut inner = self.inner.lock().unwrap();
        let next_offset = allocation.offset + HEADER_SIZE + allocation.len;
        let can_extend = next_offset < inner.buffer.len()
            && !inner.is_allocated_at(next_offset)
            && inner.length_at(next_offset) + HEADER_SIZE >= additional;

        if can_extend {
            let next_length = inner.length_at(next_offset);
            let merged = allocation.len + HEADER_SIZE + next_length;
            inner.set_header_at(allocation.offset, merged as u32, true);
            inner.take_region(allocation.offset, new_size);
            return Ok(Allocation { offset: allocation.offset, len: new_size });
        }
        drop(inner);

        // Copy-relocate: allocate a fresh region, copy the old bytes over,
        // free the old one.
        let fresh = self.allocate(new_size)?;
        {
            let mut inner = self.inner.lock().unwrap();
            let src_start = allocation.offset + HEADER_SIZE;
            let old_bytes = inner.buffer[src_start..src_start + allocation.len].to_vec();
            let dst_start = fresh.offset + HEADER_SIZE;
            inner.buffer[dst_start..dst_start + allocation.len].copy_from_slice(&old_bytes);
        }
        self.free(allocation);
        Ok(fresh)
    }

    pub fn free(&self, allocation: Allocation) {
        let mut inner = self.inner.lock().unwrap();
        inner.free_at(allocation.offset, allocation.len);
    }

    /// Frees only the first `keep..len` bytes of the allocation, shrinking
    /// it down to `keep` bytes and returning the shrunk allocation. Used by
    /// the server to release the unused tail of an over-sized receive
    /// buffer once the real message length is known.
    pub fn shrink(&self, allocation: Allocation, keep: usize) -> Allocation {
        debug_assert!(keep <= allocation.len);
        let mut inner = self.inner.lock().unwrap();
        inner.free_at(allocation.offset, keep);
        Allocation { offset: allocation.offset, len: keep }
    }

    pub fn read(&self, allocation: &Allocation, out: &mut [u8]) {
        let inner = self.inner.lock().unwrap();
        let start = allocation.offset + HEADER_SIZE;
        out[..allocation.len].copy_from_slice(&inner.buffer[start..start + allocation.len]);
    }

    pub fn write(&self, allocation: &Allocation, data: &[u8]) {
        debug_assert!(data.len() <= allocation.len);
        let mut inner = self.inner.lock().unwrap();
        let start = allocation.offset + HEADER_SIZE;
        inner.buffer[start..start + data.len()].copy_from_slice(data);
    }

    pub fn with_slice<R>(&self, allocation: &Allocation, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        let start = allocation.offset + HEADER_SIZE;
        f(&inner.buffer[start..start + allocation.len])
    }

    pub fn with_slice_mut<R>(&self, allocation: &Allocation, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let start = allocation.offset + HEADER_SIZE;
        let end = start + allocation.len;
        f(&mut inner.buffer[start..end])
    }
}
