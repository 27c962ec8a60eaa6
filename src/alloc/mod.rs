//! # Alloc
//!
//! Allocates executable memory close to a given address, so that trampolines can reach the
//! code they were moved out of with 32-bit relative branches.
//!
//! Taken from detour-rs with slight modifications: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;

use self::search::{Direction, FreePages};

pub mod search;

/// Maximum distance between an allocation and the address it was requested near (2 GiB)
pub const DEFAULT_MAX_DISTANCE: usize = 0x8000_0000;

/// A block handed out by [`ProximityAllocator`]
pub type Allocation = SliceBox<u8>;

/// Errors while creating proximity allocations
#[derive(Debug, Error)]
pub enum AllocError {
    /// Ran out of memory within an acceptable distance of the requested address
    #[error("no free memory within range of {0:#x}")]
    OutOfRange(usize),
    /// Error while mapping a pool
    #[error("{0}")]
    Mmap(mmap::MapError),
    /// Error while querying the page map
    #[error("{0}")]
    Region(#[from] region::Error),
}

/// Pools of read-write-execute memory, each serving allocations near where it was mapped
pub struct ProximityAllocator {
    /// Max distance between a requested address and an allocation serving it
    max_distance: usize,
    /// Live pools
    pools: Vec<Pool>,
}

/// A mapped pool and the bookkeeping needed to release it
struct Pool {
    /// Allocator over the mapped bytes
    slices: SlicePool<u8>,
    /// Addresses covered by the mapping
    span: Range<usize>,
    /// Allocations currently handed out from this pool
    live: usize,
}

impl ProximityAllocator {
    /// Creates an allocator with no pools
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pools: Vec::new(),
        }
    }

    /// Allocates `size` bytes within `max_distance` of `origin`
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<Allocation, AllocError> {
        let range =
            origin.saturating_sub(self.max_distance)..origin.saturating_add(self.max_distance);

        for pool in self.pools.iter_mut() {
            if !(range.contains(&pool.span.start) && range.contains(&(pool.span.end - 1))) {
                continue;
            }
            if let Some(allocation) = pool.slices.alloc(size) {
                pool.live += 1;
                return Ok(allocation);
            }
        }

        let mut pool = Self::map_pool(&range, origin, size)?;
        let allocation = pool.slices.alloc(size).ok_or(AllocError::OutOfRange(origin))?;
        pool.live += 1;
        self.pools.push(pool);
        Ok(allocation)
    }

    /// Returns an allocation, unmapping its pool once nothing else lives in it
    ///
    /// Returns false if the allocation does not belong to this allocator.
    pub fn release(&mut self, allocation: Allocation) -> bool {
        let address = allocation.as_ptr() as usize;
        let Some(index) = self
            .pools
            .iter()
            .position(|pool| pool.span.contains(&address))
        else {
            return false;
        };
        drop(allocation);

        let pool = &mut self.pools[index];
        pool.live -= 1;
        if pool.live == 0 {
            self.pools.remove(index);
        }
        true
    }

    /// Maps a new pool large enough for `size` as close to `origin` as possible
    fn map_pool(range: &Range<usize>, origin: usize, size: usize) -> Result<Pool, AllocError> {
        let up = FreePages::new(origin, range.clone(), Direction::Up);
        let down = FreePages::new(origin, range.clone(), Direction::Down);

        // search upwards first; some platforms refuse to map below the executable
        for candidate in up.chain(down) {
            match Self::map_fixed(candidate?, size) {
                // the address is only a hint, the mapping may land elsewhere
                Ok(pool) if range.contains(&pool.span.start) => return Ok(pool),
                Ok(_) | Err(AllocError::Mmap(mmap::MapError::ErrNoMem)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(AllocError::OutOfRange(origin))
    }

    /// Maps read-write-execute memory exactly at `address`
    fn map_fixed(address: usize, size: usize) -> Result<Pool, AllocError> {
        let page = region::page::size();
        let map = mmap::MemoryMap::new(
            (size + page - 1) & !(page - 1),
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const u8),
            ],
        )
        .map_err(AllocError::Mmap)?;
        let span = map.data() as usize..map.data() as usize + map.len();
        Ok(Pool {
            slices: SlicePool::new(PoolMemory(map)),
            span,
            live: 0,
        })
    }
}

/// Memory map adapter giving [`SlicePool`] access to its bytes
struct PoolMemory(mmap::MemoryMap);

impl AsRef<[u8]> for PoolMemory {
    fn as_ref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for PoolMemory {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

// the map is only ever accessed through the pool, which synchronises access
unsafe impl Send for PoolMemory {}
unsafe impl Sync for PoolMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Allocations land within range of the origin and are writable
    fn test_allocate_near() {
        let anchor = vec![0u8; 16];
        let origin = anchor.as_ptr() as usize;
        let mut allocator = ProximityAllocator::new(DEFAULT_MAX_DISTANCE);

        let mut block = allocator.allocate(origin, 32).unwrap();
        let address = block.as_ptr() as usize;
        assert!(address.abs_diff(origin) < DEFAULT_MAX_DISTANCE);

        block.copy_from_slice(&[0x90; 32]);
        assert_eq!(block[31], 0x90);

        assert!(allocator.release(block));
        assert!(allocator.pools.is_empty());
    }
}
