// Copyright (c) 2024, The CCat Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Session memory pool.
//!
//! Both codec sides draw variable-size packet buffers from one pool of
//! fixed-size 64-byte-aligned blocks recycled through a lock-free queue.
//! Requests larger than the block size fall through to exact-size aligned
//! allocations that are dropped on release instead of recycled. Blocks are
//! zeroed when returned so reused recovery accumulators start clean.

use crate::error::CcatError;
use aligned_box::AlignedBox;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

const BLOCK_ALIGN: usize = 64;

pub struct MemoryPool {
    free: ArrayQueue<AlignedBox<[u8]>>,
    block_size: usize,
}

impl MemoryPool {
    /// Creates a pool of `capacity` pre-zeroed blocks of `block_size` bytes.
    pub fn new(capacity: usize, block_size: usize) -> Result<Self, CcatError> {
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let block = AlignedBox::slice_from_value(BLOCK_ALIGN, block_size, 0u8)
                .map_err(|_| CcatError::OutOfMemory)?;
            let _ = free.push(block);
        }
        Ok(Self { free, block_size })
    }

    /// Allocates a zeroed buffer with a logical length of `len` bytes.
    pub fn alloc(pool: &Arc<MemoryPool>, len: usize) -> Result<PoolBlock, CcatError> {
        let buf = if len <= pool.block_size {
            match pool.free.pop() {
                Some(block) => block,
                None => AlignedBox::slice_from_value(BLOCK_ALIGN, pool.block_size, 0u8)
                    .map_err(|_| CcatError::OutOfMemory)?,
            }
        } else {
            AlignedBox::slice_from_value(BLOCK_ALIGN, len, 0u8)
                .map_err(|_| CcatError::OutOfMemory)?
        };
        Ok(PoolBlock {
            buf: Some(buf),
            len,
            pool: Arc::clone(pool),
        })
    }

    fn release(&self, mut block: AlignedBox<[u8]>) {
        if block.len() == self.block_size {
            // Clear before reuse so recycled accumulators start at zero.
            block.iter_mut().for_each(|b| *b = 0);
            let _ = self.free.push(block);
        }
    }
}

/// RAII handle to a pool buffer with a logical length. The buffer returns
/// to the pool when the handle drops.
pub struct PoolBlock {
    buf: Option<AlignedBox<[u8]>>,
    len: usize,
    pool: Arc<MemoryPool>,
}

impl PoolBlock {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf.as_ref().expect("pool buffer present")[..self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.buf.as_mut().expect("pool buffer present")[..len]
    }

    /// Shrinks the logical length; the physical block is untouched.
    pub fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.len);
        self.len = len;
    }
}

impl std::ops::Deref for PoolBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::ops::DerefMut for PoolBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
