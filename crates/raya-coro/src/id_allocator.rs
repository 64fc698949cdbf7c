//! Coroutine id space
//!
//! Fixed-size bitset with round-robin reuse: the search for a free id starts
//! just after the last id handed out, so a freed id is not recycled until the
//! cursor wraps around. Id 0 is reserved and never allocated.

use crate::coroutine::CoroutineId;

const WORD_BITS: usize = u64::BITS as usize;

/// Bitset allocator for coroutine ids
#[derive(Debug)]
pub struct CoroutineIdAllocator {
    words: Vec<u64>,
    capacity: usize,
    cursor: usize,
    in_use: usize,
}

impl CoroutineIdAllocator {
    /// Create an allocator for ids `1..capacity`
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let mut words = vec![0u64; capacity.div_ceil(WORD_BITS)];
        words[0] |= 1;
        Self {
            words,
            capacity,
            cursor: 1,
            in_use: 0,
        }
    }

    fn is_set(&self, index: usize) -> bool {
        self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    fn set(&mut self, index: usize) {
        self.words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
    }

    fn clear(&mut self, index: usize) {
        self.words[index / WORD_BITS] &= !(1u64 << (index % WORD_BITS));
    }

    /// Allocate the next free id, or `None` when the space is exhausted
    pub fn allocate(&mut self) -> Option<CoroutineId> {
        if self.in_use + 1 >= self.capacity {
            return None;
        }

        let mut index = self.cursor;
        for _ in 0..self.capacity {
            if index >= self.capacity {
                index = 1;
            }
            // Skip whole words that are full
            if index % WORD_BITS == 0 && self.words[index / WORD_BITS] == u64::MAX {
                index += WORD_BITS;
                continue;
            }
            if !self.is_set(index) {
                self.set(index);
                self.in_use += 1;
                self.cursor = index + 1;
                return Some(CoroutineId::from_u32(index as u32));
            }
            index += 1;
        }
        None
    }

    /// Return an id to the pool. Returns false if it was not allocated.
    pub fn free(&mut self, id: CoroutineId) -> bool {
        let index = id.as_u32() as usize;
        if index == 0 || index >= self.capacity || !self.is_set(index) {
            return false;
        }
        self.clear(index);
        self.in_use -= 1;
        true
    }

    /// Whether `id` is currently handed out
    pub fn is_allocated(&self, id: CoroutineId) -> bool {
        let index = id.as_u32() as usize;
        index != 0 && index < self.capacity && self.is_set(index)
    }

    /// Number of ids currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Size of the id space, including the reserved id 0
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
