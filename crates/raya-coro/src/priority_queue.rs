//! Ready queue ordered by priority, then arrival
//!
//! Each entry carries a packed `u64` key: bit `ORDER_BITS + priority` marks
//! the priority level and the low `ORDER_BITS` bits hold an order value. The
//! heap is a max-heap over the key, so a higher priority always wins and,
//! within one level, the order value decides.
//!
//! Queue order hands out decreasing order values (earlier pushes win: FIFO).
//! Stack order hands out increasing order values (later pushes win: LIFO).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Low bits of the key reserved for the order value
pub const ORDER_BITS: u32 = 56;

const ORDER_MASK: u64 = (1u64 << ORDER_BITS) - 1;

/// Scheduling priority of a coroutine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoroutinePriority {
    /// Background work
    Low = 0,
    /// Ordinary coroutines
    #[default]
    Medium = 1,
    /// Latency sensitive work
    High = 2,
    /// Runtime-internal continuations
    Critical = 3,
}

impl CoroutinePriority {
    /// Number of priority levels
    pub const COUNT: usize = 4;

    /// All levels, lowest first
    pub const ALL: [CoroutinePriority; Self::COUNT] = [
        CoroutinePriority::Low,
        CoroutinePriority::Medium,
        CoroutinePriority::High,
        CoroutinePriority::Critical,
    ];

    /// Numeric level
    pub fn level(self) -> u32 {
        self as u32
    }

    fn from_level(level: u32) -> Self {
        match level {
            0 => CoroutinePriority::Low,
            1 => CoroutinePriority::Medium,
            2 => CoroutinePriority::High,
            _ => CoroutinePriority::Critical,
        }
    }
}

/// How entries of the same priority are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDiscipline {
    /// First in, first out
    #[serde(rename = "queue")]
    Queue,
    /// Last in, first out
    #[serde(rename = "stack")]
    Stack,
}

struct HeapEntry<T> {
    key: u64,
    item: T,
}

impl<T> HeapEntry<T> {
    fn priority(&self) -> CoroutinePriority {
        let top_bit = 63 - self.key.leading_zeros();
        CoroutinePriority::from_level(top_bit - ORDER_BITS)
    }
}

impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for HeapEntry<T> {}

/// Binary max-heap over packed priority/order keys
pub struct PriorityQueue<T> {
    heap: BinaryHeap<HeapEntry<T>>,
    orders: [OrderDiscipline; CoroutinePriority::COUNT],
    queue_counter: u64,
    stack_counter: u64,
}

impl<T> PriorityQueue<T> {
    /// Create a queue with the given per-priority disciplines
    pub fn new(orders: [OrderDiscipline; CoroutinePriority::COUNT]) -> Self {
        Self {
            heap: BinaryHeap::new(),
            orders,
            queue_counter: 0,
            stack_counter: 0,
        }
    }

    /// Create a queue that is FIFO at every priority
    pub fn fifo() -> Self {
        Self::new([OrderDiscipline::Queue; CoroutinePriority::COUNT])
    }

    fn next_key(&mut self, priority: CoroutinePriority) -> u64 {
        let order = match self.orders[priority as usize] {
            OrderDiscipline::Queue => {
                let value = ORDER_MASK - (self.queue_counter & ORDER_MASK);
                self.queue_counter = self.queue_counter.wrapping_add(1);
                value
            }
            OrderDiscipline::Stack => {
                self.stack_counter = self.stack_counter.wrapping_add(1);
                self.stack_counter & ORDER_MASK
            }
        };
        (1u64 << (ORDER_BITS + priority.level())) | order
    }

    /// Push an item, O(log n)
    pub fn push(&mut self, item: T, priority: CoroutinePriority) {
        let key = self.next_key(priority);
        self.heap.push(HeapEntry { key, item });
    }

    /// Pop the highest-priority item, O(log n)
    pub fn pop(&mut self) -> Option<T> {
        self.heap.pop().map(|entry| entry.item)
    }

    /// Pop together with the priority the item was pushed at
    pub fn pop_with_priority(&mut self) -> Option<(T, CoroutinePriority)> {
        self.heap.pop().map(|entry| {
            let priority = entry.priority();
            (entry.item, priority)
        })
    }

    /// Item that `pop` would return
    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|entry| &entry.item)
    }

    /// Priority of the item that `pop` would return
    pub fn peek_priority(&self) -> Option<CoroutinePriority> {
        self.heap.peek().map(HeapEntry::priority)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Iterate in arbitrary (heap) order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.heap.iter().map(|entry| &entry.item)
    }

    /// Items in the order `pop` would return them, O(n log n)
    pub fn to_sorted_vec(&self) -> Vec<&T> {
        let mut entries: Vec<&HeapEntry<T>> = self.heap.iter().collect();
        entries.sort_unstable_by(|a, b| b.key.cmp(&a.key));
        entries.into_iter().map(|entry| &entry.item).collect()
    }

    /// Remove up to `limit` items matching `select`, preferring the ones that
    /// would be popped first, and repair the heap in O(n).
    ///
    /// Returned items keep their original priority so the receiver can push
    /// them back at the same level.
    pub fn remove_subset<F>(&mut self, mut select: F, limit: usize) -> Vec<(T, CoroutinePriority)>
    where
        F: FnMut(&T) -> bool,
    {
        if limit == 0 || self.heap.is_empty() {
            return Vec::new();
        }

        let entries = std::mem::take(&mut self.heap).into_vec();
        let mut candidates = Vec::new();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if select(&entry.item) {
                candidates.push(entry);
            } else {
                kept.push(entry);
            }
        }

        candidates.sort_unstable_by(|a, b| b.key.cmp(&a.key));
        let overflow = candidates.split_off(limit.min(candidates.len()));
        kept.extend(overflow);

        self.heap = BinaryHeap::from(kept);
        candidates
            .into_iter()
            .map(|entry| {
                let priority = entry.priority();
                (entry.item, priority)
            })
            .collect()
    }

    /// Rearrange items listed in pop order (as `remove_subset` returns them)
    /// so that pushing them one at a time into a queue with these disciplines
    /// pops them in the same relative order. Stack levels come out reversed.
    pub fn reinsertion_order(&self, items: Vec<(T, CoroutinePriority)>) -> Vec<(T, CoroutinePriority)> {
        let (stacked, mut ordered): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|(_, priority)| self.orders[*priority as usize] == OrderDiscipline::Stack);
        ordered.extend(stacked.into_iter().rev());
        ordered
    }

    /// Push items listed in pop order, keeping their relative order
    pub fn extend_ordered(&mut self, items: Vec<(T, CoroutinePriority)>) {
        for (item, priority) in self.reinsertion_order(items) {
            self.push(item, priority);
        }
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::fifo()
    }
}
