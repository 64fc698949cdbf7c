//! Stack pool for reusing fiber stacks across coroutine lifetimes.
//!
//! When a fiber finishes, its stack mapping is returned to the pool. The next
//! launched coroutine acquires the recycled mapping instead of asking the OS
//! for a fresh one.

use crate::error::CoroError;
use corosensei::stack::DefaultStack;
use parking_lot::Mutex;

struct PooledStack(DefaultStack);

// SAFETY: a pooled stack is an idle memory mapping that no fiber is running
// on; moving it between threads is moving a pointer and a length.
unsafe impl Send for PooledStack {}

/// Pool of reusable fiber stacks.
pub struct StackPool {
    stacks: Mutex<Vec<PooledStack>>,
    max_size: usize,
    stack_size: usize,
}

impl StackPool {
    /// Create a pool that holds up to `max_size` stacks of `stack_size` bytes.
    pub fn new(max_size: usize, stack_size: usize) -> Self {
        Self {
            stacks: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
            stack_size,
        }
    }

    /// Get a stack from the pool, or map a new one.
    pub fn acquire(&self) -> Result<DefaultStack, CoroError> {
        if let Some(PooledStack(stack)) = self.stacks.lock().pop() {
            return Ok(stack);
        }
        Ok(DefaultStack::new(self.stack_size)?)
    }

    /// Return a stack to the pool for reuse.
    pub fn release(&self, stack: DefaultStack) {
        let mut pool = self.stacks.lock();
        if pool.len() < self.max_size {
            pool.push(PooledStack(stack));
        }
        // Pool full: the stack is unmapped on drop
    }

    /// Number of stacks waiting for reuse
    pub fn len(&self) -> usize {
        self.stacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.lock().is_empty()
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}
