//! Bounded pool of reference-counted, reusable GPU objects.
//!
//! Used for bitstream buffers: a fixed number of buffers cycle between the
//! pool's free set and in-flight pictures. Release is implicit - when the
//! last outside reference drops, the object becomes reusable instead of
//! being destroyed. Reference counts are atomic (`Arc`) because references
//! are dropped from the completion-notification context, which may run
//! concurrently with new acquisitions on the submitting thread.

use crate::error::{FrameForgeError, Result};
use std::sync::Arc;
use tracing::debug;

/// A reusable object managed by [`RefCountedPool`].
pub trait PoolNode {
    /// Current usable capacity of the node in bytes.
    fn byte_capacity(&self) -> usize;

    /// Grow the node to hold at least `min_size` bytes, returning the new
    /// capacity. Nodes are never shrunk, only grown on demand, to avoid
    /// reallocation churn under varying bitstream packet sizes.
    fn ensure_capacity(&self, min_size: usize) -> Result<usize>;
}

/// Fixed-capacity pool of reference-counted reusable objects.
///
/// A node is free when the pool holds the only reference to it. `acquire`
/// prefers a free node already large enough, then constructs a new node
/// while under capacity, then grows a free-but-small node in place. When
/// capacity is reached and nothing is free, acquisition fails with
/// [`FrameForgeError::PoolExhausted`] - backpressure, not a fatal error.
pub struct RefCountedPool<T: PoolNode> {
    nodes: Vec<Arc<T>>,
    capacity: usize,
}

impl<T: PoolNode> RefCountedPool<T> {
    /// Create an empty pool with a fixed maximum node count.
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            capacity,
        }
    }

    /// Number of live nodes (free or checked out).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the pool holds no nodes at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Maximum number of live nodes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of nodes currently unreferenced outside the pool.
    pub fn available(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| Arc::strong_count(n) == 1)
            .count()
    }

    /// Acquire a node with at least `size_hint` bytes of capacity.
    ///
    /// `create` is invoked to construct a new node when no free node can
    /// satisfy the request and the pool is under capacity.
    pub fn acquire<F>(&mut self, size_hint: usize, create: F) -> Result<Arc<T>>
    where
        F: FnOnce(usize) -> Result<T>,
    {
        // Reuse a free node that is already large enough.
        if let Some(node) = self
            .nodes
            .iter()
            .find(|n| Arc::strong_count(n) == 1 && n.byte_capacity() >= size_hint)
        {
            return Ok(Arc::clone(node));
        }

        // Construct a new node while under capacity.
        if self.nodes.len() < self.capacity {
            let node = Arc::new(create(size_hint)?);
            self.nodes.push(Arc::clone(&node));
            debug!(
                "Pool grew to {}/{} nodes ({} bytes requested)",
                self.nodes.len(),
                self.capacity,
                size_hint
            );
            return Ok(node);
        }

        // At capacity: grow a free-but-small node in place.
        if let Some(node) = self.nodes.iter().find(|n| Arc::strong_count(n) == 1) {
            node.ensure_capacity(size_hint)?;
            return Ok(Arc::clone(node));
        }

        Err(FrameForgeError::PoolExhausted(self.capacity))
    }

    /// Construct up to `count` nodes of `size` bytes ahead of first use.
    ///
    /// Stops early without error once the pool reaches capacity.
    pub fn preallocate<F>(&mut self, count: usize, size: usize, mut create: F) -> Result<usize>
    where
        F: FnMut(usize) -> Result<T>,
    {
        let mut created = 0;
        while created < count && self.nodes.len() < self.capacity {
            self.nodes.push(Arc::new(create(size)?));
            created += 1;
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct TestNode {
        capacity: Mutex<usize>,
    }

    impl TestNode {
        fn new(size: usize) -> Result<Self> {
            Ok(Self {
                capacity: Mutex::new(size),
            })
        }
    }

    impl PoolNode for TestNode {
        fn byte_capacity(&self) -> usize {
            *self.capacity.lock().unwrap()
        }

        fn ensure_capacity(&self, min_size: usize) -> Result<usize> {
            let mut cap = self.capacity.lock().unwrap();
            if *cap < min_size {
                *cap = min_size;
            }
            Ok(*cap)
        }
    }

    #[test]
    fn test_acquire_creates_up_to_capacity() {
        let mut pool: RefCountedPool<TestNode> = RefCountedPool::new(4);
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire(128, TestNode::new).unwrap());
        }
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_exhausted_when_all_checked_out() {
        let mut pool: RefCountedPool<TestNode> = RefCountedPool::new(2);
        let _a = pool.acquire(64, TestNode::new).unwrap();
        let _b = pool.acquire(64, TestNode::new).unwrap();
        let err = pool.acquire(64, TestNode::new).unwrap_err();
        assert!(matches!(err, FrameForgeError::PoolExhausted(2)));
    }

    #[test]
    fn test_dropping_reference_returns_node_to_free_set() {
        let mut pool: RefCountedPool<TestNode> = RefCountedPool::new(1);
        let a = pool.acquire(64, TestNode::new).unwrap();
        drop(a);
        // Same node is reused rather than a new one constructed.
        let b = pool.acquire(64, TestNode::new).unwrap();
        assert_eq!(pool.len(), 1);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_small_free_node_grows_at_capacity() {
        let mut pool: RefCountedPool<TestNode> = RefCountedPool::new(1);
        let a = pool.acquire(64, TestNode::new).unwrap();
        drop(a);
        let b = pool.acquire(4096, TestNode::new).unwrap();
        assert_eq!(b.byte_capacity(), 4096);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_prefers_free_node_large_enough_over_creating() {
        let mut pool: RefCountedPool<TestNode> = RefCountedPool::new(8);
        let a = pool.acquire(4096, TestNode::new).unwrap();
        drop(a);
        let _b = pool.acquire(100, TestNode::new).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_pool_never_exceeds_capacity() {
        let mut pool: RefCountedPool<TestNode> = RefCountedPool::new(64);
        let mut held = Vec::new();
        for _ in 0..64 {
            held.push(pool.acquire(16, TestNode::new).unwrap());
        }
        assert_eq!(pool.len(), 64);
        assert!(matches!(
            pool.acquire(16, TestNode::new),
            Err(FrameForgeError::PoolExhausted(64))
        ));
    }

    #[test]
    fn test_preallocate_stops_at_capacity() {
        let mut pool: RefCountedPool<TestNode> = RefCountedPool::new(4);
        let created = pool.preallocate(8, 256, TestNode::new).unwrap();
        assert_eq!(created, 4);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.available(), 4);
    }
}
