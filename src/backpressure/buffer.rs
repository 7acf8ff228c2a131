//! # Buffer Managers
//!
//! Element storage behind a controller. The controller decides *whether* an
//! item goes in; the buffer only stores it and enforces its own capacity.
//!
//! ```text
//!     Fixed / Ring (preallocated slots, head + len):
//!
//!          head
//!           ▼
//!     ┌────┬────┬────┬────┬────┐
//!     │ 4  │    │ 1  │ 2  │ 3  │   logical order: 1 2 3 4
//!     └────┴────┴────┴────┴────┘
//!       tail wraps to slot 0
//!
//!     Growing (deque, allocation doubles up to max):
//!
//!     [1][2]  →  [1][2][3][ ]  →  [1][2][3][4][5][ ][ ][ ]
//!      2 slots      4 slots              8 slots (= max)
//! ```
//!
//! Pushing into a full buffer with [`BufferManager::push`] is an invariant
//! breach and panics; the controller never does it.

use super::config::BufferKind;
use std::collections::VecDeque;
use std::fmt;

/// Storage strategy for buffered items.
pub trait BufferManager<T>: Send {
    /// Appends an item at the tail.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is full.
    fn push(&mut self, item: T);

    /// Appends an item, evicting and returning the head if full.
    fn push_overwrite(&mut self, item: T) -> Option<T> {
        let evicted = if self.is_full() { self.pop() } else { None };
        self.push(item);
        evicted
    }

    /// Removes the logically oldest item.
    fn pop(&mut self) -> Option<T>;

    /// Number of buffered items.
    fn len(&self) -> usize;

    /// Hard upper bound on [`len`](Self::len).
    fn capacity(&self) -> usize;

    /// Slots currently allocated.
    fn allocated(&self) -> usize;

    /// Removes every item in FIFO order.
    fn drain_all(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len());
        while let Some(item) = self.pop() {
            items.push(item);
        }
        items
    }

    /// Returns true if nothing is buffered.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if another push would exceed capacity.
    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
}

/// Builds the buffer for a validated configuration.
pub fn new_buffer<T: Send + 'static>(
    kind: BufferKind,
    capacity: usize,
) -> Box<dyn BufferManager<T> + Send> {
    match kind {
        BufferKind::Fixed => Box::new(FixedBuffer::new(capacity)),
        BufferKind::Ring => Box::new(RingBuffer::new(capacity)),
        BufferKind::Growing { initial_capacity } => {
            Box::new(GrowingBuffer::new(initial_capacity, capacity))
        }
    }
}

// Circular slot array shared by the fixed and ring buffers.
struct Slots<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    len: usize,
}

impl<T> Slots<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    #[inline]
    fn push(&mut self, item: T) {
        assert!(!self.is_full(), "push into a full buffer (capacity {})", self.capacity());
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(item);
        self.len += 1;
    }

    #[inline]
    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        item
    }

    // Replaces the head in place and advances it: the new item becomes the
    // tail without moving anything.
    #[inline]
    fn overwrite_oldest(&mut self, item: T) -> Option<T> {
        let evicted = self.slots[self.head].replace(item);
        self.head = (self.head + 1) % self.slots.len();
        evicted
    }
}

/// Preallocated buffer with strict capacity.
pub struct FixedBuffer<T> {
    inner: Slots<T>,
}

impl<T> FixedBuffer<T> {
    /// Allocates `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Slots::new(capacity),
        }
    }
}

impl<T: Send> BufferManager<T> for FixedBuffer<T> {
    fn push(&mut self, item: T) {
        self.inner.push(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.inner.pop()
    }

    fn len(&self) -> usize {
        self.inner.len
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn allocated(&self) -> usize {
        self.inner.capacity()
    }
}

/// Preallocated circular buffer with O(1) overwrite of the oldest item.
pub struct RingBuffer<T> {
    inner: Slots<T>,
}

impl<T> RingBuffer<T> {
    /// Allocates `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Slots::new(capacity),
        }
    }
}

impl<T: Send> BufferManager<T> for RingBuffer<T> {
    fn push(&mut self, item: T) {
        self.inner.push(item);
    }

    fn push_overwrite(&mut self, item: T) -> Option<T> {
        if self.inner.is_full() {
            self.inner.overwrite_oldest(item)
        } else {
            self.inner.push(item);
            None
        }
    }

    fn pop(&mut self) -> Option<T> {
        self.inner.pop()
    }

    fn len(&self) -> usize {
        self.inner.len
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn allocated(&self) -> usize {
        self.inner.capacity()
    }
}

/// Buffer that starts small and doubles its allocation up to a hard maximum.
pub struct GrowingBuffer<T> {
    items: VecDeque<T>,
    allocated: usize,
    max_capacity: usize,
}

impl<T> GrowingBuffer<T> {
    /// Allocates `initial_capacity` slots; never holds more than
    /// `max_capacity` items.
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        let initial = initial_capacity.min(max_capacity);
        Self {
            items: VecDeque::with_capacity(initial),
            allocated: initial,
            max_capacity,
        }
    }

    fn grow(&mut self) {
        let next = self.allocated.saturating_mul(2).max(1).min(self.max_capacity);
        self.items.reserve_exact(next - self.items.len());
        tracing::debug!(from = self.allocated, to = next, "growing buffer resized");
        self.allocated = next;
    }
}

impl<T: Send> BufferManager<T> for GrowingBuffer<T> {
    fn push(&mut self, item: T) {
        assert!(
            self.items.len() < self.max_capacity,
            "push into a full buffer (capacity {})",
            self.max_capacity
        );
        if self.items.len() == self.allocated {
            self.grow();
        }
        self.items.push_back(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn capacity(&self) -> usize {
        self.max_capacity
    }

    fn allocated(&self) -> usize {
        self.allocated
    }

    fn drain_all(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }
}

impl<T> fmt::Debug for FixedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedBuffer")
            .field("len", &self.inner.len)
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.inner.len)
            .field("head", &self.inner.head)
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}

impl<T> fmt::Debug for GrowingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowingBuffer")
            .field("len", &self.items.len())
            .field("allocated", &self.allocated)
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buffer: &mut dyn BufferManager<u32>, items: std::ops::Range<u32>) {
        for i in items {
            buffer.push(i);
        }
    }

    #[test]
    fn test_fixed_fifo() {
        let mut buffer = FixedBuffer::new(3);
        fill(&mut buffer, 1..4);
        assert!(buffer.is_full());
        assert_eq!(buffer.pop(), Some(1));
        buffer.push(4);
        assert_eq!(buffer.drain_all(), vec![2, 3, 4]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    #[should_panic(expected = "full buffer")]
    fn test_fixed_push_when_full_panics() {
        let mut buffer = FixedBuffer::new(1);
        buffer.push(1u32);
        buffer.push(2u32);
    }

    #[test]
    fn test_fixed_overwrite_uses_default() {
        let mut buffer = FixedBuffer::new(2);
        fill(&mut buffer, 1..3);
        assert_eq!(buffer.push_overwrite(3), Some(1));
        assert_eq!(buffer.drain_all(), vec![2, 3]);
    }

    #[test]
    fn test_ring_overwrite_keeps_order() {
        let mut buffer = RingBuffer::new(3);
        assert_eq!(buffer.push_overwrite(1), None);
        fill(&mut buffer, 2..4);

        assert_eq!(buffer.push_overwrite(4), Some(1));
        assert_eq!(buffer.push_overwrite(5), Some(2));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.drain_all(), vec![3, 4, 5]);
    }

    #[test]
    fn test_ring_wraparound() {
        let mut buffer = RingBuffer::new(3);
        for round in 0..10u32 {
            buffer.push(round);
            buffer.push(round + 100);
            assert_eq!(buffer.pop(), Some(round));
            assert_eq!(buffer.pop(), Some(round + 100));
        }
        assert!(buffer.is_empty());
        assert_eq!(buffer.allocated(), 3);
    }

    #[test]
    fn test_growing_doubles_up_to_max() {
        let mut buffer = GrowingBuffer::new(2, 10);
        assert_eq!(buffer.allocated(), 2);

        fill(&mut buffer, 0..3);
        assert_eq!(buffer.allocated(), 4);
        fill(&mut buffer, 3..5);
        assert_eq!(buffer.allocated(), 8);
        fill(&mut buffer, 5..10);
        assert_eq!(buffer.allocated(), 10);
        assert!(buffer.is_full());
        assert_eq!(buffer.capacity(), 10);

        assert_eq!(buffer.push_overwrite(10), Some(0));
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.drain_all(), (1..11).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "full buffer")]
    fn test_growing_push_past_max_panics() {
        let mut buffer = GrowingBuffer::new(1, 2);
        fill(&mut buffer, 0..3);
    }

    #[test]
    fn test_new_buffer_kinds() {
        let fixed = new_buffer::<u32>(BufferKind::Fixed, 4);
        assert_eq!((fixed.capacity(), fixed.allocated()), (4, 4));

        let ring = new_buffer::<u32>(BufferKind::Ring, 4);
        assert_eq!((ring.capacity(), ring.allocated()), (4, 4));

        let growing = new_buffer::<u32>(BufferKind::Growing { initial_capacity: 1 }, 4);
        assert_eq!((growing.capacity(), growing.allocated()), (4, 1));
    }

    #[test]
    fn test_drops_buffered_items() {
        use std::sync::Arc;

        let marker = Arc::new(());
        {
            let mut buffer = RingBuffer::new(2);
            buffer.push(marker.clone());
            buffer.push(marker.clone());
            assert_eq!(Arc::strong_count(&marker), 3);
            drop(buffer.push_overwrite(marker.clone()));
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
