//! Append-only event queue with front popping and tail truncation.
//!
//! Storage grows on demand but is never released while the queue lives, so a
//! queue that has been warmed up to its working size stops allocating. Popping
//! from the front only advances a cursor; once the queue drains, both cursors
//! rewind to the start of the storage.

/// FIFO with stable ordering and O(1) amortized push.
#[derive(Debug, Clone)]
pub struct Queue<T> {
    items: Vec<T>,
    next_push: usize,
    next_pop: usize,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Create an empty queue without reserving storage.
    pub const fn new() -> Self {
        Self {
            items: Vec::new(),
            next_push: 0,
            next_pop: 0,
        }
    }

    /// Create an empty queue with room for `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            next_push: 0,
            next_pop: 0,
        }
    }

    /// Reserve storage for at least `capacity` items in total.
    pub fn reserve(&mut self, capacity: usize) {
        self.items.reserve(capacity.saturating_sub(self.items.len()));
    }

    /// Whether there are no items between the cursors.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.next_push == self.next_pop
    }

    /// Number of queued items.
    #[inline]
    pub fn len(&self) -> usize {
        self.next_push - self.next_pop
    }

    /// Append an item at the back.
    pub fn push(&mut self, item: T) {
        if self.next_push < self.items.len() {
            self.items[self.next_push] = item;
        } else {
            self.items.push(item);
        }

        self.next_push += 1;
    }

    /// Oldest queued item.
    #[inline]
    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    /// Newest queued item.
    #[inline]
    pub fn back(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            self.items.get(self.next_push - 1)
        }
    }

    /// Item at `index`, counted from the front.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index < self.len() {
            self.items.get(self.next_pop + index)
        } else {
            None
        }
    }

    /// Drop all items starting from `index` (counted from the front).
    pub fn drop_from(&mut self, index: usize) {
        if index < self.len() {
            self.next_push = self.next_pop + index;
            self.rewind_if_empty();
        }
    }

    /// Drop every queued item.
    pub fn clear(&mut self) {
        self.next_push = 0;
        self.next_pop = 0;
    }

    /// Iterate from front to back.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items[self.next_pop..self.next_push].iter()
    }

    fn rewind_if_empty(&mut self) {
        if self.is_empty() {
            self.next_push = 0;
            self.next_pop = 0;
        }
    }
}

impl<T: Clone> Queue<T> {
    /// Remove and return the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let item = self.items[self.next_pop].clone();
        self.next_pop += 1;
        self.rewind_if_empty();

        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_insertion_order() {
        let mut queue = Queue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.front(), Some(&3));
        assert_eq!(queue.back(), Some(&3));
        assert_eq!(queue.pop(), Some(3));
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn storage_is_reused_after_draining() {
        let mut queue = Queue::with_capacity(4);

        for round in 0..10 {
            queue.push(round);
            queue.push(round + 1);
            assert_eq!(queue.pop(), Some(round));
            assert_eq!(queue.pop(), Some(round + 1));
        }

        assert!(queue.items.len() <= 2);
    }

    #[test]
    fn drop_from_truncates_the_tail() {
        let mut queue = Queue::new();

        for i in 0..5 {
            queue.push(i);
        }

        queue.pop();
        queue.drop_from(2);

        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![1, 2]);

        queue.drop_from(0);
        assert!(queue.is_empty());
        assert_eq!(queue.back(), None);
    }

    #[test]
    fn indexing_is_relative_to_front() {
        let mut queue = Queue::new();
        queue.push('a');
        queue.push('b');
        queue.push('c');
        queue.pop();

        assert_eq!(queue.get(0), Some(&'b'));
        assert_eq!(queue.get(1), Some(&'c'));
        assert_eq!(queue.get(2), None);
    }
}
