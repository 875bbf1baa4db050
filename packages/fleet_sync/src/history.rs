//! Newest-first bounded history buffer.
//!
//! Holds the telemetry time series for one ATM. The head is always the most
//! recently pushed item; pushing past capacity evicts from the tail.

use std::collections::VecDeque;

/// Default number of samples kept per ATM.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct HistoryBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> HistoryBuffer<T> {
    /// A buffer of `capacity` items. Zero capacity stores nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY * 10)),
            capacity,
        }
    }

    /// Prepend an item, evicting the oldest when full.
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_back();
        }
        self.items.push_front(item);
    }

    /// Replace the whole buffer with `items`, which must already be newest-first.
    pub fn replace(&mut self, items: impl IntoIterator<Item = T>) {
        self.items.clear();
        self.items.extend(items.into_iter().take(self.capacity));
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn latest_mut(&mut self) -> Option<&mut T> {
        self.items.front_mut()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> HistoryBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<T> Default for HistoryBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_keeps_newest_first() {
        let mut buf = HistoryBuffer::new(10);
        buf.push(1);
        buf.push(2);
        buf.push(3);
        assert_eq!(buf.to_vec(), vec![3, 2, 1]);
        assert_eq!(buf.latest(), Some(&3));
    }

    #[test]
    fn push_past_capacity_evicts_oldest() {
        let mut buf = HistoryBuffer::new(3);
        for i in 1..=5 {
            buf.push(i);
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.to_vec(), vec![5, 4, 3]);
    }

    #[test]
    fn replace_truncates_to_capacity() {
        let mut buf = HistoryBuffer::new(2);
        buf.push(99);
        buf.replace(vec![7, 6, 5]);
        assert_eq!(buf.to_vec(), vec![7, 6]);
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let mut buf = HistoryBuffer::new(0);
        buf.push(1);
        assert!(buf.is_empty());
        assert_eq!(buf.latest(), None);
    }

    #[test]
    fn latest_mut_patches_head() {
        let mut buf = HistoryBuffer::new(4);
        buf.push(String::from("a"));
        buf.push(String::from("b"));
        if let Some(head) = buf.latest_mut() {
            head.push('!');
        }
        assert_eq!(buf.to_vec(), vec!["b!".to_string(), "a".to_string()]);
    }

    #[test]
    fn clear_empties() {
        let mut buf = HistoryBuffer::<u8>::default();
        assert_eq!(buf.capacity(), DEFAULT_CAPACITY);
        buf.push(1);
        buf.clear();
        assert!(buf.is_empty());
    }
}
