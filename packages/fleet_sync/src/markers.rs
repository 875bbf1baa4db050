//! Time-boxed marker cache.
//!
//! Each entry remembers when it was stamped. [`MarkerCache::sweep`] drops
//! everything stamped before `now - retention`; when the cache is full the
//! entry with the oldest stamp makes room for a new key.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug, Clone)]
struct Stamped<V> {
    value: V,
    stamped_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MarkerCache<K, V> {
    entries: HashMap<K, Stamped<V>>,
    retention: Duration,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> MarkerCache<K, V> {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            retention,
            capacity,
        }
    }

    /// Insert or overwrite the marker for `key`, stamped at `at`.
    pub fn insert(&mut self, key: K, value: V, at: DateTime<Utc>) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stamped_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            Stamped {
                value,
                stamped_at: at,
            },
        );
    }

    /// Remove every marker stamped before the retention window ending at
    /// `now`. Returns how many were removed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(window) = TimeDelta::from_std(self.retention) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|_, e| e.stamped_at >= cutoff);
        before - self.entries.len()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn stamped_at<Q>(&self, key: &Q) -> Option<DateTime<Utc>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|e| e.stamped_at)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|e| &e.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, e)| (k, &e.value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn cache() -> MarkerCache<&'static str, u32> {
        MarkerCache::new(Duration::from_secs(30), 8)
    }

    #[test]
    fn sweep_drops_only_expired() {
        let mut markers = cache();
        markers.insert("a", 1, at(0));
        markers.insert("b", 2, at(20));
        assert_eq!(markers.sweep(at(31)), 1);
        assert!(!markers.contains_key(&"a"));
        assert_eq!(markers.get(&"b"), Some(&2));
    }

    #[test]
    fn marker_exactly_at_window_edge_survives() {
        let mut markers = cache();
        markers.insert("a", 1, at(0));
        assert_eq!(markers.sweep(at(30)), 0);
        assert_eq!(markers.len(), 1);
    }

    #[test]
    fn reinsert_restamps() {
        let mut markers = cache();
        markers.insert("a", 1, at(0));
        markers.insert("a", 2, at(25));
        markers.sweep(at(40));
        assert_eq!(markers.get(&"a"), Some(&2));
        assert_eq!(markers.stamped_at(&"a"), Some(at(25)));
    }

    #[test]
    fn full_cache_evicts_oldest_stamp() {
        let mut markers = MarkerCache::new(Duration::from_secs(30), 2);
        markers.insert("a", 1, at(5));
        markers.insert("b", 2, at(1));
        markers.insert("c", 3, at(6));
        assert_eq!(markers.len(), 2);
        assert!(!markers.contains_key(&"b"));
        assert!(markers.contains_key(&"a"));
    }

    #[test]
    fn clear_empties_immediately() {
        let mut markers = cache();
        markers.insert("a", 1, at(0));
        markers.insert("b", 2, at(0));
        markers.clear();
        assert!(markers.is_empty());
        assert_eq!(markers.values().count(), 0);
    }
}
