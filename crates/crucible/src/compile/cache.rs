use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::compile::CompileResult;

/// Bounded FIFO cache of compiler results, keyed by job cache key.
///
/// A capacity of zero disables caching.
#[derive(Debug)]
pub struct CompileCache {
    capacity: usize,
    inner: Mutex<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    results: HashMap<String, CompileResult>,
    order: VecDeque<String>,
}

impl CompileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Entries::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<CompileResult> {
        self.lock().results.get(key).cloned()
    }

    pub fn insert(&self, key: String, result: CompileResult) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.lock();
        if entries.results.contains_key(&key) {
            entries.results.insert(key, result);
            return;
        }
        while entries.order.len() >= self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.results.remove(&oldest);
            }
        }
        entries.order.push_back(key.clone());
        entries.results.insert(key, result);
    }

    pub fn len(&self) -> usize {
        self.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, e.g. after the compiler set changed
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.results.clear();
        entries.order.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(code: i32) -> CompileResult {
        CompileResult {
            code,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
        }
    }

    #[test]
    fn evicts_oldest_first() {
        let cache = CompileCache::new(2);
        cache.insert("a".into(), result(0));
        cache.insert("b".into(), result(1));
        cache.insert("c".into(), result(2));

        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").unwrap().code, 1);
        assert_eq!(cache.get("c").unwrap().code, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinsert_does_not_grow() {
        let cache = CompileCache::new(2);
        cache.insert("a".into(), result(0));
        cache.insert("a".into(), result(5));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a").unwrap().code, 5);
    }

    #[test]
    fn zero_capacity_disables() {
        let cache = CompileCache::new(0);
        cache.insert("a".into(), result(0));
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_empties() {
        let cache = CompileCache::new(4);
        cache.insert("a".into(), result(0));
        cache.clear();
        assert!(cache.get("a").is_none());
    }
}
