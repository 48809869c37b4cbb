//! Small least-recently-used container for per-origin pools.
//!
//! Capacity is the manager's `num_pools`, typically tens, so a vector
//! ordered most-recent-first is plenty.

pub(crate) struct LruMap<K, V> {
    cap: usize,
    entries: Vec<(K, V)>,
}

impl<K: Eq, V: Clone> LruMap<K, V> {
    pub fn new(cap: usize) -> LruMap<K, V> {
        assert!(cap > 0, "lru capacity must be at least 1");
        LruMap {
            cap,
            entries: Vec::new(),
        }
    }

    /// Fetch the value for `key`, creating it with `make` when absent.
    ///
    /// The entry becomes the most recently used. Returns the value and
    /// the entry evicted to stay within capacity, if any.
    pub fn get_or_insert_with(
        &mut self,
        key: K,
        make: impl FnOnce() -> V,
    ) -> (V, Option<V>) {
        if let Some(idx) = self.entries.iter().position(|(k, _)| *k == key) {
            let entry = self.entries.remove(idx);
            let value = entry.1.clone();
            self.entries.insert(0, entry);
            return (value, None);
        }

        let value = make();
        self.entries.insert(0, (key, value.clone()));

        let evicted = if self.entries.len() > self.cap {
            self.entries.pop().map(|(_, v)| v)
        } else {
            None
        };

        (value, evicted)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry, returning the values for cleanup.
    pub fn clear(&mut self) -> Vec<V> {
        self.entries.drain(..).map(|(_, v)| v).collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }
}
