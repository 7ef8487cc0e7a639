//! Live-updatable configuration snapshots.
//!
//! Readers take an `Arc` of the whole value; writers replace it atomically. A reader therefore
//! sees either the old snapshot or the new one, never a mix of fields from both.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// `DynamicConfig<T>` gives cheap reads and atomic whole-value replacement for shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Derive a new value from the current one and store it.
    ///
    /// Uses compare-and-swap, so concurrent updates are not lost; `f` may run more than once.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|cur| Arc::new(f(cur)));
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Pair {
        a: u32,
        b: u32,
    }

    #[test]
    fn get_set_update() {
        let a = DynamicConfig::new(1);
        assert_eq!(*a.get(), 1);
        a.set(2);
        assert_eq!(*a.get(), 2);
        a.update(|v| v + 3);
        assert_eq!(*a.get(), 5);
    }

    #[test]
    fn old_snapshots_stay_consistent_after_swap() {
        let cfg = DynamicConfig::new(Pair { a: 1, b: 1 });
        let before = cfg.get();
        cfg.set(Pair { a: 2, b: 2 });

        assert_eq!(*before, Pair { a: 1, b: 1 });
        assert_eq!(*cfg.get(), Pair { a: 2, b: 2 });
    }

    #[test]
    fn concurrent_readers_never_see_torn_values() {
        let cfg = DynamicConfig::new(Pair { a: 0, b: 0 });
        let writer = {
            let cfg = cfg.clone();
            std::thread::spawn(move || {
                for i in 1..=1_000 {
                    cfg.set(Pair { a: i, b: i });
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cfg = cfg.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        let snap: Arc<Pair> = cfg.get();
                        assert_eq!(snap.a, snap.b);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
