//! Which sub-values of the current run are durably written.
//!
//! Only the contiguous prefix of completed sub-values is a safe restart
//! point: a gap means an earlier sub-value may still be unwritten.
//!
//! ```text
//!   index   0 1 2 3 4 5
//!   done    ■ ■ ■ □ ■ □      count_first = 3, count = 4
//! ```

use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct CompletionTracker {
    done: Mutex<Vec<bool>>,
}

impl CompletionTracker {
    pub fn new(size: usize) -> Self {
        Self { done: Mutex::new(vec![false; size]) }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<bool>> {
        self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resize to `size` entries, all clear.
    pub fn init(&self, size: usize) {
        let mut done = self.lock();
        done.clear();
        done.resize(size, false);
    }

    /// Clear every entry, keeping the size.
    pub fn reset(&self) {
        self.lock().iter_mut().for_each(|d| *d = false);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// `true` if every entry is set. An empty tracker has nothing pending.
    pub fn is_all(&self) -> bool {
        self.lock().iter().all(|d| *d)
    }

    /// Mark `index` done. Out of range is ignored; returns whether it was in range.
    pub fn set_at(&self, index: usize) -> bool {
        match self.lock().get_mut(index) {
            Some(d) => {
                *d = true;
                true
            }
            None => false,
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.lock().get(index).copied().unwrap_or(false)
    }

    /// Length of the run of set entries starting at 0.
    pub fn count_first(&self) -> usize {
        self.lock().iter().take_while(|d| **d).count()
    }

    pub fn count(&self) -> usize {
        self.lock().iter().filter(|d| **d).count()
    }

    /// Mark `[0, k)` done, as after a restart from `k`.
    pub fn set_first(&self, k: usize) {
        self.lock().iter_mut().take(k).for_each(|d| *d = true);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn prefix_stops_at_first_gap() {
        let t = CompletionTracker::new(6);
        for i in [0, 1, 2, 4] {
            t.set_at(i);
        }
        assert_eq!(t.count_first(), 3);
        assert_eq!(t.count(), 4);
        assert!(!t.is_all());

        t.set_at(3);
        t.set_at(5);
        assert_eq!(t.count_first(), 6);
        assert!(t.is_all());
    }

    #[test]
    fn out_of_range_is_ignored() {
        let t = CompletionTracker::new(2);
        assert!(!t.set_at(2));
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn init_and_reset() {
        let t = CompletionTracker::new(3);
        t.set_first(2);
        assert_eq!(t.count_first(), 2);
        t.reset();
        assert_eq!(t.count(), 0);
        assert_eq!(t.len(), 3);
        t.init(5);
        assert_eq!(t.len(), 5);
        assert!(!t.is_set(0));
    }

    /// For any order of `set_at` calls the checkpoint never moves back and
    /// never exceeds the number of set entries.
    #[test]
    fn checkpoint_is_monotonic() {
        let orders: [&[usize]; 4] = [
            &[7, 6, 5, 4, 3, 2, 1, 0],
            &[0, 2, 4, 6, 1, 3, 5, 7],
            &[3, 3, 0, 1, 1, 2, 7, 4, 6, 5],
            &[1, 0, 9, 2, 3, 4, 5, 6, 7],
        ];
        for order in orders {
            let t = CompletionTracker::new(8);
            let mut last = 0;
            for &i in order {
                t.set_at(i);
                let first = t.count_first();
                assert!(first >= last, "checkpoint went back on {order:?}");
                assert!(first <= t.count());
                last = first;
            }
            assert_eq!(last, 8);
        }
    }

    #[test]
    fn concurrent_set() {
        let t = Arc::new(CompletionTracker::new(64));
        let handles: Vec<_> = (0..4)
            .map(|k| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || (k..64).step_by(4).for_each(|i| {
                    t.set_at(i);
                }))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(t.is_all());
    }
}
