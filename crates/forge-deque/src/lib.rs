//! A fixed-capacity Chase-Lev work-stealing deque over job-slot indices.
//!
//! Single owner thread calls [`Deque::push`]/[`Deque::pop`]; any number of
//! other threads call [`Deque::steal`]. The backing ring is a power-of-two
//! array of atomics so concurrent reads of in-flight slots are never a data
//! race, even though only the owner ever writes a slot's contents.

#[cfg(loom)]
use loom::sync::atomic::{fence, AtomicUsize, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Sentinel for "no job" - never a valid job-cache index.
pub const NONE: usize = usize::MAX;

pub struct Deque {
    top: AtomicUsize,
    bottom: AtomicUsize,
    buf: Vec<AtomicUsize>,
    mask: usize,
}

impl Deque {
    /// Creates a deque with room for `capacity` items. `capacity` must be a
    /// power of two.
    pub fn new(capacity: usize) -> Deque {
        assert!(capacity.is_power_of_two() && capacity != 0);
        Deque {
            top: AtomicUsize::new(0),
            bottom: AtomicUsize::new(0),
            buf: (0..capacity).map(|_| AtomicUsize::new(NONE)).collect(),
            mask: capacity - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Owner-only. Pushes `item` to the bottom. Returns `false` if full.
    pub fn push(&self, item: usize) -> bool {
        debug_assert_ne!(item, NONE);
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b.wrapping_sub(t) >= self.buf.len() {
            return false;
        }
        self.buf[b & self.mask].store(item, Ordering::Relaxed);
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Release);
        true
    }

    /// Owner-only. Pops the most recently pushed item.
    pub fn pop(&self) -> Option<usize> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t0 = self.top.load(Ordering::Acquire);
        if b <= t0 {
            return None;
        }

        let b1 = b - 1;
        self.bottom.store(b1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Acquire);
        if t > b1 {
            self.bottom.store(b, Ordering::Relaxed);
            return None;
        }

        let item = self.buf[b1 & self.mask].load(Ordering::Relaxed);
        if t == b1 {
            // Only item left: race the stealers for it.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b, Ordering::Relaxed);
            if !won {
                return None;
            }
        }
        Some(item)
    }

    /// Multi-stealer. Steals the oldest item, if any.
    pub fn steal(&self) -> Option<usize> {
        loop {
            let t = self.top.load(Ordering::Acquire);
            fence(Ordering::SeqCst);
            let b = self.bottom.load(Ordering::Acquire);
            if t >= b {
                return None;
            }
            let item = self.buf[t & self.mask].load(Ordering::Relaxed);
            if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(item);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        t >= b
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_lifo() {
        let d = Deque::new(1024);
        for i in 0..1024 {
            assert!(d.push(i));
        }
        for i in (0..1024).rev() {
            assert_eq!(d.pop(), Some(i));
        }
        assert_eq!(d.pop(), None);
    }

    #[test]
    fn steal_on_empty_is_none() {
        let d = Deque::new(16);
        assert_eq!(d.steal(), None);
    }

    #[test]
    fn steal_is_fifo() {
        let d = Deque::new(1024);
        for i in 0..1024 {
            d.push(i);
        }
        for i in 0..1024 {
            assert_eq!(d.steal(), Some(i));
        }
        assert_eq!(d.steal(), None);
    }

    #[test]
    fn full_push_fails() {
        let d = Deque::new(4);
        for i in 0..4 {
            assert!(d.push(i));
        }
        assert!(!d.push(99));
    }

    #[test]
    fn concurrent_steal_and_pop_partition_exactly() {
        use std::sync::Arc;
        use std::thread;

        let d = Arc::new(Deque::new(1024));
        for i in 0..1024 {
            d.push(i);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let d2 = Arc::clone(&d);
            handles.push(thread::spawn(move || {
                let mut taken = Vec::new();
                while let Some(v) = d2.steal() {
                    taken.push(v);
                }
                taken
            }));
        }

        let mut owner_taken = Vec::new();
        while let Some(v) = d.pop() {
            owner_taken.push(v);
        }

        let mut all = owner_taken;
        for h in handles {
            all.extend(h.join().unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1024);
    }
}

#[cfg(loom)]
mod loom_tests {
    use super::*;
    use loom::thread;

    #[test]
    fn loom_single_steal_single_pop_never_double_delivers() {
        loom::model(|| {
            let d = loom::sync::Arc::new(Deque::new(4));
            d.push(1);
            d.push(2);

            let d2 = d.clone();
            let stealer = thread::spawn(move || d2.steal());

            let popped = d.pop();
            let stolen = stealer.join().unwrap();

            let mut got: Vec<usize> = [popped, stolen].into_iter().flatten().collect();
            got.sort_unstable();
            got.dedup();
            assert_eq!(got.len(), [popped, stolen].into_iter().flatten().count());
        });
    }
}
