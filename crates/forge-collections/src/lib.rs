//! A leap-frog, open-addressing hash set over arena-owned storage.
//!
//! Each slot stores only a hash and a value, not the original key: callers
//! are expected to fold the key into the hash themselves (as the job
//! scheduler's OS-thread-id-to-slot table does). `delta[0]` leaps from a
//! home slot to the first node displaced from it; `delta[1]` walks the rest
//! of that chain. A zero delta ends the chain.

mod hash;

pub use hash::{hash_u64, murmur2_hash};

use forge_arena::{AllocFlags, Arena};
use std::cell::Cell;
use std::ptr::NonNull;

const HASH_NULL: u64 = 0x0000_0000_0000_0000;
const HASH_DELETED: u64 = u64::MAX;
const INITIAL_CAPACITY: u32 = 256;

#[derive(Clone, Copy)]
struct Slot<V: Copy> {
    hash: u64,
    value: V,
    delta: [u16; 2],
}

/// An open-addressing hash set keyed by a pre-computed 64-bit hash.
pub struct HashSet<'a, V: Copy> {
    arena: &'a Arena,
    nodes: Cell<NonNull<Slot<V>>>,
    capacity: Cell<u32>,
    size: Cell<u32>,
}

impl<'a, V: Copy> HashSet<'a, V> {
    pub fn new(arena: &'a Arena) -> HashSet<'a, V> {
        Self::with_capacity(arena, INITIAL_CAPACITY)
    }

    fn with_capacity(arena: &'a Arena, capacity: u32) -> HashSet<'a, V> {
        let capacity = capacity.next_power_of_two().max(16);
        let nodes = arena
            .alloc::<Slot<V>>(capacity as usize, AllocFlags::NONE)
            .expect("hash set allocation failed");
        let set = HashSet {
            arena,
            nodes: Cell::new(nodes),
            capacity: Cell::new(capacity),
            size: Cell::new(0),
        };
        set.init_slots();
        set
    }

    fn init_slots(&self) {
        for i in 0..self.capacity.get() {
            self.slot_mut(i).hash = HASH_NULL;
            self.slot_mut(i).delta = [0, 0];
        }
    }

    fn mask(&self) -> u32 {
        self.capacity.get() - 1
    }

    fn slot(&self, idx: u32) -> &Slot<V> {
        unsafe { &*self.nodes.get().as_ptr().add(idx as usize) }
    }

    #[allow(clippy::mut_from_ref)]
    fn slot_mut(&self, idx: u32) -> &mut Slot<V> {
        unsafe { &mut *self.nodes.get().as_ptr().add(idx as usize) }
    }

    pub fn len(&self) -> u32 {
        self.size.get()
    }

    pub fn is_empty(&self) -> bool {
        self.size.get() == 0
    }

    pub fn clear(&self) {
        self.init_slots();
        self.size.set(0);
    }

    /// Looks up `hash`, returning a copy of the stored value if present.
    pub fn get(&self, hash: u64) -> Option<V> {
        let home = (hash as u32) & self.mask();
        if self.slot(home).hash == HASH_NULL {
            return None;
        }
        let mut offset = self.slot(home).delta[0];
        if offset == 0 && self.slot(home).hash != HASH_DELETED && self.slot(home).hash == hash {
            return Some(self.slot(home).value);
        }
        if offset == 0 {
            return None;
        }
        let mut idx = (home + offset as u32) & self.mask();
        loop {
            let node = self.slot(idx);
            if node.hash != HASH_DELETED && node.hash == hash {
                return Some(node.value);
            }
            let next = node.delta[1];
            if next == 0 {
                return None;
            }
            idx = (idx + next as u32) & self.mask();
        }
    }

    pub fn find(&self, hash: u64) -> bool {
        self.get(hash).is_some()
    }

    /// Inserts `value` at `hash`, overwriting any existing value for that
    /// hash (this is the set/upsert behavior; there is no separate
    /// insert-only variant since the underlying slots carry no notion of
    /// "already present" beyond the hash match itself).
    pub fn set(&self, hash: u64, value: V) {
        if (self.size.get() + 1) as f32 > self.capacity.get() as f32 * 0.75 {
            self.grow();
        }
        self.set_inner(hash, value);
    }

    fn set_inner(&self, hash: u64, value: V) {
        let home = (hash as u32) & self.mask();
        if self.slot(home).hash == HASH_NULL || self.slot(home).hash == HASH_DELETED {
            let was_deleted = self.slot(home).hash == HASH_DELETED;
            let delta = self.slot(home).delta;
            self.slot_mut(home).hash = hash;
            self.slot_mut(home).value = value;
            self.slot_mut(home).delta = delta;
            if !was_deleted {
                self.size.set(self.size.get() + 1);
            }
            return;
        }

        // Walk the existing chain looking for a match to overwrite.
        let mut predecessor = home;
        let mut offset = self.slot(home).delta[0];
        let mut idx = home;
        while offset != 0 {
            idx = (idx + offset as u32) & self.mask();
            if self.slot(idx).hash == hash {
                self.slot_mut(idx).value = value;
                return;
            }
            predecessor = idx;
            offset = self.slot(idx).delta[1];
        }

        // Not found: seat a new node via linear probing and link it in.
        let mut probe = (idx + 1) & self.mask();
        let mut steps = 0;
        while self.slot(probe).hash != HASH_NULL && self.slot(probe).hash != HASH_DELETED {
            probe = (probe + 1) & self.mask();
            steps += 1;
            if steps > self.capacity.get() {
                self.grow();
                self.set_inner(hash, value);
                return;
            }
        }
        self.slot_mut(probe).hash = hash;
        self.slot_mut(probe).value = value;
        self.slot_mut(probe).delta = [0, 0];
        self.size.set(self.size.get() + 1);

        let link = probe.wrapping_sub(predecessor) & self.mask();
        let link = if link == 0 { self.capacity.get() } else { link } as u16;
        if predecessor == home && home == idx {
            self.slot_mut(predecessor).delta[0] = link;
        } else {
            self.slot_mut(predecessor).delta[1] = link;
        }
    }

    /// Inserts `value` at `hash` only if `hash` is not already present.
    /// Returns `true` if a new entry was created.
    pub fn insert(&self, hash: u64, value: V) -> bool {
        if self.find(hash) {
            return false;
        }
        self.set(hash, value);
        true
    }

    /// Removes the entry for `hash`, if any. The slot is tombstoned rather
    /// than unlinked so later traversals through it still reach its
    /// successors; tombstones are dropped on the next resize.
    pub fn erase(&self, hash: u64) -> bool {
        let home = (hash as u32) & self.mask();
        if self.slot(home).hash == HASH_NULL {
            return false;
        }
        let mut idx = home;
        loop {
            if self.slot(idx).hash == hash {
                self.slot_mut(idx).hash = HASH_DELETED;
                self.size.set(self.size.get() - 1);
                return true;
            }
            let next = if idx == home {
                self.slot(idx).delta[0]
            } else {
                self.slot(idx).delta[1]
            };
            if next == 0 {
                return false;
            }
            idx = (idx + next as u32) & self.mask();
        }
    }

    fn grow(&self) {
        let old_capacity = self.capacity.get();
        let old_nodes = self.nodes.get();
        let new_capacity = old_capacity * 2;
        log::debug!("hash set growing from {old_capacity} to {new_capacity} slots");
        let new_nodes = self
            .arena
            .alloc::<Slot<V>>(new_capacity as usize, AllocFlags::NONE)
            .expect("hash set grow allocation failed");
        self.nodes.set(new_nodes);
        self.capacity.set(new_capacity);
        self.size.set(0);
        self.init_slots();

        for i in 0..old_capacity {
            let node = unsafe { &*old_nodes.as_ptr().add(i as usize) };
            if node.hash != HASH_NULL && node.hash != HASH_DELETED {
                self.set_inner(node.hash, node.value);
                self.size.set(self.size.get() + 1);
            }
        }
    }

    pub fn iter(&self) -> HashSetIter<'_, 'a, V> {
        HashSetIter { set: self, idx: 0 }
    }
}

pub struct HashSetIter<'s, 'a, V: Copy> {
    set: &'s HashSet<'a, V>,
    idx: u32,
}

impl<'s, 'a, V: Copy> Iterator for HashSetIter<'s, 'a, V> {
    type Item = (u64, V);
    fn next(&mut self) -> Option<(u64, V)> {
        while self.idx < self.set.capacity.get() {
            let i = self.idx;
            self.idx += 1;
            let node = self.set.slot(i);
            if node.hash != HASH_NULL && node.hash != HASH_DELETED {
                return Some((node.hash, node.value));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_arena::Arena;

    #[test]
    fn insert_then_get_roundtrips() {
        let arena = Arena::new(1 << 16).unwrap();
        let set: HashSet<u32> = HashSet::new(&arena);
        set.set(hash_u64(1), 100);
        set.set(hash_u64(2), 200);
        assert_eq!(set.get(hash_u64(1)), Some(100));
        assert_eq!(set.get(hash_u64(2)), Some(200));
        assert_eq!(set.get(hash_u64(3)), None);
    }

    #[test]
    fn overwrite_updates_value() {
        let arena = Arena::new(1 << 16).unwrap();
        let set: HashSet<u32> = HashSet::new(&arena);
        set.set(hash_u64(7), 1);
        set.set(hash_u64(7), 2);
        assert_eq!(set.get(hash_u64(7)), Some(2));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn erase_removes_entry() {
        let arena = Arena::new(1 << 16).unwrap();
        let set: HashSet<u32> = HashSet::new(&arena);
        set.set(hash_u64(9), 42);
        assert!(set.erase(hash_u64(9)));
        assert_eq!(set.get(hash_u64(9)), None);
    }

    #[test]
    fn survives_growth() {
        let arena = Arena::new(1 << 20).unwrap();
        let set: HashSet<u32> = HashSet::new(&arena);
        for i in 0..500u64 {
            set.set(hash_u64(i), i as u32);
        }
        for i in 0..500u64 {
            assert_eq!(set.get(hash_u64(i)), Some(i as u32));
        }
    }

    proptest::proptest! {
        #[test]
        fn every_inserted_key_is_findable(keys in proptest::collection::hash_set(0u64..100_000, 0..300)) {
            let arena = Arena::new(1 << 20).unwrap();
            let set: HashSet<u64> = HashSet::new(&arena);
            for &k in &keys {
                set.set(hash_u64(k), k);
            }
            proptest::prop_assert_eq!(set.len() as usize, keys.len());
            for &k in &keys {
                proptest::prop_assert_eq!(set.get(hash_u64(k)), Some(k));
            }
        }

        #[test]
        fn erased_keys_are_gone_but_others_remain(keys in proptest::collection::vec(0u64..100_000, 1..200)) {
            let arena = Arena::new(1 << 20).unwrap();
            let set: HashSet<u64> = HashSet::new(&arena);
            let unique: std::collections::HashSet<u64> = keys.iter().copied().collect();
            for &k in &unique {
                set.set(hash_u64(k), k);
            }
            let (erased, kept): (Vec<u64>, Vec<u64>) = unique.iter().enumerate().fold(
                (Vec::new(), Vec::new()),
                |(mut e, mut k), (i, &v)| {
                    if i % 2 == 0 { e.push(v) } else { k.push(v) }
                    (e, k)
                },
            );
            for &k in &erased {
                proptest::prop_assert!(set.erase(hash_u64(k)));
            }
            for &k in &erased {
                proptest::prop_assert_eq!(set.get(hash_u64(k)), None);
            }
            for &k in &kept {
                proptest::prop_assert_eq!(set.get(hash_u64(k)), Some(k));
            }
        }
    }
}
