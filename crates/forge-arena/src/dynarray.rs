use crate::{AllocFlags, Arena};
use std::cell::Cell;
use std::ptr::NonNull;

/// A growable array whose backing storage lives in an [`Arena`].
///
/// Growth allocates a fresh, larger block from the arena and copies the
/// existing elements; the old block is simply abandoned, matching the
/// arena's bulk-reset-only reclamation model. `T` must be `Copy`: the
/// elements are memcpy'd wholesale on grow, never individually dropped.
pub struct DynArray<'a, T: Copy> {
    arena: &'a Arena,
    data: Cell<NonNull<T>>,
    size: Cell<u32>,
    capacity: Cell<u32>,
}

impl<'a, T: Copy> DynArray<'a, T> {
    pub fn new(arena: &'a Arena, initial_capacity: u32) -> DynArray<'a, T> {
        let capacity = initial_capacity.max(1);
        let data = arena
            .alloc::<T>(capacity as usize, AllocFlags::NONE)
            .expect("dynamic array initial allocation failed");
        DynArray {
            arena,
            data: Cell::new(data),
            size: Cell::new(0),
            capacity: Cell::new(capacity),
        }
    }

    pub fn len(&self) -> u32 {
        self.size.get()
    }

    pub fn is_empty(&self) -> bool {
        self.size.get() == 0
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.get()
    }

    fn grow_to(&self, required: u32) {
        let new_capacity = required.max(self.capacity.get() * 2);
        let new_data = self
            .arena
            .alloc::<T>(new_capacity as usize, AllocFlags::NONE)
            .expect("dynamic array grow allocation failed");
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data.get().as_ptr(),
                new_data.as_ptr(),
                self.size.get() as usize,
            );
        }
        self.data.set(new_data);
        self.capacity.set(new_capacity);
    }

    pub fn push(&self, value: T) {
        if self.size.get() == self.capacity.get() {
            self.grow_to(self.capacity.get() + 1);
        }
        unsafe {
            *self.data.get().as_ptr().add(self.size.get() as usize) = value;
        }
        self.size.set(self.size.get() + 1);
    }

    pub fn get(&self, index: u32) -> T {
        assert!(index < self.size.get(), "dynamic array index out of bounds");
        unsafe { *self.data.get().as_ptr().add(index as usize) }
    }

    pub fn set(&self, index: u32, value: T) {
        assert!(index < self.size.get(), "dynamic array index out of bounds");
        unsafe {
            *self.data.get().as_ptr().add(index as usize) = value;
        }
    }

    /// Removes the element at `index`, shifting later elements left by one.
    pub fn remove(&self, index: u32) -> T {
        let len = self.size.get();
        assert!(index < len, "dynamic array index out of bounds");
        let removed = self.get(index);
        unsafe {
            let base = self.data.get().as_ptr();
            std::ptr::copy(
                base.add(index as usize + 1),
                base.add(index as usize),
                (len - index - 1) as usize,
            );
        }
        self.size.set(len - 1);
        removed
    }

    pub fn pop(&self) -> Option<T> {
        if self.size.get() == 0 {
            return None;
        }
        let value = self.get(self.size.get() - 1);
        self.size.set(self.size.get() - 1);
        Some(value)
    }

    pub fn clear(&self) {
        self.size.set(0);
    }

    pub fn find<F: Fn(T) -> bool>(&self, pred: F) -> Option<u32> {
        (0..self.size.get()).find(|&i| pred(self.get(i)))
    }

    /// Swaps the elements at `i` and `j`.
    pub fn swap(&self, i: u32, j: u32) {
        let len = self.size.get();
        assert!(i < len && j < len, "dynamic array index out of bounds");
        if i == j {
            return;
        }
        unsafe {
            let base = self.data.get().as_ptr();
            std::ptr::swap(base.add(i as usize), base.add(j as usize));
        }
    }

    /// Returns an independent copy backed by a fresh allocation out of the
    /// same arena.
    pub fn clone(&self) -> DynArray<'a, T> {
        let len = self.size.get();
        let capacity = self.capacity.get();
        let new_data = self
            .arena
            .alloc::<T>(capacity as usize, AllocFlags::NONE)
            .expect("dynamic array clone allocation failed");
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.get().as_ptr(), new_data.as_ptr(), len as usize);
        }
        DynArray {
            arena: self.arena,
            data: Cell::new(new_data),
            size: Cell::new(len),
            capacity: Cell::new(capacity),
        }
    }

    pub fn iter(&self) -> DynArrayIter<'_, 'a, T> {
        DynArrayIter {
            array: self,
            index: 0,
        }
    }
}

pub struct DynArrayIter<'d, 'a, T: Copy> {
    array: &'d DynArray<'a, T>,
    index: u32,
}

impl<'d, 'a, T: Copy> Iterator for DynArrayIter<'d, 'a, T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        if self.index >= self.array.len() {
            return None;
        }
        let v = self.array.get(self.index);
        self.index += 1;
        Some(v)
    }
}
