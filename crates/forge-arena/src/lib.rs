//! Linear bump allocator with bulk reset, and an arena-backed dynamic array.
//!
//! Mirrors the allocation substrate the rest of the crate graph is built on:
//! every per-frame allocation (job slots, render graph nodes, command
//! packets) comes out of an arena so it can be reclaimed in one shot instead
//! of walking a free list.

mod dynarray;
mod error;

pub use dynarray::DynArray;
pub use error::{ArenaError, Result};

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::ptr::NonNull;

/// Behavior flags for a single [`Arena::alloc`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags(u8);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    pub const ZERO_MEMORY: AllocFlags = AllocFlags(1 << 0);
    pub const SOFT_FAIL: AllocFlags = AllocFlags(1 << 1);

    pub const fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AllocFlags {
    type Output = AllocFlags;
    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

/// A contiguous byte range with a monotonically increasing offset.
///
/// Not `Sync`: callers that need per-thread scratch arenas should give each
/// thread its own `Arena` rather than share one behind a lock.
pub struct Arena {
    base: NonNull<u8>,
    layout: Layout,
    offset: Cell<usize>,
}

impl Arena {
    /// Reserves `capacity` bytes from the global allocator.
    pub fn new(capacity: usize) -> Result<Arena> {
        let layout = Layout::from_size_align(capacity.max(1), 16)
            .map_err(|_| ArenaError::ReserveFailed { requested: capacity })?;
        let base = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(base).ok_or(ArenaError::ReserveFailed { requested: capacity })?;
        Ok(Arena {
            base,
            layout,
            offset: Cell::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub fn current_size(&self) -> usize {
        self.offset.get()
    }

    /// Rewinds the arena to empty without releasing the underlying memory.
    /// Every pointer previously returned by `alloc` is invalidated.
    pub fn reset(&self) {
        self.offset.set(0);
    }

    /// Allocates `count` contiguous, `align_of::<T>()`-aligned values of `T`.
    ///
    /// On exhaustion: with [`AllocFlags::SOFT_FAIL`] set, returns
    /// `Err(ArenaError::OutOfMemory)`; otherwise logs and aborts, matching
    /// the hard-fail-by-default posture of the allocator this substrate is
    /// built around.
    pub fn alloc<T>(&self, count: usize, flags: AllocFlags) -> Result<NonNull<T>> {
        let requested = std::mem::size_of::<T>()
            .checked_mul(count)
            .expect("allocation size overflow");
        let align = std::mem::align_of::<T>();
        let ptr = self.alloc_raw(requested, align, flags)?;
        let typed = ptr.cast::<T>();
        if flags.contains(AllocFlags::ZERO_MEMORY) {
            unsafe { typed.as_ptr().write_bytes(0u8, count) };
        }
        Ok(typed)
    }

    fn alloc_raw(&self, size: usize, align: usize, flags: AllocFlags) -> Result<NonNull<u8>> {
        let start = self.offset.get();
        let aligned_start = (start + align - 1) & !(align - 1);
        let end = aligned_start
            .checked_add(size)
            .expect("allocation offset overflow");
        if end > self.capacity() {
            if flags.contains(AllocFlags::SOFT_FAIL) {
                return Err(ArenaError::OutOfMemory {
                    requested: size,
                    offset: start,
                    capacity: self.capacity(),
                });
            }
            log::error!(
                "arena exhausted: requested {size} bytes at offset {start} of {} byte arena",
                self.capacity()
            );
            panic!("arena out of memory");
        }
        self.offset.set(end);
        // SAFETY: [aligned_start, end) lies within [0, capacity) by the check above,
        // and the arena owns `capacity` bytes starting at `base`.
        let ptr = unsafe { self.base.as_ptr().add(aligned_start) };
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_alignment() {
        let arena = Arena::new(4096).unwrap();
        let p = arena.alloc::<u64>(4, AllocFlags::NONE).unwrap();
        assert_eq!(p.as_ptr() as usize % std::mem::align_of::<u64>(), 0);
    }

    #[test]
    fn reset_replays_identical_offsets() {
        let arena = Arena::new(4096).unwrap();
        let a = arena.alloc::<u32>(8, AllocFlags::NONE).unwrap();
        arena.reset();
        let b = arena.alloc::<u32>(8, AllocFlags::NONE).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn soft_fail_reports_exhaustion() {
        let arena = Arena::new(8).unwrap();
        let err = arena.alloc::<u64>(4, AllocFlags::SOFT_FAIL).unwrap_err();
        assert!(matches!(err, ArenaError::OutOfMemory { .. }));
    }

    #[test]
    fn zeroed_alloc_is_zero() {
        let arena = Arena::new(4096).unwrap();
        let p = arena.alloc::<u64>(1, AllocFlags::ZERO_MEMORY).unwrap();
        assert_eq!(unsafe { *p.as_ptr() }, 0);
    }
}
