//! Stable LSD base-10 radix sort over `u64` keys with a parallel `u64`
//! payload array (typically packet or element indices).
//!
//! Each pass is a decimal-digit counting sort: a 10-bucket histogram is
//! turned into prefix-sum offsets, then elements are placed back to front
//! so that equal keys preserve their relative order (stability). Scratch
//! space for the back-and-forth copy comes out of a caller-supplied
//! [`Arena`] rather than the heap, so a per-frame sort costs no allocation
//! beyond the arena's own bump pointer.

use forge_arena::{AllocFlags, Arena};

/// Sorts `keys` ascending, stably, permuting `payload` identically.
/// `keys.len()` must equal `payload.len()`. Scratch buffers for the sort
/// are bump-allocated out of `arena`.
pub fn radix_sort(keys: &mut [u64], payload: &mut [u64], arena: &Arena) {
    assert_eq!(keys.len(), payload.len());
    let n = keys.len();
    if n == 0 {
        return;
    }
    let max = *keys.iter().max().unwrap();
    let tmp_keys_ptr = arena.alloc::<u64>(n, AllocFlags::NONE).expect("radix sort scratch allocation failed");
    let tmp_payload_ptr = arena.alloc::<u64>(n, AllocFlags::NONE).expect("radix sort scratch allocation failed");
    // SAFETY: both allocations are `n` contiguous, just-allocated `u64`s
    // owned exclusively by this call for its duration.
    let tmp_keys = unsafe { std::slice::from_raw_parts_mut(tmp_keys_ptr.as_ptr(), n) };
    let tmp_payload = unsafe { std::slice::from_raw_parts_mut(tmp_payload_ptr.as_ptr(), n) };

    let mut pos: u64 = 1;
    while max / pos > 0 {
        count_sort(keys, payload, pos, tmp_keys, tmp_payload);
        match pos.checked_mul(10) {
            Some(next) => pos = next,
            None => break,
        }
    }
}

/// Sorts `keys` ascending and returns the identity-seeded permutation
/// (`payload[i] == i` before sorting), i.e. which original index now sits
/// at each sorted position. The permutation itself is still heap-allocated
/// since it outlives the call (callers own it); only the sort's internal
/// scratch comes from `arena`.
pub fn radix_sort_indices(keys: &mut [u64], arena: &Arena) -> Vec<u64> {
    let mut payload: Vec<u64> = (0..keys.len() as u64).collect();
    radix_sort(keys, &mut payload, arena);
    payload
}

fn count_sort(keys: &mut [u64], payload: &mut [u64], pos: u64, tmp_keys: &mut [u64], tmp_payload: &mut [u64]) {
    let n = keys.len();
    let mut bucket = [0u32; 10];
    for &k in keys.iter() {
        let digit = ((k / pos) % 10) as usize;
        bucket[digit] += 1;
    }
    for d in 1..10 {
        bucket[d] += bucket[d - 1];
    }
    for i in (0..n).rev() {
        let digit = ((keys[i] / pos) % 10) as usize;
        bucket[digit] -= 1;
        let dst = bucket[digit] as usize;
        tmp_keys[dst] = keys[i];
        tmp_payload[dst] = payload[i];
    }
    keys.copy_from_slice(tmp_keys);
    payload.copy_from_slice(tmp_payload);
}
