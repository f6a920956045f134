//! Per-pass command buckets: commands are appended in arbitrary order,
//! each tagged with a caller-defined sort key, and `submit` radix-sorts
//! the keys before dispatching so draw order falls out of the sort
//! rather than being managed by hand.

use std::cell::Cell;
use std::ptr::NonNull;

use forge_arena::{AllocFlags, Arena, DynArray};
use forge_backend::BackendDriver;

/// A command packet's dispatch function: receives the driver and a
/// pointer to the command bytes written at the packet's `cmds` region.
/// Commands are POD; their layout is private to whichever call site
/// allocated them and cast `cmds` back to a concrete type.
pub type DispatchFn = unsafe fn(&mut dyn BackendDriver, *const u8);

/// One link in a command chain. `next` is set by `append_command` to
/// chain auxiliary commands (bind, update) behind a draw under the same
/// sort key. `data` points at an optional auxiliary byte block
/// allocated ahead of `cmds`; it is null when a packet carries none.
#[repr(C)]
pub struct CommandPacket {
    next: Cell<*const CommandPacket>,
    dispatch_fn: DispatchFn,
    pub cmds: *mut u8,
    pub data: *mut u8,
}

impl CommandPacket {
    /// Casts the packet's command region to `&mut T`. The caller is
    /// responsible for `T` matching what `dispatch_fn` expects to read,
    /// and for not holding two such references at once.
    pub unsafe fn cmd_mut<T>(&self) -> &mut T {
        &mut *(self.cmds as *mut T)
    }

    /// Casts the packet's auxiliary region to `&mut T`, if any was
    /// allocated for this packet.
    pub unsafe fn aux_mut<T>(&self) -> Option<&mut T> {
        if self.data.is_null() {
            None
        } else {
            Some(&mut *(self.data as *mut T))
        }
    }
}

fn alloc_packet(
    arena: &Arena,
    aux_size: usize,
    cmd_size: usize,
    dispatch_fn: DispatchFn,
) -> NonNull<CommandPacket> {
    let data = if aux_size > 0 {
        arena.alloc::<u8>(aux_size, AllocFlags::NONE).unwrap().as_ptr()
    } else {
        std::ptr::null_mut()
    };
    let cmds = arena.alloc::<u8>(cmd_size, AllocFlags::NONE).unwrap().as_ptr();
    let header = arena.alloc::<CommandPacket>(1, AllocFlags::NONE).unwrap();
    unsafe {
        header.as_ptr().write(CommandPacket {
            next: Cell::new(std::ptr::null()),
            dispatch_fn,
            cmds,
            data,
        });
    }
    header
}

/// Per-pass container of sortable, chained command packets.
pub struct CommandBucket<'a> {
    keys: DynArray<'a, u64>,
    heads: DynArray<'a, *const CommandPacket>,
}

impl<'a> CommandBucket<'a> {
    /// Pre-reserves storage for `capacity` top-level commands. `arena`
    /// backs the bucket's own key/head arrays, independent of whichever
    /// arena individual `add_command`/`append_command` calls allocate
    /// packets from.
    pub fn new(capacity: u32, arena: &'a Arena) -> CommandBucket<'a> {
        CommandBucket {
            keys: DynArray::new(arena, capacity),
            heads: DynArray::new(arena, capacity),
        }
    }

    pub fn len(&self) -> u32 {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Allocates a new top-level packet sorted under `key`, sized for
    /// `cmd_size` bytes of command data out of `arena`. Returns the
    /// packet so the caller can write the command's fields via
    /// [`CommandPacket::cmd_mut`].
    pub fn add_command(
        &self,
        key: u64,
        cmd_size: usize,
        arena: &Arena,
        dispatch_fn: DispatchFn,
    ) -> NonNull<CommandPacket> {
        let packet = alloc_packet(arena, 0, cmd_size, dispatch_fn);
        self.keys.push(key);
        self.heads.push(packet.as_ptr() as *const CommandPacket);
        packet
    }

    /// Chains a new packet after `prev`, inheriting `prev`'s sort key.
    /// `aux_size` reserves an auxiliary byte block (read via
    /// [`CommandPacket::aux_mut`]) ahead of the `cmd_size`-byte command
    /// region; pass `0` for none.
    pub fn append_command(
        &self,
        prev: NonNull<CommandPacket>,
        aux_size: usize,
        cmd_size: usize,
        arena: &Arena,
        dispatch_fn: DispatchFn,
    ) -> NonNull<CommandPacket> {
        let packet = alloc_packet(arena, aux_size, cmd_size, dispatch_fn);
        unsafe { prev.as_ref() }.next.set(packet.as_ptr() as *const CommandPacket);
        packet
    }

    /// Radix-sorts the key array (payload = packet index) and, for each
    /// sorted index, walks its packet chain invoking `dispatch_fn(driver,
    /// cmds)` at every link. Does not bind to any notion of "the current
    /// pass": the caller (typically the render graph's execute phase)
    /// supplies whichever driver the surviving pass holds. `arena` backs
    /// the sort's scratch buffers and the key/payload copy this call
    /// needs to hand the sort a contiguous slice; nothing here touches the
    /// heap.
    pub fn submit(&self, driver: &mut dyn BackendDriver, arena: &Arena) {
        let n = self.keys.len() as usize;
        if n == 0 {
            return;
        }
        log::trace!("submitting command bucket: {n} top-level commands");

        let keys_ptr = arena.alloc::<u64>(n, AllocFlags::NONE).expect("command bucket sort scratch allocation failed");
        let payload_ptr = arena.alloc::<u64>(n, AllocFlags::NONE).expect("command bucket sort scratch allocation failed");
        // SAFETY: both allocations are `n` contiguous, just-allocated `u64`s
        // owned exclusively by this call for its duration.
        let keys = unsafe { std::slice::from_raw_parts_mut(keys_ptr.as_ptr(), n) };
        let payload = unsafe { std::slice::from_raw_parts_mut(payload_ptr.as_ptr(), n) };
        for i in 0..n as u32 {
            keys[i as usize] = self.keys.get(i);
            payload[i as usize] = i as u64;
        }

        forge_sort::radix_sort(keys, payload, arena);

        for &idx in payload.iter() {
            let mut cursor = self.heads.get(idx as u32);
            while !cursor.is_null() {
                let packet = unsafe { &*cursor };
                unsafe { (packet.dispatch_fn)(driver, packet.cmds) };
                cursor = packet.next.get();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_backend::NullDriver;
    use std::sync::atomic::{AtomicI32, Ordering};

    static BUCKET_TEST_VAL: AtomicI32 = AtomicI32::new(0);

    struct AddCommand {
        add_val: i32,
    }

    struct MulCommand {
        factor_ptr: *const i32,
    }

    unsafe fn dispatch_add(_driver: &mut dyn BackendDriver, data: *const u8) {
        let cmd = &*(data as *const AddCommand);
        BUCKET_TEST_VAL.fetch_add(cmd.add_val, Ordering::Relaxed);
    }

    unsafe fn dispatch_mul(_driver: &mut dyn BackendDriver, data: *const u8) {
        let cmd = &*(data as *const MulCommand);
        let factor = *cmd.factor_ptr;
        let prev = BUCKET_TEST_VAL.load(Ordering::Relaxed);
        BUCKET_TEST_VAL.store(prev * factor, Ordering::Relaxed);
    }

    #[test]
    fn chained_commands_dispatch_in_append_order() {
        BUCKET_TEST_VAL.store(0, Ordering::Relaxed);
        let arena = Arena::new(1 << 16).unwrap();
        let bucket = CommandBucket::new(10, &arena);

        let pkt0 = bucket.add_command(0, std::mem::size_of::<AddCommand>(), &arena, dispatch_add);
        unsafe { pkt0.as_ref().cmd_mut::<AddCommand>().add_val = 5 };

        let pkt1 =
            bucket.append_command(pkt0, 0, std::mem::size_of::<AddCommand>(), &arena, dispatch_add);
        unsafe { pkt1.as_ref().cmd_mut::<AddCommand>().add_val = 10 };

        let pkt2 = bucket.append_command(
            pkt1,
            std::mem::size_of::<i32>(),
            std::mem::size_of::<MulCommand>(),
            &arena,
            dispatch_mul,
        );
        unsafe {
            let pkt2_ref = pkt2.as_ref();
            let aux: &mut i32 = pkt2_ref.aux_mut().unwrap();
            *aux = 2;
            pkt2_ref.cmd_mut::<MulCommand>().factor_ptr = aux as *const i32;
        }

        let mut driver = NullDriver::new();
        bucket.submit(&mut driver, &arena);

        assert_eq!(BUCKET_TEST_VAL.load(Ordering::Relaxed), (0 + 5 + 10) * 2);
    }

    #[test]
    fn sort_key_reorders_across_top_level_commands() {
        BUCKET_TEST_VAL.store(0, Ordering::Relaxed);
        let arena = Arena::new(1 << 16).unwrap();
        let bucket = CommandBucket::new(10, &arena);

        // Added out of key order; submit must still run key=0 before key=1.
        let later = bucket.add_command(1, std::mem::size_of::<MulCommand>(), &arena, dispatch_mul);
        static FACTOR: i32 = 10;
        unsafe { later.as_ref().cmd_mut::<MulCommand>().factor_ptr = &FACTOR };

        let earlier = bucket.add_command(0, std::mem::size_of::<AddCommand>(), &arena, dispatch_add);
        unsafe { earlier.as_ref().cmd_mut::<AddCommand>().add_val = 3 };

        let mut driver = NullDriver::new();
        bucket.submit(&mut driver, &arena);

        assert_eq!(BUCKET_TEST_VAL.load(Ordering::Relaxed), 30);
    }

    #[test]
    fn empty_bucket_submits_without_panic() {
        let arena = Arena::new(4096).unwrap();
        let bucket = CommandBucket::new(4, &arena);
        let mut driver = NullDriver::new();
        bucket.submit(&mut driver, &arena);
        assert!(bucket.is_empty());
    }

    struct RecordCommand {
        key: u64,
    }

    static RECORD_ORDER: std::sync::Mutex<Vec<u64>> = std::sync::Mutex::new(Vec::new());

    unsafe fn dispatch_record(_driver: &mut dyn BackendDriver, data: *const u8) {
        let cmd = &*(data as *const RecordCommand);
        RECORD_ORDER.lock().unwrap().push(cmd.key);
    }

    proptest::proptest! {
        #[test]
        fn dispatch_order_follows_ascending_keys(keys in proptest::collection::vec(0u64..1_000_000, 0..200)) {
            RECORD_ORDER.lock().unwrap().clear();
            let arena = Arena::new(1 << 20).unwrap();
            let bucket = CommandBucket::new(keys.len().max(1) as u32, &arena);
            for &key in &keys {
                let pkt = bucket.add_command(key, std::mem::size_of::<RecordCommand>(), &arena, dispatch_record);
                unsafe { pkt.as_ref().cmd_mut::<RecordCommand>().key = key };
            }

            let mut driver = NullDriver::new();
            bucket.submit(&mut driver, &arena);

            let mut expected = keys.clone();
            expected.sort_unstable();
            let observed = RECORD_ORDER.lock().unwrap().clone();
            proptest::prop_assert_eq!(observed, expected);
        }
    }
}
