//! Bump allocator backing a memtable.
//!
//! Allocations are served from 4 KiB blocks and are never individually
//! freed; everything is released when the arena is dropped together with
//! its memtable. Approximate usage is published through a relaxed atomic so
//! readers can sample it without synchronizing with the writer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const BLOCK_SIZE: usize = 4096;

pub struct Arena {
    core: Mutex<Core>,
    usage: AtomicUsize,
}

struct Core {
    // Bump state for the current block.
    ptr: *mut u8,
    remaining: usize,
    blocks: Vec<Box<[u8]>>,
}

// The raw pointer only ever aliases memory owned by `blocks`, which lives
// as long as the arena; handing out pointers is what the type is for.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new() -> Self {
        Arena {
            core: Mutex::new(Core {
                ptr: std::ptr::null_mut(),
                remaining: 0,
                blocks: Vec::new(),
            }),
            usage: AtomicUsize::new(0),
        }
    }

    /// Allocates `n` bytes. The returned memory stays valid until the arena
    /// is dropped. `n` must be > 0.
    pub fn allocate(&self, n: usize) -> *mut u8 {
        assert!(n > 0);
        let mut core = self.core.lock().unwrap();
        if n <= core.remaining {
            let result = core.ptr;
            core.ptr = unsafe { core.ptr.add(n) };
            core.remaining -= n;
            return result;
        }
        self.allocate_fallback(&mut core, n)
    }

    /// Allocates `n` bytes aligned for pointer-sized data.
    pub fn allocate_aligned(&self, n: usize) -> *mut u8 {
        let align = std::mem::size_of::<usize>().max(8);
        debug_assert!(align.is_power_of_two());
        let mut core = self.core.lock().unwrap();
        let slop = {
            let current_mod = core.ptr as usize & (align - 1);
            if current_mod == 0 {
                0
            } else {
                align - current_mod
            }
        };
        let needed = n + slop;
        if needed <= core.remaining {
            let result = unsafe { core.ptr.add(slop) };
            core.ptr = unsafe { core.ptr.add(needed) };
            core.remaining -= needed;
            result
        } else {
            // Fallback blocks come from the global allocator and are
            // already aligned for anything we hand out.
            self.allocate_fallback(&mut core, n)
        }
    }

    fn allocate_fallback(&self, core: &mut Core, n: usize) -> *mut u8 {
        if n > BLOCK_SIZE / 4 {
            // Large objects get their own block so the tail of the current
            // block is not wasted on them.
            return self.new_block(core, n);
        }
        let ptr = self.new_block(core, BLOCK_SIZE);
        core.ptr = unsafe { ptr.add(n) };
        core.remaining = BLOCK_SIZE - n;
        ptr
    }

    fn new_block(&self, core: &mut Core, size: usize) -> *mut u8 {
        let mut block = vec![0u8; size].into_boxed_slice();
        let ptr = block.as_mut_ptr();
        core.blocks.push(block);
        self.usage.fetch_add(
            size + std::mem::size_of::<Box<[u8]>>(),
            Ordering::Relaxed,
        );
        ptr
    }

    /// Approximate total memory held by the arena. Readers may call this
    /// concurrently with allocation.
    pub fn memory_usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
