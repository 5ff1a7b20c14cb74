// SPDX-License-Identifier: MPL-2.0

//! Aligned byte-buffer allocation for frame and scratch storage.
//!
//! All buffers are 32-byte aligned so the AVX2/NEON conversion kernels can
//! use aligned loads on whole rows. Consumers can swap in their own
//! allocator (e.g. one backed by GPU-upload-friendly memory) through
//! [`crate::Provider::set_frame_allocator`].

use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::errors::{report_error, ErrorCode};

/// Buffer alignment required by the SIMD conversion kernels.
pub const BUFFER_ALIGNMENT: usize = 32;

/// A growable, 32-byte-aligned byte buffer.
///
/// Implementations must keep the pointer returned by [`data`] valid until
/// the next [`resize`] call or drop, and must hand out 32-byte-aligned
/// memory.
///
/// [`data`]: FrameAllocator::data
/// [`resize`]: FrameAllocator::resize
pub trait FrameAllocator: Send + Sync {
    /// Ensures the buffer holds at least `size` bytes.
    ///
    /// After a failed allocation `data()` is null and `size()` is 0.
    fn resize(&self, size: usize);

    /// Pointer to the start of the buffer, or null before the first
    /// successful `resize`.
    fn data(&self) -> *mut u8;

    /// Current capacity in bytes.
    fn size(&self) -> usize;
}

/// Factory producing allocators for materialized frames.
pub type AllocatorFactory = dyn Fn() -> Arc<dyn FrameAllocator> + Send + Sync;

struct Block {
    ptr: *mut u8,
    size: usize,
}

// The raw pointer is owned exclusively by the containing allocator and only
// handed out under the single-writer discipline of the frame pipeline.
unsafe impl Send for Block {}

/// Default heap allocator used when no custom factory is installed.
pub struct DefaultAllocator {
    block: Mutex<Block>,
}

impl DefaultAllocator {
    pub fn new() -> Self {
        Self {
            block: Mutex::new(Block {
                ptr: std::ptr::null_mut(),
                size: 0,
            }),
        }
    }

    fn layout_for(size: usize) -> Layout {
        // Round up to a whole number of alignment units.
        let padded = (size + BUFFER_ALIGNMENT - 1) & !(BUFFER_ALIGNMENT - 1);
        Layout::from_size_align(padded, BUFFER_ALIGNMENT).expect("buffer layout")
    }
}

impl Default for DefaultAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for DefaultAllocator {
    fn resize(&self, size: usize) {
        debug_assert!(size > 0, "resize(0) is not meaningful");
        let mut block = self.block.lock().unwrap_or_else(|e| e.into_inner());

        // Reuse the current block when it is at least as large as requested
        // but no more than twice the request. The lower bound avoids
        // re-allocation churn on small fluctuations; the upper bound keeps a
        // briefly-huge frame from pinning memory forever.
        if !block.ptr.is_null() && size <= block.size && size >= block.size / 2 {
            return;
        }

        if !block.ptr.is_null() {
            unsafe { dealloc(block.ptr, Self::layout_for(block.size)) };
        }

        let layout = Self::layout_for(size);
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            block.ptr = std::ptr::null_mut();
            block.size = 0;
            report_error(
                ErrorCode::MemoryAllocationFailed,
                &format!("failed to allocate {} bytes for frame buffer", layout.size()),
            );
            return;
        }

        trace!(bytes = layout.size(), "allocated frame buffer");
        block.ptr = ptr;
        block.size = layout.size();
    }

    fn data(&self) -> *mut u8 {
        self.block.lock().unwrap_or_else(|e| e.into_inner()).ptr
    }

    fn size(&self) -> usize {
        self.block.lock().unwrap_or_else(|e| e.into_inner()).size
    }
}

impl Drop for DefaultAllocator {
    fn drop(&mut self) {
        let block = self.block.get_mut().unwrap_or_else(|e| e.into_inner());
        if !block.ptr.is_null() {
            unsafe { dealloc(block.ptr, Self::layout_for(block.size)) };
        }
    }
}

/// Generation counter bumped by [`reset_shared_allocators`]; thread-local
/// slots lazily drop themselves when they observe a newer generation.
static SCRATCH_GENERATION: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static SCRATCH_SLOTS: RefCell<(u64, [Option<Arc<DefaultAllocator>>; 2])> =
        const { RefCell::new((0, [None, None])) };
}

/// Returns this thread's shared scratch allocator.
///
/// The conversion engine uses scratch buffers for intermediate results
/// (e.g. a 32-bit staging image when the final output is 24-bit). Up to two
/// allocators exist per thread so one nested scope (convert + flip) does
/// not overwrite its caller's scratch data; a slot is handed out only while
/// no other holder keeps it alive.
pub fn shared_scratch_allocator() -> Arc<dyn FrameAllocator> {
    SCRATCH_SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        let generation = SCRATCH_GENERATION.load(Ordering::Acquire);
        if slots.0 != generation {
            slots.0 = generation;
            slots.1 = [None, None];
        }

        let primary = slots.1[0].get_or_insert_with(|| Arc::new(DefaultAllocator::new()));
        if Arc::strong_count(primary) == 1 {
            return primary.clone() as Arc<dyn FrameAllocator>;
        }

        let secondary = slots.1[1].get_or_insert_with(|| {
            debug!("primary scratch allocator engaged, creating secondary");
            Arc::new(DefaultAllocator::new())
        });
        secondary.clone() as Arc<dyn FrameAllocator>
    })
}

/// Drops every thread's scratch allocator slots.
///
/// Threads release their buffers the next time they ask for a scratch
/// allocator; buffers still borrowed by in-flight conversions stay alive
/// until those conversions finish.
pub fn reset_shared_allocators() {
    SCRATCH_GENERATION.fetch_add(1, Ordering::Release);
    SCRATCH_SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        slots.0 = SCRATCH_GENERATION.load(Ordering::Acquire);
        slots.1 = [None, None];
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned() {
        let allocator = DefaultAllocator::new();
        allocator.resize(100);
        assert!(!allocator.data().is_null());
        assert_eq!(allocator.data() as usize % BUFFER_ALIGNMENT, 0);
        assert!(allocator.size() >= 100);
        assert_eq!(allocator.size() % BUFFER_ALIGNMENT, 0);
    }

    #[test]
    fn resize_reuses_within_window() {
        let allocator = DefaultAllocator::new();
        allocator.resize(1024);
        let first = allocator.data();
        let first_size = allocator.size();

        // Same size and mild shrink both reuse the block.
        allocator.resize(1024);
        assert_eq!(allocator.data(), first);
        allocator.resize(600);
        assert_eq!(allocator.data(), first);
        assert_eq!(allocator.size(), first_size);

        // Growing past the block forces a fresh allocation.
        allocator.resize(4096);
        assert!(allocator.size() >= 4096);

        // Shrinking below half the held size releases the large block.
        allocator.resize(128);
        assert!(allocator.size() < 4096);
    }

    #[test]
    fn scratch_allocator_hands_out_second_slot_when_busy() {
        reset_shared_allocators();
        let first = shared_scratch_allocator();
        let second = shared_scratch_allocator();
        // The first is still held, so the second request must not alias it.
        first.resize(64);
        second.resize(64);
        assert_ne!(first.data(), second.data());

        drop(first);
        drop(second);
        let again = shared_scratch_allocator();
        again.resize(64);
        assert!(!again.data().is_null());
    }

    #[test]
    fn reset_drops_thread_slots() {
        let before = shared_scratch_allocator();
        before.resize(64);
        let ptr = before.data();
        drop(before);

        reset_shared_allocators();
        let after = shared_scratch_allocator();
        // A fresh allocator has no block until resized.
        assert!(after.data().is_null() || after.data() != ptr);
    }
}
