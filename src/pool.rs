// SPDX-License-Identifier: MPL-2.0

//! Bounded reuse pool for frame buffers.
//!
//! Each pool slot is an allocator shared with at most one in-flight frame.
//! A slot is free again once the last reference to its frame drops, so a
//! frame is writable exactly while the backend holds the only reference.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::alloc::{AllocatorFactory, DefaultAllocator, FrameAllocator};
use crate::frame::VideoFrame;

/// Default cap for the reuse pool.
pub const DEFAULT_MAX_CACHE_FRAME_SIZE: usize = 15;

struct PoolState {
    slots: VecDeque<Arc<dyn FrameAllocator>>,
    max_size: usize,
    factory: Option<Arc<AllocatorFactory>>,
}

pub(crate) struct FramePool {
    state: Mutex<PoolState>,
}

impl FramePool {
    pub(crate) fn new() -> Self {
        FramePool {
            state: Mutex::new(PoolState {
                slots: VecDeque::new(),
                max_size: DEFAULT_MAX_CACHE_FRAME_SIZE,
                factory: None,
            }),
        }
    }

    /// Returns a blank frame bound to a free pool slot.
    ///
    /// Scans for the first slot with no outstanding frame; when every slot
    /// is busy, the oldest slot is evicted once the pool exceeds its cap
    /// and a fresh slot is allocated.
    pub(crate) fn get_free_frame(&self) -> VideoFrame {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(position) = state
            .slots
            .iter()
            .position(|slot| Arc::strong_count(slot) == 1)
        {
            return VideoFrame::with_pool_token(state.slots[position].clone());
        }

        if state.slots.len() > state.max_size {
            warn!("frame pool is full, evicting the oldest buffer");
            state.slots.pop_front();
        }

        let slot: Arc<dyn FrameAllocator> = match &state.factory {
            Some(factory) => factory(),
            None => Arc::new(DefaultAllocator::new()),
        };
        state.slots.push_back(slot.clone());
        VideoFrame::with_pool_token(slot)
    }

    /// Installs a custom allocator factory and drops all pooled buffers so
    /// every future frame uses the new source.
    pub(crate) fn set_factory(&self, factory: Arc<AllocatorFactory>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.factory = Some(factory);
        state.slots.clear();
    }

    pub(crate) fn set_max_size(&self, max_size: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.max_size = max_size.max(1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .slots
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_frames_reuse_slots() {
        let pool = FramePool::new();
        let first = pool.get_free_frame();
        let token = first.pool_token.clone().unwrap();
        drop(first);

        let second = pool.get_free_frame();
        assert!(Arc::ptr_eq(second.pool_token.as_ref().unwrap(), &token));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn busy_slots_are_skipped() {
        let pool = FramePool::new();
        let held = pool.get_free_frame();
        let other = pool.get_free_frame();
        assert!(!Arc::ptr_eq(
            held.pool_token.as_ref().unwrap(),
            other.pool_token.as_ref().unwrap()
        ));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn pool_never_exceeds_cap_plus_one() {
        let pool = FramePool::new();
        pool.set_max_size(3);

        let mut live = Vec::new();
        for _ in 0..16 {
            live.push(pool.get_free_frame());
            assert!(pool.len() <= 3 + 1, "pool len {} broke the cap", pool.len());
        }
    }

    #[test]
    fn factory_change_clears_pool() {
        let pool = FramePool::new();
        let frame = pool.get_free_frame();
        drop(frame);
        assert_eq!(pool.len(), 1);

        pool.set_factory(Arc::new(|| {
            Arc::new(DefaultAllocator::new()) as Arc<dyn FrameAllocator>
        }));
        assert_eq!(pool.len(), 0);
        let _frame = pool.get_free_frame();
        assert_eq!(pool.len(), 1);
    }
}
