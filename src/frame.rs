// SPDX-License-Identifier: MPL-2.0

//! Frame descriptor shared between the capture backends and consumers.
//!
//! A [`VideoFrame`] either points straight into a native capture buffer
//! (zero-copy, with a disposer that releases the buffer when the last
//! reference drops) or into a buffer owned by its allocator after the
//! conversion engine materialized it.

use std::sync::Arc;

use tracing::trace;

use crate::alloc::{DefaultAllocator, FrameAllocator};
use crate::format::{FrameOrientation, PixelFormat};

/// Backend-specific handle retained for the lifetime of a zero-copy frame.
pub enum NativeHandle {
    /// Index into the V4L2 mmap buffer ring.
    BufferIndex(u32),
    /// Retained platform object (`CMSampleBufferRef` on Apple platforms,
    /// `IMediaSample*` on Windows). Released by the frame's disposer.
    Pointer(*mut std::ffi::c_void),
}

/// Cleanup hook run exactly once when the last reference to a frame drops.
pub(crate) type Disposer = Box<dyn FnOnce() + Send>;

/// A single captured video frame.
///
/// Frames are handed to consumers as `Arc<VideoFrame>`. A published frame
/// is read-only; it is filled by exactly one backend thread before
/// publication. Plane memory stays valid until the last reference drops:
/// either the [`allocator`](Self::allocator) owns it, or the disposer keeps
/// the native buffer retained.
pub struct VideoFrame {
    pub(crate) data: [*const u8; 3],
    pub(crate) stride: [u32; 3],
    pub(crate) pixel_format: PixelFormat,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) size_in_bytes: u32,
    pub(crate) timestamp: u64,
    pub(crate) frame_index: u64,
    pub(crate) orientation: FrameOrientation,
    pub(crate) allocator: Option<Arc<dyn FrameAllocator>>,
    pub(crate) native_handle: Option<NativeHandle>,
    pub(crate) disposer: Option<Disposer>,
    /// Keeps the pool slot marked busy while this frame is alive.
    pub(crate) pool_token: Option<Arc<dyn FrameAllocator>>,
}

// Safety: plane pointers target memory that is immutable after publication
// and kept alive by either `allocator` or the native buffer retained by the
// disposer. The only mutation after construction happens in `Drop`, which
// has exclusive access by definition.
unsafe impl Send for VideoFrame {}
unsafe impl Sync for VideoFrame {}

impl VideoFrame {
    /// Blank frame attached to a pool slot.
    pub(crate) fn with_pool_token(token: Arc<dyn FrameAllocator>) -> Self {
        let mut frame = VideoFrame::empty();
        frame.pool_token = Some(token);
        frame
    }

    pub(crate) fn empty() -> Self {
        VideoFrame {
            data: [std::ptr::null(); 3],
            stride: [0; 3],
            pixel_format: PixelFormat::Unknown,
            width: 0,
            height: 0,
            size_in_bytes: 0,
            timestamp: 0,
            frame_index: 0,
            orientation: FrameOrientation::TopToBottom,
            allocator: None,
            native_handle: None,
            disposer: None,
            pool_token: None,
        }
    }

    #[inline]
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Total bytes spanned by all planes.
    #[inline]
    pub fn size_in_bytes(&self) -> u32 {
        self.size_in_bytes
    }

    /// Nanoseconds since an arbitrary monotonic origin chosen by the
    /// backend.
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Strictly increasing per open session; the first frame is 0.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    #[inline]
    pub fn orientation(&self) -> FrameOrientation {
        self.orientation
    }

    /// Bytes per row of plane `index`; 0 when the plane is absent.
    #[inline]
    pub fn stride(&self, index: usize) -> u32 {
        self.stride.get(index).copied().unwrap_or(0)
    }

    /// Allocator owning the frame data, or `None` for zero-copy frames.
    pub fn allocator(&self) -> Option<&Arc<dyn FrameAllocator>> {
        self.allocator.as_ref()
    }

    /// Native handle of a zero-copy frame.
    pub fn native_handle(&self) -> Option<&NativeHandle> {
        self.native_handle.as_ref()
    }

    /// True when the planes point into a native capture buffer.
    pub fn is_zero_copy(&self) -> bool {
        self.native_handle.is_some()
    }

    /// Number of rows stored in plane `index` for this frame's format.
    pub(crate) fn plane_rows(&self, index: usize) -> u32 {
        if index == 0 {
            return self.height;
        }
        // Only the 4:2:0 formats carry extra planes, and their chroma planes
        // are vertically subsampled by two.
        self.height / 2
    }

    /// Read access to plane `index`, or `None` when the plane is absent.
    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        if index >= 3 || self.data[index].is_null() || self.stride[index] == 0 {
            return None;
        }
        let len = self.stride[index] as usize * self.plane_rows(index) as usize;
        // Safety: the region [data, data + stride * rows) is valid for the
        // frame's lifetime (struct invariant, see the Send/Sync comment).
        Some(unsafe { std::slice::from_raw_parts(self.data[index], len) })
    }

    /// Severs the frame from its native backing buffer.
    ///
    /// If the frame is zero-copy, the planes are copied into an
    /// allocator-owned buffer, the native handle is released immediately,
    /// and the frame no longer depends on the backend's buffer lifetime.
    /// A frame that already owns its buffer is left untouched.
    pub fn detach(&mut self) {
        let already_owned = match (&self.allocator, self.native_handle.is_none()) {
            (Some(allocator), true) => self.data[0] == allocator.data() as *const u8,
            _ => false,
        };
        if already_owned {
            return;
        }

        let allocator = self
            .allocator
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultAllocator::new()) as Arc<dyn FrameAllocator>);

        let plane_sizes: [usize; 3] = [
            self.stride[0] as usize * self.plane_rows(0) as usize,
            self.stride[1] as usize * self.plane_rows(1) as usize,
            self.stride[2] as usize * self.plane_rows(2) as usize,
        ];
        let total: usize = plane_sizes.iter().sum();
        allocator.resize(total.max(self.size_in_bytes as usize));
        let base = allocator.data();
        if base.is_null() {
            return; // allocation failure already reported
        }

        let mut offset = 0usize;
        for index in 0..3 {
            if self.data[index].is_null() || plane_sizes[index] == 0 {
                continue;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.data[index],
                    base.add(offset),
                    plane_sizes[index],
                );
            }
            self.data[index] = unsafe { base.add(offset) } as *const u8;
            offset += plane_sizes[index];
        }

        self.allocator = Some(allocator);
        self.native_handle = None;
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
        trace!(
            frame_index = self.frame_index,
            bytes = total,
            "frame detached from native buffer"
        );
    }

    /// Returns a deep copy that owns its buffer and carries no native
    /// handle, leaving this frame untouched.
    pub fn to_detached(&self) -> VideoFrame {
        let mut copy = VideoFrame::empty();
        copy.data = self.data;
        copy.stride = self.stride;
        copy.pixel_format = self.pixel_format;
        copy.width = self.width;
        copy.height = self.height;
        copy.size_in_bytes = self.size_in_bytes;
        copy.timestamp = self.timestamp;
        copy.frame_index = self.frame_index;
        copy.orientation = self.orientation;
        // detach() sees a frame without allocator or handle and copies the
        // planes out; the source planes stay valid for the whole call
        // because `self` is borrowed.
        copy.detach_planes_from(self);
        copy
    }

    fn detach_planes_from(&mut self, source: &VideoFrame) {
        let allocator: Arc<dyn FrameAllocator> = Arc::new(DefaultAllocator::new());
        let plane_sizes: [usize; 3] = [
            source.stride[0] as usize * source.plane_rows(0) as usize,
            source.stride[1] as usize * source.plane_rows(1) as usize,
            source.stride[2] as usize * source.plane_rows(2) as usize,
        ];
        let total: usize = plane_sizes.iter().sum();
        allocator.resize(total.max(source.size_in_bytes as usize));
        let base = allocator.data();
        if base.is_null() {
            return;
        }
        let mut offset = 0usize;
        for index in 0..3 {
            if source.data[index].is_null() || plane_sizes[index] == 0 {
                self.data[index] = std::ptr::null();
                continue;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    source.data[index],
                    base.add(offset),
                    plane_sizes[index],
                );
            }
            self.data[index] = unsafe { base.add(offset) } as *const u8;
            offset += plane_sizes[index];
        }
        self.allocator = Some(allocator);
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }
}

// A manual Debug impl keeps the raw plane pointers out of log output.
impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("pixel_format", &self.pixel_format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("size_in_bytes", &self.size_in_bytes)
            .field("frame_index", &self.frame_index)
            .field("orientation", &self.orientation)
            .field("zero_copy", &self.is_zero_copy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_frame(data: &'static [u8], width: u32, height: u32) -> VideoFrame {
        let mut frame = VideoFrame::empty();
        frame.data[0] = data.as_ptr();
        frame.stride[0] = width * 3;
        frame.pixel_format = PixelFormat::Rgb24;
        frame.width = width;
        frame.height = height;
        frame.size_in_bytes = width * 3 * height;
        frame
    }

    #[test]
    fn disposer_runs_exactly_once_on_drop() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        static DATA: [u8; 6] = [1, 2, 3, 4, 5, 6];

        let mut frame = test_frame(&DATA, 2, 1);
        frame.native_handle = Some(NativeHandle::BufferIndex(0));
        frame.disposer = Some(Box::new(|| {
            RUNS.fetch_add(1, Ordering::SeqCst);
        }));

        let shared = Arc::new(frame);
        let other = shared.clone();
        drop(shared);
        assert_eq!(RUNS.load(Ordering::SeqCst), 0, "a reference is still live");
        drop(other);
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_copies_planes_and_releases_native_buffer() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        static DATA: [u8; 6] = [10, 20, 30, 40, 50, 60];

        let mut frame = test_frame(&DATA, 2, 1);
        frame.native_handle = Some(NativeHandle::BufferIndex(3));
        frame.disposer = Some(Box::new(|| {
            RUNS.fetch_add(1, Ordering::SeqCst);
        }));

        frame.detach();
        assert_eq!(RUNS.load(Ordering::SeqCst), 1, "disposer runs at detach");
        assert!(frame.native_handle.is_none());
        assert!(frame.allocator.is_some());
        assert_ne!(frame.data[0], DATA.as_ptr());
        assert_eq!(frame.plane(0).unwrap(), &DATA);

        // Dropping after detach must not run the disposer again.
        drop(frame);
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_is_idempotent_for_owned_frames() {
        static DATA: [u8; 6] = [9, 8, 7, 6, 5, 4];
        let mut frame = test_frame(&DATA, 2, 1);
        frame.detach();
        let owned_ptr = frame.data[0];
        frame.detach();
        assert_eq!(frame.data[0], owned_ptr);
    }

    #[test]
    fn to_detached_leaves_source_untouched() {
        static DATA: [u8; 6] = [1, 1, 2, 3, 5, 8];
        let frame = test_frame(&DATA, 2, 1);
        let copy = frame.to_detached();
        assert_eq!(frame.data[0], DATA.as_ptr());
        assert_eq!(copy.plane(0).unwrap(), frame.plane(0).unwrap());
        assert!(copy.allocator.is_some());
    }

    #[test]
    fn plane_accessor_bounds() {
        static DATA: [u8; 6] = [0; 6];
        let frame = test_frame(&DATA, 2, 1);
        assert!(frame.plane(0).is_some());
        assert!(frame.plane(1).is_none());
        assert!(frame.plane(2).is_none());
        assert!(frame.plane(9).is_none());
    }
}
