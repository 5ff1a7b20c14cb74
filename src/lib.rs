// SPDX-License-Identifier: MPL-2.0

//! framegrab: cross-platform camera capture.
//!
//! A uniform interface for acquiring raw video frames from system cameras:
//! V4L2 on Linux, AVFoundation on macOS, DirectShow on Windows. Frames are
//! delivered zero-copy from the native capture buffers wherever possible
//! and converted by a SIMD-accelerated pixel engine when the caller asks
//! for a different format or orientation.
//!
//! # Architecture
//!
//! - [`Provider`]: device discovery, the capture session, and the
//!   producer/consumer frame queue ([`Provider::grab`] / frame callback)
//! - [`VideoFrame`]: plane pointers + strides, pooled and reference
//!   counted; zero-copy frames release their native buffer when the last
//!   reference drops
//! - [`convert`]: the pixel-conversion engine (RGB shuffles, YUV → RGB,
//!   vertical flip) with AVX2 / NEON / Apple-Accelerate backends and a
//!   scalar reference path
//! - [`dump`]: debug helpers writing frames as BMP/raw-YUV files
//!
//! # Example
//!
//! ```no_run
//! use framegrab::{Property, Provider};
//!
//! let mut camera = Provider::new();
//! camera.set(Property::Width, 1280.0);
//! camera.set(Property::Height, 720.0);
//! if camera.open("", true) {
//!     while let Some(frame) = camera.grab(1000) {
//!         println!(
//!             "frame {}: {}x{} {}",
//!             frame.frame_index(),
//!             frame.width(),
//!             frame.height(),
//!             frame.pixel_format()
//!         );
//!     }
//! }
//! ```

mod alloc;
mod backend;
pub mod convert;
pub mod dump;
mod errors;
mod format;
mod frame;
mod pool;
mod provider;

pub use alloc::{
    reset_shared_allocators, shared_scratch_allocator, AllocatorFactory, DefaultAllocator,
    FrameAllocator, BUFFER_ALIGNMENT,
};
pub use convert::{
    convert_backend, convert_frame_in_place, set_convert_backend, ConvertBackend, ConvertFlag,
};
pub use errors::{clear_error_callback, set_error_callback, ErrorCallback, ErrorCode};
pub use format::{bits, FrameOrientation, PixelFormat};
pub use frame::{NativeHandle, VideoFrame};
pub use provider::{
    DeviceInfo, FrameProperty, Property, Provider, Resolution, DEFAULT_MAX_AVAILABLE_FRAME_SIZE,
    DEFAULT_MAX_CACHE_FRAME_SIZE, GRAB_WAIT_FOREVER,
};
