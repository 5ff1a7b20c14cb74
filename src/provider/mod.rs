// SPDX-License-Identifier: MPL-2.0

//! Public capture provider.
//!
//! A [`Provider`] owns one platform backend (V4L2, AVFoundation or
//! DirectShow) and the shared producer/consumer core. Frames can be pulled
//! with [`Provider::grab`] or pushed through a registered callback.

pub(crate) mod core;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alloc::{AllocatorFactory, FrameAllocator};
use crate::backend::{create_platform_backend, PlatformBackend};
use crate::frame::VideoFrame;

pub use self::core::{FrameProperty, DEFAULT_MAX_AVAILABLE_FRAME_SIZE, GRAB_WAIT_FOREVER};
pub use crate::pool::DEFAULT_MAX_CACHE_FRAME_SIZE;

use self::core::{NewFrameCallback, ProviderCore};

/// Camera properties settable through [`Provider::set`] / readable through
/// [`Provider::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    /// Requested frame width. The backend picks the closest supported
    /// resolution, preferring one at least as large as the request; `get`
    /// returns the negotiated value once frames are flowing.
    Width,
    /// Requested frame height; see [`Property::Width`].
    Height,
    /// Target fps; 0 keeps the device default.
    FrameRate,
    /// The pixel format requested from the camera
    /// ([`PixelFormat`](crate::PixelFormat) bits as a double).
    PixelFormatInternal,
    /// The pixel format delivered to the caller.
    PixelFormatOutput,
    /// Only affects RGB output; YUV frames are always top-to-bottom.
    FrameOrientation,
}

/// A supported capture resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Information about the currently opened device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_name: String,
    /// Formats the hardware can deliver without conversion.
    pub supported_pixel_formats: Vec<crate::PixelFormat>,
    /// Deduplicated, sorted by pixel count ascending.
    pub supported_resolutions: Vec<Resolution>,
}

/// Orders device names so real cameras come first and virtual ones
/// ("obs" / "virtual" / "fake", case-insensitive) come last, preserving
/// relative order otherwise.
pub(crate) fn sort_virtual_cameras_last(names: &mut [String]) {
    const KEYWORDS: [&str; 3] = ["obs", "virtual", "fake"];
    let rank = |name: &str| -> i64 {
        let lower = name.to_lowercase();
        KEYWORDS
            .iter()
            .position(|keyword| lower.contains(keyword))
            .map(|index| index as i64)
            .unwrap_or(-1)
    };
    names.sort_by(|a, b| rank(a).cmp(&rank(b)));
}

/// Deduplicates resolutions and sorts them by area ascending.
pub(crate) fn normalize_resolutions(resolutions: &mut Vec<Resolution>) {
    resolutions.sort_by_key(|r| (r.width as u64 * r.height as u64, r.width));
    resolutions.dedup();
}

/// Camera capture provider.
///
/// Typical use:
///
/// ```no_run
/// use framegrab::{PixelFormat, Property, Provider};
///
/// let mut camera = Provider::new();
/// camera.set(Property::Width, 1280.0);
/// camera.set(Property::Height, 720.0);
/// camera.set(Property::PixelFormatOutput, PixelFormat::Bgr24.bits() as f64);
/// if camera.open("", true) {
///     if let Some(frame) = camera.grab(1000) {
///         println!("{}x{} {}", frame.width(), frame.height(), frame.pixel_format());
///     }
/// }
/// ```
pub struct Provider {
    core: Arc<ProviderCore>,
    backend: Box<dyn PlatformBackend>,
}

impl Provider {
    /// Creates a provider without opening a device.
    pub fn new() -> Self {
        let core = ProviderCore::new();
        let backend = create_platform_backend(core.clone());
        Provider { core, backend }
    }

    /// Creates a provider and opens the named device (empty = default),
    /// starting capture immediately.
    pub fn with_device(device_name: &str) -> Self {
        let mut provider = Provider::new();
        provider.open(device_name, true);
        provider
    }

    /// Creates a provider and opens the device at `index` (negative =
    /// default), starting capture immediately.
    pub fn with_index(index: i32) -> Self {
        let mut provider = Provider::new();
        provider.open_index(index, true);
        provider
    }

    /// Scans for capture devices. Real cameras are listed before virtual
    /// ones; pass any returned name to [`Provider::open`].
    pub fn find_device_names(&mut self) -> Vec<String> {
        self.backend.find_device_names()
    }

    /// Opens a capture device by name; an empty name selects the default
    /// device. With `auto_start`, streaming begins immediately.
    pub fn open(&mut self, device_name: &str, auto_start: bool) -> bool {
        self.backend.open(device_name) && (!auto_start || self.start())
    }

    /// Opens a device by index from [`Provider::find_device_names`]. A
    /// negative index selects the default device; an index past the end
    /// selects the last device.
    pub fn open_index(&mut self, index: i32, auto_start: bool) -> bool {
        let mut device_name = String::new();
        if index >= 0 {
            let names = self.find_device_names();
            if !names.is_empty() {
                let clamped = (index as usize).min(names.len() - 1);
                device_name = names[clamped].clone();
                debug!(index, device = %device_name, "device selected by index");
            }
        }
        self.open(&device_name, auto_start)
    }

    pub fn is_opened(&self) -> bool {
        self.backend.is_opened()
    }

    /// Supported formats/resolutions of the opened device; `None` before a
    /// successful [`Provider::open`].
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.backend.device_info()
    }

    /// Stops capture and releases the device. The provider may be reused
    /// by calling [`Provider::open`] again.
    pub fn close(&mut self) {
        self.backend.close();
    }

    /// Starts (or resumes) frame capture.
    ///
    /// Frame indices continue from where a previous [`Provider::stop`]
    /// left off; they reset only when the device is re-opened.
    pub fn start(&mut self) -> bool {
        self.backend.start()
    }

    /// Pauses frame capture; [`Provider::start`] resumes it.
    pub fn stop(&mut self) {
        self.backend.stop();
    }

    /// True while the device is open and actively delivering frames.
    pub fn is_started(&self) -> bool {
        self.backend.is_started()
    }

    /// Sets a capture property. Returns false for unknown values.
    /// Some properties require a restart to take effect.
    pub fn set(&mut self, prop: Property, value: f64) -> bool {
        self.core.set(prop, value)
    }

    /// Reads a capture property; NaN when the property has no value.
    pub fn get(&self, prop: Property) -> f64 {
        self.core.get(prop)
    }

    /// Waits for the next frame, up to `timeout_ms` milliseconds
    /// ([`GRAB_WAIT_FOREVER`] = wait indefinitely, 0 = poll). Returns
    /// `None` on timeout or when the provider is not started.
    ///
    /// The returned frame may be held and used on any thread; its planes
    /// stay valid until the last reference drops.
    pub fn grab(&self, timeout_ms: u32) -> Option<Arc<VideoFrame>> {
        self.core.grab(timeout_ms)
    }

    /// Registers a callback invoked synchronously on the delivery thread
    /// for every new frame. Returning `true` consumes the frame (it will
    /// not be queued for [`Provider::grab`]); returning `false` leaves it
    /// available.
    pub fn set_new_frame_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&Arc<VideoFrame>) -> bool + Send + 'static,
    {
        self.core
            .set_new_frame_callback(Some(Box::new(callback) as NewFrameCallback));
    }

    /// Removes the new-frame callback.
    pub fn clear_new_frame_callback(&mut self) {
        self.core.set_new_frame_callback(None);
    }

    /// Installs a factory for the buffers backing materialized frames,
    /// e.g. to hand out GPU-upload-friendly memory. Call before
    /// [`Provider::start`].
    pub fn set_frame_allocator<F>(&mut self, factory: F)
    where
        F: Fn() -> Arc<dyn FrameAllocator> + Send + Sync + 'static,
    {
        self.core
            .set_frame_allocator(Arc::new(factory) as Arc<AllocatorFactory>);
    }

    /// Caps the ready-frame queue (default 3); the oldest frame is dropped
    /// on overflow.
    pub fn set_max_available_frame_size(&mut self, size: usize) {
        self.core.set_max_available_frame_size(size);
    }

    /// Caps the frame reuse pool (default 15).
    pub fn set_max_cache_frame_size(&mut self, size: usize) {
        self.core.set_max_cache_frame_size(size);
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::new()
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_cameras_sort_last() {
        let mut names = vec![
            "OBS Virtual Camera".to_string(),
            "Integrated Webcam".to_string(),
            "Fake Cam".to_string(),
            "USB Camera".to_string(),
        ];
        sort_virtual_cameras_last(&mut names);
        assert_eq!(names[0], "Integrated Webcam");
        assert_eq!(names[1], "USB Camera");
        // "obs" ranks before "fake" in the keyword order.
        assert_eq!(names[2], "OBS Virtual Camera");
        assert_eq!(names[3], "Fake Cam");
    }

    #[test]
    fn resolutions_dedup_and_sort_by_area() {
        let mut resolutions = vec![
            Resolution {
                width: 1920,
                height: 1080,
            },
            Resolution {
                width: 640,
                height: 480,
            },
            Resolution {
                width: 1920,
                height: 1080,
            },
            Resolution {
                width: 1280,
                height: 720,
            },
        ];
        normalize_resolutions(&mut resolutions);
        assert_eq!(resolutions.len(), 3);
        assert_eq!(resolutions[0].width, 640);
        assert_eq!(resolutions[1].width, 1280);
        assert_eq!(resolutions[2].width, 1920);
    }
}
