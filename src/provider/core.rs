// SPDX-License-Identifier: MPL-2.0

//! Provider core: the producer/consumer glue between a platform backend
//! and the consumer-facing API.
//!
//! Backends deliver frames on their own threads through
//! [`ProviderCore::new_frame_available`]; consumers either block in
//! [`ProviderCore::grab`] or register a callback that runs synchronously on
//! the delivery thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{trace, warn};

use crate::alloc::AllocatorFactory;
use crate::format::{FrameOrientation, PixelFormat};
use crate::frame::VideoFrame;
use crate::pool::FramePool;
use crate::provider::Property;

/// Default cap for the ready-frame queue.
pub const DEFAULT_MAX_AVAILABLE_FRAME_SIZE: usize = 3;

/// `grab` timeout meaning "wait indefinitely" (in one-second slices).
pub const GRAB_WAIT_FOREVER: u32 = u32::MAX;

/// Per-session capture configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameProperty {
    /// Target frames per second; 0 lets the device pick.
    pub fps: f64,
    /// Format requested from the camera; `Unknown` lets the backend pick.
    pub camera_pixel_format: PixelFormat,
    /// Format delivered to the caller.
    pub output_pixel_format: PixelFormat,
    pub width: i32,
    pub height: i32,
}

impl Default for FrameProperty {
    fn default() -> Self {
        FrameProperty {
            fps: 0.0,
            camera_pixel_format: PixelFormat::Unknown,
            #[cfg(target_vendor = "apple")]
            output_pixel_format: PixelFormat::Bgra32,
            #[cfg(not(target_vendor = "apple"))]
            output_pixel_format: PixelFormat::Bgr24,
            width: 640,
            height: 480,
        }
    }
}

/// Settings guarded together so property writes observe a consistent view.
pub(crate) struct Settings {
    pub frame_prop: FrameProperty,
    pub orientation: FrameOrientation,
    pub property_changed: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            frame_prop: FrameProperty::default(),
            #[cfg(windows)]
            orientation: FrameOrientation::BottomToTop,
            #[cfg(not(windows))]
            orientation: FrameOrientation::TopToBottom,
            property_changed: false,
        }
    }
}

pub(crate) type NewFrameCallback = Box<dyn FnMut(&Arc<VideoFrame>) -> bool + Send>;

pub(crate) struct AvailableFrames {
    queue: VecDeque<Arc<VideoFrame>>,
    max_size: usize,
    grab_waiting: bool,
    /// Shared so an unregister racing an in-flight invocation stays safe:
    /// the running callback keeps its callable alive through the Arc.
    callback: Option<Arc<Mutex<NewFrameCallback>>>,
}

/// What a backend must do with an incoming camera frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IngressDecision {
    pub should_flip: bool,
    pub should_convert: bool,
    pub output_format: PixelFormat,
    /// Orientation recorded on the emitted frame.
    pub frame_orientation: FrameOrientation,
}

pub(crate) struct ProviderCore {
    available: Mutex<AvailableFrames>,
    frame_cond: Condvar,
    pub(crate) pool: FramePool,
    frame_index: AtomicU64,
    pub(crate) started: AtomicBool,
    pub(crate) settings: Mutex<Settings>,
}

impl ProviderCore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ProviderCore {
            available: Mutex::new(AvailableFrames {
                queue: VecDeque::new(),
                max_size: DEFAULT_MAX_AVAILABLE_FRAME_SIZE,
                grab_waiting: false,
                callback: None,
            }),
            frame_cond: Condvar::new(),
            pool: FramePool::new(),
            frame_index: AtomicU64::new(0),
            started: AtomicBool::new(false),
            settings: Mutex::new(Settings::default()),
        })
    }

    pub(crate) fn set(&self, prop: Property, value: f64) -> bool {
        let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        let last = settings.frame_prop.clone();
        match prop {
            Property::Width => settings.frame_prop.width = value as i32,
            Property::Height => settings.frame_prop.height = value as i32,
            Property::FrameRate => settings.frame_prop.fps = value,
            Property::PixelFormatInternal => {
                #[allow(unused_mut)]
                let mut bits = value as u32;
                // DirectShow carries no range information; the display
                // infers the Y range.
                #[cfg(windows)]
                {
                    bits &= !crate::format::bits::FULL_RANGE;
                }
                let Some(format) = PixelFormat::from_bits(bits) else {
                    return false;
                };
                settings.frame_prop.camera_pixel_format = format;
            }
            Property::PixelFormatOutput => {
                #[allow(unused_mut)]
                let mut bits = value as u32;
                #[cfg(windows)]
                {
                    bits &= !crate::format::bits::FULL_RANGE;
                }
                let Some(format) = PixelFormat::from_bits(bits) else {
                    return false;
                };
                if format.is_yuv()
                    && settings.frame_prop.camera_pixel_format == PixelFormat::Unknown
                {
                    // A YUV output with no explicit camera format implies
                    // the platform's preferred YUV layout.
                    settings.frame_prop.camera_pixel_format = if cfg!(target_vendor = "apple") {
                        PixelFormat::Nv12Full
                    } else {
                        PixelFormat::Nv12
                    };
                }
                settings.frame_prop.output_pixel_format = format;
            }
            Property::FrameOrientation => {
                settings.orientation = match value as i32 {
                    0 => FrameOrientation::TopToBottom,
                    1 => FrameOrientation::BottomToTop,
                    _ => return false,
                };
            }
        }
        settings.property_changed = last != settings.frame_prop;
        true
    }

    pub(crate) fn get(&self, prop: Property) -> f64 {
        let settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        match prop {
            Property::Width => settings.frame_prop.width as f64,
            Property::Height => settings.frame_prop.height as f64,
            Property::FrameRate => settings.frame_prop.fps,
            Property::PixelFormatInternal => settings.frame_prop.camera_pixel_format.bits() as f64,
            Property::PixelFormatOutput => settings.frame_prop.output_pixel_format.bits() as f64,
            Property::FrameOrientation => f64::NAN,
        }
    }

    pub(crate) fn set_new_frame_callback(&self, callback: Option<NewFrameCallback>) {
        let mut available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        available.callback = callback.map(|cb| Arc::new(Mutex::new(cb)));
    }

    pub(crate) fn set_frame_allocator(&self, factory: Arc<AllocatorFactory>) {
        self.pool.set_factory(factory);
    }

    pub(crate) fn set_max_available_frame_size(&self, size: usize) {
        let mut available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        available.max_size = size.max(1);
    }

    pub(crate) fn set_max_cache_frame_size(&self, size: usize) {
        self.pool.set_max_size(size);
    }

    /// Blocks until a frame is ready or the timeout elapses.
    ///
    /// Waits in one-second condvar slices so a stopped provider is noticed
    /// promptly even with [`GRAB_WAIT_FOREVER`].
    pub(crate) fn grab(&self, timeout_ms: u32) -> Option<Arc<VideoFrame>> {
        let mut available = self.available.lock().unwrap_or_else(|e| e.into_inner());

        if available.queue.is_empty() && timeout_ms > 0 {
            if !self.started.load(Ordering::Acquire) {
                warn!("grab called while the camera is not started");
                return None;
            }

            available.grab_waiting = true;
            let mut waited_ms: u64 = 0;
            while available.queue.is_empty() && waited_ms < timeout_ms as u64 {
                let slice = Duration::from_millis(1000.min(timeout_ms as u64 - waited_ms));
                let (guard, _timeout) = self
                    .frame_cond
                    .wait_timeout_while(available, slice, |a| a.queue.is_empty())
                    .unwrap_or_else(|e| e.into_inner());
                available = guard;
                if available.queue.is_empty() && !self.started.load(Ordering::Acquire) {
                    // stop() woke us; give up instead of burning the
                    // remaining timeout.
                    break;
                }
                waited_ms += 1000;
                if available.queue.is_empty() {
                    trace!(waited_ms, "still waiting for a new frame");
                }
            }
            available.grab_waiting = false;
            if available.queue.is_empty() {
                trace!(timeout_ms, "grab timed out");
                return None;
            }
        }

        available.queue.pop_front()
    }

    /// True when the ready queue is already at its cap, so a backend can
    /// leave frames queued in the driver instead of churning the consumer.
    pub(crate) fn too_many_new_frames(&self) -> bool {
        let available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        available.queue.len() >= available.max_size
    }

    pub(crate) fn next_frame_index(&self) -> u64 {
        self.frame_index.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn get_free_frame(&self) -> VideoFrame {
        self.pool.get_free_frame()
    }

    /// Publishes a filled frame: synchronous callback fan-out first, then
    /// the bounded ready queue, then waking any `grab` waiter.
    pub(crate) fn new_frame_available(&self, frame: VideoFrame) {
        let frame = Arc::new(frame);

        let callback = {
            let available = self.available.lock().unwrap_or_else(|e| e.into_inner());
            available.callback.clone()
        };
        let mut consumed = false;
        if let Some(callback) = callback {
            let mut callback = callback.lock().unwrap_or_else(|e| e.into_inner());
            consumed = (callback)(&frame);
        }

        let mut available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        if !consumed {
            available.queue.push_back(frame);
            if available.queue.len() > available.max_size {
                // Dropping the Arc runs the frame's disposer unless a
                // callback kept a reference.
                let dropped = available.queue.pop_front();
                trace!(
                    frame_index = dropped.map(|f| f.frame_index()).unwrap_or(0),
                    "ready queue over capacity, dropped oldest frame"
                );
            }
        }
        if available.grab_waiting && !available.queue.is_empty() {
            self.frame_cond.notify_all();
        }
    }

    /// Snapshot of the session configuration for a capture thread.
    pub(crate) fn snapshot(&self) -> (FrameProperty, FrameOrientation) {
        let settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        (settings.frame_prop.clone(), settings.orientation)
    }

    /// The convert/flip decision every backend runs on frame ingress.
    pub(crate) fn ingress_decision(
        &self,
        camera_format: PixelFormat,
        input_orientation: FrameOrientation,
    ) -> IngressDecision {
        let (prop, orientation) = self.snapshot();
        let output_yuv = prop.output_pixel_format.is_yuv();
        // Orientation correction only applies to RGB output; YUV frames
        // are always delivered top-to-bottom.
        let frame_orientation = if output_yuv {
            FrameOrientation::TopToBottom
        } else {
            orientation
        };
        IngressDecision {
            should_flip: frame_orientation != input_orientation && !output_yuv,
            should_convert: prop.output_pixel_format != PixelFormat::Unknown
                && prop.output_pixel_format != camera_format,
            output_format: prop.output_pixel_format,
            frame_orientation,
        }
    }

    /// Clears queued frames; used by backends when a session closes.
    pub(crate) fn drain_available_frames(&self) {
        let mut available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        available.queue.clear();
        self.frame_cond.notify_all();
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Flags the provider as stopped and wakes every `grab` waiter so they
    /// observe the empty queue instead of sleeping out their timeout.
    pub(crate) fn mark_stopped(&self) {
        self.started.store(false, Ordering::Release);
        let _available = self.available.lock().unwrap_or_else(|e| e.into_inner());
        self.frame_cond.notify_all();
    }

    /// Frame numbering restarts when a device is (re-)opened; `stop` /
    /// `start` cycles keep counting.
    pub(crate) fn reset_frame_index(&self) {
        self.frame_index.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn synthetic_frame(core: &ProviderCore, seed: u8) -> VideoFrame {
        static BACKING: [u8; 64] = [0; 64];
        let mut frame = core.get_free_frame();
        frame.data[0] = BACKING.as_ptr();
        frame.stride[0] = 8;
        frame.pixel_format = PixelFormat::Bgr24;
        frame.width = 2;
        frame.height = 2;
        frame.size_in_bytes = 16;
        frame.timestamp = seed as u64 * 1000;
        frame.frame_index = core.next_frame_index();
        frame
    }

    #[test]
    fn grab_zero_timeout_returns_immediately() {
        let core = ProviderCore::new();
        assert!(core.grab(0).is_none());
    }

    #[test]
    fn grab_without_start_returns_none() {
        let core = ProviderCore::new();
        assert!(core.grab(50).is_none());
    }

    #[test]
    fn frames_are_delivered_in_order_with_increasing_indices() {
        let core = ProviderCore::new();
        core.started.store(true, Ordering::Release);

        for seed in 0..3 {
            let frame = synthetic_frame(&core, seed);
            core.new_frame_available(frame);
        }

        let first = core.grab(0).expect("frame queued");
        let second = core.grab(0).expect("frame queued");
        assert!(second.frame_index() > first.frame_index());
        assert_eq!(first.frame_index(), 0);
    }

    #[test]
    fn queue_drops_oldest_beyond_cap() {
        let core = ProviderCore::new();
        core.started.store(true, Ordering::Release);
        core.set_max_available_frame_size(1);

        for seed in 0..4 {
            core.new_frame_available(synthetic_frame(&core, seed));
        }
        // Only the newest survives.
        let frame = core.grab(0).expect("one frame kept");
        assert_eq!(frame.frame_index(), 3);
        assert!(core.grab(0).is_none());
    }

    #[test]
    fn callback_consuming_frames_keeps_queue_empty() {
        let core = ProviderCore::new();
        core.started.store(true, Ordering::Release);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_cb = seen.clone();
        core.set_new_frame_callback(Some(Box::new(move |_frame| {
            seen_in_cb.fetch_add(1, Ordering::SeqCst);
            true
        })));

        core.new_frame_available(synthetic_frame(&core, 1));
        core.new_frame_available(synthetic_frame(&core, 2));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(core.grab(0).is_none(), "consumed frames are not enqueued");

        // A declining callback leaves the frame for grab.
        core.set_new_frame_callback(Some(Box::new(|_frame| false)));
        core.new_frame_available(synthetic_frame(&core, 3));
        assert!(core.grab(0).is_some());
    }

    #[test]
    fn grab_wakes_on_delivery_from_another_thread() {
        let core = ProviderCore::new();
        core.started.store(true, Ordering::Release);

        let delivery_core = core.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            delivery_core.new_frame_available(synthetic_frame(&delivery_core, 9));
        });

        let frame = core.grab(5000);
        handle.join().unwrap();
        assert!(frame.is_some(), "grab should wake before the timeout");
    }

    #[test]
    fn too_many_new_frames_reflects_cap() {
        let core = ProviderCore::new();
        core.started.store(true, Ordering::Release);
        core.set_max_available_frame_size(2);
        assert!(!core.too_many_new_frames());

        core.new_frame_available(synthetic_frame(&core, 1));
        assert!(!core.too_many_new_frames());
        core.new_frame_available(synthetic_frame(&core, 2));
        assert!(core.too_many_new_frames());
    }

    #[test]
    fn yuv_output_pins_orientation_top_to_bottom() {
        let core = ProviderCore::new();
        assert!(core.set(
            Property::PixelFormatOutput,
            PixelFormat::Nv12.bits() as f64
        ));
        let decision = core.ingress_decision(PixelFormat::Nv12, FrameOrientation::TopToBottom);
        assert_eq!(decision.frame_orientation, FrameOrientation::TopToBottom);
        assert!(!decision.should_flip);
        assert!(!decision.should_convert);
    }

    #[test]
    fn yuv_output_defaults_internal_format() {
        let core = ProviderCore::new();
        assert!(core.set(
            Property::PixelFormatOutput,
            PixelFormat::I420.bits() as f64
        ));
        let (prop, _) = core.snapshot();
        if cfg!(target_vendor = "apple") {
            assert_eq!(prop.camera_pixel_format, PixelFormat::Nv12Full);
        } else {
            assert_eq!(prop.camera_pixel_format, PixelFormat::Nv12);
        }
    }

    #[test]
    fn property_round_trip_and_change_tracking() {
        let core = ProviderCore::new();
        assert!(core.set(Property::Width, 1280.0));
        assert!(core.set(Property::Height, 720.0));
        assert_eq!(core.get(Property::Width), 1280.0);
        assert_eq!(core.get(Property::Height), 720.0);
        assert!(core
            .settings
            .lock()
            .unwrap()
            .property_changed);

        // Setting the same value again clears the changed flag.
        assert!(core.set(Property::Height, 720.0));
        assert!(!core.settings.lock().unwrap().property_changed);

        assert!(core.get(Property::FrameOrientation).is_nan());
        assert!(!core.set(Property::PixelFormatOutput, 12345.0));
    }
}
