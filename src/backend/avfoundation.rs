// SPDX-License-Identifier: MPL-2.0

//! macOS capture backend: an AVFoundation capture session delivering
//! zero-copy CVPixelBuffer frames.
//!
//! The session graph is device → `AVCaptureDeviceInput` →
//! `AVCaptureVideoDataOutput`; the output's delegate runs on a private
//! dispatch queue and feeds the provider core. Each emitted zero-copy
//! frame retains its `CMSampleBuffer` and keeps the pixel buffer's base
//! address locked until the last consumer reference drops.

use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Instant;

use objc2::declare::ClassBuilder;
use objc2::runtime::{AnyClass, AnyObject, Sel};
use objc2::{class, msg_send, sel};
use tracing::{debug, info, warn};

use super::PlatformBackend;
use crate::errors::{report_error, ErrorCode};
use crate::format::{FrameOrientation, PixelFormat};
use crate::frame::NativeHandle;
use crate::provider::core::ProviderCore;
use crate::provider::{sort_virtual_cameras_last, DeviceInfo};

#[repr(C)]
#[derive(Clone, Copy)]
struct CMTime {
    value: i64,
    timescale: i32,
    flags: u32,
    epoch: i64,
}

type CFTypeRef = *const c_void;
type CVPixelBufferRef = *mut c_void;
type CMSampleBufferRef = *mut c_void;
type DispatchQueueRef = *mut c_void;

const LOCK_READ_ONLY: u64 = 1;

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    fn CFRetain(cf: CFTypeRef) -> CFTypeRef;
    fn CFRelease(cf: CFTypeRef);
}

#[link(name = "CoreMedia", kind = "framework")]
extern "C" {
    fn CMSampleBufferGetImageBuffer(sbuf: CMSampleBufferRef) -> CVPixelBufferRef;
    fn CMSampleBufferGetPresentationTimeStamp(sbuf: CMSampleBufferRef) -> CMTime;
    fn CMTimeGetSeconds(time: CMTime) -> f64;
}

#[link(name = "CoreVideo", kind = "framework")]
extern "C" {
    fn CVPixelBufferLockBaseAddress(buffer: CVPixelBufferRef, flags: u64) -> i32;
    fn CVPixelBufferUnlockBaseAddress(buffer: CVPixelBufferRef, flags: u64) -> i32;
    fn CVPixelBufferGetWidth(buffer: CVPixelBufferRef) -> usize;
    fn CVPixelBufferGetHeight(buffer: CVPixelBufferRef) -> usize;
    fn CVPixelBufferIsPlanar(buffer: CVPixelBufferRef) -> bool;
    fn CVPixelBufferGetBaseAddress(buffer: CVPixelBufferRef) -> *mut c_void;
    fn CVPixelBufferGetBytesPerRow(buffer: CVPixelBufferRef) -> usize;
    fn CVPixelBufferGetPlaneCount(buffer: CVPixelBufferRef) -> usize;
    fn CVPixelBufferGetBaseAddressOfPlane(buffer: CVPixelBufferRef, plane: usize) -> *mut c_void;
    fn CVPixelBufferGetBytesPerRowOfPlane(buffer: CVPixelBufferRef, plane: usize) -> usize;
    fn CVPixelBufferGetPixelFormatType(buffer: CVPixelBufferRef) -> u32;
}

#[link(name = "System", kind = "dylib")]
extern "C" {
    fn dispatch_queue_create(label: *const c_char, attr: *const c_void) -> DispatchQueueRef;
    fn dispatch_release(queue: DispatchQueueRef);
}

#[link(name = "AVFoundation", kind = "framework")]
extern "C" {
    static AVMediaTypeVideo: *mut AnyObject;
}

const fn cv_fourcc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

/// CoreVideo pixel format ↔ our taxonomy.
const CV_FORMAT_MAP: [(u32, PixelFormat); 8] = [
    (cv_fourcc(b"420v"), PixelFormat::Nv12),
    (cv_fourcc(b"420f"), PixelFormat::Nv12Full),
    (cv_fourcc(b"yuvs"), PixelFormat::Yuyv),
    (cv_fourcc(b"2vuy"), PixelFormat::Uyvy),
    (24, PixelFormat::Rgb24),           // kCVPixelFormatType_24RGB
    (cv_fourcc(b"24BG"), PixelFormat::Bgr24),
    (cv_fourcc(b"RGBA"), PixelFormat::Rgba32),
    (cv_fourcc(b"BGRA"), PixelFormat::Bgra32),
];

fn cv_to_pixel_format(cv_format: u32) -> PixelFormat {
    CV_FORMAT_MAP
        .iter()
        .find(|(code, _)| *code == cv_format)
        .map(|(_, format)| *format)
        .unwrap_or(PixelFormat::Unknown)
}

fn pixel_format_to_cv(format: PixelFormat) -> Option<u32> {
    CV_FORMAT_MAP
        .iter()
        .find(|(_, f)| *f == format)
        .map(|(code, _)| *code)
}

fn nsstring_to_string(string: *mut AnyObject) -> String {
    if string.is_null() {
        return String::new();
    }
    unsafe {
        let utf8: *const c_char = msg_send![string, UTF8String];
        if utf8.is_null() {
            String::new()
        } else {
            CStr::from_ptr(utf8).to_string_lossy().into_owned()
        }
    }
}

/// State shared with the sample-buffer delegate.
struct DelegateShared {
    core: Arc<ProviderCore>,
    running: AtomicBool,
    session_start: Instant,
}

/// `captureOutput:didOutputSampleBuffer:fromConnection:` implementation.
extern "C" fn capture_output(
    this: &AnyObject,
    _sel: Sel,
    _output: *mut AnyObject,
    sample_buffer: CMSampleBufferRef,
    _connection: *mut AnyObject,
) {
    let shared = unsafe {
        let ivar = this.class().instance_variable("shared").expect("ivar");
        let ptr = *ivar.load::<*const c_void>(this);
        &*(ptr as *const DelegateShared)
    };
    if !shared.running.load(Ordering::Acquire) {
        return;
    }
    deliver_sample(shared, sample_buffer);
}

fn deliver_sample(shared: &DelegateShared, sample_buffer: CMSampleBufferRef) {
    let core = &shared.core;
    if core.too_many_new_frames() {
        return;
    }

    let pixel_buffer = unsafe { CMSampleBufferGetImageBuffer(sample_buffer) };
    if pixel_buffer.is_null() {
        return;
    }

    let camera_format = cv_to_pixel_format(unsafe { CVPixelBufferGetPixelFormatType(pixel_buffer) });
    if camera_format == PixelFormat::Unknown {
        warn!("dropping frame with unrecognized CoreVideo format");
        return;
    }

    if unsafe { CVPixelBufferLockBaseAddress(pixel_buffer, LOCK_READ_ONLY) } != 0 {
        report_error(ErrorCode::FrameCaptureFailed, "CVPixelBuffer lock failed");
        return;
    }
    // Retain the sample buffer for the lifetime of the emitted frame; the
    // disposer pairs the unlock/release.
    unsafe { CFRetain(sample_buffer as CFTypeRef) };

    let width = unsafe { CVPixelBufferGetWidth(pixel_buffer) } as u32;
    let height = unsafe { CVPixelBufferGetHeight(pixel_buffer) } as u32;

    let mut frame = core.get_free_frame();
    frame.width = width;
    frame.height = height;
    frame.pixel_format = camera_format;
    let seconds = unsafe { CMTimeGetSeconds(CMSampleBufferGetPresentationTimeStamp(sample_buffer)) };
    frame.timestamp = if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1e9) as u64
    } else {
        shared.session_start.elapsed().as_nanos() as u64
    };

    let mut total = 0u32;
    if unsafe { CVPixelBufferIsPlanar(pixel_buffer) } {
        let planes = unsafe { CVPixelBufferGetPlaneCount(pixel_buffer) }.min(3);
        for plane in 0..planes {
            let base = unsafe { CVPixelBufferGetBaseAddressOfPlane(pixel_buffer, plane) };
            let stride = unsafe { CVPixelBufferGetBytesPerRowOfPlane(pixel_buffer, plane) } as u32;
            frame.data[plane] = base as *const u8;
            frame.stride[plane] = stride;
            let rows = if plane == 0 { height } else { height / 2 };
            total += stride * rows;
        }
    } else {
        frame.data[0] = unsafe { CVPixelBufferGetBaseAddress(pixel_buffer) } as *const u8;
        frame.stride[0] = unsafe { CVPixelBufferGetBytesPerRow(pixel_buffer) } as u32;
        total = frame.stride[0] * height;
    }
    frame.size_in_bytes = total;

    let decision = core.ingress_decision(camera_format, FrameOrientation::TopToBottom);
    frame.orientation = decision.frame_orientation;

    let mut zero_copy = !decision.should_convert && !decision.should_flip;
    if !zero_copy {
        zero_copy = !crate::convert::convert_frame_in_place(
            &mut frame,
            decision.output_format,
            decision.should_flip,
        );
    }

    if zero_copy {
        frame.orientation = FrameOrientation::TopToBottom;
        frame.pixel_format = camera_format;
        frame.native_handle = Some(NativeHandle::Pointer(sample_buffer));
        let retained = sample_buffer as usize;
        let buffer = pixel_buffer as usize;
        frame.disposer = Some(Box::new(move || unsafe {
            CVPixelBufferUnlockBaseAddress(buffer as CVPixelBufferRef, LOCK_READ_ONLY);
            CFRelease(retained as CFTypeRef);
        }));
    } else {
        frame.size_in_bytes = frame.stride(0) * frame.height
            + (frame.stride(1) + frame.stride(2)) * frame.height / 2;
        unsafe {
            CVPixelBufferUnlockBaseAddress(pixel_buffer, LOCK_READ_ONLY);
            CFRelease(sample_buffer as CFTypeRef);
        }
    }

    frame.frame_index = core.next_frame_index();
    core.new_frame_available(frame);
}

fn delegate_class() -> &'static AnyClass {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        let superclass = class!(NSObject);
        let mut builder =
            ClassBuilder::new("FramegrabSampleDelegate", superclass).expect("delegate class");
        builder.add_ivar::<*const c_void>("shared");
        unsafe {
            builder.add_method(
                sel!(captureOutput:didOutputSampleBuffer:fromConnection:),
                capture_output
                    as extern "C" fn(&AnyObject, Sel, *mut AnyObject, CMSampleBufferRef, *mut AnyObject),
            );
        }
        builder.register();
    });
    AnyClass::get("FramegrabSampleDelegate").expect("delegate class registered")
}

pub(crate) struct AvFoundationBackend {
    core: Arc<ProviderCore>,
    session: *mut AnyObject,
    input: *mut AnyObject,
    output: *mut AnyObject,
    delegate: *mut AnyObject,
    queue: DispatchQueueRef,
    shared: Option<Arc<DelegateShared>>,
    device_name: String,
    opened: bool,
    started: bool,
}

// Safety: the Objective-C objects are only messaged from the thread that
// owns the backend; AVFoundation delivers samples on its own queue through
// the delegate, which communicates via the Arc'd shared state only.
unsafe impl Send for AvFoundationBackend {}

impl AvFoundationBackend {
    pub(crate) fn new(core: Arc<ProviderCore>) -> Self {
        AvFoundationBackend {
            core,
            session: std::ptr::null_mut(),
            input: std::ptr::null_mut(),
            output: std::ptr::null_mut(),
            delegate: std::ptr::null_mut(),
            queue: std::ptr::null_mut(),
            shared: None,
            device_name: String::new(),
            opened: false,
            started: false,
        }
    }

    fn video_devices() -> Vec<*mut AnyObject> {
        unsafe {
            let devices: *mut AnyObject =
                msg_send![class!(AVCaptureDevice), devicesWithMediaType: AVMediaTypeVideo];
            if devices.is_null() {
                return Vec::new();
            }
            let count: usize = msg_send![devices, count];
            (0..count)
                .map(|index| msg_send![devices, objectAtIndex: index])
                .collect()
        }
    }

    fn find_device(device_name: &str) -> Option<*mut AnyObject> {
        let devices = Self::video_devices();
        if device_name.is_empty() {
            let default: *mut AnyObject = unsafe {
                msg_send![
                    class!(AVCaptureDevice),
                    defaultDeviceWithMediaType: AVMediaTypeVideo
                ]
            };
            if !default.is_null() {
                return Some(default);
            }
            return devices.into_iter().next();
        }
        devices.into_iter().find(|&device| {
            let name: *mut AnyObject = unsafe { msg_send![device, localizedName] };
            nsstring_to_string(name) == device_name
        })
    }

    fn teardown(&mut self) {
        unsafe {
            if !self.session.is_null() {
                let _: () = msg_send![self.session, release];
                self.session = std::ptr::null_mut();
            }
            if !self.input.is_null() {
                let _: () = msg_send![self.input, release];
                self.input = std::ptr::null_mut();
            }
            if !self.output.is_null() {
                let _: () = msg_send![self.output, release];
                self.output = std::ptr::null_mut();
            }
            if !self.delegate.is_null() {
                let _: () = msg_send![self.delegate, release];
                self.delegate = std::ptr::null_mut();
            }
            if !self.queue.is_null() {
                dispatch_release(self.queue);
                self.queue = std::ptr::null_mut();
            }
        }
        self.shared = None;
    }
}

impl PlatformBackend for AvFoundationBackend {
    fn find_device_names(&mut self) -> Vec<String> {
        let mut names: Vec<String> = Self::video_devices()
            .into_iter()
            .map(|device| {
                let name: *mut AnyObject = unsafe { msg_send![device, localizedName] };
                nsstring_to_string(name)
            })
            .filter(|name| !name.is_empty())
            .collect();
        sort_virtual_cameras_last(&mut names);
        names
    }

    fn open(&mut self, device_name: &str) -> bool {
        if self.opened {
            report_error(ErrorCode::DeviceOpenFailed, "device already opened");
            return false;
        }

        let Some(device) = Self::find_device(device_name) else {
            report_error(
                ErrorCode::InvalidDevice,
                &format!("no video capture device: {device_name}"),
            );
            return false;
        };
        let name: *mut AnyObject = unsafe { msg_send![device, localizedName] };
        self.device_name = nsstring_to_string(name);

        unsafe {
            let session: *mut AnyObject = msg_send![class!(AVCaptureSession), new];
            if session.is_null() {
                report_error(ErrorCode::InitializationFailed, "AVCaptureSession init failed");
                return false;
            }
            let _: () = msg_send![session, beginConfiguration];

            let mut error: *mut AnyObject = std::ptr::null_mut();
            let input: *mut AnyObject = msg_send![
                class!(AVCaptureDeviceInput),
                deviceInputWithDevice: device,
                error: &mut error
            ];
            if input.is_null() {
                let _: () = msg_send![session, release];
                report_error(ErrorCode::DeviceOpenFailed, "AVCaptureDeviceInput failed");
                return false;
            }
            let _: () = msg_send![input, retain];
            let can_add: bool = msg_send![session, canAddInput: input];
            if !can_add {
                let _: () = msg_send![input, release];
                let _: () = msg_send![session, release];
                report_error(ErrorCode::DeviceOpenFailed, "cannot add capture input");
                return false;
            }
            let _: () = msg_send![session, addInput: input];

            let output: *mut AnyObject = msg_send![class!(AVCaptureVideoDataOutput), new];
            let _: () = msg_send![output, setAlwaysDiscardsLateVideoFrames: true];

            // Ask the output for the configured camera format; AVFoundation
            // converts on our behalf when the device cannot deliver it.
            let (prop, _) = self.core.snapshot();
            let requested = if prop.camera_pixel_format != PixelFormat::Unknown {
                prop.camera_pixel_format
            } else if cfg!(target_os = "macos") {
                PixelFormat::Bgra32
            } else {
                PixelFormat::Nv12Full
            };
            if let Some(cv_format) = pixel_format_to_cv(requested) {
                let key: *mut AnyObject = msg_send![
                    class!(NSString),
                    stringWithUTF8String: b"PixelFormatType\0".as_ptr() as *const c_char
                ];
                let number: *mut AnyObject =
                    msg_send![class!(NSNumber), numberWithUnsignedInt: cv_format];
                let settings: *mut AnyObject = msg_send![
                    class!(NSDictionary),
                    dictionaryWithObject: number,
                    forKey: key
                ];
                let _: () = msg_send![output, setVideoSettings: settings];
            }

            let shared = Arc::new(DelegateShared {
                core: self.core.clone(),
                running: AtomicBool::new(false),
                session_start: Instant::now(),
            });

            let delegate: *mut AnyObject = msg_send![delegate_class(), new];
            let ivar = delegate_class().instance_variable("shared").expect("ivar");
            *ivar.load_mut::<*const c_void>(&mut *delegate) =
                Arc::as_ptr(&shared) as *const c_void;

            let queue = dispatch_queue_create(
                b"framegrab.avf.delivery\0".as_ptr() as *const c_char,
                std::ptr::null(),
            );
            let _: () = msg_send![output, setSampleBufferDelegate: delegate, queue: queue];

            let can_add: bool = msg_send![session, canAddOutput: output];
            if !can_add {
                let _: () = msg_send![output, release];
                let _: () = msg_send![input, release];
                let _: () = msg_send![session, release];
                report_error(ErrorCode::DeviceOpenFailed, "cannot add capture output");
                return false;
            }
            let _: () = msg_send![session, addOutput: output];
            let _: () = msg_send![session, commitConfiguration];

            self.session = session;
            self.input = input;
            self.output = output;
            self.delegate = delegate;
            self.queue = queue;
            self.shared = Some(shared);
        }

        self.core.reset_frame_index();
        self.opened = true;
        info!(device = %self.device_name, "device opened");
        true
    }

    fn is_opened(&self) -> bool {
        self.opened
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        if !self.opened {
            return None;
        }
        // AVFoundation exposes formats per device; the provider reports
        // the negotiated frame size through the property API instead.
        Some(DeviceInfo {
            device_name: self.device_name.clone(),
            supported_pixel_formats: vec![
                PixelFormat::Nv12,
                PixelFormat::Nv12Full,
                PixelFormat::Uyvy,
                PixelFormat::Yuyv,
                PixelFormat::Bgra32,
            ],
            supported_resolutions: Vec::new(),
        })
    }

    fn close(&mut self) {
        self.stop();
        self.teardown();
        self.opened = false;
        self.core.drain_available_frames();
        debug!("device closed");
    }

    fn start(&mut self) -> bool {
        if !self.opened {
            report_error(ErrorCode::DeviceStartFailed, "device not opened");
            return false;
        }
        if self.started {
            return true;
        }
        if let Some(shared) = &self.shared {
            shared.running.store(true, Ordering::Release);
        }
        unsafe {
            let _: () = msg_send![self.session, startRunning];
            let running: bool = msg_send![self.session, isRunning];
            if !running {
                report_error(ErrorCode::DeviceStartFailed, "capture session did not start");
                return false;
            }
        }
        self.started = true;
        self.core.mark_started();
        info!("capture session started");
        true
    }

    fn stop(&mut self) {
        if !self.started {
            return;
        }
        if let Some(shared) = &self.shared {
            shared.running.store(false, Ordering::Release);
        }
        unsafe {
            let _: () = msg_send![self.session, stopRunning];
        }
        self.started = false;
        self.core.mark_stopped();
        info!("capture session stopped");
    }

    fn is_started(&self) -> bool {
        self.started
    }
}

impl Drop for AvFoundationBackend {
    fn drop(&mut self) {
        self.close();
    }
}
